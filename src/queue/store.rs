//! Durable storage for queued items.
//!
//! `SqliteQueueStore` keeps items across restarts; the autoincrement `seq`
//! column preserves insertion order so replays stay FIFO.

use super::{ItemStatus, QueuedItem};
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Mutex;

/// Keyed item storage. Listing returns items in insertion order.
pub trait DurableStore: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<QueuedItem>>;

    /// Insert or replace by id. A replaced item keeps its original position.
    fn put(&self, item: &QueuedItem) -> Result<()>;

    /// Returns whether a row was removed.
    fn delete(&self, id: &str) -> Result<bool>;

    fn list_by_status(&self, status: ItemStatus) -> Result<Vec<QueuedItem>>;

    fn count_by_status(&self, status: ItemStatus) -> Result<usize>;
}

const COLUMNS: &str =
    "id, kind, operation, payload, created_at, attempt_count, status, last_error, updated_at";

/// Persists queued items in SQLite.
pub struct SqliteQueueStore {
    conn: Mutex<Connection>,
}

impl SqliteQueueStore {
    /// Opens (or creates) the SQLite database and ensures the table exists.
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open queue DB at {}", db_path))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_table()?;
        Ok(store)
    }

    fn create_table(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS queued_items (
                seq           INTEGER PRIMARY KEY AUTOINCREMENT,
                id            TEXT UNIQUE NOT NULL,
                kind          TEXT NOT NULL,
                operation     TEXT NOT NULL,
                payload       TEXT NOT NULL,
                created_at    TEXT NOT NULL,
                attempt_count INTEGER NOT NULL,
                status        TEXT NOT NULL,
                last_error    TEXT,
                updated_at    TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_queued_items_status ON queued_items (status, seq);",
        )
        .context("Failed to create queued_items table")?;
        Ok(())
    }
}

struct RawItem {
    id: String,
    kind: String,
    operation: String,
    payload: String,
    created_at: String,
    attempt_count: i64,
    status: String,
    last_error: Option<String>,
    updated_at: String,
}

impl RawItem {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            operation: row.get(2)?,
            payload: row.get(3)?,
            created_at: row.get(4)?,
            attempt_count: row.get(5)?,
            status: row.get(6)?,
            last_error: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn into_item(self) -> Result<QueuedItem> {
        let id = self.id;
        Ok(QueuedItem {
            kind: self.kind.parse()?,
            operation: self.operation,
            payload: serde_json::from_str(&self.payload)
                .with_context(|| format!("Failed to parse payload for item {}", id))?,
            created_at: self
                .created_at
                .parse()
                .with_context(|| format!("Failed to parse created_at for item {}", id))?,
            attempt_count: u32::try_from(self.attempt_count).unwrap_or(u32::MAX),
            status: self.status.parse()?,
            last_error: self.last_error,
            updated_at: self
                .updated_at
                .parse()
                .with_context(|| format!("Failed to parse updated_at for item {}", id))?,
            id,
        })
    }
}

impl DurableStore for SqliteQueueStore {
    fn get(&self, id: &str) -> Result<Option<QueuedItem>> {
        let conn = self.conn.lock().unwrap();
        let raw = conn
            .query_row(
                &format!("SELECT {} FROM queued_items WHERE id = ?1", COLUMNS),
                params![id],
                RawItem::from_row,
            )
            .optional()
            .context("Failed to query queued item")?;
        raw.map(RawItem::into_item).transpose()
    }

    fn put(&self, item: &QueuedItem) -> Result<()> {
        let payload = serde_json::to_string(&item.payload).context("Failed to encode payload")?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!(
                "INSERT INTO queued_items ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                    kind = excluded.kind,
                    operation = excluded.operation,
                    payload = excluded.payload,
                    attempt_count = excluded.attempt_count,
                    status = excluded.status,
                    last_error = excluded.last_error,
                    updated_at = excluded.updated_at",
                COLUMNS
            ),
            params![
                item.id,
                item.kind.as_str(),
                item.operation,
                payload,
                item.created_at.to_rfc3339(),
                item.attempt_count as i64,
                item.status.as_str(),
                item.last_error,
                item.updated_at.to_rfc3339(),
            ],
        )
        .with_context(|| format!("Failed to store queued item {}", item.id))?;
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let removed = conn
            .execute("DELETE FROM queued_items WHERE id = ?1", params![id])
            .context("Failed to delete queued item")?;
        Ok(removed > 0)
    }

    fn list_by_status(&self, status: ItemStatus) -> Result<Vec<QueuedItem>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM queued_items WHERE status = ?1 ORDER BY seq ASC",
                COLUMNS
            ))
            .context("Failed to prepare list query")?;
        let rows = stmt
            .query_map(params![status.as_str()], RawItem::from_row)
            .context("Failed to query queued items")?;

        let mut items = Vec::new();
        for row in rows {
            let raw = row.context("Failed to read queued item row")?;
            items.push(raw.into_item()?);
        }
        Ok(items)
    }

    fn count_by_status(&self, status: ItemStatus) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM queued_items WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            )
            .context("Failed to count queued items")?;
        Ok(count as usize)
    }
}

/// Process-local store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryQueueStore {
    items: Mutex<Vec<QueuedItem>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DurableStore for MemoryQueueStore {
    fn get(&self, id: &str) -> Result<Option<QueuedItem>> {
        let items = self.items.lock().unwrap();
        Ok(items.iter().find(|i| i.id == id).cloned())
    }

    fn put(&self, item: &QueuedItem) -> Result<()> {
        let mut items = self.items.lock().unwrap();
        match items.iter_mut().find(|i| i.id == item.id) {
            Some(existing) => *existing = item.clone(),
            None => items.push(item.clone()),
        }
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let mut items = self.items.lock().unwrap();
        let before = items.len();
        items.retain(|i| i.id != id);
        Ok(items.len() < before)
    }

    fn list_by_status(&self, status: ItemStatus) -> Result<Vec<QueuedItem>> {
        let items = self.items.lock().unwrap();
        Ok(items.iter().filter(|i| i.status == status).cloned().collect())
    }

    fn count_by_status(&self, status: ItemStatus) -> Result<usize> {
        let items = self.items.lock().unwrap();
        Ok(items.iter().filter(|i| i.status == status).count())
    }
}
