use super::protocol::HotspotPush;
use super::{
    HistoryEntry, HistoryStatus, Hotspot, HotspotConfig, HotspotFilter, HotspotPatch,
    HotspotSnapshot,
};
use crate::clock::Clock;
use crate::connection::PushEvent;
use crate::error::SyncError;
use crate::shutdown::ShutdownSignal;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const SNAPSHOT_BUFFER: usize = 16;

/// Client edit awaiting server confirmation.
struct PendingEdit {
    patch: HotspotPatch,
    /// Last server-confirmed state; restored on rollback
    base: Hotspot,
}

struct Tracked {
    /// Latest server record of every merged member, keyed by member id
    members: BTreeMap<String, Hotspot>,
    /// What observers see: the merged record with the pending patch applied, if any
    current: Hotspot,
    pending: Option<PendingEdit>,
}

impl Tracked {
    fn new(hotspot: Hotspot) -> Self {
        let mut members = BTreeMap::new();
        members.insert(hotspot.id.clone(), hotspot.clone());
        Self {
            members,
            current: hotspot,
            pending: None,
        }
    }

    /// Rebuild the merged record from the members. With an edit pending the
    /// result becomes the new pre-image and the patch is re-applied on top.
    fn refresh(&mut self, key: &str) {
        let Some(merged) = merge_members(key, &self.members) else {
            return;
        };
        match &mut self.pending {
            Some(edit) => {
                let mut current = merged.clone();
                edit.patch.apply_to(&mut current);
                edit.base = merged;
                self.current = current;
            }
            None => self.current = merged,
        }
    }
}

struct Inner {
    hotspots: BTreeMap<String, Tracked>,
    /// Absorbed id → representative id
    aliases: HashMap<String, String>,
    history: HashMap<String, VecDeque<HistoryEntry>>,
    /// Ids with history, oldest first
    history_order: VecDeque<String>,
    revision: u64,
    latest: HotspotSnapshot,
}

impl Inner {
    fn resolve(&self, id: &str) -> Option<String> {
        if self.hotspots.contains_key(id) {
            return Some(id.to_string());
        }
        self.aliases
            .get(id)
            .filter(|target| self.hotspots.contains_key(*target))
            .cloned()
    }

    fn nearest_match(&self, incoming: &Hotspot, radius_m: f64, now: DateTime<Utc>) -> Option<String> {
        self.hotspots
            .iter()
            .filter(|(_, t)| t.current.category == incoming.category && !t.current.is_expired(now))
            .map(|(id, t)| (id, t.current.location.distance_m(&incoming.location)))
            .filter(|(_, distance)| *distance <= radius_m)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(id, _)| id.clone())
    }

    fn drop_aliases_of(&mut self, id: &str) {
        self.aliases.retain(|alias, target| target != id && alias != id);
    }
}

/// Authoritative in-memory view of live hotspots.
pub struct HotspotManager {
    config: HotspotConfig,
    clock: Arc<dyn Clock>,
    inner: RwLock<Inner>,
    snapshot_tx: broadcast::Sender<HotspotSnapshot>,
}

impl HotspotManager {
    pub fn new(config: HotspotConfig, clock: Arc<dyn Clock>) -> Self {
        let (snapshot_tx, _) = broadcast::channel(SNAPSHOT_BUFFER);
        Self {
            config,
            clock,
            inner: RwLock::new(Inner {
                hotspots: BTreeMap::new(),
                aliases: HashMap::new(),
                history: HashMap::new(),
                history_order: VecDeque::new(),
                revision: 0,
                latest: HotspotSnapshot {
                    revision: 0,
                    hotspots: Arc::new(Vec::new()),
                },
            }),
            snapshot_tx,
        }
    }

    pub fn config(&self) -> &HotspotConfig {
        &self.config
    }

    /// Receive a full snapshot after every mutation.
    pub fn subscribe(&self) -> broadcast::Receiver<HotspotSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// The most recently published snapshot.
    pub fn snapshot(&self) -> HotspotSnapshot {
        self.inner.read().unwrap().latest.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().hotspots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up by id or by an absorbed id.
    pub fn get(&self, id: &str) -> Option<Hotspot> {
        let inner = self.inner.read().unwrap();
        let id = inner.resolve(id)?;
        inner.hotspots.get(&id).map(|t| t.current.clone())
    }

    /// Live hotspots matching `filter`, ordered by id. Prunes expired ones first.
    pub fn query(&self, filter: &HotspotFilter) -> Vec<Hotspot> {
        self.prune_expired();
        let inner = self.inner.read().unwrap();
        inner
            .hotspots
            .values()
            .map(|t| &t.current)
            .filter(|h| filter.matches(h))
            .cloned()
            .collect()
    }

    /// Merge a server record. Returns the id of the record now holding it,
    /// or `None` if it had already expired.
    pub fn add_or_update(&self, hotspot: Hotspot) -> Option<String> {
        let now = self.clock.now();
        let mut inner = self.inner.write().unwrap();
        let id = self.merge_locked(&mut inner, hotspot, now)?;
        self.publish(&mut inner);
        Some(id)
    }

    /// Remove by id or absorbed id. Returns whether anything was removed.
    pub fn remove(&self, id: &str) -> bool {
        let now = self.clock.now();
        let mut inner = self.inner.write().unwrap();
        let removed = self.remove_locked(&mut inner, id, HistoryStatus::Removed, now);
        if removed {
            self.publish(&mut inner);
        }
        removed
    }

    /// Apply a client edit ahead of server confirmation.
    ///
    /// A second edit before confirmation stacks on the first; rollback
    /// restores the state before either.
    pub fn apply_optimistic(&self, id: &str, patch: HotspotPatch) -> Result<Hotspot, SyncError> {
        let mut inner = self.inner.write().unwrap();
        let key = inner
            .resolve(id)
            .ok_or_else(|| SyncError::NotFound(format!("hotspot {}", id)))?;
        let Some(tracked) = inner.hotspots.get_mut(&key) else {
            return Err(SyncError::NotFound(format!("hotspot {}", id)));
        };

        let (base, mut stacked) = match &tracked.pending {
            Some(edit) => (edit.base.clone(), edit.patch.clone()),
            None => (tracked.current.clone(), HotspotPatch::default()),
        };
        stacked.merge(patch);

        let mut current = base.clone();
        stacked.apply_to(&mut current);
        if current.expires_at().is_none() {
            return Err(SyncError::ClientRejected {
                status: 0,
                message: format!("validity window of hotspot {} out of range", id),
            });
        }

        tracked.pending = Some(PendingEdit {
            patch: stacked,
            base,
        });
        tracked.current = current.clone();

        debug!(id = %key, "Optimistic edit applied");
        self.publish(&mut inner);
        Ok(current)
    }

    /// The server accepted the edit; the edited state becomes confirmed.
    pub fn confirm_optimistic(&self, id: &str) -> Result<(), SyncError> {
        let now = self.clock.now();
        let mut inner = self.inner.write().unwrap();
        let (key, edit) = Self::take_pending(&mut inner, id)?;
        let current = inner
            .hotspots
            .get(&key)
            .map(|t| t.current.clone())
            .ok_or_else(|| SyncError::NotFound(format!("hotspot {}", id)))?;

        self.record_history(
            &mut inner,
            &key,
            current,
            HistoryStatus::Updated,
            Some(edit.base.risk_score),
            now,
        );
        debug!(id = %key, "Optimistic edit confirmed");
        self.publish(&mut inner);
        Ok(())
    }

    /// The server refused the edit; restore the confirmed pre-image.
    pub fn rollback_optimistic(&self, id: &str) -> Result<Hotspot, SyncError> {
        let mut inner = self.inner.write().unwrap();
        let (key, edit) = Self::take_pending(&mut inner, id)?;
        let restored = edit.base;
        if let Some(tracked) = inner.hotspots.get_mut(&key) {
            tracked.current = restored.clone();
        }

        info!(id = %key, "Optimistic edit rolled back");
        self.publish(&mut inner);
        Ok(restored)
    }

    pub fn has_pending_edit(&self, id: &str) -> bool {
        let inner = self.inner.read().unwrap();
        inner
            .resolve(id)
            .and_then(|key| inner.hotspots.get(&key).map(|t| t.pending.is_some()))
            .unwrap_or(false)
    }

    /// Remove every hotspot past its validity window. Returns how many.
    pub fn prune_expired(&self) -> usize {
        let now = self.clock.now();

        let expired: Vec<String> = {
            let inner = self.inner.read().unwrap();
            inner
                .hotspots
                .iter()
                .filter(|(_, t)| t.current.is_expired(now))
                .map(|(id, _)| id.clone())
                .collect()
        };
        if expired.is_empty() {
            return 0;
        }

        let mut inner = self.inner.write().unwrap();
        let mut pruned = 0;
        for id in expired {
            // Re-check under the write lock; a fresh record may have arrived
            let still_expired = inner
                .hotspots
                .get(&id)
                .is_some_and(|t| t.current.is_expired(now));
            if still_expired && self.remove_locked(&mut inner, &id, HistoryStatus::Expired, now) {
                pruned += 1;
            }
        }

        if pruned > 0 {
            info!(pruned = pruned, "Pruned expired hotspots");
            self.publish(&mut inner);
        }
        pruned
    }

    /// Change log of one hotspot, oldest first.
    pub fn history(&self, id: &str) -> Vec<HistoryEntry> {
        let inner = self.inner.read().unwrap();
        let key = inner
            .resolve(id)
            .unwrap_or_else(|| id.to_string());
        inner
            .history
            .get(&key)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Apply a decoded server message.
    pub fn apply_push(&self, push: HotspotPush) {
        let now = self.clock.now();
        let mut inner = self.inner.write().unwrap();

        let changed = match push {
            HotspotPush::Upsert { hotspot } => self.merge_locked(&mut inner, hotspot, now).is_some(),
            HotspotPush::Remove { id } => {
                self.remove_locked(&mut inner, &id, HistoryStatus::Removed, now)
            }
            HotspotPush::Batch { hotspots } => {
                let count = hotspots.len();
                let mut changed = false;
                for hotspot in hotspots {
                    changed |= self.merge_locked(&mut inner, hotspot, now).is_some();
                }
                debug!(count = count, "Applied hotspot batch");
                changed
            }
        };

        if changed {
            self.publish(&mut inner);
        }
    }

    /// Decode and apply a push event from the connection manager.
    pub fn handle_push(&self, event: &PushEvent) {
        match serde_json::from_value::<HotspotPush>(event.payload.clone()) {
            Ok(push) => self.apply_push(push),
            Err(e) => warn!(topic = %event.topic, error = %e, "Ignoring malformed hotspot push"),
        }
    }

    /// Prune on a timer until shutdown.
    pub async fn run_prune_loop(self: Arc<Self>, mut shutdown: ShutdownSignal) {
        let period = Duration::from_secs(self.config.prune_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.triggered() => break,
                _ = ticker.tick() => {
                    self.prune_expired();
                }
            }
        }
        debug!("Hotspot prune loop stopped");
    }

    fn merge_locked(&self, inner: &mut Inner, incoming: Hotspot, now: DateTime<Utc>) -> Option<String> {
        if incoming.expires_at().is_none() {
            warn!(
                id = %incoming.id,
                valid_for_minutes = incoming.valid_for_minutes,
                "Ignoring hotspot with out-of-range validity window"
            );
            return None;
        }
        if incoming.is_expired(now) {
            debug!(id = %incoming.id, "Ignoring already expired hotspot");
            return None;
        }

        let target = inner
            .resolve(&incoming.id)
            .or_else(|| inner.nearest_match(&incoming, self.config.proximity_radius_m, now));

        let Some(target) = target else {
            let id = incoming.id.clone();
            inner.aliases.remove(&id);
            self.record_history(inner, &id, incoming.clone(), HistoryStatus::New, None, now);
            inner.hotspots.insert(id.clone(), Tracked::new(incoming));
            debug!(id = %id, "New hotspot");
            return Some(id);
        };

        let member = incoming.id.clone();
        let tracked = inner.hotspots.get_mut(&target)?;
        let previous_score = tracked.current.risk_score;
        tracked.members.insert(member.clone(), incoming);
        tracked.refresh(&target);
        let snapshot = tracked.current.clone();

        if member != target {
            debug!(
                id = %member,
                representative = %target,
                "Merging nearby hotspot into representative"
            );
            inner.aliases.insert(member, target.clone());
        }

        self.record_history(
            inner,
            &target,
            snapshot,
            HistoryStatus::Updated,
            Some(previous_score),
            now,
        );
        Some(target)
    }

    /// Expiry drops the whole merged record. Any other removal drops one
    /// member; the record goes with its last member.
    fn remove_locked(&self, inner: &mut Inner, id: &str, status: HistoryStatus, now: DateTime<Utc>) -> bool {
        let Some(key) = inner.resolve(id) else {
            return false;
        };
        let Some(tracked) = inner.hotspots.get_mut(&key) else {
            return false;
        };

        if status != HistoryStatus::Expired {
            if tracked.members.remove(id).is_none() {
                return false;
            }
            if !tracked.members.is_empty() {
                let previous_score = tracked.current.risk_score;
                tracked.refresh(&key);
                let snapshot = tracked.current.clone();
                inner.aliases.remove(id);
                self.record_history(
                    inner,
                    &key,
                    snapshot,
                    HistoryStatus::Updated,
                    Some(previous_score),
                    now,
                );
                debug!(id = %id, representative = %key, "Member removed from merged hotspot");
                return true;
            }
        }

        let Some(tracked) = inner.hotspots.remove(&key) else {
            return false;
        };
        inner.drop_aliases_of(&key);
        let previous_score = Some(tracked.current.risk_score);
        self.record_history(inner, &key, tracked.current, status, previous_score, now);
        debug!(id = %key, status = %status, "Hotspot removed");
        true
    }

    fn take_pending(inner: &mut Inner, id: &str) -> Result<(String, PendingEdit), SyncError> {
        let key = inner
            .resolve(id)
            .ok_or_else(|| SyncError::NotFound(format!("hotspot {}", id)))?;
        inner
            .hotspots
            .get_mut(&key)
            .and_then(|t| t.pending.take())
            .map(|edit| (key, edit))
            .ok_or_else(|| SyncError::NotFound(format!("pending edit for hotspot {}", id)))
    }

    fn record_history(
        &self,
        inner: &mut Inner,
        id: &str,
        snapshot: Hotspot,
        status: HistoryStatus,
        previous_score: Option<f64>,
        now: DateTime<Utc>,
    ) {
        if self.config.history_capacity == 0 {
            return;
        }

        if !inner.history.contains_key(id) {
            while inner.history_order.len() >= self.config.max_tracked_histories.max(1) {
                match inner.history_order.pop_front() {
                    Some(oldest) => {
                        inner.history.remove(&oldest);
                    }
                    None => break,
                }
            }
            inner.history_order.push_back(id.to_string());
        }

        let entries = inner.history.entry(id.to_string()).or_default();
        if entries.len() >= self.config.history_capacity {
            entries.pop_front();
        }
        entries.push_back(HistoryEntry {
            entity_id: id.to_string(),
            snapshot,
            timestamp: now,
            status,
            previous_score,
        });
    }

    fn publish(&self, inner: &mut Inner) {
        inner.revision += 1;
        let hotspots: Vec<Hotspot> = inner.hotspots.values().map(|t| t.current.clone()).collect();
        inner.latest = HotspotSnapshot {
            revision: inner.revision,
            hotspots: Arc::new(hotspots),
        };
        // No receivers is fine; the latest snapshot stays readable
        let _ = self.snapshot_tx.send(inner.latest.clone());
    }
}

/// Merged view of a group: the record stored under `key` (or the first
/// remaining member once that one is gone) with every other member folded in.
fn merge_members(key: &str, members: &BTreeMap<String, Hotspot>) -> Option<Hotspot> {
    let mut merged = members
        .get(key)
        .or_else(|| members.values().next())?
        .clone();
    merged.id = key.to_string();
    for (id, member) in members {
        if id != key {
            absorb(&mut merged, member);
        }
    }
    Some(merged)
}

/// Fold a nearby record into its representative: highest risk, most recent
/// timestamp and the validity window of whichever record is newer.
fn absorb(representative: &mut Hotspot, incoming: &Hotspot) {
    representative.risk_score = representative.risk_score.max(incoming.risk_score);
    if incoming.created_at > representative.created_at {
        representative.created_at = incoming.created_at;
        representative.valid_for_minutes = incoming.valid_for_minutes;
    }
    for (key, value) in &incoming.properties {
        representative
            .properties
            .entry(key.clone())
            .or_insert_with(|| value.clone());
    }
}
