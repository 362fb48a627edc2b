//! Live view of perishable, geo-located hotspots.
//!
//! The manager is the single writer of the hotspot map. Server pushes,
//! optimistic edits, removals and expiry all go through it, and each
//! mutation publishes a complete immutable snapshot to observers.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

mod geo;
mod manager;
mod protocol;


pub use geo::GeoPoint;
pub use manager::HotspotManager;
pub use protocol::HotspotPush;

/// Push topic carrying hotspot updates
pub const HOTSPOT_TOPIC: &str = "hotspots";

/// A predicted fraud hotspot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hotspot {
    pub id: String,
    pub category: String,
    pub location: GeoPoint,
    /// 0.0 to 1.0
    pub risk_score: f64,
    pub created_at: DateTime<Utc>,
    pub valid_for_minutes: i64,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl Hotspot {
    /// `None` when the validity window does not fit the calendar.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        Duration::try_minutes(self.valid_for_minutes)
            .and_then(|window| self.created_at.checked_add_signed(window))
    }

    /// A record whose expiry cannot be represented counts as expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().map_or(true, |at| now >= at)
    }
}

/// Partial client-side edit of a hotspot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HotspotPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_for_minutes: Option<i64>,
    /// Merged key by key into `properties`
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,
}

impl HotspotPatch {
    /// Stack `later` on top of this patch; its fields win.
    pub fn merge(&mut self, later: HotspotPatch) {
        if later.risk_score.is_some() {
            self.risk_score = later.risk_score;
        }
        if later.category.is_some() {
            self.category = later.category;
        }
        if later.valid_for_minutes.is_some() {
            self.valid_for_minutes = later.valid_for_minutes;
        }
        self.properties.extend(later.properties);
    }

    pub fn apply_to(&self, hotspot: &mut Hotspot) {
        if let Some(risk) = self.risk_score {
            hotspot.risk_score = risk;
        }
        if let Some(category) = &self.category {
            hotspot.category = category.clone();
        }
        if let Some(minutes) = self.valid_for_minutes {
            hotspot.valid_for_minutes = minutes;
        }
        for (key, value) in &self.properties {
            hotspot.properties.insert(key.clone(), value.clone());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    New,
    Updated,
    Expired,
    Removed,
}

impl fmt::Display for HistoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistoryStatus::New => write!(f, "new"),
            HistoryStatus::Updated => write!(f, "updated"),
            HistoryStatus::Expired => write!(f, "expired"),
            HistoryStatus::Removed => write!(f, "removed"),
        }
    }
}

/// Informational record of one change to a hotspot. Never authoritative.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub entity_id: String,
    pub snapshot: Hotspot,
    pub timestamp: DateTime<Utc>,
    pub status: HistoryStatus,
    pub previous_score: Option<f64>,
}

/// Query over live hotspots. Empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HotspotFilter {
    pub min_risk: Option<f64>,
    pub category: Option<String>,
    /// Center and radius in meters
    pub near: Option<(GeoPoint, f64)>,
}

impl HotspotFilter {
    pub fn matches(&self, hotspot: &Hotspot) -> bool {
        if let Some(min) = self.min_risk {
            if hotspot.risk_score < min {
                return false;
            }
        }
        if let Some(category) = &self.category {
            if &hotspot.category != category {
                return false;
            }
        }
        if let Some((center, radius_m)) = &self.near {
            if center.distance_m(&hotspot.location) > *radius_m {
                return false;
            }
        }
        true
    }
}

/// Full state published after every mutation.
#[derive(Debug, Clone)]
pub struct HotspotSnapshot {
    /// Increases by one per mutation
    pub revision: u64,
    /// Live hotspots ordered by id
    pub hotspots: Arc<Vec<Hotspot>>,
}

/// `[hotspots]` configuration section
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HotspotConfig {
    /// Same-category hotspots closer than this merge into one
    #[serde(default = "default_proximity_radius_m")]
    pub proximity_radius_m: f64,

    /// History entries kept per hotspot
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,

    /// Hotspots with retained history; oldest histories are dropped beyond this
    #[serde(default = "default_max_tracked_histories")]
    pub max_tracked_histories: usize,
}

fn default_proximity_radius_m() -> f64 {
    100.0
}

fn default_history_capacity() -> usize {
    10
}

fn default_prune_interval_secs() -> u64 {
    60
}

fn default_max_tracked_histories() -> usize {
    256
}

impl Default for HotspotConfig {
    fn default() -> Self {
        Self {
            proximity_radius_m: default_proximity_radius_m(),
            history_capacity: default_history_capacity(),
            prune_interval_secs: default_prune_interval_secs(),
            max_tracked_histories: default_max_tracked_histories(),
        }
    }
}
