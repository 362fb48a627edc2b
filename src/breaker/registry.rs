use super::{BreakerConfig, BreakerSnapshot, CircuitBreaker};
use crate::clock::Clock;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// `[breakers]` configuration: a default plus per-group overrides.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BreakerSection {
    #[serde(default)]
    pub default: BreakerConfig,

    /// Overrides keyed by service group (e.g. "alerts", "actions")
    #[serde(default)]
    pub groups: HashMap<String, BreakerConfig>,
}

impl BreakerSection {
    pub fn config_for(&self, group: &str) -> BreakerConfig {
        self.groups
            .get(group)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

/// One breaker per service group, created lazily on first use.
///
/// Breakers never share counters; the registry only hands out the instance
/// owned by each group.
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    section: BreakerSection,
    clock: Arc<dyn Clock>,
}

impl BreakerRegistry {
    pub fn new(section: BreakerSection, clock: Arc<dyn Clock>) -> Self {
        Self {
            breakers: DashMap::new(),
            section,
            clock,
        }
    }

    /// Get the breaker for `group`, creating it from configuration if needed.
    pub fn get(&self, group: &str) -> Arc<CircuitBreaker> {
        let entry = self.breakers.entry(group.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(
                group,
                self.section.config_for(group),
                Arc::clone(&self.clock),
            ))
        });
        Arc::clone(entry.value())
    }

    /// Snapshots of every breaker created so far, ordered by group.
    pub fn snapshot_all(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<BreakerSnapshot> =
            self.breakers.iter().map(|b| b.value().snapshot()).collect();
        snapshots.sort_by(|a, b| a.group.cmp(&b.group));
        snapshots
    }

    /// Reset one group. Returns false if the group has no breaker yet.
    pub fn reset(&self, group: &str) -> bool {
        match self.breakers.get(group) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.iter() {
            breaker.value().reset();
        }
    }
}
