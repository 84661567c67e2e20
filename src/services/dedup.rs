//! At-most-once-per-interval suppression of action firing

use crate::domain::event::DedupKey;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Persisted form of one dedup entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupEntry {
    pub key: DedupKey,
    pub last_fired_ms: u64,
}

/// Last-fired timestamps per dedup key
pub struct DeliveryDedup {
    last_fired: FxHashMap<DedupKey, u64>,
    min_refire_interval_ms: u64,
}

impl DeliveryDedup {
    pub fn new(min_refire_interval_ms: u64) -> Self {
        Self { last_fired: FxHashMap::default(), min_refire_interval_ms }
    }

    #[inline]
    pub fn interval_ms(&self) -> u64 {
        self.min_refire_interval_ms
    }

    /// Check with the default interval; records the firing when allowed
    pub fn should_fire(&mut self, key: DedupKey, now: u64) -> bool {
        self.should_fire_within(key, now, self.min_refire_interval_ms)
    }

    /// Check with a caller-chosen interval; records the firing when allowed
    pub fn should_fire_within(&mut self, key: DedupKey, now: u64, interval_ms: u64) -> bool {
        if let Some(&last) = self.last_fired.get(&key) {
            if now.saturating_sub(last) < interval_ms {
                debug!(dedup_key = %key, since_ms = now.saturating_sub(last), "action_suppressed");
                return false;
            }
        }
        self.last_fired.insert(key, now);
        true
    }

    pub fn last_fired(&self, key: DedupKey) -> Option<u64> {
        self.last_fired.get(&key).copied()
    }

    /// Forget entries whose window has passed
    pub fn prune(&mut self, now: u64) -> usize {
        let before = self.last_fired.len();
        let interval = self.min_refire_interval_ms;
        self.last_fired.retain(|_, last| now.saturating_sub(*last) < interval);
        before - self.last_fired.len()
    }

    pub fn len(&self) -> usize {
        self.last_fired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_fired.is_empty()
    }

    /// Entries sorted by key, for snapshots
    pub fn entries(&self) -> Vec<DedupEntry> {
        let mut entries: Vec<_> = self
            .last_fired
            .iter()
            .map(|(&key, &last_fired_ms)| DedupEntry { key, last_fired_ms })
            .collect();
        entries.sort_by_key(|e| e.key);
        entries
    }

    pub fn restore(&mut self, entries: &[DedupEntry]) {
        self.last_fired = entries.iter().map(|e| (e.key, e.last_fired_ms)).collect();
    }
}
