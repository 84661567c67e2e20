//! Zone resolution from merged ranging batches
//!
//! Applies batch samples to beacons (through the legal-transition check) and
//! derives the current zone: the zone owning the closest in-range beacon,
//! ties broken by stronger signal, then key order. Unzoned beacons never own
//! the current zone.

use crate::domain::beacon::{Beacon, Transition};
use crate::domain::registry::Registry;
use crate::domain::types::{BeaconKey, RawSample, ZoneId};
use std::cmp::Ordering;
use tracing::debug;

/// A detected difference between the committed zone and the computed one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneChange {
    pub from: Option<ZoneId>,
    pub to: Option<ZoneId>,
}

/// Tracks the committed current zone
#[derive(Debug, Default)]
pub struct ZoneResolver {
    current: Option<ZoneId>,
    /// Epoch ms the current zone was committed
    entered_at: Option<u64>,
}

impl ZoneResolver {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn current(&self) -> Option<&ZoneId> {
        self.current.as_ref()
    }

    pub fn entered_at(&self) -> Option<u64> {
        self.entered_at
    }

    /// Commit a zone; returns the previous one
    pub fn commit(&mut self, zone: Option<ZoneId>, now: u64) -> Option<ZoneId> {
        self.entered_at = zone.as_ref().map(|_| now);
        std::mem::replace(&mut self.current, zone)
    }

    /// Apply batch samples. `resumes_stay` says whether a beacon re-entering
    /// still has a pending leave (so its stay continues).
    pub fn apply_batch(
        &self,
        registry: &mut Registry,
        samples: &[RawSample],
        now: u64,
        resumes_stay: impl Fn(&BeaconKey) -> bool,
    ) -> Vec<(BeaconKey, Transition)> {
        let mut transitions = Vec::with_capacity(samples.len());
        for sample in samples {
            let Some(beacon) = registry.beacon_mut(&sample.key) else {
                debug!(beacon = %sample.key, "sample_for_unknown_beacon");
                continue;
            };
            let resume = !beacon.is_in_range() && resumes_stay(&sample.key);
            let transition = beacon.apply_sample(sample, now, resume);
            if transition == Transition::Ignored {
                debug!(beacon = %sample.key, "sample_without_proximity_ignored");
                continue;
            }
            transitions.push((sample.key.clone(), transition));
        }
        transitions
    }

    /// Zone the current beacon state points at
    pub fn compute_zone(registry: &Registry) -> Option<ZoneId> {
        registry
            .beacons()
            .filter(|b| b.is_in_range() && b.zone.is_some())
            .min_by(|a, b| closer(a, b))
            .and_then(|b| b.zone.clone())
    }

    /// Closest in-range beacon, zoned or not
    pub fn closest_beacon(registry: &Registry) -> Option<&Beacon> {
        registry.beacons().filter(|b| b.is_in_range()).min_by(|a, b| closer(a, b))
    }

    /// Compare committed zone against current beacon state
    pub fn detect_change(&self, registry: &Registry) -> Option<ZoneChange> {
        let computed = Self::compute_zone(registry);
        if computed == self.current {
            None
        } else {
            Some(ZoneChange { from: self.current.clone(), to: computed })
        }
    }
}

/// Ordering used for "closest": distance, then stronger rssi, then key
fn closer(a: &Beacon, b: &Beacon) -> Ordering {
    a.estimated_distance
        .total_cmp(&b.estimated_distance)
        .then_with(|| b.rssi.cmp(&a.rssi))
        .then_with(|| a.key.cmp(&b.key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::Proximity;
    use serde_json::json;

    fn registry() -> Registry {
        Registry::from_json(
            &json!({
                "beacons": [
                    {"protocol": "eddystone", "namespace": "n", "instance": "a"},
                    {"protocol": "eddystone", "namespace": "n", "instance": "b"},
                    {"protocol": "eddystone", "namespace": "n", "instance": "c"},
                    {"protocol": "eddystone", "namespace": "n", "instance": "x"}
                ],
                "zones": [
                    {"id": "z1", "beacons": ["n+a", "n+b"]},
                    {"id": "z2", "beacons": ["n+c"]}
                ]
            })
            .to_string(),
        )
        .unwrap()
    }

    fn s(instance: &str, rssi: i32, distance: f64) -> RawSample {
        RawSample::new(BeaconKey::new(format!("n+{instance}")), rssi, distance)
    }

    #[test]
    fn test_closest_beacon_owns_zone() {
        let mut reg = registry();
        let resolver = ZoneResolver::new();
        resolver.apply_batch(&mut reg, &[s("a", -60, 2.0), s("b", -70, 5.0), s("c", -50, 1.0)], 0, |_| false);

        assert_eq!(ZoneResolver::compute_zone(&reg), Some(ZoneId::new("z2")));
    }

    #[test]
    fn test_distance_tie_broken_by_rssi_then_key() {
        let mut reg = registry();
        let resolver = ZoneResolver::new();
        resolver.apply_batch(&mut reg, &[s("a", -80, 2.0), s("c", -60, 2.0)], 0, |_| false);
        assert_eq!(ZoneResolver::compute_zone(&reg), Some(ZoneId::new("z2")));

        let mut reg = registry();
        resolver.apply_batch(&mut reg, &[s("a", -60, 2.0), s("c", -60, 2.0)], 0, |_| false);
        assert_eq!(ZoneResolver::compute_zone(&reg), Some(ZoneId::new("z1")));
    }

    #[test]
    fn test_unzoned_beacon_does_not_own_zone() {
        let mut reg = registry();
        let resolver = ZoneResolver::new();
        resolver.apply_batch(&mut reg, &[s("x", -40, 0.2), s("b", -70, 5.0)], 0, |_| false);

        assert_eq!(ZoneResolver::compute_zone(&reg), Some(ZoneId::new("z1")));
        assert_eq!(ZoneResolver::closest_beacon(&reg).map(|b| b.key.as_str()), Some("n+x"));
    }

    #[test]
    fn test_no_beacons_in_range_means_no_zone() {
        let reg = registry();
        assert_eq!(ZoneResolver::compute_zone(&reg), None);
        assert!(ZoneResolver::closest_beacon(&reg).is_none());
    }

    #[test]
    fn test_unknown_samples_are_dropped() {
        let mut reg = registry();
        let resolver = ZoneResolver::new();
        let transitions = resolver.apply_batch(
            &mut reg,
            &[s("a", -60, -1.0), s("nope", -60, 1.0), s("b", -60, 1.0)],
            0,
            |_| false,
        );

        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].1, Transition::Entered { to: Proximity::Near });
    }

    #[test]
    fn test_detect_and_commit_change() {
        let mut reg = registry();
        let mut resolver = ZoneResolver::new();
        resolver.apply_batch(&mut reg, &[s("a", -60, 2.0)], 0, |_| false);

        let change = resolver.detect_change(&reg).unwrap();
        assert_eq!(change, ZoneChange { from: None, to: Some(ZoneId::new("z1")) });

        assert_eq!(resolver.commit(change.to, 500), None);
        assert_eq!(resolver.entered_at(), Some(500));
        assert!(resolver.detect_change(&reg).is_none());
    }
}
