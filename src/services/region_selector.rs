//! Monitored-region selection under the hardware cap
//!
//! Selection rules, in order:
//! 1. Everything, when the site has no more beacons than the cap.
//! 2. Beacons in range, beacons with a pending leave and beacons of the
//!    current zone are always kept.
//! 3. Remaining slots are filled by rank: same zone as a kept beacon, near
//!    the last location (same floor), already monitored, closer, key order.
//!
//! The ranking is total, so identical inputs always give identical output.

use crate::domain::registry::Registry;
use crate::domain::types::{BeaconKey, Location, ZoneId};
use std::collections::BTreeSet;
use tracing::debug;

/// Hard limit imposed by the platform
pub const MAX_MONITORED_REGIONS: usize = 20;

/// Radius (meters) within which a beacon counts as near the device
const NEAR_RADIUS_M: f64 = 100.0;

/// Result of a selection pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub regions: BTreeSet<BeaconKey>,
    /// False when the set equals the previous pass
    pub changed: bool,
}

/// Chooses which beacons the radio monitors
pub struct RegionSelector {
    cap: usize,
    current: BTreeSet<BeaconKey>,
}

impl RegionSelector {
    pub fn new(cap: usize) -> Self {
        Self { cap: cap.clamp(1, MAX_MONITORED_REGIONS), current: BTreeSet::new() }
    }

    #[inline]
    pub fn cap(&self) -> usize {
        self.cap
    }

    /// The set returned by the last pass
    #[inline]
    pub fn current(&self) -> &BTreeSet<BeaconKey> {
        &self.current
    }

    /// Forget the last selection, e.g. after monitoring was stopped
    pub fn reset(&mut self) {
        self.current.clear();
    }

    /// Run one selection pass. `leaving` holds beacons whose leave timer is
    /// still pending; they stay monitored so a return can cancel it.
    pub fn select(
        &mut self,
        registry: &Registry,
        current_zone: Option<&ZoneId>,
        location: Option<&Location>,
        leaving: &BTreeSet<BeaconKey>,
    ) -> Selection {
        let regions = if registry.beacon_count() <= self.cap {
            registry.beacon_keys().cloned().collect()
        } else {
            self.rank(registry, current_zone, location, leaving)
        };

        let changed = regions != self.current;
        if changed {
            debug!(
                previous = self.current.len(),
                selected = regions.len(),
                "region_selection_changed"
            );
            self.current = regions.clone();
        }
        Selection { regions, changed }
    }

    fn rank(
        &self,
        registry: &Registry,
        current_zone: Option<&ZoneId>,
        location: Option<&Location>,
        leaving: &BTreeSet<BeaconKey>,
    ) -> BTreeSet<BeaconKey> {
        // Live beacons: in range (closest first), leave pending, then members of the current zone
        let mut in_range: Vec<_> = registry.beacons().filter(|b| b.is_in_range()).collect();
        in_range.sort_by(|a, b| {
            a.estimated_distance.total_cmp(&b.estimated_distance).then_with(|| a.key.cmp(&b.key))
        });

        let mut retained: Vec<BeaconKey> = in_range.iter().map(|b| b.key.clone()).collect();
        for key in leaving {
            if registry.beacon(key).is_some() && !retained.contains(key) {
                retained.push(key.clone());
            }
        }
        if let Some(zone) = current_zone.and_then(|id| registry.zone(id)) {
            for key in &zone.beacons {
                if !retained.contains(key) {
                    retained.push(key.clone());
                }
            }
        }
        retained.truncate(self.cap);

        let mut selected: BTreeSet<BeaconKey> = retained.into_iter().collect();
        let retained_zones: BTreeSet<&ZoneId> =
            selected.iter().filter_map(|k| registry.zone_of(k)).collect();

        let mut candidates: Vec<_> = registry
            .beacons()
            .filter(|b| !selected.contains(&b.key))
            .map(|b| {
                let same_zone = b.zone.as_ref().is_some_and(|z| retained_zones.contains(z));
                let distance = match (location, b.location.as_ref()) {
                    (Some(here), Some(there)) if !here.is_other_floor(there) => {
                        Some(here.distance_m(there))
                    }
                    _ => None,
                };
                let near = distance.is_some_and(|d| d <= NEAR_RADIUS_M);
                let sticky = self.current.contains(&b.key);
                (!same_zone, !near, !sticky, distance.unwrap_or(f64::INFINITY), &b.key)
            })
            .collect();

        candidates.sort_by(|a, b| {
            (a.0, a.1, a.2)
                .cmp(&(b.0, b.1, b.2))
                .then_with(|| a.3.total_cmp(&b.3))
                .then_with(|| a.4.cmp(b.4))
        });

        let free = self.cap.saturating_sub(selected.len());
        selected.extend(candidates.into_iter().take(free).map(|c| c.4.clone()));
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::registry::{BeaconSpec, SiteConfiguration};
    use crate::domain::beacon::BeaconIdentity;
    use crate::domain::types::RawSample;
    use crate::domain::zone::Zone;

    fn spec(minor: u16, location: Option<Location>) -> BeaconSpec {
        BeaconSpec {
            identity: BeaconIdentity::IBeacon { proximity_uuid: "u".into(), major: 1, minor },
            name: String::new(),
            location,
        }
    }

    fn key(minor: u16) -> BeaconKey {
        BeaconKey::ibeacon("u", 1, minor)
    }

    /// `count` beacons; zone `z{n}` holds minors [n*5, n*5+5)
    fn site(count: u16) -> Registry {
        let beacons = (0..count).map(|m| spec(m, None)).collect();
        let zones = (0..count.div_ceil(5))
            .map(|z| {
                let mut zone = Zone::new(ZoneId::new(format!("z{z}")));
                for m in (z * 5)..((z * 5 + 5).min(count)) {
                    zone.beacons.insert(key(m));
                }
                zone
            })
            .collect();
        Registry::from_site(SiteConfiguration { beacons, zones, ..Default::default() }).unwrap()
    }

    fn enter(registry: &mut Registry, minor: u16, distance: f64) {
        let k = key(minor);
        registry.beacon_mut(&k).unwrap().apply_sample(&RawSample::new(k.clone(), -60, distance), 0, false);
    }

    #[test]
    fn test_small_site_monitors_everything() {
        let registry = site(12);
        let mut selector = RegionSelector::new(20);

        let selection = selector.select(&registry, None, None, &BTreeSet::new());
        assert_eq!(selection.regions.len(), 12);
        assert!(selection.changed);
    }

    #[test]
    fn test_cap_is_clamped() {
        assert_eq!(RegionSelector::new(0).cap(), 1);
        assert_eq!(RegionSelector::new(64).cap(), MAX_MONITORED_REGIONS);
    }

    #[test]
    fn test_never_exceeds_cap() {
        for count in [0u16, 1, 19, 20, 21, 57, 200] {
            let mut registry = site(count);
            for m in (0..count).step_by(7) {
                enter(&mut registry, m, m as f64);
            }
            let mut selector = RegionSelector::new(20);
            let selection =
                selector.select(&registry, Some(&ZoneId::new("z1")), None, &BTreeSet::new());
            assert!(selection.regions.len() <= 20, "count {count}");
        }
    }

    #[test]
    fn test_stable_selection_reports_unchanged() {
        let mut registry = site(60);
        enter(&mut registry, 33, 1.0);
        let mut selector = RegionSelector::new(20);

        let first = selector.select(&registry, None, None, &BTreeSet::new());
        let second = selector.select(&registry, None, None, &BTreeSet::new());
        assert!(first.changed);
        assert!(!second.changed);
        assert_eq!(first.regions, second.regions);
    }

    #[test]
    fn test_in_range_beacons_are_retained() {
        let mut registry = site(60);
        enter(&mut registry, 41, 2.0);
        enter(&mut registry, 58, 6.0);
        let mut selector = RegionSelector::new(20);

        let selection = selector.select(&registry, None, None, &BTreeSet::new());
        assert!(selection.regions.contains(&key(41)));
        assert!(selection.regions.contains(&key(58)));
    }

    #[test]
    fn test_pending_leave_retained_over_near_candidates() {
        let here = Location::new(52.0, 21.0);
        let near = Location::new(52.0, 21.0005);
        let mut beacons: Vec<_> = (0..30).map(|m| spec(m, Some(near))).collect();
        beacons[29] = spec(29, None);
        let registry =
            Registry::from_site(SiteConfiguration { beacons, ..Default::default() }).unwrap();
        let mut selector = RegionSelector::new(20);

        // Out of range with its leave still pending
        let leaving: BTreeSet<_> = [key(29)].into_iter().collect();
        let selection = selector.select(&registry, None, Some(&here), &leaving);
        assert!(selection.regions.contains(&key(29)));
        assert_eq!(selection.regions.len(), 20);

        let selection = selector.select(&registry, None, Some(&here), &BTreeSet::new());
        assert!(!selection.regions.contains(&key(29)));
    }

    #[test]
    fn test_same_zone_ranked_first() {
        let mut registry = site(60);
        enter(&mut registry, 41, 2.0);
        let mut selector = RegionSelector::new(20);

        let selection = selector.select(&registry, None, None, &BTreeSet::new());
        // z8 holds 40..45
        for m in 40..45 {
            assert!(selection.regions.contains(&key(m)), "minor {m}");
        }
    }

    #[test]
    fn test_current_zone_members_retained() {
        let registry = site(60);
        let mut selector = RegionSelector::new(20);

        let selection =
            selector.select(&registry, Some(&ZoneId::new("z11")), None, &BTreeSet::new());
        for m in 55..60 {
            assert!(selection.regions.contains(&key(m)));
        }
    }

    #[test]
    fn test_near_location_ranked_before_key_order() {
        let here = Location::new(52.0, 21.0).with_floor(0);
        let near = Location::new(52.0, 21.0005).with_floor(0);
        let near_other_floor = Location::new(52.0, 21.0005).with_floor(3);
        let far = Location::new(53.0, 21.0);

        let mut beacons: Vec<_> = (0..40).map(|m| spec(m, Some(far))).collect();
        beacons[35] = spec(35, Some(near));
        beacons[36] = spec(36, Some(near_other_floor));
        let registry =
            Registry::from_site(SiteConfiguration { beacons, ..Default::default() }).unwrap();

        let mut selector = RegionSelector::new(3);
        let selection = selector.select(&registry, None, Some(&here), &BTreeSet::new());

        assert!(selection.regions.contains(&key(35)));
        assert!(!selection.regions.contains(&key(36)));
        assert_eq!(selection.regions.len(), 3);
    }

    #[test]
    fn test_key_order_tie_break() {
        let registry = site(40);
        let mut selector = RegionSelector::new(5);

        let selection = selector.select(&registry, None, None, &BTreeSet::new());
        let mut expected: Vec<BeaconKey> = (0..40).map(key).collect();
        expected.sort();
        let expected: BTreeSet<_> = expected.into_iter().take(5).collect();
        assert_eq!(selection.regions, expected);
    }
}
