//! Beacon model and its proximity state machine
//!
//! Proximity transitions:
//! - `unknown -> {immediate, near, far}` on the first in-range sample (sets `last_entered_at`)
//! - free movement between `immediate`, `near` and `far`
//! - `* -> unknown` only through an explicit region exit (`Beacon::exit`)
//!
//! A ranging sample can never move a beacon to `unknown`; see `can_set_proximity`.

use crate::domain::types::{BeaconKey, Location, Proximity, RawSample, ZoneId};
use serde::{Deserialize, Serialize};

/// Protocol-specific identity as it appears in site configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum BeaconIdentity {
    #[serde(rename = "ibeacon")]
    IBeacon { proximity_uuid: String, major: u16, minor: u16 },
    Eddystone { namespace: String, instance: String },
}

impl BeaconIdentity {
    pub fn key(&self) -> BeaconKey {
        match self {
            BeaconIdentity::IBeacon { proximity_uuid, major, minor } => {
                BeaconKey::ibeacon(proximity_uuid, *major, *minor)
            }
            BeaconIdentity::Eddystone { namespace, instance } => {
                BeaconKey::eddystone(namespace, instance)
            }
        }
    }
}

/// What a sample or exit did to a beacon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// `unknown -> in range`
    Entered { to: Proximity },
    /// In range, bucket changed
    Moved { from: Proximity, to: Proximity },
    /// In range, same bucket (distance/rssi refreshed)
    Refreshed,
    /// `in range -> unknown` (explicit exit)
    Exited { from: Proximity },
    /// Sample was not a legal transition and was ignored
    Ignored,
}

/// A configured beacon together with its live proximity state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Beacon {
    pub key: BeaconKey,
    #[serde(default)]
    pub name: String,
    /// Owning zone, resolved through the registry (non-owning link)
    #[serde(default)]
    pub zone: Option<ZoneId>,
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(default)]
    pub proximity: Proximity,
    /// Accuracy in meters, 0 when out of range
    #[serde(default)]
    pub accuracy: f64,
    #[serde(default)]
    pub estimated_distance: f64,
    #[serde(default)]
    pub rssi: i32,
    /// Epoch ms of the start of the current (or last) stay
    #[serde(default)]
    pub last_entered_at: Option<u64>,
    /// Length of the last completed stay
    #[serde(default)]
    pub last_stay_ms: u64,
}

impl Beacon {
    pub fn new(key: BeaconKey) -> Self {
        Self {
            key,
            name: String::new(),
            zone: None,
            location: None,
            proximity: Proximity::Unknown,
            accuracy: 0.0,
            estimated_distance: 0.0,
            rssi: 0,
            last_entered_at: None,
            last_stay_ms: 0,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_zone(mut self, zone: ZoneId) -> Self {
        self.zone = Some(zone);
        self
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    #[inline]
    pub fn is_in_range(&self) -> bool {
        self.proximity.is_in_range()
    }

    /// Ranging may only move a beacon between in-range buckets
    #[inline]
    pub fn can_set_proximity(&self, new_proximity: Proximity) -> bool {
        new_proximity.is_in_range()
    }

    /// Stay duration: running while in range, else the last completed stay
    pub fn stays_duration_ms(&self, now: u64) -> u64 {
        match (self.is_in_range(), self.last_entered_at) {
            (true, Some(entered)) => now.saturating_sub(entered),
            _ => self.last_stay_ms,
        }
    }

    /// Apply a merged ranging sample.
    ///
    /// `resume_stay` keeps the previous `last_entered_at` when the beacon comes
    /// back before its pending leave fired, so a flicker is not a new stay.
    pub fn apply_sample(&mut self, sample: &RawSample, now: u64, resume_stay: bool) -> Transition {
        let new_proximity = sample.proximity();
        if !self.can_set_proximity(new_proximity) {
            return Transition::Ignored;
        }

        let previous = self.proximity;
        self.proximity = new_proximity;
        self.estimated_distance = sample.distance.max(0.0);
        self.accuracy = self.estimated_distance;
        self.rssi = sample.rssi;

        if !previous.is_in_range() {
            if !(resume_stay && self.last_entered_at.is_some()) {
                self.last_entered_at = Some(now);
            }
            Transition::Entered { to: new_proximity }
        } else if previous != new_proximity {
            Transition::Moved { from: previous, to: new_proximity }
        } else {
            Transition::Refreshed
        }
    }

    /// Explicit region exit; completes the current stay
    pub fn exit(&mut self, now: u64) -> Transition {
        let previous = self.proximity;
        if !previous.is_in_range() {
            return Transition::Ignored;
        }
        self.last_stay_ms = self.stays_duration_ms(now);
        self.proximity = Proximity::Unknown;
        self.accuracy = 0.0;
        Transition::Exited { from: previous }
    }

    /// Copy live state from an older instance of the same beacon
    pub fn carry_live_state(&mut self, old: &Beacon) {
        self.proximity = old.proximity;
        self.accuracy = old.accuracy;
        self.estimated_distance = old.estimated_distance;
        self.rssi = old.rssi;
        self.last_entered_at = old.last_entered_at;
        self.last_stay_ms = old.last_stay_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(distance: f64) -> RawSample {
        RawSample::new(BeaconKey::new("b1"), -60, distance)
    }

    #[test]
    fn test_identity_keys() {
        let id = BeaconIdentity::IBeacon {
            proximity_uuid: "ABC".to_string(),
            major: 1,
            minor: 2,
        };
        assert_eq!(id.key(), BeaconKey::new("abc+1+2"));

        let json = r#"{"protocol":"eddystone","namespace":"NS","instance":"I1"}"#;
        let id: BeaconIdentity = serde_json::from_str(json).unwrap();
        assert_eq!(id.key(), BeaconKey::new("ns+i1"));
    }

    #[test]
    fn test_enter_sets_last_entered() {
        let mut beacon = Beacon::new(BeaconKey::new("b1"));
        let t = beacon.apply_sample(&sample(1.0), 1_000, false);

        assert_eq!(t, Transition::Entered { to: Proximity::Near });
        assert_eq!(beacon.last_entered_at, Some(1_000));
        assert_eq!(beacon.stays_duration_ms(4_000), 3_000);
    }

    #[test]
    fn test_moves_between_buckets_without_unknown() {
        let mut beacon = Beacon::new(BeaconKey::new("b1"));
        beacon.apply_sample(&sample(1.0), 1_000, false);

        let t = beacon.apply_sample(&sample(10.0), 2_000, false);
        assert_eq!(t, Transition::Moved { from: Proximity::Near, to: Proximity::Far });
        assert_eq!(beacon.last_entered_at, Some(1_000));

        let t = beacon.apply_sample(&sample(12.0), 3_000, false);
        assert_eq!(t, Transition::Refreshed);
    }

    #[test]
    fn test_sample_cannot_set_unknown() {
        let mut beacon = Beacon::new(BeaconKey::new("b1"));
        beacon.apply_sample(&sample(1.0), 1_000, false);

        let t = beacon.apply_sample(&sample(-1.0), 2_000, false);
        assert_eq!(t, Transition::Ignored);
        assert_eq!(beacon.proximity, Proximity::Near);
    }

    #[test]
    fn test_exit_completes_stay() {
        let mut beacon = Beacon::new(BeaconKey::new("b1"));
        beacon.apply_sample(&sample(1.0), 1_000, false);

        let t = beacon.exit(6_000);
        assert_eq!(t, Transition::Exited { from: Proximity::Near });
        assert_eq!(beacon.proximity, Proximity::Unknown);
        assert_eq!(beacon.stays_duration_ms(60_000), 5_000);

        // Exit while already out is a no-op
        assert_eq!(beacon.exit(7_000), Transition::Ignored);
    }

    #[test]
    fn test_new_enter_resets_stay() {
        let mut beacon = Beacon::new(BeaconKey::new("b1"));
        beacon.apply_sample(&sample(1.0), 1_000, false);
        beacon.exit(2_000);

        beacon.apply_sample(&sample(1.0), 10_000, false);
        assert_eq!(beacon.last_entered_at, Some(10_000));
        assert_eq!(beacon.stays_duration_ms(11_000), 1_000);
    }

    #[test]
    fn test_resumed_stay_keeps_entered_at() {
        let mut beacon = Beacon::new(BeaconKey::new("b1"));
        beacon.apply_sample(&sample(1.0), 1_000, false);
        beacon.exit(2_000);

        beacon.apply_sample(&sample(1.0), 3_000, true);
        assert_eq!(beacon.last_entered_at, Some(1_000));
        assert_eq!(beacon.stays_duration_ms(5_000), 4_000);
    }
}
