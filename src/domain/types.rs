//! Shared types for the beacon engine

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Opaque beacon identity.
///
/// Both iBeacon (UUID + major + minor) and Eddystone (namespace + instance)
/// identities collapse to one canonical lowercase string, so the rest of the
/// engine never cares which protocol a beacon speaks.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BeaconKey(pub String);

impl BeaconKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key for an iBeacon identity
    pub fn ibeacon(proximity_uuid: &str, major: u16, minor: u16) -> Self {
        Self(format!("{}+{}+{}", proximity_uuid.trim().to_ascii_lowercase(), major, minor))
    }

    /// Key for an Eddystone-UID identity
    pub fn eddystone(namespace: &str, instance: &str) -> Self {
        Self(format!(
            "{}+{}",
            namespace.trim().to_ascii_lowercase(),
            instance.trim().to_ascii_lowercase()
        ))
    }

    /// Canonical form of a key written by hand in a payload
    pub fn canonical(&self) -> Self {
        Self(self.0.trim().to_ascii_lowercase())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BeaconKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Newtype wrapper for zone identifiers
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ZoneId(pub String);

impl ZoneId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ZoneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Newtype wrapper for action identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(pub u64);

impl std::fmt::Display for ActionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype wrapper for trigger identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerId(pub u64);

impl std::fmt::Display for TriggerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Coarse distance classification reported by the radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Proximity {
    #[default]
    Unknown,
    Immediate,
    Near,
    Far,
}

/// Upper bound (meters) of the immediate bucket when deriving from distance
const IMMEDIATE_MAX_M: f64 = 0.5;
/// Upper bound (meters) of the near bucket when deriving from distance
const NEAR_MAX_M: f64 = 3.0;

impl Proximity {
    /// Derive a bucket from an estimated distance; negative means no fix
    pub fn from_distance(distance_m: f64) -> Self {
        if !distance_m.is_finite() || distance_m < 0.0 {
            Proximity::Unknown
        } else if distance_m < IMMEDIATE_MAX_M {
            Proximity::Immediate
        } else if distance_m < NEAR_MAX_M {
            Proximity::Near
        } else {
            Proximity::Far
        }
    }

    #[inline]
    pub fn is_in_range(&self) -> bool {
        !matches!(self, Proximity::Unknown)
    }

    /// The range event emitted when a beacon lands in this bucket
    pub fn range_event(&self) -> Option<EventType> {
        match self {
            Proximity::Immediate => Some(EventType::RangeImmediate),
            Proximity::Near => Some(EventType::RangeNear),
            Proximity::Far => Some(EventType::RangeFar),
            Proximity::Unknown => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Proximity::Unknown => "unknown",
            Proximity::Immediate => "immediate",
            Proximity::Near => "near",
            Proximity::Far => "far",
        }
    }
}

/// Kinds of events a trigger condition can react to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Enter,
    Leave,
    RangeImmediate,
    RangeNear,
    RangeFar,
    DwellTime,
    Timer,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Enter => "enter",
            EventType::Leave => "leave",
            EventType::RangeImmediate => "range_immediate",
            EventType::RangeNear => "range_near",
            EventType::RangeFar => "range_far",
            EventType::DwellTime => "dwell_time",
            EventType::Timer => "timer",
        }
    }

    /// Stable numeric code, used when hashing dedup keys
    pub fn code(&self) -> u8 {
        match self {
            EventType::Enter => 1,
            EventType::Leave => 2,
            EventType::RangeImmediate => 3,
            EventType::RangeNear => 4,
            EventType::RangeFar => 5,
            EventType::DwellTime => 6,
            EventType::Timer => 7,
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "enter" => EventType::Enter,
            "leave" => EventType::Leave,
            "range_immediate" => EventType::RangeImmediate,
            "range_near" => EventType::RangeNear,
            "range_far" => EventType::RangeFar,
            "dwell_time" => EventType::DwellTime,
            "timer" => EventType::Timer,
            other => return Err(format!("unknown event type '{other}'")),
        })
    }
}

/// Mean earth radius used for haversine distances
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Coarse device or beacon position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub floor: Option<i32>,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude, floor: None }
    }

    pub fn with_floor(mut self, floor: i32) -> Self {
        self.floor = Some(floor);
        self
    }

    /// Great-circle distance in meters (floors ignored)
    pub fn distance_m(&self, other: &Location) -> f64 {
        let (lat1, lat2) = (self.latitude.to_radians(), other.latitude.to_radians());
        let dlat = lat2 - lat1;
        let dlon = (other.longitude - self.longitude).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().asin()
    }

    /// True when both floors are known and differ
    pub fn is_other_floor(&self, other: &Location) -> bool {
        matches!((self.floor, other.floor), (Some(a), Some(b)) if a != b)
    }
}

/// One raw proximity sample from the radio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    pub key: BeaconKey,
    pub rssi: i32,
    /// Estimated distance in meters (negative when the radio has no fix)
    pub distance: f64,
    /// Bucket reported by the radio, derived from `distance` when absent
    #[serde(default)]
    pub proximity: Option<Proximity>,
}

impl RawSample {
    pub fn new(key: BeaconKey, rssi: i32, distance: f64) -> Self {
        Self { key, rssi, distance, proximity: None }
    }

    pub fn with_proximity(mut self, proximity: Proximity) -> Self {
        self.proximity = Some(proximity);
        self
    }

    #[inline]
    pub fn proximity(&self) -> Proximity {
        self.proximity.unwrap_or_else(|| Proximity::from_distance(self.distance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beacon_key_forms() {
        let ib = BeaconKey::ibeacon("F7826DA6-4FA2-4E98-8024-BC5B71E0893E", 1, 42);
        assert_eq!(ib.as_str(), "f7826da6-4fa2-4e98-8024-bc5b71e0893e+1+42");

        let ed = BeaconKey::eddystone("EDD1EBEAC04E5DEFA017", "0BDB87539B67");
        assert_eq!(ed.as_str(), "edd1ebeac04e5defa017+0bdb87539b67");
    }

    #[test]
    fn test_proximity_from_distance() {
        assert_eq!(Proximity::from_distance(-1.0), Proximity::Unknown);
        assert_eq!(Proximity::from_distance(f64::NAN), Proximity::Unknown);
        assert_eq!(Proximity::from_distance(0.2), Proximity::Immediate);
        assert_eq!(Proximity::from_distance(1.5), Proximity::Near);
        assert_eq!(Proximity::from_distance(8.0), Proximity::Far);
    }

    #[test]
    fn test_range_event_mapping() {
        assert_eq!(Proximity::Near.range_event(), Some(EventType::RangeNear));
        assert_eq!(Proximity::Unknown.range_event(), None);
    }

    #[test]
    fn test_event_type_from_str() {
        assert_eq!("dwell_time".parse::<EventType>().unwrap(), EventType::DwellTime);
        assert!("bogus".parse::<EventType>().is_err());
    }

    #[test]
    fn test_location_distance() {
        let a = Location::new(52.2297, 21.0122);
        let b = Location::new(52.2297, 21.0137);
        let d = a.distance_m(&b);
        assert!(d > 90.0 && d < 115.0, "distance was {d}");
        assert!(a.distance_m(&a) < 1e-6);
    }

    #[test]
    fn test_other_floor() {
        let a = Location::new(0.0, 0.0).with_floor(1);
        let b = Location::new(0.0, 0.0).with_floor(2);
        let c = Location::new(0.0, 0.0);
        assert!(a.is_other_floor(&b));
        assert!(!a.is_other_floor(&c));
    }

    #[test]
    fn test_sample_proximity_fallback() {
        let s = RawSample::new(BeaconKey::new("a"), -60, 1.0);
        assert_eq!(s.proximity(), Proximity::Near);
        let s = s.with_proximity(Proximity::Immediate);
        assert_eq!(s.proximity(), Proximity::Immediate);
    }
}
