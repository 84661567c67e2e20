//! Zone: a named group of beacons

use crate::domain::types::{BeaconKey, ZoneId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A logical area made of beacons. Membership is by key only; the zone never
/// owns beacon lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: ZoneId,
    #[serde(default)]
    pub name: String,
    /// Display color as sent by the backend (e.g. `#ff8800`), kept opaque
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub beacons: BTreeSet<BeaconKey>,
}

impl Zone {
    pub fn new(id: ZoneId) -> Self {
        Self { id, name: String::new(), color: None, beacons: BTreeSet::new() }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_beacon(mut self, key: BeaconKey) -> Self {
        self.beacons.insert(key);
        self
    }

    #[inline]
    pub fn contains(&self, key: &BeaconKey) -> bool {
        self.beacons.contains(key)
    }
}
