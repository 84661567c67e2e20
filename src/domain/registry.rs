//! Owning registry for the beacon / zone / trigger graph
//!
//! Every cross reference (beacon -> zone, action -> trigger, trigger -> scope)
//! is a key resolved through this registry, so a whole configuration can be
//! swapped without dangling links.

use crate::domain::beacon::{Beacon, BeaconIdentity};
use crate::domain::trigger::{Action, Condition, Trigger, TriggerScope};
use crate::domain::types::{ActionId, BeaconKey, Location, TriggerId, ZoneId};
use crate::domain::zone::Zone;
use crate::infra::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One beacon as described by the site payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeaconSpec {
    #[serde(flatten)]
    pub identity: BeaconIdentity,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub location: Option<Location>,
}

/// Raw configuration payload as fetched from the backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteConfiguration {
    #[serde(default)]
    pub beacons: Vec<BeaconSpec>,
    #[serde(default)]
    pub zones: Vec<Zone>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    /// Extension names to enable
    #[serde(default)]
    pub extensions: Vec<String>,
}

impl SiteConfiguration {
    pub fn from_json(json: &str) -> Result<Self, ConfigurationError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Validated beacon / zone / trigger graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    beacons: BTreeMap<BeaconKey, Beacon>,
    zones: BTreeMap<ZoneId, Zone>,
    triggers: BTreeMap<TriggerId, Trigger>,
    #[serde(default)]
    extensions: Vec<String>,
}

impl Registry {
    /// Validate a payload and build the graph. Nothing is partially applied on error.
    pub fn from_site(site: SiteConfiguration) -> Result<Self, ConfigurationError> {
        let mut beacons = BTreeMap::new();
        for spec in site.beacons {
            let key = spec.identity.key();
            if beacons.contains_key(&key) {
                return Err(ConfigurationError::DuplicateBeacon(key));
            }
            let mut beacon = Beacon::new(key.clone()).with_name(&spec.name);
            beacon.location = spec.location;
            beacons.insert(key, beacon);
        }

        let mut zones: BTreeMap<ZoneId, Zone> = BTreeMap::new();
        for mut zone in site.zones {
            zone.beacons = zone.beacons.iter().map(BeaconKey::canonical).collect();
            if zones.contains_key(&zone.id) {
                return Err(ConfigurationError::DuplicateZone(zone.id));
            }
            for key in &zone.beacons {
                let beacon: &mut Beacon = beacons.get_mut(key).ok_or_else(|| {
                    ConfigurationError::UnknownBeacon { zone: zone.id.clone(), beacon: key.clone() }
                })?;
                if let Some(first) = &beacon.zone {
                    return Err(ConfigurationError::BeaconInTwoZones {
                        beacon: key.clone(),
                        first: first.clone(),
                        second: zone.id.clone(),
                    });
                }
                beacon.zone = Some(zone.id.clone());
            }
            zones.insert(zone.id.clone(), zone);
        }

        let mut triggers = BTreeMap::new();
        let mut action_ids: BTreeSet<ActionId> = BTreeSet::new();
        for mut trigger in site.triggers {
            if triggers.contains_key(&trigger.id) {
                return Err(ConfigurationError::DuplicateTrigger(trigger.id));
            }
            if trigger.conditions.is_empty() {
                return Err(ConfigurationError::EmptyTrigger(trigger.id));
            }
            if let TriggerScope::Beacon(key) = &mut trigger.scope {
                *key = key.canonical();
            }
            let scope_exists = match &trigger.scope {
                TriggerScope::Beacon(key) => beacons.contains_key(key),
                TriggerScope::Zone(id) => zones.contains_key(id),
            };
            if !scope_exists {
                let entity = match &trigger.scope {
                    TriggerScope::Beacon(key) => format!("beacon '{key}'"),
                    TriggerScope::Zone(id) => format!("zone '{id}'"),
                };
                return Err(ConfigurationError::MissingScope { trigger: trigger.id, entity });
            }
            validate_conditions(&trigger)?;
            for action in &mut trigger.actions {
                if !action_ids.insert(action.id) {
                    return Err(ConfigurationError::DuplicateAction(action.id));
                }
                action.trigger = Some(trigger.id);
            }
            triggers.insert(trigger.id, trigger);
        }

        Ok(Self { beacons, zones, triggers, extensions: site.extensions })
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigurationError> {
        Self::from_site(SiteConfiguration::from_json(json)?)
    }

    #[inline]
    pub fn beacon(&self, key: &BeaconKey) -> Option<&Beacon> {
        self.beacons.get(key)
    }

    #[inline]
    pub fn beacon_mut(&mut self, key: &BeaconKey) -> Option<&mut Beacon> {
        self.beacons.get_mut(key)
    }

    pub fn beacons(&self) -> impl Iterator<Item = &Beacon> {
        self.beacons.values()
    }

    pub fn beacon_keys(&self) -> impl Iterator<Item = &BeaconKey> {
        self.beacons.keys()
    }

    #[inline]
    pub fn beacon_count(&self) -> usize {
        self.beacons.len()
    }

    pub fn zone(&self, id: &ZoneId) -> Option<&Zone> {
        self.zones.get(id)
    }

    pub fn zones(&self) -> impl Iterator<Item = &Zone> {
        self.zones.values()
    }

    /// Owning zone of a beacon; `None` for unknown or unzoned beacons
    pub fn zone_of(&self, key: &BeaconKey) -> Option<&ZoneId> {
        self.beacons.get(key).and_then(|b| b.zone.as_ref())
    }

    pub fn trigger(&self, id: TriggerId) -> Option<&Trigger> {
        self.triggers.get(&id)
    }

    pub fn triggers(&self) -> impl Iterator<Item = &Trigger> {
        self.triggers.values()
    }

    /// Triggers attached to a scope, in trigger-id order
    pub fn triggers_for(&self, scope: TriggerScope) -> impl Iterator<Item = &Trigger> + '_ {
        self.triggers.values().filter(move |t| t.scope == scope)
    }

    pub fn action(&self, id: ActionId) -> Option<&Action> {
        self.triggers.values().flat_map(|t| t.actions.iter()).find(|a| a.id == id)
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    /// Keep live proximity state of beacons that exist in both graphs
    pub fn carry_live_state_from(&mut self, old: &Registry) {
        for (key, beacon) in self.beacons.iter_mut() {
            if let Some(previous) = old.beacons.get(key) {
                beacon.carry_live_state(previous);
            }
        }
    }

    /// Beacons present in `old` but not in `self`
    pub fn removed_since(&self, old: &Registry) -> Vec<BeaconKey> {
        old.beacons.keys().filter(|k| !self.beacons.contains_key(*k)).cloned().collect()
    }
}

fn validate_conditions(trigger: &Trigger) -> Result<(), ConfigurationError> {
    for condition in &trigger.conditions {
        if let Condition::Timer { interval_ms: 0 } = condition {
            return Err(ConfigurationError::InvalidCondition {
                trigger: trigger.id,
                reason: "timer interval must be positive".to_string(),
            });
        }
    }
    // A conjunction over two different event kinds can never match a single event
    let mut kinds = trigger.conditions.iter().map(Condition::event_type);
    if let Some(first) = kinds.next() {
        if kinds.any(|k| k != first) {
            return Err(ConfigurationError::InvalidCondition {
                trigger: trigger.id,
                reason: "conditions mix different event kinds".to_string(),
            });
        }
    }
    Ok(())
}
