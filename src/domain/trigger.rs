//! Triggers, their conditions and the actions they invoke

use crate::domain::types::{ActionId, BeaconKey, EventType, TriggerId, ZoneId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Closed set of condition kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    Enter,
    Leave,
    RangeImmediate,
    RangeNear,
    RangeFar,
    /// Matches once the stay reaches `threshold_ms`
    DwellTime { threshold_ms: u64 },
    /// Fires every `interval_ms` while the beacon stays in range
    Timer { interval_ms: u64 },
}

impl Condition {
    pub fn event_type(&self) -> EventType {
        match self {
            Condition::Enter => EventType::Enter,
            Condition::Leave => EventType::Leave,
            Condition::RangeImmediate => EventType::RangeImmediate,
            Condition::RangeNear => EventType::RangeNear,
            Condition::RangeFar => EventType::RangeFar,
            Condition::DwellTime { .. } => EventType::DwellTime,
            Condition::Timer { .. } => EventType::Timer,
        }
    }
}

/// What a trigger is attached to
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum TriggerScope {
    Beacon(BeaconKey),
    Zone(ZoneId),
}

/// A configured action. `trigger` is a lookup key into the registry, not an owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: ActionId,
    #[serde(default)]
    pub name: String,
    /// Handler name (`url`, `custom`, ...), resolved through the action registry
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub payload: BTreeMap<String, Value>,
    #[serde(default)]
    pub custom_values: Vec<Value>,
    #[serde(default)]
    pub is_test_action: bool,
    #[serde(default)]
    pub trigger: Option<TriggerId>,
}

impl Action {
    pub fn new(id: u64, action_type: &str) -> Self {
        Self {
            id: ActionId(id),
            name: String::new(),
            action_type: action_type.to_string(),
            payload: BTreeMap::new(),
            custom_values: Vec::new(),
            is_test_action: false,
            trigger: None,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_payload(mut self, key: &str, value: Value) -> Self {
        self.payload.insert(key.to_string(), value);
        self
    }

    pub fn test_action(mut self) -> Self {
        self.is_test_action = true;
        self
    }

    /// `url` payload entry, if present and a string
    pub fn url(&self) -> Option<&str> {
        self.payload.get("url").and_then(Value::as_str)
    }
}

/// Conditions (all must hold) plus the actions to run when they do
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: TriggerId,
    pub scope: TriggerScope,
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

impl Trigger {
    pub fn new(id: u64, scope: TriggerScope) -> Self {
        Self { id: TriggerId(id), scope, conditions: Vec::new(), actions: Vec::new() }
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_action(mut self, mut action: Action) -> Self {
        action.trigger = Some(self.id);
        self.actions.push(action);
        self
    }

    /// Dwell thresholds this trigger waits on
    pub fn dwell_thresholds(&self) -> impl Iterator<Item = u64> + '_ {
        self.conditions.iter().filter_map(|c| match c {
            Condition::DwellTime { threshold_ms } => Some(*threshold_ms),
            _ => None,
        })
    }

    /// Timer intervals this trigger waits on
    pub fn timer_intervals(&self) -> impl Iterator<Item = u64> + '_ {
        self.conditions.iter().filter_map(|c| match c {
            Condition::Timer { interval_ms } => Some(*interval_ms),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_condition_wire_form() {
        let c: Condition = serde_json::from_value(json!({"kind": "dwell_time", "threshold_ms": 5000})).unwrap();
        assert_eq!(c, Condition::DwellTime { threshold_ms: 5000 });
        assert_eq!(c.event_type(), EventType::DwellTime);

        let c: Condition = serde_json::from_value(json!({"kind": "range_near"})).unwrap();
        assert_eq!(c.event_type(), EventType::RangeNear);
    }

    #[test]
    fn test_scope_wire_form() {
        let s: TriggerScope = serde_json::from_value(json!({"type": "zone", "id": "z1"})).unwrap();
        assert_eq!(s, TriggerScope::Zone(ZoneId::new("z1")));
    }

    #[test]
    fn test_action_back_reference_and_url() {
        let trigger = Trigger::new(7, TriggerScope::Beacon(BeaconKey::new("b1")))
            .with_condition(Condition::Enter)
            .with_action(Action::new(1, "url").with_payload("url", json!("https://example.org")));

        assert_eq!(trigger.actions[0].trigger, Some(TriggerId(7)));
        assert_eq!(trigger.actions[0].url(), Some("https://example.org"));
        assert_eq!(Action::new(2, "custom").url(), None);
    }
}
