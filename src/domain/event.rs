//! Fired action events and their dedup identity

use crate::domain::types::{ActionId, BeaconKey, EventType, ZoneId};
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Namespace for deterministic event ids
const EVENT_ID_NAMESPACE: Uuid = Uuid::from_u128(0x5b3e_0c7a_91d4_4f0e_b2a6_7d1c_e84f_2a90);

/// Beacon or zone an event refers to
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum EntityRef {
    Beacon(BeaconKey),
    Zone(ZoneId),
}

impl EntityRef {
    pub fn as_str(&self) -> &str {
        match self {
            EntityRef::Beacon(key) => key.as_str(),
            EntityRef::Zone(id) => id.as_str(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EntityRef::Beacon(_) => "beacon",
            EntityRef::Zone(_) => "zone",
        }
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.as_str())
    }
}

/// Hash of (entity, action, event kind), used to suppress re-firing
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(pub u64);

impl DedupKey {
    pub fn compute(entity: &EntityRef, action_id: ActionId, event_type: EventType) -> Self {
        let mut hasher = FxHasher::default();
        entity.kind().hash(&mut hasher);
        entity.as_str().hash(&mut hasher);
        action_id.0.hash(&mut hasher);
        event_type.code().hash(&mut hasher);
        Self(hasher.finish())
    }
}

impl std::fmt::Display for DedupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0.to_be_bytes()))
    }
}

/// One fired action, as queued for backend delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEvent {
    /// Deterministic id; the backend dedups on it
    pub id: String,
    pub event_type: EventType,
    pub entity: EntityRef,
    pub action_id: ActionId,
    #[serde(default)]
    pub action_name: String,
    pub timestamp_ms: u64,
}

impl ActionEvent {
    pub fn new(event_type: EventType, entity: EntityRef, action_id: ActionId, timestamp_ms: u64) -> Self {
        let id = Self::event_id(event_type, &entity, action_id, timestamp_ms);
        Self { id, event_type, entity, action_id, action_name: String::new(), timestamp_ms }
    }

    pub fn with_action_name(mut self, name: &str) -> Self {
        self.action_name = name.to_string();
        self
    }

    /// UUIDv5 over `kind|entity|action|timestamp`
    pub fn event_id(event_type: EventType, entity: &EntityRef, action_id: ActionId, timestamp_ms: u64) -> String {
        let name = format!("{}|{}|{}|{}", event_type.as_str(), entity, action_id, timestamp_ms);
        Uuid::new_v5(&EVENT_ID_NAMESPACE, name.as_bytes()).to_string()
    }

    pub fn dedup_key(&self) -> DedupKey {
        DedupKey::compute(&self.entity, self.action_id, self.event_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beacon(key: &str) -> EntityRef {
        EntityRef::Beacon(BeaconKey::new(key))
    }

    #[test]
    fn test_event_id_is_deterministic() {
        let a = ActionEvent::new(EventType::Enter, beacon("b1"), ActionId(3), 1_000);
        let b = ActionEvent::new(EventType::Enter, beacon("b1"), ActionId(3), 1_000);
        let c = ActionEvent::new(EventType::Enter, beacon("b1"), ActionId(3), 1_001);

        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn test_dedup_key_ignores_timestamp() {
        let a = ActionEvent::new(EventType::RangeNear, beacon("b1"), ActionId(3), 1_000);
        let b = ActionEvent::new(EventType::RangeNear, beacon("b1"), ActionId(3), 9_000);
        assert_eq!(a.dedup_key(), b.dedup_key());
    }

    #[test]
    fn test_dedup_key_separates_entities_and_kinds() {
        let base = DedupKey::compute(&beacon("b1"), ActionId(3), EventType::Enter);
        assert_ne!(base, DedupKey::compute(&beacon("b2"), ActionId(3), EventType::Enter));
        assert_ne!(base, DedupKey::compute(&beacon("b1"), ActionId(4), EventType::Enter));
        assert_ne!(base, DedupKey::compute(&beacon("b1"), ActionId(3), EventType::Leave));
        assert_ne!(
            base,
            DedupKey::compute(&EntityRef::Zone(ZoneId::new("b1")), ActionId(3), EventType::Enter)
        );
    }

    #[test]
    fn test_dedup_key_display_is_hex() {
        let key = DedupKey(0xff);
        assert_eq!(key.to_string(), "00000000000000ff");
    }
}
