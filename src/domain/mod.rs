//! Domain models - core business types
//!
//! This module contains the canonical data types used throughout the system:
//! - `Beacon` - a configured beacon and its live proximity state
//! - `Zone` - a named group of beacons
//! - `Trigger` / `Condition` / `Action` - what to do on which event
//! - `ActionEvent` - a fired action queued for delivery
//! - `Registry` - owner of the whole graph, resolves all cross references

pub mod beacon;
pub mod event;
pub mod registry;
pub mod trigger;
pub mod types;
pub mod zone;

// Re-export commonly used types at module level
pub use beacon::{Beacon, BeaconIdentity, Transition};
pub use event::{ActionEvent, DedupKey, EntityRef};
pub use registry::{Registry, SiteConfiguration};
pub use trigger::{Action, Condition, Trigger, TriggerScope};
pub use types::{epoch_ms, ActionId, BeaconKey, EventType, Location, Proximity, RawSample, TriggerId, ZoneId};
pub use zone::Zone;
