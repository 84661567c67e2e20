//! Services - pipeline components and the engine that serializes them
//!
//! - `ranging` - merges per-region ranging callbacks into one batch per pass
//! - `region_selector` - picks the monitored beacon set under the hardware cap
//! - `zone_resolver` - beacon transitions and the zone the device is in
//! - `scheduler` - delayed, cancellable leave / zone-change timers
//! - `trigger_engine` - condition evaluation (incl. dwell and timers)
//! - `dedup` - at-most-once-per-interval action firing
//! - `spooler` - ordered, bounded event queue with batched delivery
//! - `actions` - action handler and extension registries
//! - `engine` - the serialized pipeline and its run loop

pub mod actions;
pub mod dedup;
pub mod engine;
pub mod ranging;
pub mod region_selector;
pub mod scheduler;
pub mod spooler;
pub mod trigger_engine;
pub mod zone_resolver;

// Re-export commonly used types
pub use actions::{ActionHandler, ActionRegistry, Extension, ExtensionRegistry, PerformOutcome};
pub use engine::{Engine, PipelineInput};
pub use trigger_engine::ActionMatch;
