//! IO modules - collaborator interfaces and default adapters
//!
//! - `backend` - configuration fetch, event delivery, token refresh
//! - `platform` - region monitoring and capability probe
//! - `observer` - host hooks (actions, zone / closest beacon changes)
//! - `persistence` - engine snapshots
//! - `feed` - JSONL feed of platform callbacks
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod backend;
pub mod feed;
pub mod observer;
pub mod persistence;
pub mod platform;
pub mod prometheus;

// Re-export commonly used types
pub use backend::{Backend, FileBackend, MemoryBackend};
pub use feed::{parse_feed_line, read_feed, read_stdin_feed, FeedStats};
pub use observer::{NoopObserver, Observer, ObserverHooks, TracingObserver};
pub use persistence::{JsonFileStore, MemoryStore, Snapshot, SnapshotStore};
pub use platform::{Capabilities, Platform, RecordingPlatform};
