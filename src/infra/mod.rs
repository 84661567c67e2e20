//! Infrastructure - configuration, errors, and metrics
//!
//! - `config` - Application configuration (TOML loading, defaults)
//! - `error` - Error taxonomy shared by services and IO
//! - `metrics` - Lock-free metrics collection

pub mod config;
pub mod error;
pub mod metrics;

pub use config::Config;
pub use error::{BackendError, Capability, CapabilityReport, ConfigurationError, EngineError};
pub use metrics::Metrics;
