//! Error taxonomy for the beacon engine
//!
//! - `Capability`: pre-flight reasons monitoring cannot (fully) run. Never fatal.
//! - `BackendError`: delivery / fetch failures, classified for retry.
//! - `ConfigurationError`: a site payload that fails validation. Existing state is kept.
//! - `PersistenceError`: snapshot read/write failures.
//! - `EngineError`: umbrella returned by engine operations.

use crate::domain::types::{ActionId, BeaconKey, TriggerId, ZoneId};
use std::path::PathBuf;
use thiserror::Error;

/// A platform capability that is missing or denied
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Error)]
pub enum Capability {
    #[error("Bluetooth is powered off")]
    BluetoothOff,
    #[error("region monitoring is not available on this device")]
    MonitoringUnavailable,
    #[error("location permission denied")]
    LocationDenied,
    #[error("background refresh denied; timers may not fire while suspended")]
    BackgroundRefreshDenied,
    #[error("notification permission denied")]
    NotificationsDenied,
}

impl Capability {
    /// Reasons that prevent monitoring from starting at all
    #[inline]
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            Capability::BluetoothOff | Capability::MonitoringUnavailable | Capability::LocationDenied
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::BluetoothOff => "bluetooth_off",
            Capability::MonitoringUnavailable => "monitoring_unavailable",
            Capability::LocationDenied => "location_denied",
            Capability::BackgroundRefreshDenied => "background_refresh_denied",
            Capability::NotificationsDenied => "notifications_denied",
        }
    }
}

/// Result of a capability pre-flight check
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityReport {
    pub missing: Vec<Capability>,
}

impl CapabilityReport {
    pub fn new(mut missing: Vec<Capability>) -> Self {
        missing.sort();
        missing.dedup();
        Self { missing }
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        !self.missing.iter().any(Capability::is_blocking)
    }

    pub fn blocking(&self) -> impl Iterator<Item = &Capability> {
        self.missing.iter().filter(|c| c.is_blocking())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Capability> {
        self.missing.iter().filter(|c| !c.is_blocking())
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.missing.contains(&capability)
    }
}

/// Failure talking to the backend collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Transient(String),
    #[error("backend rejected credentials")]
    Unauthorized,
    #[error("backend returned an invalid payload: {0}")]
    InvalidPayload(String),
}

impl BackendError {
    /// Transient failures are retried on the next flush; auth needs a token refresh first
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }

    #[inline]
    pub fn is_auth(&self) -> bool {
        matches!(self, BackendError::Unauthorized)
    }
}

/// A site configuration payload that cannot be applied
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error("failed to parse site configuration: {0}")]
    Parse(String),
    #[error("duplicate beacon '{0}'")]
    DuplicateBeacon(BeaconKey),
    #[error("duplicate zone '{0}'")]
    DuplicateZone(ZoneId),
    #[error("duplicate trigger {0}")]
    DuplicateTrigger(TriggerId),
    #[error("duplicate action {0}")]
    DuplicateAction(ActionId),
    #[error("zone '{zone}' references unknown beacon '{beacon}'")]
    UnknownBeacon { zone: ZoneId, beacon: BeaconKey },
    #[error("beacon '{beacon}' belongs to both '{first}' and '{second}'")]
    BeaconInTwoZones { beacon: BeaconKey, first: ZoneId, second: ZoneId },
    #[error("trigger {0} has no conditions")]
    EmptyTrigger(TriggerId),
    #[error("trigger {trigger} is scoped to missing {entity}")]
    MissingScope { trigger: TriggerId, entity: String },
    #[error("trigger {trigger} has an invalid condition: {reason}")]
    InvalidCondition { trigger: TriggerId, reason: String },
}

impl From<serde_json::Error> for ConfigurationError {
    fn from(err: serde_json::Error) -> Self {
        ConfigurationError::Parse(err.to_string())
    }
}

/// Snapshot store failures
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to read snapshot {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write snapshot {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot is corrupt: {0}")]
    Corrupt(String),
}

/// Umbrella error for engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("monitoring blocked: {}", format_capabilities(.0))]
    NotReady(Vec<Capability>),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

fn format_capabilities(caps: &[Capability]) -> String {
    caps.iter().map(Capability::as_str).collect::<Vec<_>>().join(", ")
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    #[inline]
    #[must_use]
    pub fn is_capability_error(&self) -> bool {
        matches!(self, Self::NotReady(_))
    }

    #[inline]
    #[must_use]
    pub fn is_delivery_error(&self) -> bool {
        matches!(self, Self::Backend(_))
    }

    #[inline]
    #[must_use]
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// True when retrying later without user action may succeed
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Backend(e) => e.is_retryable(),
            Self::Persistence(PersistenceError::Read { .. } | PersistenceError::Write { .. }) => true,
            _ => false,
        }
    }

    /// Machine-readable code for logs
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotReady(_) => "NOT_READY",
            Self::Backend(BackendError::Transient(_)) => "BACKEND_TRANSIENT",
            Self::Backend(BackendError::Unauthorized) => "BACKEND_UNAUTHORIZED",
            Self::Backend(BackendError::InvalidPayload(_)) => "BACKEND_INVALID_PAYLOAD",
            Self::Configuration(_) => "CONFIGURATION_INVALID",
            Self::Persistence(PersistenceError::Corrupt(_)) => "SNAPSHOT_CORRUPT",
            Self::Persistence(_) => "SNAPSHOT_IO",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_report_blocking() {
        let report = CapabilityReport::new(vec![
            Capability::NotificationsDenied,
            Capability::BackgroundRefreshDenied,
        ]);
        assert!(report.is_ready());
        assert_eq!(report.warnings().count(), 2);

        let report = CapabilityReport::new(vec![Capability::BluetoothOff, Capability::BluetoothOff]);
        assert!(!report.is_ready());
        assert_eq!(report.missing.len(), 1);
        assert!(report.has(Capability::BluetoothOff));
    }

    #[test]
    fn test_backend_error_classification() {
        assert!(BackendError::Transient("timeout".into()).is_retryable());
        assert!(!BackendError::Unauthorized.is_retryable());
        assert!(BackendError::Unauthorized.is_auth());
        assert!(!BackendError::InvalidPayload("x".into()).is_retryable());
    }

    #[test]
    fn test_engine_error_codes() {
        let err: EngineError = BackendError::Unauthorized.into();
        assert_eq!(err.error_code(), "BACKEND_UNAUTHORIZED");
        assert!(err.is_delivery_error());
        assert!(!err.is_recoverable());

        let err: EngineError = ConfigurationError::EmptyTrigger(TriggerId(3)).into();
        assert_eq!(err.error_code(), "CONFIGURATION_INVALID");
        assert!(err.is_config_error());

        let err = EngineError::NotReady(vec![Capability::BluetoothOff, Capability::LocationDenied]);
        assert!(err.to_string().contains("bluetooth_off, location_denied"));
        assert!(err.is_capability_error());
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<EngineError>();
    }
}
