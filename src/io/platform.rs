//! Platform ranging/monitoring collaborator
//!
//! The engine tells the platform which regions to monitor; samples and region
//! enter/exit callbacks come back through the engine's input channel (see
//! `io::feed`). Capabilities are probed before monitoring starts.

use crate::domain::types::BeaconKey;
use crate::infra::error::{Capability, CapabilityReport};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::info;

/// Raw capability state as reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    pub bluetooth_on: bool,
    pub monitoring_available: bool,
    pub location_authorized: bool,
    pub background_refresh: bool,
    pub notifications_authorized: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            bluetooth_on: true,
            monitoring_available: true,
            location_authorized: true,
            background_refresh: true,
            notifications_authorized: true,
        }
    }
}

impl Capabilities {
    pub fn report(&self) -> CapabilityReport {
        let checks = [
            (self.bluetooth_on, Capability::BluetoothOff),
            (self.monitoring_available, Capability::MonitoringUnavailable),
            (self.location_authorized, Capability::LocationDenied),
            (self.background_refresh, Capability::BackgroundRefreshDenied),
            (self.notifications_authorized, Capability::NotificationsDenied),
        ];
        CapabilityReport::new(checks.into_iter().filter(|(ok, _)| !ok).map(|(_, c)| c).collect())
    }
}

pub trait Platform: Send {
    /// Replace the monitored region set (never more than the hardware cap)
    fn start_monitoring(&mut self, regions: &BTreeSet<BeaconKey>);
    fn stop_monitoring(&mut self);
    fn capabilities(&self) -> Capabilities;
}

#[derive(Debug, Default)]
struct RecordingState {
    monitored: BTreeSet<BeaconKey>,
    monitoring: bool,
    start_calls: usize,
    stop_calls: usize,
    capabilities: Capabilities,
}

/// Platform adapter that records the requested region set.
///
/// Used by the daemon, where the actual radio sits behind the stdin feed, and
/// by tests. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct RecordingPlatform {
    state: std::sync::Arc<Mutex<RecordingState>>,
}

impl RecordingPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_capabilities(&self, capabilities: Capabilities) {
        self.state.lock().capabilities = capabilities;
    }

    pub fn monitored(&self) -> BTreeSet<BeaconKey> {
        self.state.lock().monitored.clone()
    }

    pub fn is_monitoring(&self) -> bool {
        self.state.lock().monitoring
    }

    pub fn start_calls(&self) -> usize {
        self.state.lock().start_calls
    }

    pub fn stop_calls(&self) -> usize {
        self.state.lock().stop_calls
    }
}

impl Platform for RecordingPlatform {
    fn start_monitoring(&mut self, regions: &BTreeSet<BeaconKey>) {
        let mut state = self.state.lock();
        state.monitored = regions.clone();
        state.monitoring = true;
        state.start_calls += 1;
        info!(regions = regions.len(), "platform_monitoring_started");
    }

    fn stop_monitoring(&mut self) {
        let mut state = self.state.lock();
        state.monitored.clear();
        state.monitoring = false;
        state.stop_calls += 1;
        info!("platform_monitoring_stopped");
    }

    fn capabilities(&self) -> Capabilities {
        self.state.lock().capabilities
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_report() {
        let caps = Capabilities { bluetooth_on: false, notifications_authorized: false, ..Default::default() };
        let report = caps.report();

        assert!(!report.is_ready());
        assert!(report.has(Capability::BluetoothOff));
        assert_eq!(report.warnings().count(), 1);
        assert!(Capabilities::default().report().is_ready());
    }

    #[test]
    fn test_recording_platform_shares_state() {
        let platform = RecordingPlatform::new();
        let mut handle = platform.clone();
        let regions: BTreeSet<_> = [BeaconKey::new("a"), BeaconKey::new("b")].into();

        handle.start_monitoring(&regions);
        assert!(platform.is_monitoring());
        assert_eq!(platform.monitored(), regions);

        handle.stop_monitoring();
        assert!(platform.monitored().is_empty());
        assert_eq!(platform.stop_calls(), 1);
    }
}
