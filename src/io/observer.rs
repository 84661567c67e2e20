//! Observer hooks for the host (notifications, UI)
//!
//! An observer declares the hooks it implements through `ObserverHooks`; the
//! engine only calls hooks present in that set. Veto hooks default to "allow".

use crate::domain::beacon::Beacon;
use crate::domain::event::ActionEvent;
use crate::domain::types::{BeaconKey, ZoneId};
use crate::services::actions::PerformOutcome;
use crate::services::trigger_engine::ActionMatch;
use std::collections::BTreeSet;
use tracing::info;

bitflags::bitflags! {
    /// Hooks an observer wants to receive
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ObserverHooks: u16 {
        const WILL_PERFORM_ACTION        = 1 << 0;
        const DID_PERFORM_ACTION         = 1 << 1;
        const SHOULD_AUTO_PERFORM_ACTION = 1 << 2;
        const SHOULD_AUTO_NOTIFY_ACTION  = 1 << 3;
        const NOTIFY_ACTION              = 1 << 4;
        const OBSERVED_BEACONS_CHANGED   = 1 << 5;
        const CLOSEST_BEACON_CHANGED     = 1 << 6;
        const CURRENT_ZONE_CHANGED       = 1 << 7;
    }
}

pub trait Observer: Send {
    fn hooks(&self) -> ObserverHooks;

    fn will_perform_action(&mut self, _action: &ActionMatch, _event: &ActionEvent) {}

    fn did_perform_action(&mut self, _action: &ActionMatch, _event: &ActionEvent, _outcome: &PerformOutcome) {}

    /// Return false to skip the default handler for this action instance
    fn should_auto_perform_action(&mut self, _action: &ActionMatch) -> bool {
        true
    }

    /// Return false to suppress the background notification for this action instance
    fn should_auto_notify_action(&mut self, _action: &ActionMatch) -> bool {
        true
    }

    /// Present a notification for an action fired while backgrounded
    fn notify_action(&mut self, _action: &ActionMatch, _event: &ActionEvent) {}

    fn observed_beacons_changed(&mut self, _beacons: &BTreeSet<BeaconKey>, _zones: &BTreeSet<ZoneId>) {}

    fn closest_beacon_changed(&mut self, _beacon: Option<&Beacon>) {}

    fn current_zone_changed(&mut self, _from: Option<&ZoneId>, _to: Option<&ZoneId>) {}
}

/// Observer that wants nothing
#[derive(Debug, Default)]
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn hooks(&self) -> ObserverHooks {
        ObserverHooks::empty()
    }
}

/// Logs every hook; the daemon default
#[derive(Debug, Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn hooks(&self) -> ObserverHooks {
        ObserverHooks::all()
            - ObserverHooks::SHOULD_AUTO_PERFORM_ACTION
            - ObserverHooks::SHOULD_AUTO_NOTIFY_ACTION
    }

    fn will_perform_action(&mut self, action: &ActionMatch, event: &ActionEvent) {
        info!(
            action_id = %action.action.id,
            action_type = %action.action.action_type,
            event = event.event_type.as_str(),
            entity = %event.entity,
            "will_perform_action"
        );
    }

    fn did_perform_action(&mut self, action: &ActionMatch, event: &ActionEvent, outcome: &PerformOutcome) {
        info!(action_id = %action.action.id, event_id = %event.id, outcome = ?outcome, "did_perform_action");
    }

    fn notify_action(&mut self, action: &ActionMatch, event: &ActionEvent) {
        info!(action_id = %action.action.id, name = %action.action.name, entity = %event.entity, "notify_action");
    }

    fn observed_beacons_changed(&mut self, beacons: &BTreeSet<BeaconKey>, zones: &BTreeSet<ZoneId>) {
        info!(beacons = beacons.len(), zones = ?zones, "observed_beacons_changed");
    }

    fn closest_beacon_changed(&mut self, beacon: Option<&Beacon>) {
        match beacon {
            Some(b) => info!(beacon = %b.key, distance_m = b.estimated_distance, "closest_beacon_changed"),
            None => info!("closest_beacon_cleared"),
        }
    }

    fn current_zone_changed(&mut self, from: Option<&ZoneId>, to: Option<&ZoneId>) {
        info!(from = ?from, to = ?to, "current_zone_changed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_sets() {
        assert!(NoopObserver.hooks().is_empty());

        let hooks = TracingObserver.hooks();
        assert!(hooks.contains(ObserverHooks::CURRENT_ZONE_CHANGED | ObserverHooks::NOTIFY_ACTION));
        assert!(!hooks.contains(ObserverHooks::SHOULD_AUTO_PERFORM_ACTION));
    }
}
