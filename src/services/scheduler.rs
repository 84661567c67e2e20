//! Delayed beacon-leave and zone-change notifications
//!
//! Pending entries carry an `fire_at` epoch ms and are released by `poll`.
//! Re-scheduling replaces, cancelling is idempotent, and at most one zone
//! change is outstanding. While backgrounded, timers only fire inside the
//! grace budget; anything due later is dropped.

use crate::domain::types::{BeaconKey, ZoneId};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// A timer that came due
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduledEvent {
    BeaconLeave(BeaconKey),
    ZoneChange { from: Option<ZoneId>, to: Option<ZoneId> },
}

/// Outcome of one `poll`
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SchedulerPoll {
    pub fired: Vec<ScheduledEvent>,
    /// Timers discarded because they fell past the background budget
    pub dropped: usize,
}

#[derive(Debug, Clone)]
struct PendingZoneChange {
    from: Option<ZoneId>,
    to: Option<ZoneId>,
    fire_at: u64,
}

pub struct EventScheduler {
    beacons: BTreeMap<BeaconKey, u64>,
    zone_change: Option<PendingZoneChange>,
    background_grace_ms: u64,
    /// Epoch ms the host went to background, if it did
    background_since: Option<u64>,
}

impl EventScheduler {
    pub fn new(background_grace_ms: u64) -> Self {
        Self {
            beacons: BTreeMap::new(),
            zone_change: None,
            background_grace_ms,
            background_since: None,
        }
    }

    /// Arm (or re-arm) the leave timer for a beacon
    pub fn schedule_beacon_event(&mut self, key: &BeaconKey, delay_ms: u64, now: u64) {
        let fire_at = now.saturating_add(delay_ms);
        if self.beacons.insert(key.clone(), fire_at).is_some() {
            debug!(beacon = %key, fire_at, "beacon_timer_replaced");
        } else {
            debug!(beacon = %key, fire_at, "beacon_timer_scheduled");
        }
    }

    /// Arm the zone-change timer, superseding any pending one
    pub fn schedule_zone_change(
        &mut self,
        from: Option<ZoneId>,
        to: Option<ZoneId>,
        delay_ms: u64,
        now: u64,
    ) {
        let fire_at = now.saturating_add(delay_ms);
        if let Some(old) = &self.zone_change {
            debug!(superseded_to = ?old.to, to = ?to, "zone_change_superseded");
        }
        debug!(from = ?from, to = ?to, fire_at, "zone_change_scheduled");
        self.zone_change = Some(PendingZoneChange { from, to, fire_at });
    }

    /// Returns whether a pending timer was removed
    pub fn cancel(&mut self, key: &BeaconKey) -> bool {
        let cancelled = self.beacons.remove(key).is_some();
        if cancelled {
            debug!(beacon = %key, "beacon_timer_cancelled");
        }
        cancelled
    }

    /// Returns whether a pending zone change was removed
    pub fn cancel_zone_change(&mut self) -> bool {
        let cancelled = self.zone_change.take().is_some();
        if cancelled {
            debug!("zone_change_cancelled");
        }
        cancelled
    }

    #[inline]
    pub fn is_scheduled(&self, key: &BeaconKey) -> bool {
        self.beacons.contains_key(key)
    }

    /// Beacons with a leave timer armed
    pub fn pending_beacons(&self) -> impl Iterator<Item = &BeaconKey> {
        self.beacons.keys()
    }

    #[inline]
    pub fn is_zone_change_scheduled(&self) -> bool {
        self.zone_change.is_some()
    }

    /// Target of the pending zone change, `Some(None)` meaning "no zone"
    pub fn pending_zone_target(&self) -> Option<Option<&ZoneId>> {
        self.zone_change.as_ref().map(|z| z.to.as_ref())
    }

    pub fn pending_count(&self) -> usize {
        self.beacons.len() + usize::from(self.zone_change.is_some())
    }

    /// Earliest pending fire time
    pub fn next_deadline(&self) -> Option<u64> {
        let beacon = self.beacons.values().copied().min();
        let zone = self.zone_change.as_ref().map(|z| z.fire_at);
        match (beacon, zone) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn enter_background(&mut self, now: u64) {
        self.background_since.get_or_insert(now);
    }

    pub fn enter_foreground(&mut self) {
        self.background_since = None;
    }

    #[inline]
    pub fn is_background(&self) -> bool {
        self.background_since.is_some()
    }

    fn budget_end(&self) -> Option<u64> {
        self.background_since.map(|t| t.saturating_add(self.background_grace_ms))
    }

    /// Release due timers, beacons in key order before the zone change
    pub fn poll(&mut self, now: u64) -> SchedulerPoll {
        let budget_end = self.budget_end();
        let budget_spent = budget_end.is_some_and(|end| now >= end);
        let beyond_budget = |fire_at: u64| budget_end.is_some_and(|end| fire_at > end);

        let mut result = SchedulerPoll::default();

        let mut due = Vec::new();
        self.beacons.retain(|key, fire_at| {
            if *fire_at <= now || (budget_spent && beyond_budget(*fire_at)) {
                due.push((key.clone(), *fire_at));
                false
            } else {
                true
            }
        });
        for (key, fire_at) in due {
            if beyond_budget(fire_at) {
                warn!(beacon = %key, fire_at, "beacon_timer_dropped_background");
                result.dropped += 1;
            } else {
                result.fired.push(ScheduledEvent::BeaconLeave(key));
            }
        }

        let zone_due = self
            .zone_change
            .as_ref()
            .is_some_and(|z| z.fire_at <= now || (budget_spent && beyond_budget(z.fire_at)));
        if zone_due {
            if let Some(change) = self.zone_change.take() {
                if beyond_budget(change.fire_at) {
                    warn!(to = ?change.to, fire_at = change.fire_at, "zone_change_dropped_background");
                    result.dropped += 1;
                } else {
                    result.fired.push(ScheduledEvent::ZoneChange { from: change.from, to: change.to });
                }
            }
        }

        result
    }

    /// Drop every pending timer
    pub fn clear(&mut self) {
        self.beacons.clear();
        self.zone_change = None;
    }
}
