//! Trigger evaluation
//!
//! A trigger matches an event when every one of its conditions holds against
//! that single event (conjunction, no memory of earlier events). Beacon events
//! also reach zone-scoped triggers of the beacon's zone for range, dwell and
//! timer kinds; zone enter/leave come only from committed zone changes.
//!
//! Dwell matches fire once per stay. Timer matches fire every interval while
//! the beacon stays in range.

use crate::domain::beacon::Beacon;
use crate::domain::event::EntityRef;
use crate::domain::registry::Registry;
use crate::domain::trigger::{Action, Condition, Trigger, TriggerScope};
use crate::domain::types::{BeaconKey, EventType, TriggerId, ZoneId};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet};

/// The event being evaluated, plus the state snapshot conditions look at
#[derive(Debug, Clone)]
pub struct EventContext<'a> {
    pub event_type: EventType,
    /// Beacon the event originated from, if any
    pub beacon: Option<&'a Beacon>,
    /// Zone the event refers to (zone events) or the beacon's zone
    pub zone: Option<&'a ZoneId>,
    pub now: u64,
    /// Time since this trigger's timer last fired (timer events only)
    pub timer_elapsed_ms: Option<u64>,
}

impl<'a> EventContext<'a> {
    pub fn for_beacon(event_type: EventType, beacon: &'a Beacon, now: u64) -> Self {
        Self { event_type, beacon: Some(beacon), zone: beacon.zone.as_ref(), now, timer_elapsed_ms: None }
    }

    pub fn for_zone(event_type: EventType, zone: &'a ZoneId, now: u64) -> Self {
        Self { event_type, beacon: None, zone: Some(zone), now, timer_elapsed_ms: None }
    }
}

/// One action resolved for an event
#[derive(Debug, Clone, PartialEq)]
pub struct ActionMatch {
    pub trigger: TriggerId,
    pub action: Action,
    pub event_type: EventType,
    /// Trigger scope the action fired for
    pub entity: EntityRef,
    /// Originating beacon, for beacon-driven events
    pub beacon: Option<BeaconKey>,
}

/// Whether one condition holds for the event
pub fn condition_matches(condition: &Condition, ctx: &EventContext<'_>) -> bool {
    if condition.event_type() != ctx.event_type {
        return false;
    }
    match condition {
        Condition::DwellTime { threshold_ms } => {
            ctx.beacon.is_some_and(|b| b.is_in_range() && b.stays_duration_ms(ctx.now) >= *threshold_ms)
        }
        Condition::Timer { interval_ms } => ctx.timer_elapsed_ms.is_some_and(|e| e >= *interval_ms),
        _ => true,
    }
}

/// All conditions must hold
pub fn trigger_matches(trigger: &Trigger, ctx: &EventContext<'_>) -> bool {
    !trigger.conditions.is_empty() && trigger.conditions.iter().all(|c| condition_matches(c, ctx))
}

fn reaches_zone_scope(event_type: EventType) -> bool {
    !matches!(event_type, EventType::Enter | EventType::Leave)
}

/// Per-stay bookkeeping in persistable form
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StayMarks {
    #[serde(default)]
    pub dwell_fired: Vec<(TriggerId, BeaconKey)>,
    #[serde(default)]
    pub timer_last: Vec<(TriggerId, BeaconKey, u64)>,
}

/// Stateful evaluator (dwell / timer bookkeeping per stay)
#[derive(Debug, Default)]
pub struct TriggerEngine {
    /// Dwell triggers already fired during the current stay
    dwell_fired: BTreeSet<(TriggerId, BeaconKey)>,
    /// Last timer fire per trigger and beacon
    timer_last: BTreeMap<(TriggerId, BeaconKey), u64>,
}

impl TriggerEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Triggers an event can reach, beacon scope first
    fn candidate_triggers<'r>(
        registry: &'r Registry,
        ctx: &EventContext<'_>,
    ) -> SmallVec<[&'r Trigger; 8]> {
        let mut out: SmallVec<[&Trigger; 8]> = SmallVec::new();
        match ctx.beacon {
            Some(beacon) => {
                out.extend(registry.triggers_for(TriggerScope::Beacon(beacon.key.clone())));
                if reaches_zone_scope(ctx.event_type) {
                    if let Some(zone) = ctx.zone {
                        out.extend(registry.triggers_for(TriggerScope::Zone(zone.clone())));
                    }
                }
            }
            None => {
                if let Some(zone) = ctx.zone {
                    out.extend(registry.triggers_for(TriggerScope::Zone(zone.clone())));
                }
            }
        }
        out
    }

    fn expand(trigger: &Trigger, ctx: &EventContext<'_>, out: &mut Vec<ActionMatch>) {
        let entity = match &trigger.scope {
            TriggerScope::Beacon(key) => EntityRef::Beacon(key.clone()),
            TriggerScope::Zone(id) => EntityRef::Zone(id.clone()),
        };
        for action in &trigger.actions {
            out.push(ActionMatch {
                trigger: trigger.id,
                action: action.clone(),
                event_type: ctx.event_type,
                entity: entity.clone(),
                beacon: ctx.beacon.map(|b| b.key.clone()),
            });
        }
    }

    /// Ordered actions for an event (trigger order, then action order)
    pub fn evaluate(&self, registry: &Registry, ctx: &EventContext<'_>) -> Vec<ActionMatch> {
        let mut out = Vec::new();
        for trigger in Self::candidate_triggers(registry, ctx) {
            if trigger_matches(trigger, ctx) {
                Self::expand(trigger, ctx, &mut out);
            }
        }
        out
    }

    /// Dwell triggers that newly reached their threshold this stay
    pub fn dwell_due(&mut self, registry: &Registry, beacon: &Beacon, now: u64) -> Vec<ActionMatch> {
        if !beacon.is_in_range() {
            return Vec::new();
        }
        let ctx = EventContext::for_beacon(EventType::DwellTime, beacon, now);
        let mut out = Vec::new();
        for trigger in Self::candidate_triggers(registry, &ctx) {
            let id = (trigger.id, beacon.key.clone());
            if self.dwell_fired.contains(&id) || !trigger_matches(trigger, &ctx) {
                continue;
            }
            self.dwell_fired.insert(id);
            Self::expand(trigger, &ctx, &mut out);
        }
        out
    }

    /// Timer triggers whose interval elapsed for this beacon
    pub fn timers_due(&mut self, registry: &Registry, beacon: &Beacon, now: u64) -> Vec<ActionMatch> {
        let Some(entered) = beacon.last_entered_at.filter(|_| beacon.is_in_range()) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let probe = EventContext::for_beacon(EventType::Timer, beacon, now);
        for trigger in Self::candidate_triggers(registry, &probe) {
            if trigger.timer_intervals().next().is_none() {
                continue;
            }
            let id = (trigger.id, beacon.key.clone());
            let last = self.timer_last.get(&id).copied().unwrap_or(entered);
            let ctx = EventContext { timer_elapsed_ms: Some(now.saturating_sub(last)), ..probe.clone() };
            if trigger_matches(trigger, &ctx) {
                self.timer_last.insert(id, now);
                Self::expand(trigger, &ctx, &mut out);
            }
        }
        out
    }

    /// Earliest time a timer trigger could fire for a beacon
    pub fn next_timer_deadline(&self, registry: &Registry, beacon: &Beacon) -> Option<u64> {
        let entered = beacon.last_entered_at.filter(|_| beacon.is_in_range())?;
        let probe = EventContext::for_beacon(EventType::Timer, beacon, 0);
        Self::candidate_triggers(registry, &probe)
            .into_iter()
            .filter_map(|t| {
                let interval = t.timer_intervals().max()?;
                let last = self.timer_last.get(&(t.id, beacon.key.clone())).copied().unwrap_or(entered);
                Some(last.saturating_add(interval))
            })
            .min()
    }

    /// A new stay started (or the beacon left): forget per-stay bookkeeping
    pub fn reset_stay(&mut self, key: &BeaconKey) {
        self.dwell_fired.retain(|(_, k)| k != key);
        self.timer_last.retain(|(_, k), _| k != key);
    }

    pub fn clear(&mut self) {
        self.dwell_fired.clear();
        self.timer_last.clear();
    }

    pub fn marks(&self) -> StayMarks {
        StayMarks {
            dwell_fired: self.dwell_fired.iter().cloned().collect(),
            timer_last: self.timer_last.iter().map(|((t, k), at)| (*t, k.clone(), *at)).collect(),
        }
    }

    /// Replace bookkeeping with saved marks. Marks of beacons no longer in
    /// range belong to a finished stay and are dropped.
    pub fn restore(&mut self, marks: StayMarks, registry: &Registry) {
        let live = |key: &BeaconKey| registry.beacon(key).is_some_and(|b| b.is_in_range());
        self.clear();
        self.dwell_fired = marks.dwell_fired.into_iter().filter(|(_, k)| live(k)).collect();
        self.timer_last = marks
            .timer_last
            .into_iter()
            .filter(|(_, k, _)| live(k))
            .map(|(t, k, at)| ((t, k), at))
            .collect();
    }
}
