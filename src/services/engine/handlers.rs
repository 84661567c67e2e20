//! Pipeline handlers for the Engine
//!
//! Ranging pass -> beacon transitions -> beacon events -> zone reconciliation
//! -> trigger evaluation -> dedup -> dispatch + spool.

use super::{Engine, PipelineInput};
use crate::domain::beacon::Transition;
use crate::domain::event::ActionEvent;
use crate::domain::types::{BeaconKey, EventType, Location, RawSample, ZoneId};
use crate::io::observer::ObserverHooks;
use crate::services::actions::PerformOutcome;
use crate::services::ranging::RangingBatch;
use crate::services::scheduler::ScheduledEvent;
use crate::services::trigger_engine::{ActionMatch, EventContext};
use crate::services::zone_resolver::ZoneResolver;
use std::time::Instant;
use tracing::{debug, info};

impl Engine {
    /// Apply one feed message. Timers due before `now` run first.
    pub fn handle_input(&mut self, input: PipelineInput, now: u64) -> Vec<ActionEvent> {
        let mut events = self.handle_timers(now);
        match input {
            PipelineInput::Ranging { region, samples } => {
                events.extend(self.handle_ranging(&region, samples, now));
            }
            PipelineInput::RegionEnter { region } => self.handle_region_enter(&region),
            PipelineInput::RegionExit { region } => events.extend(self.handle_region_exit(&region, now)),
            PipelineInput::Location { latitude, longitude, floor } => {
                let location = Location { latitude, longitude, floor };
                self.set_location(location);
            }
            PipelineInput::Background { background } => self.set_background(background, now),
            PipelineInput::Pause { paused } => self.set_paused(paused),
            PipelineInput::Reload => debug!("reload_needs_backend"),
        }
        events
    }

    /// Samples for one monitored region; processed once the pass is complete
    pub fn handle_ranging(&mut self, region: &BeaconKey, samples: Vec<RawSample>, now: u64) -> Vec<ActionEvent> {
        if !self.monitoring || !self.selector.current().contains(region) {
            self.metrics.record_samples_ignored(samples.len());
            debug!(region = %region, samples = samples.len(), "ranging_for_unmonitored_region");
            return Vec::new();
        }
        let mut events = Vec::new();
        for batch in self.aggregator.add(region, samples, now) {
            events.extend(self.process_batch(batch, now));
        }
        events
    }

    /// Region entry is informational; proximity comes from ranging
    pub fn handle_region_enter(&mut self, region: &BeaconKey) {
        debug!(region = %region, "region_entered");
    }

    /// Beacon left its region: go out of range now, emit Leave after the delay
    pub fn handle_region_exit(&mut self, region: &BeaconKey, now: u64) -> Vec<ActionEvent> {
        let Some(beacon) = self.registry.beacon_mut(region) else {
            debug!(region = %region, "exit_for_unknown_beacon");
            return Vec::new();
        };
        let Transition::Exited { from } = beacon.exit(now) else {
            return Vec::new();
        };
        info!(beacon = %region, from = from.as_str(), "beacon_out_of_range");

        let delay = self.config.beacon_leave_delay_ms();
        self.scheduler.schedule_beacon_event(region, delay, now);
        self.metrics.record_timer_scheduled();

        let mut events = self.reconcile_zone(now);
        self.update_closest();
        self.update_monitored_beacons();
        events.extend(self.run_due_triggers(now));
        events
    }

    pub(crate) fn process_batch(&mut self, batch: RangingBatch, now: u64) -> Vec<ActionEvent> {
        let started = Instant::now();
        let sample_count = batch.samples.len();
        if !batch.complete {
            debug!(regions = batch.regions_reported, samples = sample_count, "ranging_batch_partial");
        }

        let scheduler = &self.scheduler;
        let transitions =
            self.resolver.apply_batch(&mut self.registry, &batch.samples, now, |k| scheduler.is_scheduled(k));

        let mut events = Vec::new();
        for (key, transition) in transitions {
            match transition {
                Transition::Entered { to } => {
                    if self.scheduler.cancel(&key) {
                        // Back before the leave fired: same stay, no Enter
                        self.metrics.record_timer_cancelled();
                        debug!(beacon = %key, "beacon_leave_cancelled");
                    } else {
                        self.triggers.reset_stay(&key);
                        info!(beacon = %key, proximity = to.as_str(), "beacon_entered");
                        events.extend(self.emit_beacon_event(&key, EventType::Enter, now));
                    }
                    if let Some(range) = to.range_event() {
                        events.extend(self.emit_beacon_event(&key, range, now));
                    }
                }
                Transition::Moved { from, to } => {
                    debug!(beacon = %key, from = from.as_str(), to = to.as_str(), "beacon_proximity_changed");
                    if let Some(range) = to.range_event() {
                        events.extend(self.emit_beacon_event(&key, range, now));
                    }
                }
                Transition::Refreshed | Transition::Exited { .. } | Transition::Ignored => {}
            }
        }

        events.extend(self.run_due_triggers(now));
        events.extend(self.reconcile_zone(now));
        self.update_closest();
        self.update_monitored_beacons();

        self.metrics.record_batch(sample_count, started.elapsed().as_micros() as u64);
        events
    }

    /// Fire whatever timers are due at `now`
    pub fn handle_timers(&mut self, now: u64) -> Vec<ActionEvent> {
        let mut events = Vec::new();
        if let Some(batch) = self.aggregator.poll_timeout(now) {
            events.extend(self.process_batch(batch, now));
        }

        let poll = self.scheduler.poll(now);
        if !poll.fired.is_empty() || poll.dropped > 0 {
            self.metrics.record_timers_fired(poll.fired.len(), poll.dropped);
        }
        for fired in poll.fired {
            match fired {
                ScheduledEvent::BeaconLeave(key) => {
                    let still_out = self.registry.beacon(&key).is_some_and(|b| !b.is_in_range());
                    if still_out {
                        info!(beacon = %key, "beacon_left");
                        events.extend(self.emit_beacon_event(&key, EventType::Leave, now));
                        self.triggers.reset_stay(&key);
                    }
                }
                ScheduledEvent::ZoneChange { from, to } => {
                    if self.resolver.current() != from.as_ref() {
                        debug!(from = ?from, current = ?self.resolver.current(), "zone_change_stale");
                        continue;
                    }
                    events.extend(self.commit_zone(to, now));
                    self.update_monitored_beacons();
                }
            }
        }

        events.extend(self.run_due_triggers(now));
        events
    }

    /// Keep the pending zone-change timer in line with current beacon state
    pub(crate) fn reconcile_zone(&mut self, now: u64) -> Vec<ActionEvent> {
        let computed = ZoneResolver::compute_zone(&self.registry);
        if computed.as_ref() == self.resolver.current() {
            if self.scheduler.cancel_zone_change() {
                self.metrics.record_timer_cancelled();
                debug!(zone = ?computed, "zone_change_cancelled");
            }
            return Vec::new();
        }
        if self.scheduler.pending_zone_target() == Some(computed.as_ref()) {
            return Vec::new();
        }

        let delay = self.config.zone_change_delay_ms();
        let from = self.resolver.current().cloned();
        if delay == 0 {
            self.scheduler.cancel_zone_change();
            return self.commit_zone(computed, now);
        }
        debug!(from = ?from, to = ?computed, delay_ms = delay, "zone_change_scheduled");
        self.scheduler.schedule_zone_change(from, computed, delay, now);
        self.metrics.record_timer_scheduled();
        Vec::new()
    }

    /// Commit a zone change and emit zone Leave / Enter
    pub(crate) fn commit_zone(&mut self, to: Option<ZoneId>, now: u64) -> Vec<ActionEvent> {
        let previous = self.resolver.commit(to.clone(), now);
        if previous == to {
            return Vec::new();
        }
        self.metrics.record_zone_change();
        info!(from = ?previous, to = ?to, "zone_changed");
        if self.observer.hooks().contains(ObserverHooks::CURRENT_ZONE_CHANGED) {
            self.observer.current_zone_changed(previous.as_ref(), to.as_ref());
        }

        let mut events = Vec::new();
        if let Some(left) = previous {
            events.extend(self.emit_zone_event(&left, EventType::Leave, now));
        }
        if let Some(entered) = to {
            events.extend(self.emit_zone_event(&entered, EventType::Enter, now));
        }
        events
    }

    /// Report the closest beacon when it changes
    pub(crate) fn update_closest(&mut self) {
        let closest = ZoneResolver::closest_beacon(&self.registry);
        let key = closest.map(|b| b.key.clone());
        if key == self.closest {
            return;
        }
        if self.observer.hooks().contains(ObserverHooks::CLOSEST_BEACON_CHANGED) {
            self.observer.closest_beacon_changed(closest);
        }
        debug!(closest = ?key, "closest_beacon_updated");
        self.closest = key;
    }

    /// Dwell and timer triggers for every in-range beacon
    fn run_due_triggers(&mut self, now: u64) -> Vec<ActionEvent> {
        let in_range: Vec<BeaconKey> =
            self.registry.beacons().filter(|b| b.is_in_range()).map(|b| b.key.clone()).collect();
        let mut events = Vec::new();
        for key in in_range {
            let Some(beacon) = self.registry.beacon(&key) else {
                continue;
            };
            let mut matches = self.triggers.dwell_due(&self.registry, beacon, now);
            matches.extend(self.triggers.timers_due(&self.registry, beacon, now));
            if !matches.is_empty() {
                for extension in &mut self.extensions {
                    for m in &matches {
                        extension.on_event(m.event_type, beacon);
                    }
                }
                events.extend(self.dispatch(matches, now));
            }
        }
        events
    }

    fn emit_beacon_event(&mut self, key: &BeaconKey, event_type: EventType, now: u64) -> Vec<ActionEvent> {
        let Some(beacon) = self.registry.beacon(key) else {
            return Vec::new();
        };
        for extension in &mut self.extensions {
            extension.on_event(event_type, beacon);
        }
        let ctx = EventContext::for_beacon(event_type, beacon, now);
        let matches = self.triggers.evaluate(&self.registry, &ctx);
        self.dispatch(matches, now)
    }

    fn emit_zone_event(&mut self, zone: &ZoneId, event_type: EventType, now: u64) -> Vec<ActionEvent> {
        let ctx = EventContext::for_zone(event_type, zone, now);
        let matches = self.triggers.evaluate(&self.registry, &ctx);
        self.dispatch(matches, now)
    }

    /// Dedup, spool and perform matched actions in order
    pub(crate) fn dispatch(&mut self, matches: Vec<ActionMatch>, now: u64) -> Vec<ActionEvent> {
        let mut fired = Vec::with_capacity(matches.len());
        for m in matches {
            if self.paused {
                debug!(action_id = %m.action.id, "action_skipped_paused");
                continue;
            }
            let event = ActionEvent::new(m.event_type, m.entity.clone(), m.action.id, now)
                .with_action_name(&m.action.name);
            if !self.dedup.should_fire(event.dedup_key(), now) {
                self.metrics.record_action_suppressed();
                debug!(action_id = %m.action.id, entity = %m.entity, event = m.event_type.as_str(), "action_suppressed");
                continue;
            }
            self.metrics.record_action_fired();

            if m.action.is_test_action {
                debug!(action_id = %m.action.id, "test_action_not_spooled");
            } else {
                let dropped = self.spool.enqueue(event.clone());
                self.metrics.record_event_spooled(dropped);
                self.metrics.set_spool_len(self.spool.len());
            }

            let hooks = self.observer.hooks();
            if hooks.contains(ObserverHooks::WILL_PERFORM_ACTION) {
                self.observer.will_perform_action(&m, &event);
            }
            let auto_perform = !hooks.contains(ObserverHooks::SHOULD_AUTO_PERFORM_ACTION)
                || self.observer.should_auto_perform_action(&m);
            let outcome = if auto_perform {
                self.actions.perform(&m.action, &event)
            } else {
                PerformOutcome::Skipped
            };
            if self.scheduler.is_background() {
                let auto_notify = !hooks.contains(ObserverHooks::SHOULD_AUTO_NOTIFY_ACTION)
                    || self.observer.should_auto_notify_action(&m);
                if auto_notify && hooks.contains(ObserverHooks::NOTIFY_ACTION) {
                    self.observer.notify_action(&m, &event);
                }
            }
            if hooks.contains(ObserverHooks::DID_PERFORM_ACTION) {
                self.observer.did_perform_action(&m, &event, &outcome);
            }

            info!(
                action_id = %m.action.id,
                trigger = %m.trigger,
                event = m.event_type.as_str(),
                entity = %m.entity,
                outcome = ?outcome,
                "action_fired"
            );
            fired.push(event);
        }
        fired
    }
}
