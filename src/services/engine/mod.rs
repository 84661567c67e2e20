//! Beacon engine: the serialized ranging → zone → trigger → delivery pipeline
//!
//! The Engine owns every piece of mutable state (registry, aggregator,
//! selector, resolver, scheduler, trigger bookkeeping, dedup, spool) and is
//! driven by one task. Inputs (ranging callbacks, region exits, location,
//! app state) and timer deadlines are processed to completion one at a time.
//! Network work (configuration fetch, event delivery) runs in spawned tasks
//! whose results come back through channels into the same loop.

mod handlers;

use crate::domain::beacon::Beacon;
use crate::domain::event::ActionEvent;
use crate::domain::registry::{Registry, SiteConfiguration};
use crate::domain::types::{epoch_ms, BeaconKey, EventType, Location, RawSample, ZoneId};
use crate::infra::config::Config;
use crate::infra::error::{BackendError, CapabilityReport, EngineError, Result};
use crate::infra::metrics::Metrics;
use crate::io::backend::Backend;
use crate::io::observer::{Observer, ObserverHooks};
use crate::io::persistence::{Snapshot, SnapshotStore};
use crate::io::platform::Platform;
use crate::services::actions::{ActionRegistry, Extension, ExtensionRegistry};
use crate::services::dedup::DeliveryDedup;
use crate::services::ranging::RangingAggregator;
use crate::services::region_selector::RegionSelector;
use crate::services::scheduler::EventScheduler;
use crate::services::spooler::EventSpooler;
use crate::services::trigger_engine::TriggerEngine;
use crate::services::zone_resolver::ZoneResolver;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Wake-up period of the run loop when nothing is scheduled
const IDLE_WAKE_MS: u64 = 1000;

/// One message into the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineInput {
    /// Samples reported for one monitored region
    Ranging {
        region: BeaconKey,
        #[serde(default)]
        samples: Vec<RawSample>,
    },
    RegionEnter { region: BeaconKey },
    RegionExit { region: BeaconKey },
    /// Coarse device location
    Location {
        latitude: f64,
        longitude: f64,
        #[serde(default)]
        floor: Option<i32>,
    },
    /// Host app moved to / from background
    Background { background: bool },
    Pause { paused: bool },
    /// Re-fetch the site configuration
    Reload,
}

/// Central pipeline state
pub struct Engine {
    pub(crate) config: Config,
    pub(crate) registry: Registry,
    pub(crate) aggregator: RangingAggregator,
    pub(crate) selector: RegionSelector,
    pub(crate) resolver: ZoneResolver,
    pub(crate) scheduler: EventScheduler,
    pub(crate) triggers: TriggerEngine,
    pub(crate) dedup: DeliveryDedup,
    pub(crate) spool: EventSpooler,
    pub(crate) actions: ActionRegistry,
    pub(crate) extension_factories: ExtensionRegistry,
    pub(crate) extensions: Vec<Box<dyn Extension>>,
    pub(crate) platform: Box<dyn Platform>,
    pub(crate) observer: Box<dyn Observer>,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) location: Option<Location>,
    pub(crate) monitoring: bool,
    pub(crate) paused: bool,
    /// Last closest beacon reported to the observer
    pub(crate) closest: Option<BeaconKey>,
}

impl Engine {
    pub fn new(
        config: Config,
        platform: Box<dyn Platform>,
        observer: Box<dyn Observer>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            aggregator: RangingAggregator::new(config.ranging_flush_timeout_ms()),
            selector: RegionSelector::new(config.max_monitored_regions()),
            scheduler: EventScheduler::new(config.background_grace_ms()),
            dedup: DeliveryDedup::new(config.min_refire_interval_ms()),
            spool: EventSpooler::new(config.batch_size(), config.max_queue_len()),
            config,
            registry: Registry::default(),
            resolver: ZoneResolver::new(),
            triggers: TriggerEngine::new(),
            actions: ActionRegistry::with_defaults(),
            extension_factories: ExtensionRegistry::with_defaults(),
            extensions: Vec::new(),
            platform,
            observer,
            metrics,
            location: None,
            monitoring: false,
            paused: false,
            closest: None,
        }
    }

    pub fn with_actions(mut self, actions: ActionRegistry) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_extensions(mut self, extensions: ExtensionRegistry) -> Self {
        self.extension_factories = extensions;
        self
    }

    // --- configuration ---------------------------------------------------

    /// Validate and swap in a new site configuration.
    ///
    /// On error nothing changes. Beacons present in both graphs keep their
    /// live state; pending leaves of removed beacons are dropped.
    pub fn apply_configuration(&mut self, site: SiteConfiguration, now: u64) -> Result<()> {
        let mut registry = Registry::from_site(site).map_err(|e| {
            warn!(error = %e, "configuration_rejected");
            e
        })?;
        registry.carry_live_state_from(&self.registry);

        for key in registry.removed_since(&self.registry) {
            if self.scheduler.cancel(&key) {
                self.metrics.record_timer_cancelled();
            }
            self.triggers.reset_stay(&key);
            if self.closest.as_ref() == Some(&key) {
                self.closest = None;
            }
        }

        self.extensions = self.extension_factories.instantiate(registry.extensions());
        self.registry = registry;
        self.metrics.record_reconfiguration();
        info!(
            beacons = self.registry.beacon_count(),
            zones = self.registry.zones().count(),
            triggers = self.registry.triggers().count(),
            extensions = self.extensions.len(),
            "configuration_applied"
        );

        // A committed zone that no longer exists is left right away
        if let Some(current) = self.resolver.current().cloned() {
            if self.registry.zone(&current).is_none() {
                self.scheduler.cancel_zone_change();
                self.commit_zone(None, now);
            }
        }
        self.reconcile_zone(now);
        self.update_closest();
        if self.monitoring {
            self.update_monitored_beacons();
        }
        Ok(())
    }

    /// Fetch from the backend and apply; fetch failures leave state untouched
    pub async fn refresh_configuration(&mut self, backend: &dyn Backend, now: u64) -> Result<()> {
        let site = backend.fetch_configuration().await.map_err(|e| {
            warn!(error = %e, "configuration_fetch_failed");
            EngineError::from(e)
        })?;
        self.apply_configuration(site, now)
    }

    /// Push every configured beacon's metadata to the backend
    pub async fn sync_beacons(&self, backend: &dyn Backend) -> Result<usize> {
        let mut synced = 0;
        for beacon in self.registry.beacons() {
            backend.sync_beacon(beacon).await?;
            synced += 1;
        }
        debug!(synced, "beacons_synced");
        Ok(synced)
    }

    // --- monitoring ------------------------------------------------------

    /// Capability pre-flight
    pub fn readiness(&self) -> CapabilityReport {
        let report = self.platform.capabilities().report();
        for capability in report.blocking() {
            warn!(reason = capability.as_str(), "capability_blocking");
        }
        for capability in report.warnings() {
            info!(reason = capability.as_str(), "capability_degraded");
        }
        report
    }

    /// Start monitoring if no blocking capability is missing
    pub fn start_monitoring(&mut self) -> Result<CapabilityReport> {
        let report = self.readiness();
        if !report.is_ready() {
            return Err(EngineError::NotReady(report.blocking().copied().collect()));
        }
        self.monitoring = true;
        self.selector.reset();
        let leaving: BTreeSet<BeaconKey> = self.scheduler.pending_beacons().cloned().collect();
        let selection = self.selector.select(
            &self.registry,
            self.resolver.current(),
            self.location.as_ref(),
            &leaving,
        );
        self.reconfigure_platform(&selection.regions);
        info!(regions = selection.regions.len(), "monitoring_started");
        Ok(report)
    }

    pub fn stop_monitoring(&mut self) {
        if !self.monitoring {
            return;
        }
        self.platform.stop_monitoring();
        self.monitoring = false;
        self.selector.reset();
        self.aggregator.flush();
        self.aggregator.set_expected_regions(&BTreeSet::new());
        self.metrics.set_monitored_regions(0);
        info!("monitoring_stopped");
    }

    /// Re-run region selection; reconfigures the platform only on change
    pub fn update_monitored_beacons(&mut self) -> bool {
        if !self.monitoring {
            return false;
        }
        let leaving: BTreeSet<BeaconKey> = self.scheduler.pending_beacons().cloned().collect();
        let selection = self.selector.select(
            &self.registry,
            self.resolver.current(),
            self.location.as_ref(),
            &leaving,
        );
        if selection.changed {
            self.reconfigure_platform(&selection.regions);
        }
        selection.changed
    }

    fn reconfigure_platform(&mut self, regions: &BTreeSet<BeaconKey>) {
        self.platform.start_monitoring(regions);
        self.aggregator.set_expected_regions(regions);
        self.metrics.set_monitored_regions(regions.len());
        if self.observer.hooks().contains(ObserverHooks::OBSERVED_BEACONS_CHANGED) {
            let zones = self.observed_zones();
            self.observer.observed_beacons_changed(regions, &zones);
        }
        debug!(regions = regions.len(), "observed_beacons_changed");
    }

    // --- host state ------------------------------------------------------

    pub fn set_location(&mut self, location: Location) {
        debug!(lat = location.latitude, lon = location.longitude, floor = ?location.floor, "location_updated");
        self.location = Some(location);
        self.update_monitored_beacons();
    }

    pub fn set_background(&mut self, background: bool, now: u64) {
        if background {
            self.scheduler.enter_background(now);
            info!(grace_ms = self.config.background_grace_ms(), "entered_background");
        } else {
            self.scheduler.enter_foreground();
            info!("entered_foreground");
            // Permissions may have changed while away
            self.readiness();
        }
    }

    /// Paused engines keep tracking state but fire no actions
    pub fn set_paused(&mut self, paused: bool) {
        if self.paused != paused {
            info!(paused, "engine_paused_changed");
        }
        self.paused = paused;
    }

    // --- queries ---------------------------------------------------------

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn beacon(&self, key: &BeaconKey) -> Option<&Beacon> {
        self.registry.beacon(key)
    }

    pub fn current_zone(&self) -> Option<&ZoneId> {
        self.resolver.current()
    }

    pub fn closest_beacon(&self) -> Option<&Beacon> {
        ZoneResolver::closest_beacon(&self.registry)
    }

    /// In-range beacon whose current stay started most recently
    pub fn last_entered_beacon(&self) -> Option<&Beacon> {
        self.registry
            .beacons()
            .filter(|b| b.is_in_range())
            .max_by(|a, b| a.last_entered_at.cmp(&b.last_entered_at).then_with(|| b.key.cmp(&a.key)))
    }

    /// In-range beacons, closest first
    pub fn beacons_by_distance(&self) -> Vec<&Beacon> {
        let mut beacons: Vec<_> = self.registry.beacons().filter(|b| b.is_in_range()).collect();
        beacons.sort_by(|a, b| {
            a.estimated_distance
                .total_cmp(&b.estimated_distance)
                .then_with(|| b.rssi.cmp(&a.rssi))
                .then_with(|| a.key.cmp(&b.key))
        });
        beacons
    }

    pub fn monitored_regions(&self) -> &BTreeSet<BeaconKey> {
        self.selector.current()
    }

    /// Zones with at least one monitored beacon
    pub fn observed_zones(&self) -> BTreeSet<ZoneId> {
        self.selector.current().iter().filter_map(|k| self.registry.zone_of(k)).cloned().collect()
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_leave_pending(&self, key: &BeaconKey) -> bool {
        self.scheduler.is_scheduled(key)
    }

    pub fn is_zone_change_pending(&self) -> bool {
        self.scheduler.is_zone_change_scheduled()
    }

    pub fn spool_len(&self) -> usize {
        self.spool.len()
    }

    pub fn pending_events(&self) -> Vec<ActionEvent> {
        self.spool.pending()
    }

    pub fn last_event_of_type(&self, event_type: EventType) -> Option<&ActionEvent> {
        self.spool.last_event_of_type(event_type)
    }

    /// Earliest time the engine needs to run `handle_timers`
    pub fn next_deadline(&self) -> Option<u64> {
        let timer = self
            .registry
            .beacons()
            .filter(|b| b.is_in_range())
            .filter_map(|b| self.triggers.next_timer_deadline(&self.registry, b))
            .min();
        [self.aggregator.deadline(), self.scheduler.next_deadline(), timer].into_iter().flatten().min()
    }

    // --- persistence -----------------------------------------------------

    pub fn snapshot(&self, now: u64) -> Snapshot {
        let mut snapshot = Snapshot::new(self.registry.clone(), now);
        snapshot.current_zone = self.resolver.current().cloned();
        snapshot.zone_entered_at = self.resolver.entered_at();
        snapshot.stay_marks = self.triggers.marks();
        snapshot.dedup = self.dedup.entries();
        snapshot.spool = self.spool.pending();
        snapshot
    }

    /// Rebuild state from a snapshot. Timers are not restored.
    pub fn restore(&mut self, snapshot: Snapshot) {
        let Snapshot { registry, current_zone, zone_entered_at, stay_marks, dedup, spool, saved_at, .. } =
            snapshot;
        self.extensions = self.extension_factories.instantiate(registry.extensions());
        self.registry = registry;
        self.resolver = ZoneResolver::new();
        if let Some(zone) = current_zone.filter(|z| self.registry.zone(z).is_some()) {
            self.resolver.commit(Some(zone), zone_entered_at.unwrap_or_default());
        }
        self.dedup.restore(&dedup);
        self.spool.restore(spool);
        self.metrics.set_spool_len(self.spool.len());
        self.scheduler.clear();
        self.triggers.restore(stay_marks, &self.registry);
        self.closest = ZoneResolver::closest_beacon(&self.registry).map(|b| b.key.clone());
        self.selector.reset();
        if self.monitoring {
            self.update_monitored_beacons();
        }
        info!(
            saved_at = %saved_at,
            beacons = self.registry.beacon_count(),
            zone = ?self.resolver.current(),
            spool = self.spool.len(),
            "engine_restored"
        );
    }

    pub fn save_snapshot(&self, store: &dyn SnapshotStore, now: u64) -> Result<()> {
        store.save(&self.snapshot(now))?;
        Ok(())
    }

    /// Returns whether a snapshot was found
    pub fn load_snapshot(&mut self, store: &dyn SnapshotStore) -> Result<bool> {
        match store.load()? {
            Some(snapshot) => {
                self.restore(snapshot);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // --- delivery --------------------------------------------------------

    /// Take the next batch to hand to the backend
    pub fn take_delivery_batch(&mut self) -> Option<Vec<ActionEvent>> {
        self.spool.begin_batch()
    }

    /// Settle the in-flight batch; returns how many events were removed
    pub fn complete_delivery(&mut self, result: std::result::Result<(), BackendError>) -> usize {
        let delivered = match &result {
            Ok(()) => self.spool.complete_batch(true),
            Err(e) => {
                self.spool.complete_batch(false);
                self.metrics.record_delivery_failure();
                if e.is_retryable() {
                    warn!(error = %e, queued = self.spool.len(), "delivery_failed_will_retry");
                } else {
                    error!(error = %e, queued = self.spool.len(), "delivery_failed");
                }
                0
            }
        };
        if delivered > 0 {
            self.metrics.record_delivery(delivered);
            debug!(delivered, remaining = self.spool.len(), "delivery_acknowledged");
        }
        self.metrics.set_spool_len(self.spool.len());
        delivered
    }

    /// Deliver everything queued, inline
    pub async fn flush(&mut self, backend: &dyn Backend) -> Result<usize> {
        let mut total = 0;
        while let Some(batch) = self.take_delivery_batch() {
            let result = EventSpooler::deliver_batch(backend, &batch).await;
            let failed = result.clone().err();
            total += self.complete_delivery(result);
            if let Some(e) = failed {
                return Err(e.into());
            }
        }
        Ok(total)
    }

    fn spawn_delivery(&mut self, backend: &Arc<dyn Backend>, outcome_tx: &mpsc::Sender<DeliveryOutcome>) {
        let Some(batch) = self.take_delivery_batch() else {
            return;
        };
        let backend = backend.clone();
        let tx = outcome_tx.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let result = EventSpooler::deliver_batch(backend.as_ref(), &batch).await;
            debug!(events = batch.len(), elapsed_us = started.elapsed().as_micros() as u64, "delivery_attempted");
            if tx.send(DeliveryOutcome { result }).await.is_err() {
                warn!("delivery_outcome_dropped");
            }
        });
    }

    // --- run loop --------------------------------------------------------

    /// Drive the engine until the input closes or shutdown is signalled
    pub async fn run(
        &mut self,
        mut input_rx: mpsc::Receiver<PipelineInput>,
        backend: Arc<dyn Backend>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let (outcome_tx, mut outcome_rx) = mpsc::channel::<DeliveryOutcome>(4);
        let (config_tx, mut config_rx) =
            mpsc::channel::<std::result::Result<SiteConfiguration, BackendError>>(2);

        let mut flush_interval = interval(Duration::from_millis(self.config.flush_interval_ms()));
        flush_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut metrics_interval = interval(Duration::from_secs(self.config.metrics_interval_secs()));
        metrics_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("engine_started");

        loop {
            let wait_ms = self
                .next_deadline()
                .map(|deadline| deadline.saturating_sub(epoch_ms()))
                .unwrap_or(IDLE_WAKE_MS)
                .min(IDLE_WAKE_MS);

            tokio::select! {
                input = input_rx.recv() => {
                    match input {
                        Some(PipelineInput::Reload) => {
                            let backend = backend.clone();
                            let tx = config_tx.clone();
                            tokio::spawn(async move {
                                let _ = tx.send(backend.fetch_configuration().await).await;
                            });
                        }
                        Some(input) => {
                            self.handle_input(input, epoch_ms());
                        }
                        None => {
                            info!("engine_input_closed");
                            break;
                        }
                    }
                }
                Some(fetched) = config_rx.recv() => {
                    match fetched {
                        Ok(site) => {
                            if let Err(e) = self.apply_configuration(site, epoch_ms()) {
                                warn!(error = %e, code = e.error_code(), "reload_rejected");
                            }
                        }
                        Err(e) => warn!(error = %e, "reload_fetch_failed"),
                    }
                }
                _ = sleep(Duration::from_millis(wait_ms)) => {
                    self.handle_timers(epoch_ms());
                }
                _ = flush_interval.tick() => {
                    if !self.spool.is_in_flight() {
                        self.spawn_delivery(&backend, &outcome_tx);
                    }
                    self.dedup.prune(epoch_ms());
                }
                Some(outcome) = outcome_rx.recv() => {
                    let ok = outcome.result.is_ok();
                    self.complete_delivery(outcome.result);
                    // Keep draining while the backend accepts
                    if ok && !self.spool.is_empty() {
                        self.spawn_delivery(&backend, &outcome_tx);
                    }
                }
                _ = metrics_interval.tick() => {
                    self.metrics.report().log();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("engine_shutdown_requested");
                        break;
                    }
                }
            }
        }

        if self.spool.is_in_flight() {
            if let Some(outcome) = outcome_rx.recv().await {
                self.complete_delivery(outcome.result);
            }
        }
        match self.flush(backend.as_ref()).await {
            Ok(n) => info!(delivered = n, "engine_final_flush"),
            Err(e) => warn!(error = %e, queued = self.spool.len(), "engine_final_flush_failed"),
        }
        self.stop_monitoring();
        info!("engine_stopped");
    }
}

/// Result of a spawned delivery attempt
#[derive(Debug)]
struct DeliveryOutcome {
    result: std::result::Result<(), BackendError>,
}
