//! Lock-free metrics collection and periodic reporting
//!
//! Counters are plain atomics updated from the engine loop. The periodic
//! reporter reads and resets the latency window through `report`; the
//! Prometheus endpoint reads lifetime totals through `totals`, which resets
//! nothing. All atomics use Relaxed ordering;
//! these are statistical counters only and never drive engine decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].load(Ordering::Relaxed))
}

#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Upper bound of the bucket holding the given percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Last bucket uses 2x the previous bound
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Ranging batches processed (monotonic)
    batches_total: AtomicU64,
    /// Batches since last report (reset on report)
    batches_since_report: AtomicU64,
    /// Raw samples received (monotonic)
    samples_total: AtomicU64,
    /// Samples dropped because their region was not monitored
    samples_ignored: AtomicU64,
    /// Sum of batch latencies in microseconds (reset on report)
    latency_sum_us: AtomicU64,
    /// Max batch latency in microseconds (reset on report)
    latency_max_us: AtomicU64,
    /// Batch processing latency histogram (reset on report)
    latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Lifetime latency sum, max and histogram (never reset)
    latency_total_sum_us: AtomicU64,
    latency_total_max_us: AtomicU64,
    latency_total_buckets: [AtomicU64; NUM_BUCKETS],
    zone_changes: AtomicU64,
    timers_scheduled: AtomicU64,
    timers_cancelled: AtomicU64,
    timers_fired: AtomicU64,
    /// Timers dropped after the background budget ran out
    timers_dropped: AtomicU64,
    actions_fired: AtomicU64,
    /// Action firings suppressed by the refire interval
    actions_suppressed: AtomicU64,
    events_spooled: AtomicU64,
    /// Spooled events dropped to respect the queue limit
    events_spool_dropped: AtomicU64,
    events_delivered: AtomicU64,
    delivery_failures: AtomicU64,
    reconfigurations: AtomicU64,
    /// Current spool length (point-in-time)
    spool_len: AtomicU64,
    /// Current number of monitored regions (point-in-time)
    monitored_regions: AtomicU64,
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            batches_total: AtomicU64::new(0),
            batches_since_report: AtomicU64::new(0),
            samples_total: AtomicU64::new(0),
            samples_ignored: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
            latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            latency_total_sum_us: AtomicU64::new(0),
            latency_total_max_us: AtomicU64::new(0),
            latency_total_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            zone_changes: AtomicU64::new(0),
            timers_scheduled: AtomicU64::new(0),
            timers_cancelled: AtomicU64::new(0),
            timers_fired: AtomicU64::new(0),
            timers_dropped: AtomicU64::new(0),
            actions_fired: AtomicU64::new(0),
            actions_suppressed: AtomicU64::new(0),
            events_spooled: AtomicU64::new(0),
            events_spool_dropped: AtomicU64::new(0),
            events_delivered: AtomicU64::new(0),
            delivery_failures: AtomicU64::new(0),
            reconfigurations: AtomicU64::new(0),
            spool_len: AtomicU64::new(0),
            monitored_regions: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record a processed ranging batch with its sample count and latency
    #[inline]
    pub fn record_batch(&self, samples: usize, latency_us: u64) {
        self.batches_total.fetch_add(1, Ordering::Relaxed);
        self.batches_since_report.fetch_add(1, Ordering::Relaxed);
        self.samples_total.fetch_add(samples as u64, Ordering::Relaxed);
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        let bucket = bucket_index(latency_us);
        self.latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.latency_max_us, latency_us);
        self.latency_total_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.latency_total_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.latency_total_max_us, latency_us);
    }

    #[inline]
    pub fn record_samples_ignored(&self, n: usize) {
        self.samples_ignored.fetch_add(n as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_zone_change(&self) {
        self.zone_changes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_timer_scheduled(&self) {
        self.timers_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_timer_cancelled(&self) {
        self.timers_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_timers_fired(&self, fired: usize, dropped: usize) {
        self.timers_fired.fetch_add(fired as u64, Ordering::Relaxed);
        self.timers_dropped.fetch_add(dropped as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_action_fired(&self) {
        self.actions_fired.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_action_suppressed(&self) {
        self.actions_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_spooled(&self, dropped: usize) {
        self.events_spooled.fetch_add(1, Ordering::Relaxed);
        self.events_spool_dropped.fetch_add(dropped as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_delivery(&self, delivered: usize) {
        self.events_delivered.fetch_add(delivered as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_delivery_failure(&self) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reconfiguration(&self) {
        self.reconfigurations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_spool_len(&self, len: usize) {
        self.spool_len.store(len as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_monitored_regions(&self, n: usize) {
        self.monitored_regions.store(n as u64, Ordering::Relaxed);
    }

    pub fn batches_total(&self) -> u64 {
        self.batches_total.load(Ordering::Relaxed)
    }

    pub fn samples_total(&self) -> u64 {
        self.samples_total.load(Ordering::Relaxed)
    }

    pub fn samples_ignored(&self) -> u64 {
        self.samples_ignored.load(Ordering::Relaxed)
    }

    pub fn zone_changes(&self) -> u64 {
        self.zone_changes.load(Ordering::Relaxed)
    }

    pub fn timers_scheduled(&self) -> u64 {
        self.timers_scheduled.load(Ordering::Relaxed)
    }

    pub fn timers_cancelled(&self) -> u64 {
        self.timers_cancelled.load(Ordering::Relaxed)
    }

    pub fn timers_fired(&self) -> u64 {
        self.timers_fired.load(Ordering::Relaxed)
    }

    pub fn timers_dropped(&self) -> u64 {
        self.timers_dropped.load(Ordering::Relaxed)
    }

    pub fn actions_fired(&self) -> u64 {
        self.actions_fired.load(Ordering::Relaxed)
    }

    pub fn actions_suppressed(&self) -> u64 {
        self.actions_suppressed.load(Ordering::Relaxed)
    }

    pub fn events_spooled(&self) -> u64 {
        self.events_spooled.load(Ordering::Relaxed)
    }

    pub fn events_spool_dropped(&self) -> u64 {
        self.events_spool_dropped.load(Ordering::Relaxed)
    }

    pub fn events_delivered(&self) -> u64 {
        self.events_delivered.load(Ordering::Relaxed)
    }

    pub fn delivery_failures(&self) -> u64 {
        self.delivery_failures.load(Ordering::Relaxed)
    }

    pub fn reconfigurations(&self) -> u64 {
        self.reconfigurations.load(Ordering::Relaxed)
    }

    pub fn spool_len(&self) -> u64 {
        self.spool_len.load(Ordering::Relaxed)
    }

    pub fn monitored_regions(&self) -> u64 {
        self.monitored_regions.load(Ordering::Relaxed)
    }

    /// Calculate and return a summary, then reset periodic counters
    pub fn report(&self) -> MetricsSummary {
        let batches = self.batches_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.latency_max_us.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.latency_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let batches_per_sec = if elapsed.as_secs_f64() > 0.0 {
            batches as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let avg_latency = if batches > 0 { latency_sum / batches } else { 0 };
        self.summary(batches_per_sec, avg_latency, max_latency, lat_buckets)
    }

    /// Lifetime view for scrapers; leaves the report window alone
    pub fn totals(&self) -> MetricsSummary {
        let batches = self.batches_total();
        let latency_sum = self.latency_total_sum_us.load(Ordering::Relaxed);
        let avg_latency = if batches > 0 { latency_sum / batches } else { 0 };
        self.summary(
            0.0,
            avg_latency,
            self.latency_total_max_us.load(Ordering::Relaxed),
            load_buckets(&self.latency_total_buckets),
        )
    }

    fn summary(
        &self,
        batches_per_sec: f64,
        avg_latency: u64,
        max_latency: u64,
        lat_buckets: [u64; NUM_BUCKETS],
    ) -> MetricsSummary {
        MetricsSummary {
            batches_total: self.batches_total(),
            batches_per_sec,
            samples_total: self.samples_total(),
            samples_ignored: self.samples_ignored(),
            avg_batch_latency_us: avg_latency,
            max_batch_latency_us: max_latency,
            lat_buckets,
            lat_p50_us: percentile_from_buckets(&lat_buckets, 0.50),
            lat_p99_us: percentile_from_buckets(&lat_buckets, 0.99),
            zone_changes: self.zone_changes(),
            timers_scheduled: self.timers_scheduled(),
            timers_cancelled: self.timers_cancelled(),
            timers_fired: self.timers_fired(),
            timers_dropped: self.timers_dropped(),
            actions_fired: self.actions_fired(),
            actions_suppressed: self.actions_suppressed(),
            events_spooled: self.events_spooled(),
            events_spool_dropped: self.events_spool_dropped(),
            events_delivered: self.events_delivered(),
            delivery_failures: self.delivery_failures(),
            reconfigurations: self.reconfigurations(),
            spool_len: self.spool_len(),
            monitored_regions: self.monitored_regions(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Exported for Prometheus formatting
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub batches_total: u64,
    pub batches_per_sec: f64,
    pub samples_total: u64,
    pub samples_ignored: u64,
    pub avg_batch_latency_us: u64,
    pub max_batch_latency_us: u64,
    /// Batch latency histogram, same bounds as `METRICS_BUCKET_BOUNDS`
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p99_us: u64,
    pub zone_changes: u64,
    pub timers_scheduled: u64,
    pub timers_cancelled: u64,
    pub timers_fired: u64,
    pub timers_dropped: u64,
    pub actions_fired: u64,
    pub actions_suppressed: u64,
    pub events_spooled: u64,
    pub events_spool_dropped: u64,
    pub events_delivered: u64,
    pub delivery_failures: u64,
    pub reconfigurations: u64,
    pub spool_len: u64,
    pub monitored_regions: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            batches_total = %self.batches_total,
            batches_per_sec = format!("{:.1}", self.batches_per_sec),
            samples_total = %self.samples_total,
            avg_latency_us = %self.avg_batch_latency_us,
            p99_us = %self.lat_p99_us,
            zone_changes = %self.zone_changes,
            actions_fired = %self.actions_fired,
            actions_suppressed = %self.actions_suppressed,
            spool_len = %self.spool_len,
            delivered = %self.events_delivered,
            delivery_failures = %self.delivery_failures,
            monitored_regions = %self.monitored_regions,
            "metrics"
        );
    }
}
