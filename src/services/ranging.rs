//! Ranging aggregation across monitored regions
//!
//! The radio reports samples region by region. The aggregator collects one
//! pass until every expected region has reported (or the flush timeout
//! passes) and hands downstream a single merged batch. It never touches
//! beacon state itself.

use crate::domain::types::{BeaconKey, RawSample};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// One merged view of a ranging pass
#[derive(Debug, Clone, PartialEq)]
pub struct RangingBatch {
    /// Latest sample per beacon, ordered by key
    pub samples: Vec<RawSample>,
    /// Regions that reported during the pass
    pub regions_reported: usize,
    /// False when the pass was cut short by the flush timeout
    pub complete: bool,
}

/// Merges per-region ranging callbacks into per-pass batches
pub struct RangingAggregator {
    expected: BTreeSet<BeaconKey>,
    reported: BTreeSet<BeaconKey>,
    pending: BTreeMap<BeaconKey, RawSample>,
    /// Epoch ms of the first report in the current pass
    pass_started_at: Option<u64>,
    flush_timeout_ms: u64,
}

impl RangingAggregator {
    pub fn new(flush_timeout_ms: u64) -> Self {
        Self {
            expected: BTreeSet::new(),
            reported: BTreeSet::new(),
            pending: BTreeMap::new(),
            pass_started_at: None,
            flush_timeout_ms,
        }
    }

    /// Set the regions expected to report in each pass
    pub fn set_expected_regions(&mut self, regions: &BTreeSet<BeaconKey>) {
        self.expected = regions.clone();
        self.reported.retain(|r| regions.contains(r));
    }

    #[inline]
    pub fn expected_regions(&self) -> &BTreeSet<BeaconKey> {
        &self.expected
    }

    /// Add one region's samples.
    ///
    /// Returns the batches completed by this call: a region reporting twice
    /// closes the running pass first, and the new report may itself complete
    /// the next one.
    pub fn add(&mut self, region: &BeaconKey, samples: Vec<RawSample>, now: u64) -> Vec<RangingBatch> {
        let mut flushed = Vec::new();

        if self.reported.contains(region) {
            debug!(region = %region, "ranging_pass_restarted");
            if let Some(batch) = self.take(false) {
                flushed.push(batch);
            }
        }

        for sample in samples {
            self.pending.insert(sample.key.clone(), sample);
        }
        self.reported.insert(region.clone());
        self.pass_started_at.get_or_insert(now);

        if self.expected.is_subset(&self.reported) {
            if let Some(batch) = self.take(true) {
                flushed.push(batch);
            }
        }

        flushed
    }

    /// When the running pass times out
    pub fn deadline(&self) -> Option<u64> {
        self.pass_started_at.map(|t| t.saturating_add(self.flush_timeout_ms))
    }

    /// Flush the running pass if its timeout elapsed
    pub fn poll_timeout(&mut self, now: u64) -> Option<RangingBatch> {
        match self.deadline() {
            Some(deadline) if now >= deadline => {
                debug!(
                    reported = self.reported.len(),
                    expected = self.expected.len(),
                    "ranging_pass_timed_out"
                );
                self.take(false)
            }
            _ => None,
        }
    }

    /// Force out whatever has been collected
    pub fn flush(&mut self) -> Option<RangingBatch> {
        let complete = self.expected.is_subset(&self.reported);
        self.take(complete)
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.pass_started_at.is_some()
    }

    fn take(&mut self, complete: bool) -> Option<RangingBatch> {
        self.pass_started_at = None;
        if self.reported.is_empty() {
            return None;
        }
        let regions_reported = self.reported.len();
        self.reported.clear();
        let samples = std::mem::take(&mut self.pending).into_values().collect();
        Some(RangingBatch { samples, regions_reported, complete })
    }
}
