//! Durable queue of fired-but-undelivered action events
//!
//! Events stay ordered by occurrence time. A batch is taken from the front,
//! handed to the backend, and only removed once acknowledged; a failed batch
//! stays queued for the next attempt (at-least-once, the backend dedups on
//! event id).

use crate::domain::event::ActionEvent;
use crate::domain::types::EventType;
use crate::infra::error::BackendError;
use crate::io::backend::Backend;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use tracing::{debug, info, warn};

pub struct EventSpooler {
    queue: VecDeque<ActionEvent>,
    /// Number of events at the front currently handed to the backend
    in_flight: usize,
    batch_size: usize,
    max_len: usize,
    last_by_type: FxHashMap<EventType, ActionEvent>,
}

impl EventSpooler {
    pub fn new(batch_size: usize, max_len: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            in_flight: 0,
            batch_size: batch_size.max(1),
            max_len: max_len.max(1),
            last_by_type: FxHashMap::default(),
        }
    }

    /// Queue an event in timestamp order. Returns how many old events were
    /// dropped to respect the length limit.
    pub fn enqueue(&mut self, event: ActionEvent) -> usize {
        let newer = self
            .last_by_type
            .get(&event.event_type)
            .map_or(true, |last| last.timestamp_ms <= event.timestamp_ms);
        if newer {
            self.last_by_type.insert(event.event_type, event.clone());
        }

        // Never insert ahead of the in-flight prefix
        let tail = self.queue.range(self.in_flight..);
        let offset = tail.take_while(|e| e.timestamp_ms <= event.timestamp_ms).count();
        self.queue.insert(self.in_flight + offset, event);

        let mut dropped = 0;
        while self.queue.len() > self.max_len && self.queue.len() > self.in_flight {
            if let Some(old) = self.queue.remove(self.in_flight) {
                warn!(event_id = %old.id, queue_len = self.queue.len(), "spool_event_dropped");
                dropped += 1;
            }
        }
        dropped
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[inline]
    pub fn is_in_flight(&self) -> bool {
        self.in_flight > 0
    }

    /// Take the next batch from the front, unless one is already out
    pub fn begin_batch(&mut self) -> Option<Vec<ActionEvent>> {
        if self.in_flight > 0 || self.queue.is_empty() {
            return None;
        }
        let n = self.batch_size.min(self.queue.len());
        self.in_flight = n;
        Some(self.queue.iter().take(n).cloned().collect())
    }

    /// Settle the in-flight batch; returns the number of events removed
    pub fn complete_batch(&mut self, acknowledged: bool) -> usize {
        let n = std::mem::take(&mut self.in_flight);
        if acknowledged {
            self.queue.drain(..n.min(self.queue.len()));
            n
        } else {
            0
        }
    }

    /// Most recent event of a kind ever queued
    pub fn last_event_of_type(&self, event_type: EventType) -> Option<&ActionEvent> {
        self.last_by_type.get(&event_type)
    }

    /// Queue contents in delivery order, for snapshots
    pub fn pending(&self) -> Vec<ActionEvent> {
        self.queue.iter().cloned().collect()
    }

    /// Replace the queue (snapshot restore); in-flight state is reset
    pub fn restore(&mut self, mut events: Vec<ActionEvent>) {
        events.sort_by_key(|e| e.timestamp_ms);
        self.in_flight = 0;
        self.queue = events.into();
        self.last_by_type.clear();
        for event in &self.queue {
            self.last_by_type.insert(event.event_type, event.clone());
        }
    }

    /// Deliver one batch; on `Unauthorized` refresh the token once and retry
    pub async fn deliver_batch(backend: &dyn Backend, batch: &[ActionEvent]) -> Result<(), BackendError> {
        match backend.send_events(batch).await {
            Err(BackendError::Unauthorized) => {
                info!(events = batch.len(), "spool_auth_refresh");
                backend.refresh_token().await?;
                backend.send_events(batch).await
            }
            other => other,
        }
    }

    /// Deliver everything queued, batch by batch, stopping at the first error.
    /// Returns the number of events delivered.
    pub async fn flush(&mut self, backend: &dyn Backend) -> Result<usize, BackendError> {
        let mut delivered = 0;
        while let Some(batch) = self.begin_batch() {
            match Self::deliver_batch(backend, &batch).await {
                Ok(()) => {
                    delivered += self.complete_batch(true);
                    debug!(events = batch.len(), remaining = self.len(), "spool_batch_delivered");
                }
                Err(e) => {
                    self.complete_batch(false);
                    warn!(error = %e, queued = self.len(), "spool_flush_failed");
                    return Err(e);
                }
            }
        }
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::EntityRef;
    use crate::domain::types::{ActionId, BeaconKey};
    use crate::io::backend::MemoryBackend;

    fn event(kind: EventType, ts: u64) -> ActionEvent {
        ActionEvent::new(kind, EntityRef::Beacon(BeaconKey::new("b1")), ActionId(1), ts)
    }

    fn timestamps(events: &[ActionEvent]) -> Vec<u64> {
        events.iter().map(|e| e.timestamp_ms).collect()
    }

    #[test]
    fn test_queue_ordered_by_occurrence() {
        let mut spool = EventSpooler::new(10, 100);
        spool.enqueue(event(EventType::Enter, 30));
        spool.enqueue(event(EventType::Enter, 10));
        spool.enqueue(event(EventType::Leave, 20));

        assert_eq!(timestamps(&spool.pending()), vec![10, 20, 30]);
    }

    #[test]
    fn test_failed_batch_stays_queued() {
        let mut spool = EventSpooler::new(2, 100);
        for ts in 1..=3 {
            spool.enqueue(event(EventType::Enter, ts));
        }

        let batch = spool.begin_batch().unwrap();
        assert_eq!(timestamps(&batch), vec![1, 2]);
        assert!(spool.begin_batch().is_none());

        assert_eq!(spool.complete_batch(false), 0);
        assert_eq!(spool.len(), 3);

        let batch = spool.begin_batch().unwrap();
        assert_eq!(timestamps(&batch), vec![1, 2]);
        assert_eq!(spool.complete_batch(true), 2);
        assert_eq!(timestamps(&spool.pending()), vec![3]);
    }

    #[test]
    fn test_enqueue_never_jumps_in_flight_batch() {
        let mut spool = EventSpooler::new(2, 100);
        spool.enqueue(event(EventType::Enter, 10));
        spool.enqueue(event(EventType::Enter, 20));
        spool.begin_batch();

        spool.enqueue(event(EventType::Enter, 5));
        spool.complete_batch(true);
        assert_eq!(timestamps(&spool.pending()), vec![5]);
    }

    #[test]
    fn test_max_len_drops_oldest() {
        let mut spool = EventSpooler::new(10, 2);
        spool.enqueue(event(EventType::Enter, 1));
        spool.enqueue(event(EventType::Enter, 2));
        assert_eq!(spool.enqueue(event(EventType::Enter, 3)), 1);
        assert_eq!(timestamps(&spool.pending()), vec![2, 3]);
    }

    #[test]
    fn test_last_event_of_type() {
        let mut spool = EventSpooler::new(10, 100);
        spool.enqueue(event(EventType::Enter, 5));
        spool.enqueue(event(EventType::Enter, 3));
        spool.enqueue(event(EventType::Leave, 4));

        assert_eq!(spool.last_event_of_type(EventType::Enter).map(|e| e.timestamp_ms), Some(5));
        assert!(spool.last_event_of_type(EventType::Timer).is_none());
    }

    #[tokio::test]
    async fn test_flush_delivers_in_batches() {
        let backend = MemoryBackend::new();
        let mut spool = EventSpooler::new(2, 100);
        for ts in 1..=5 {
            spool.enqueue(event(EventType::Enter, ts));
        }

        assert_eq!(spool.flush(&backend).await.unwrap(), 5);
        assert!(spool.is_empty());
        assert_eq!(backend.send_calls(), 3);
        assert_eq!(timestamps(&backend.delivered()), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_events() {
        let backend = MemoryBackend::new();
        backend.fail_next_send(BackendError::Transient("down".into()));
        let mut spool = EventSpooler::new(10, 100);
        spool.enqueue(event(EventType::Enter, 1));

        assert!(spool.flush(&backend).await.is_err());
        assert_eq!(spool.len(), 1);
        assert_eq!(backend.refresh_calls(), 0);

        assert_eq!(spool.flush(&backend).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_refreshes_once_and_retries() {
        let backend = MemoryBackend::new();
        backend.fail_next_send(BackendError::Unauthorized);
        let mut spool = EventSpooler::new(10, 100);
        spool.enqueue(event(EventType::Enter, 1));

        assert_eq!(spool.flush(&backend).await.unwrap(), 1);
        assert_eq!(backend.refresh_calls(), 1);
        assert_eq!(backend.delivered().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_propagates_and_keeps_events() {
        let backend = MemoryBackend::new();
        backend.fail_next_send(BackendError::Unauthorized);
        backend.fail_refresh(Some(BackendError::Unauthorized));
        let mut spool = EventSpooler::new(10, 100);
        spool.enqueue(event(EventType::Enter, 1));

        assert_eq!(spool.flush(&backend).await, Err(BackendError::Unauthorized));
        assert_eq!(spool.len(), 1);
        assert_eq!(backend.send_calls(), 1);
    }
}
