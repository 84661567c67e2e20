//! Backend collaborator: configuration fetch, event delivery, beacon sync
//!
//! `FileBackend` is the daemon default: site configuration comes from a JSON
//! file and delivered events are appended to a JSONL file (one event per
//! line). `MemoryBackend` keeps everything in memory and can be told to fail.

use crate::domain::beacon::Beacon;
use crate::domain::event::ActionEvent;
use crate::domain::registry::SiteConfiguration;
use crate::domain::types::BeaconKey;
use crate::infra::error::BackendError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

#[async_trait]
pub trait Backend: Send + Sync {
    async fn fetch_configuration(&self) -> Result<SiteConfiguration, BackendError>;
    async fn send_events(&self, batch: &[ActionEvent]) -> Result<(), BackendError>;
    async fn sync_beacon(&self, beacon: &Beacon) -> Result<(), BackendError>;
    /// Re-authenticate after an `Unauthorized` response
    async fn refresh_token(&self) -> Result<(), BackendError>;
}

/// One delivered event line
#[derive(Serialize)]
struct DeliveredLine<'a> {
    user_id: &'a str,
    client_id: &'a str,
    #[serde(flatten)]
    event: &'a ActionEvent,
}

/// Site file in, JSONL events out
pub struct FileBackend {
    site_file: PathBuf,
    events_file: PathBuf,
    client_id: String,
    user_id: String,
}

impl FileBackend {
    pub fn new(site_file: impl Into<PathBuf>, events_file: impl Into<PathBuf>) -> Self {
        let site_file = site_file.into();
        let events_file = events_file.into();
        info!(site_file = %site_file.display(), events_file = %events_file.display(), "file_backend_initialized");
        Self { site_file, events_file, client_id: String::new(), user_id: String::new() }
    }

    pub fn with_identity(mut self, client_id: &str, user_id: &str) -> Self {
        self.client_id = client_id.to_string();
        self.user_id = user_id.to_string();
        self
    }

    pub fn events_file(&self) -> &Path {
        &self.events_file
    }

    async fn append_lines(&self, lines: &str) -> std::io::Result<()> {
        if let Some(parent) = self.events_file.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_file)
            .await?;
        file.write_all(lines.as_bytes()).await?;
        file.flush().await
    }
}

#[async_trait]
impl Backend for FileBackend {
    async fn fetch_configuration(&self) -> Result<SiteConfiguration, BackendError> {
        let raw = tokio::fs::read_to_string(&self.site_file).await.map_err(|e| {
            BackendError::Transient(format!("read {}: {e}", self.site_file.display()))
        })?;
        SiteConfiguration::from_json(&raw).map_err(|e| BackendError::InvalidPayload(e.to_string()))
    }

    async fn send_events(&self, batch: &[ActionEvent]) -> Result<(), BackendError> {
        let mut buf = String::new();
        for event in batch {
            let line = DeliveredLine { user_id: &self.user_id, client_id: &self.client_id, event };
            let json = serde_json::to_string(&line)
                .map_err(|e| BackendError::InvalidPayload(e.to_string()))?;
            buf.push_str(&json);
            buf.push('\n');
        }
        self.append_lines(&buf).await.map_err(|e| {
            BackendError::Transient(format!("append {}: {e}", self.events_file.display()))
        })?;
        debug!(events = batch.len(), file = %self.events_file.display(), "events_written");
        Ok(())
    }

    async fn sync_beacon(&self, beacon: &Beacon) -> Result<(), BackendError> {
        debug!(beacon = %beacon.key, "beacon_sync_skipped_file_backend");
        Ok(())
    }

    async fn refresh_token(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

#[derive(Default)]
struct MemoryState {
    site: Option<SiteConfiguration>,
    delivered: Vec<ActionEvent>,
    synced: Vec<BeaconKey>,
    send_failures: VecDeque<BackendError>,
    refresh_failure: Option<BackendError>,
    refresh_calls: u32,
    send_calls: u32,
}

/// In-memory backend with scriptable failures
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_site(site: SiteConfiguration) -> Self {
        let backend = Self::default();
        backend.state.lock().site = Some(site);
        backend
    }

    pub fn set_site(&self, site: SiteConfiguration) {
        self.state.lock().site = Some(site);
    }

    /// Queue a failure for the next `send_events` call
    pub fn fail_next_send(&self, error: BackendError) {
        self.state.lock().send_failures.push_back(error);
    }

    pub fn fail_refresh(&self, error: Option<BackendError>) {
        self.state.lock().refresh_failure = error;
    }

    pub fn delivered(&self) -> Vec<ActionEvent> {
        self.state.lock().delivered.clone()
    }

    pub fn synced(&self) -> Vec<BeaconKey> {
        self.state.lock().synced.clone()
    }

    pub fn refresh_calls(&self) -> u32 {
        self.state.lock().refresh_calls
    }

    pub fn send_calls(&self) -> u32 {
        self.state.lock().send_calls
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn fetch_configuration(&self) -> Result<SiteConfiguration, BackendError> {
        self.state
            .lock()
            .site
            .clone()
            .ok_or_else(|| BackendError::Transient("no site configured".to_string()))
    }

    async fn send_events(&self, batch: &[ActionEvent]) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.send_calls += 1;
        if let Some(err) = state.send_failures.pop_front() {
            return Err(err);
        }
        state.delivered.extend_from_slice(batch);
        Ok(())
    }

    async fn sync_beacon(&self, beacon: &Beacon) -> Result<(), BackendError> {
        self.state.lock().synced.push(beacon.key.clone());
        Ok(())
    }

    async fn refresh_token(&self) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.refresh_calls += 1;
        match state.refresh_failure.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::EntityRef;
    use crate::domain::types::{ActionId, EventType};
    use tempfile::tempdir;

    fn event(ts: u64) -> ActionEvent {
        ActionEvent::new(EventType::Enter, EntityRef::Beacon(BeaconKey::new("b1")), ActionId(1), ts)
    }

    #[tokio::test]
    async fn test_file_backend_appends_jsonl() {
        let dir = tempdir().unwrap();
        let events_file = dir.path().join("out/delivered.jsonl");
        let backend = FileBackend::new(dir.path().join("site.json"), &events_file)
            .with_identity("client-1", "user-1");

        backend.send_events(&[event(1), event(2)]).await.unwrap();
        backend.send_events(&[event(3)]).await.unwrap();

        let content = std::fs::read_to_string(&events_file).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["user_id"], "user-1");
        assert_eq!(first["event_type"], "enter");
        assert_eq!(first["timestamp_ms"], 1);
    }

    #[tokio::test]
    async fn test_file_backend_fetch_errors() {
        let dir = tempdir().unwrap();
        let site = dir.path().join("site.json");
        let backend = FileBackend::new(&site, dir.path().join("e.jsonl"));

        assert!(matches!(backend.fetch_configuration().await, Err(BackendError::Transient(_))));

        std::fs::write(&site, "{ nope").unwrap();
        assert!(matches!(backend.fetch_configuration().await, Err(BackendError::InvalidPayload(_))));

        std::fs::write(&site, r#"{"beacons": [], "zones": []}"#).unwrap();
        assert!(backend.fetch_configuration().await.is_ok());
    }

    #[tokio::test]
    async fn test_memory_backend_scripted_failure() {
        let backend = MemoryBackend::new();
        backend.fail_next_send(BackendError::Unauthorized);

        assert_eq!(backend.send_events(&[event(1)]).await, Err(BackendError::Unauthorized));
        assert!(backend.send_events(&[event(1)]).await.is_ok());
        assert_eq!(backend.delivered().len(), 1);
        assert_eq!(backend.send_calls(), 2);
    }
}
