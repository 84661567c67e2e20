//! Snapshot persistence collaborator
//!
//! A snapshot holds what the engine needs to resume after a restart: the
//! configured graph with live beacon state, the committed zone, per-stay
//! trigger marks, the dedup table and the undelivered spool. Pending timers
//! are not saved; they are re-derived from the next ranging pass.

use crate::domain::event::ActionEvent;
use crate::domain::registry::Registry;
use crate::domain::types::ZoneId;
use crate::infra::error::PersistenceError;
use crate::services::dedup::DedupEntry;
use crate::services::trigger_engine::StayMarks;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub registry: Registry,
    pub current_zone: Option<ZoneId>,
    #[serde(default)]
    pub zone_entered_at: Option<u64>,
    /// Dwell and timer triggers already handled in the running stays
    #[serde(default)]
    pub stay_marks: StayMarks,
    #[serde(default)]
    pub dedup: Vec<DedupEntry>,
    #[serde(default)]
    pub spool: Vec<ActionEvent>,
}

impl Snapshot {
    pub fn new(registry: Registry, now: u64) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: DateTime::from_timestamp_millis(now as i64).unwrap_or_default(),
            registry,
            current_zone: None,
            zone_entered_at: None,
            stay_marks: StayMarks::default(),
            dedup: Vec::new(),
            spool: Vec::new(),
        }
    }
}

pub trait SnapshotStore: Send {
    fn load(&self) -> Result<Option<Snapshot>, PersistenceError>;
    fn save(&self, snapshot: &Snapshot) -> Result<(), PersistenceError>;
}

/// Pretty JSON file, replaced atomically (temp file + rename)
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_err(&self, source: std::io::Error) -> PersistenceError {
        PersistenceError::Write { path: self.path.clone(), source }
    }
}

impl SnapshotStore for JsonFileStore {
    fn load(&self) -> Result<Option<Snapshot>, PersistenceError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "snapshot_absent");
                return Ok(None);
            }
            Err(source) => return Err(PersistenceError::Read { path: self.path.clone(), source }),
        };
        let snapshot: Snapshot =
            serde_json::from_str(&raw).map_err(|e| PersistenceError::Corrupt(e.to_string()))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(PersistenceError::Corrupt(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        info!(path = %self.path.display(), saved_at = %snapshot.saved_at, "snapshot_loaded");
        Ok(Some(snapshot))
    }

    fn save(&self, snapshot: &Snapshot) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| self.write_err(e))?;
            }
        }
        let json = serde_json::to_string_pretty(snapshot)
            .map_err(|e| PersistenceError::Corrupt(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| self.write_err(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.write_err(e))?;
        debug!(
            path = %self.path.display(),
            spool = snapshot.spool.len(),
            dedup = snapshot.dedup.len(),
            "snapshot_saved"
        );
        Ok(())
    }
}

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    slot: Mutex<Option<Snapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemoryStore {
    fn load(&self) -> Result<Option<Snapshot>, PersistenceError> {
        Ok(self.slot.lock().clone())
    }

    fn save(&self, snapshot: &Snapshot) -> Result<(), PersistenceError> {
        *self.slot.lock() = Some(snapshot.clone());
        Ok(())
    }
}
