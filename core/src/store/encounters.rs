// Encounter log persistence
//
// Sessions are keyed by (first_seen, remote) so appends are idempotent and a
// prefix scan returns them in first_seen order.

use super::backend::{BackendError, MemoryStorage, SledStorage, StorageBackend};
use crate::encounter::{EncounterSession, SessionKey, SESSION_KEY_PREFIX};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("Corrupt session record: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    /// A session with the same key is already stored; it was left untouched
    Duplicate,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStats {
    pub sessions: usize,
    pub distinct_identifiers: usize,
    pub total_sightings: u64,
    pub oldest_first_seen: Option<u64>,
    pub newest_last_seen: Option<u64>,
}

#[derive(Clone)]
pub struct EncounterStore {
    backend: Arc<dyn StorageBackend>,
}

impl EncounterStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Open (or create) a sled-backed store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Ok(Self::new(Arc::new(SledStorage::open(path)?)))
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    pub fn append(&self, session: &EncounterSession) -> Result<AppendOutcome, StoreError> {
        let key = session.key();
        let value = serde_json::to_vec(session)?;

        if self.backend.insert_if_absent(&key.to_bytes(), &value)? {
            debug!("Stored encounter {}", key);
            Ok(AppendOutcome::Inserted)
        } else {
            debug!("Encounter {} already stored", key);
            Ok(AppendOutcome::Duplicate)
        }
    }

    pub fn get(&self, key: &SessionKey) -> Result<Option<EncounterSession>, StoreError> {
        match self.backend.get(&key.to_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Sessions still active at or after `since`, ordered by first_seen
    pub fn list_since(&self, since: u64) -> Result<Vec<EncounterSession>, StoreError> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|s| s.last_seen >= since)
            .collect())
    }

    /// Remove sessions whose last sighting is older than `now - retention`
    pub fn purge_older_than(&self, retention: Duration, now: u64) -> Result<usize, StoreError> {
        let cutoff = now.saturating_sub(retention.as_secs());
        let mut purged = 0;

        for (key, value) in self.backend.scan_prefix(SESSION_KEY_PREFIX)? {
            let session: EncounterSession = serde_json::from_slice(&value)?;
            if session.last_seen < cutoff {
                self.backend.remove(&key)?;
                purged += 1;
            }
        }

        if purged > 0 {
            info!("Purged {} encounters last seen before {}", purged, cutoff);
        }
        Ok(purged)
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        Ok(self.backend.count_prefix(SESSION_KEY_PREFIX)?)
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let sessions = self.all()?;
        let distinct: HashSet<_> = sessions.iter().map(|s| s.remote).collect();

        Ok(StoreStats {
            sessions: sessions.len(),
            distinct_identifiers: distinct.len(),
            total_sightings: sessions.iter().map(|s| s.sighting_count).sum(),
            oldest_first_seen: sessions.iter().map(|s| s.first_seen).min(),
            newest_last_seen: sessions.iter().map(|s| s.last_seen).max(),
        })
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        Ok(self.backend.flush()?)
    }

    fn all(&self) -> Result<Vec<EncounterSession>, StoreError> {
        self.backend
            .scan_prefix(SESSION_KEY_PREFIX)?
            .into_iter()
            .map(|(_, value)| serde_json::from_slice(&value).map_err(StoreError::from))
            .collect()
    }
}
