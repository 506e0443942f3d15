// Encounter deduplication
//
// Sequential reducer over the sighting stream. Owns every open session until
// it closes; at most one open session per remote identifier.

use super::session::{EncounterSession, Sighting};
use crate::transport::ble::RemoteIdentifier;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncounterConfig {
    /// Silence after which a session is closed
    pub gap_timeout_secs: u64,
    /// How often open sessions are swept for staleness
    pub sweep_interval_secs: u64,
}

impl Default for EncounterConfig {
    fn default() -> Self {
        Self {
            gap_timeout_secs: 300,
            sweep_interval_secs: 60,
        }
    }
}

pub struct EncounterDeduplicator {
    gap_timeout_secs: u64,
    open: HashMap<RemoteIdentifier, EncounterSession>,
}

impl EncounterDeduplicator {
    pub fn new(config: &EncounterConfig) -> Self {
        Self {
            gap_timeout_secs: config.gap_timeout_secs,
            open: HashMap::new(),
        }
    }

    /// Fold a sighting in. Returns the previous session for this remote if the
    /// gap since its last sighting exceeded the timeout; a fresh session is
    /// opened in its place.
    pub fn observe(&mut self, sighting: &Sighting) -> Option<EncounterSession> {
        match self.open.get_mut(&sighting.remote) {
            Some(session) if session.is_stale(sighting.observed_at, self.gap_timeout_secs) => {
                debug!(
                    "Encounter {} resumed after gap, closing previous session",
                    sighting.remote.display_name()
                );
                let closed = std::mem::replace(session, EncounterSession::open(sighting));
                Some(closed)
            }
            Some(session) => {
                session.record(sighting);
                None
            }
            None => {
                debug!("Encounter {} opened", sighting.remote.display_name());
                self.open.insert(sighting.remote, EncounterSession::open(sighting));
                None
            }
        }
    }

    /// Close every session silent for longer than the gap timeout
    pub fn sweep(&mut self, now: u64) -> Vec<EncounterSession> {
        let gap = self.gap_timeout_secs;
        let stale: Vec<RemoteIdentifier> = self
            .open
            .iter()
            .filter(|(_, session)| session.is_stale(now, gap))
            .map(|(remote, _)| *remote)
            .collect();

        let mut closed: Vec<EncounterSession> = stale
            .iter()
            .filter_map(|remote| self.open.remove(remote))
            .collect();
        closed.sort_by_key(|s| s.key());
        closed
    }

    /// Close everything
    pub fn drain(&mut self) -> Vec<EncounterSession> {
        let mut closed: Vec<EncounterSession> = self.open.drain().map(|(_, s)| s).collect();
        closed.sort_by_key(|s| s.key());
        closed
    }

    pub fn get(&self, remote: &RemoteIdentifier) -> Option<&EncounterSession> {
        self.open.get(remote)
    }

    pub fn is_open(&self, remote: &RemoteIdentifier) -> bool {
        self.open.contains_key(remote)
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }
}
