// Sightings and encounter sessions

use crate::identity::IDENTIFIER_LEN;
use crate::transport::ble::RemoteIdentifier;
use serde::{Deserialize, Serialize};

/// RSSI samples kept per session; the summary covers every sighting
pub const MAX_RSSI_SAMPLES: usize = 256;

/// Key prefix for persisted sessions
pub const SESSION_KEY_PREFIX: &[u8] = b"enc/";

/// One observed advertisement from a remote device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sighting {
    pub remote: RemoteIdentifier,
    /// Signal strength in dBm
    pub rssi: i16,
    /// Epoch seconds
    pub observed_at: u64,
}

/// A continuous run of sightings of one remote identifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncounterSession {
    pub remote: RemoteIdentifier,
    pub first_seen: u64,
    pub last_seen: u64,
    pub sighting_count: u64,
    pub rssi_samples: Vec<i16>,
    pub rssi_min: i16,
    pub rssi_max: i16,
    /// Sum over all sightings, for the mean
    pub rssi_sum: i64,
    pub duration_secs: u64,
}

impl EncounterSession {
    pub fn open(sighting: &Sighting) -> Self {
        Self {
            remote: sighting.remote,
            first_seen: sighting.observed_at,
            last_seen: sighting.observed_at,
            sighting_count: 1,
            rssi_samples: vec![sighting.rssi],
            rssi_min: sighting.rssi,
            rssi_max: sighting.rssi,
            rssi_sum: sighting.rssi as i64,
            duration_secs: 0,
        }
    }

    /// Fold another sighting of the same remote into the session.
    ///
    /// Late sightings count but never move `last_seen` backwards.
    pub fn record(&mut self, sighting: &Sighting) {
        debug_assert_eq!(sighting.remote, self.remote);

        self.sighting_count += 1;
        self.last_seen = self.last_seen.max(sighting.observed_at);
        self.duration_secs = self.last_seen.saturating_sub(self.first_seen);

        if self.rssi_samples.len() < MAX_RSSI_SAMPLES {
            self.rssi_samples.push(sighting.rssi);
        }
        self.rssi_min = self.rssi_min.min(sighting.rssi);
        self.rssi_max = self.rssi_max.max(sighting.rssi);
        self.rssi_sum += sighting.rssi as i64;
    }

    pub fn rssi_mean(&self) -> f64 {
        if self.sighting_count == 0 {
            return 0.0;
        }
        self.rssi_sum as f64 / self.sighting_count as f64
    }

    /// Older than the gap timeout: a new sighting starts a new session
    pub fn is_stale(&self, now: u64, gap_timeout_secs: u64) -> bool {
        now.saturating_sub(self.last_seen) > gap_timeout_secs
    }

    pub fn key(&self) -> SessionKey {
        SessionKey {
            first_seen: self.first_seen,
            remote: self.remote,
        }
    }
}

/// Identity of a persisted session. Byte order sorts by `first_seen`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub first_seen: u64,
    pub remote: RemoteIdentifier,
}

impl SessionKey {
    pub const ENCODED_LEN: usize = SESSION_KEY_PREFIX.len() + 8 + IDENTIFIER_LEN;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(Self::ENCODED_LEN);
        key.extend_from_slice(SESSION_KEY_PREFIX);
        key.extend_from_slice(&self.first_seen.to_be_bytes());
        key.extend_from_slice(self.remote.as_bytes());
        key
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::ENCODED_LEN || !bytes.starts_with(SESSION_KEY_PREFIX) {
            return None;
        }
        let rest = &bytes[SESSION_KEY_PREFIX.len()..];
        let first_seen = u64::from_be_bytes(rest[..8].try_into().ok()?);
        let remote = RemoteIdentifier(rest[8..].try_into().ok()?);
        Some(Self { first_seen, remote })
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.remote.display_name(), self.first_seen)
    }
}
