// Pipeline counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counters updated by the scanner, encounter worker and store writer
#[derive(Debug, Default)]
pub struct ServiceCounters {
    sightings_received: AtomicU64,
    sightings_dropped: AtomicU64,
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    sessions_persisted: AtomicU64,
    sessions_lost: AtomicU64,
    duplicate_appends: AtomicU64,
    storage_failures: AtomicU64,
}

impl ServiceCounters {
    pub fn record_sighting(&self) {
        self.sightings_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sightings_dropped(&self, n: u64) {
        self.sightings_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_persisted(&self) {
        self.sessions_persisted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_lost(&self) {
        self.sessions_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate_append(&self) {
        self.duplicate_appends.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_storage_failure(&self) {
        self.storage_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ServiceStats {
        ServiceStats {
            sightings_received: self.sightings_received.load(Ordering::Relaxed),
            sightings_dropped: self.sightings_dropped.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            sessions_persisted: self.sessions_persisted.load(Ordering::Relaxed),
            sessions_lost: self.sessions_lost.load(Ordering::Relaxed),
            duplicate_appends: self.duplicate_appends.load(Ordering::Relaxed),
            storage_failures: self.storage_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ServiceCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServiceStats {
    pub sightings_received: u64,
    /// Lost to backpressure before reaching the deduplicator
    pub sightings_dropped: u64,
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub sessions_persisted: u64,
    /// Dropped from the write backlog while storage was failing
    pub sessions_lost: u64,
    pub duplicate_appends: u64,
    pub storage_failures: u64,
}
