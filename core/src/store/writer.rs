// Store writer task
//
// Closed sessions arrive fire-and-forget; the encounter worker never waits on
// disk I/O. A failed write stays queued and is retried ahead of the next one.

use super::encounters::{AppendOutcome, EncounterStore, StoreError};
use crate::encounter::EncounterSession;
use crate::events::SupervisorReport;
use crate::service::ServiceCounters;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Sessions held while storage is failing before the oldest are dropped
pub const MAX_PENDING_SESSIONS: usize = 10_000;

enum StoreMessage {
    Session(EncounterSession),
    Purge {
        retention: Duration,
        now: u64,
        reply: oneshot::Sender<Result<usize, StoreError>>,
    },
    Sync {
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
}

/// Sender side of the writer task
#[derive(Clone)]
pub struct StoreWriter {
    tx: mpsc::UnboundedSender<StoreMessage>,
}

impl StoreWriter {
    /// Spawn the writer. The task exits, after a final write attempt, once
    /// every `StoreWriter` clone is dropped.
    pub fn spawn(
        store: EncounterStore,
        counters: Arc<ServiceCounters>,
        reports: mpsc::UnboundedSender<SupervisorReport>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<StoreMessage>();

        let task = tokio::spawn(async move {
            let mut writer = WriterState {
                store,
                counters,
                reports,
                pending: VecDeque::new(),
                failing: false,
            };

            while let Some(message) = rx.recv().await {
                match message {
                    StoreMessage::Session(session) => {
                        writer.enqueue(session);
                        let _ = writer.write_pending();
                    }
                    StoreMessage::Purge {
                        retention,
                        now,
                        reply,
                    } => {
                        let _ = reply.send(writer.store.purge_older_than(retention, now));
                    }
                    StoreMessage::Sync { reply } => {
                        let result = writer.write_pending().and_then(|()| writer.store.flush());
                        let _ = reply.send(result);
                    }
                }
            }

            if writer.write_pending().and_then(|()| writer.store.flush()).is_err() {
                error!(
                    "Store writer stopping with {} unwritten encounters",
                    writer.pending.len()
                );
            }
            debug!("Store writer stopped");
        });

        (Self { tx }, task)
    }

    /// Queue a closed session. Returns false if the writer has stopped.
    pub fn submit(&self, session: EncounterSession) -> bool {
        self.tx.send(StoreMessage::Session(session)).is_ok()
    }

    pub async fn purge(&self, retention: Duration, now: u64) -> Result<usize, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreMessage::Purge {
                retention,
                now,
                reply,
            })
            .map_err(|_| writer_stopped())?;
        rx.await.map_err(|_| writer_stopped())?
    }

    /// Wait until everything submitted so far is written and flushed
    pub async fn sync(&self) -> Result<(), StoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreMessage::Sync { reply })
            .map_err(|_| writer_stopped())?;
        rx.await.map_err(|_| writer_stopped())?
    }
}

fn writer_stopped() -> StoreError {
    StoreError::Backend(super::backend::BackendError::Io(
        "store writer stopped".to_string(),
    ))
}

struct WriterState {
    store: EncounterStore,
    counters: Arc<ServiceCounters>,
    reports: mpsc::UnboundedSender<SupervisorReport>,
    pending: VecDeque<EncounterSession>,
    failing: bool,
}

impl WriterState {
    fn enqueue(&mut self, session: EncounterSession) {
        if self.pending.len() >= MAX_PENDING_SESSIONS {
            if let Some(dropped) = self.pending.pop_front() {
                warn!("Encounter backlog full, dropping {}", dropped.key());
                self.counters.record_session_lost();
            }
        }
        self.pending.push_back(session);
    }

    /// Write queued sessions in order, stopping at the first failure
    fn write_pending(&mut self) -> Result<(), StoreError> {
        while let Some(session) = self.pending.front() {
            match self.store.append(session) {
                Ok(AppendOutcome::Inserted) => self.counters.record_session_persisted(),
                Ok(AppendOutcome::Duplicate) => self.counters.record_duplicate_append(),
                Err(e) => {
                    if !self.failing {
                        self.failing = true;
                        self.counters.record_storage_failure();
                        warn!("Encounter storage failing: {}", e);
                        let _ = self.reports.send(SupervisorReport::StoreFailed(e.clone()));
                    }
                    return Err(e);
                }
            }
            self.pending.pop_front();
        }

        if self.failing {
            self.failing = false;
            info!("Encounter storage recovered");
            let _ = self.reports.send(SupervisorReport::StoreRecovered);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encounter::Sighting;
    use crate::identity::IDENTIFIER_LEN;
    use crate::store::backend::MemoryStorage;
    use crate::transport::ble::RemoteIdentifier;

    fn session(fill: u8, at: u64) -> EncounterSession {
        EncounterSession::open(&Sighting {
            remote: RemoteIdentifier([fill; IDENTIFIER_LEN]),
            rssi: -60,
            observed_at: at,
        })
    }

    fn setup() -> (
        MemoryStorage,
        EncounterStore,
        Arc<ServiceCounters>,
        StoreWriter,
        mpsc::UnboundedReceiver<SupervisorReport>,
    ) {
        let backend = MemoryStorage::new();
        let store = EncounterStore::new(Arc::new(backend.clone()));
        let counters = Arc::new(ServiceCounters::default());
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let (writer, _task) = StoreWriter::spawn(store.clone(), counters.clone(), reports_tx);
        (backend, store, counters, writer, reports_rx)
    }

    #[tokio::test]
    async fn test_submitted_sessions_are_persisted() {
        let (_backend, store, counters, writer, _reports) = setup();

        assert!(writer.submit(session(1, 100)));
        assert!(writer.submit(session(2, 200)));
        assert!(writer.submit(session(1, 100)));
        writer.sync().await.unwrap();

        assert_eq!(store.count().unwrap(), 2);
        let stats = counters.snapshot();
        assert_eq!(stats.sessions_persisted, 2);
        assert_eq!(stats.duplicate_appends, 1);
    }

    #[tokio::test]
    async fn test_failed_write_is_retried_on_next_write() {
        let (backend, store, counters, writer, mut reports) = setup();

        backend.set_fail_writes(true);
        writer.submit(session(1, 100));
        writer.submit(session(2, 200));
        assert!(writer.sync().await.is_err());
        assert_eq!(store.count().unwrap(), 0);

        // One report per failure transition
        assert!(matches!(reports.try_recv(), Ok(SupervisorReport::StoreFailed(_))));
        assert!(reports.try_recv().is_err());
        assert_eq!(counters.snapshot().storage_failures, 1);

        backend.set_fail_writes(false);
        writer.submit(session(3, 300));
        writer.sync().await.unwrap();

        assert_eq!(store.count().unwrap(), 3);
        assert!(matches!(reports.try_recv(), Ok(SupervisorReport::StoreRecovered)));
    }

    #[tokio::test]
    async fn test_purge_through_writer() {
        let (_backend, store, _counters, writer, _reports) = setup();
        writer.submit(session(1, 100));
        writer.submit(session(2, 10_000));

        let purged = writer.purge(Duration::from_secs(1_000), 10_500).await.unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dropping_writer_flushes_and_stops() {
        let backend = MemoryStorage::new();
        let store = EncounterStore::new(Arc::new(backend));
        let (reports_tx, _reports_rx) = mpsc::unbounded_channel();
        let (writer, task) =
            StoreWriter::spawn(store.clone(), Arc::new(ServiceCounters::default()), reports_tx);

        writer.submit(session(1, 100));
        drop(writer);
        task.await.unwrap();

        assert_eq!(store.count().unwrap(), 1);
    }
}
