// Encounter worker
//
// Owns the deduplicator. Sightings and sweep ticks are handled on one
// sequential timeline, so the open-session map needs no lock.

use super::dedup::{EncounterConfig, EncounterDeduplicator};
use super::session::{EncounterSession, Sighting};
use crate::clock::Clock;
use crate::events::EventBus;
use crate::service::ServiceCounters;
use crate::store::StoreWriter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Sightings handled back to back before commands and sweeps are polled
const MAX_SIGHTING_BURST: usize = 64;

enum WorkerCommand {
    Flush { reply: oneshot::Sender<usize> },
    OpenCount { reply: oneshot::Sender<usize> },
}

/// Handle to the encounter worker task
pub struct EncounterWorker {
    command_tx: mpsc::Sender<WorkerCommand>,
    task: JoinHandle<()>,
}

impl EncounterWorker {
    /// Close every open session and hand it to the writer. Returns how many.
    pub async fn flush(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.command_tx.send(WorkerCommand::Flush { reply }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn open_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.command_tx.send(WorkerCommand::OpenCount { reply }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Stop the worker, closing any open sessions first
    pub async fn shutdown(self) {
        drop(self.command_tx);
        let _ = self.task.await;
    }
}

pub fn spawn_encounter_worker(
    config: &EncounterConfig,
    mut sightings: broadcast::Receiver<Sighting>,
    writer: StoreWriter,
    clock: Arc<dyn Clock>,
    events: EventBus,
    counters: Arc<ServiceCounters>,
) -> EncounterWorker {
    let (command_tx, mut command_rx) = mpsc::channel::<WorkerCommand>(16);
    let mut dedup = EncounterDeduplicator::new(config);
    let sweep_every = Duration::from_secs(config.sweep_interval_secs.max(1));

    let task = tokio::spawn(async move {
        let close = |sessions: Vec<EncounterSession>| {
            for session in sessions {
                counters.record_session_closed();
                debug!(
                    "Encounter {} closed after {}s ({} sightings)",
                    session.remote.display_name(),
                    session.duration_secs,
                    session.sighting_count
                );
                if !writer.submit(session) {
                    warn!("Store writer gone, encounter lost");
                    counters.record_session_lost();
                }
            }
        };

        let mut sweep = tokio::time::interval(sweep_every);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sightings_open = true;
        let mut burst = 0usize;

        loop {
            // Sightings first so commands observe everything already queued,
            // but commands and sweeps get a turn after every burst
            tokio::select! {
                biased;

                received = sightings.recv(), if sightings_open && burst < MAX_SIGHTING_BURST => {
                    burst += 1;
                    match received {
                        Ok(sighting) => {
                            if let Some(session) = observe(&mut dedup, &sighting, &counters, &events) {
                                close(vec![session]);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Encounter worker lagging, {} sightings dropped", n);
                            counters.record_sightings_dropped(n);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("Sighting stream closed");
                            sightings_open = false;
                        }
                    }
                }
                command = command_rx.recv() => {
                    burst = 0;
                    match command {
                        Some(WorkerCommand::Flush { reply }) => {
                            // Whatever is already queued belongs to this flush
                            loop {
                                match sightings.try_recv() {
                                    Ok(sighting) => {
                                        if let Some(session) =
                                            observe(&mut dedup, &sighting, &counters, &events)
                                        {
                                            close(vec![session]);
                                        }
                                    }
                                    Err(broadcast::error::TryRecvError::Lagged(n)) => {
                                        counters.record_sightings_dropped(n);
                                    }
                                    Err(_) => break,
                                }
                            }
                            let sessions = dedup.drain();
                            let n = sessions.len();
                            close(sessions);
                            let _ = reply.send(n);
                        }
                        Some(WorkerCommand::OpenCount { reply }) => {
                            let _ = reply.send(dedup.open_count());
                        }
                        None => break,
                    }
                }
                _ = sweep.tick() => {
                    burst = 0;
                    close(dedup.sweep(clock.now_secs()));
                }
                _ = std::future::ready(()), if burst >= MAX_SIGHTING_BURST => {
                    burst = 0;
                }
            }
        }

        close(dedup.drain());
        debug!("Encounter worker stopped");
    });

    EncounterWorker { command_tx, task }
}

/// Fold one sighting in. Returns the session it closed, if any.
fn observe(
    dedup: &mut EncounterDeduplicator,
    sighting: &Sighting,
    counters: &ServiceCounters,
    events: &EventBus,
) -> Option<EncounterSession> {
    counters.record_sighting();
    let was_open = dedup.is_open(&sighting.remote);
    let closed = dedup.observe(sighting);
    if !was_open || closed.is_some() {
        counters.record_session_opened();
        events.nearby_device_found(sighting.remote.display_name(), sighting.rssi);
    }
    closed
}
