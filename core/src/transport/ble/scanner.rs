/// BLE scan controller with duty cycle management
///
/// Scanning is either continuous (100 % duty cycle) or alternates between a
/// scan window and a pause within each `scan_interval_ms`. Received
/// advertisements are validated and published as [`Sighting`]s on a bounded
/// broadcast channel; a lagging consumer loses the oldest sightings (counted)
/// and never blocks the platform callback.

use super::beacon::parse_beacon;
use super::capability::{AdvertisementCallback, BleCapability, CapabilityError, RawAdvertisement};
use super::retry::RetryPolicy;
use crate::encounter::Sighting;
use crate::events::{EventBus, SupervisorReport};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, trace, warn};

/// Longest scan cycle accepted by `validate`
pub const MAX_SCAN_INTERVAL_MS: u64 = 3_600_000;

/// BLE scanning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Length of one scan cycle (window + pause) in milliseconds
    pub scan_interval_ms: u64,
    /// Share of each cycle spent scanning (1-100)
    pub duty_cycle_percent: u8,
    /// Buffered sightings before the oldest are dropped
    pub sighting_channel_capacity: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: 4_000,
            duty_cycle_percent: 100,
            sighting_channel_capacity: 1024,
        }
    }
}

impl ScanConfig {
    /// Set the duty cycle percentage
    pub fn with_duty_cycle(mut self, percent: u8) -> Result<Self, ScanError> {
        if percent == 0 || percent > 100 {
            return Err(ScanError::InvalidDutyCycle(percent));
        }
        self.duty_cycle_percent = percent;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ScanError> {
        if self.scan_interval_ms == 0 {
            return Err(ScanError::InvalidConfig(
                "Scan interval must be > 0".to_string(),
            ));
        }
        if self.scan_interval_ms > MAX_SCAN_INTERVAL_MS {
            return Err(ScanError::InvalidConfig(format!(
                "Scan interval must be at most {} ms",
                MAX_SCAN_INTERVAL_MS
            )));
        }
        if self.duty_cycle_percent == 0 || self.duty_cycle_percent > 100 {
            return Err(ScanError::InvalidDutyCycle(self.duty_cycle_percent));
        }
        if self.sighting_channel_capacity == 0 {
            return Err(ScanError::InvalidConfig(
                "Sighting channel capacity must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_continuous(&self) -> bool {
        self.duty_cycle_percent >= 100
    }

    /// Scan window within one interval
    pub fn window_duration(&self) -> Duration {
        let ms = self
            .scan_interval_ms
            .saturating_mul(self.duty_cycle_percent.min(100) as u64)
            / 100;
        Duration::from_millis(ms.max(1))
    }

    /// Pause within one interval
    pub fn pause_duration(&self) -> Duration {
        let pause_percent = 100u64.saturating_sub(self.duty_cycle_percent as u64);
        Duration::from_millis((self.scan_interval_ms.saturating_mul(pause_percent) / 100).max(1))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("Invalid scan configuration: {0}")]
    InvalidConfig(String),
    #[error("Invalid duty cycle: {0}")]
    InvalidDutyCycle(u8),
    #[error("Scanning capability error: {0}")]
    Capability(#[from] CapabilityError),
    #[error("Scanner task is not running")]
    TaskStopped,
}

/// Scanner state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScannerState {
    Idle,
    Scanning,
    Error,
}

/// Advertisement ingestion counters, shared with the platform callback
#[derive(Debug, Default)]
pub struct ScanCounters {
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl ScanCounters {
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScannerStatus {
    pub state: ScannerState,
    /// Whether the radio is scanning right now (false during a duty-cycle pause)
    pub window_open: bool,
    pub duty_cycle_percent: u8,
    pub accepted: u64,
    pub rejected: u64,
}

pub struct ScanController {
    capability: Arc<dyn BleCapability>,
    config: ScanConfig,
    retry: RetryPolicy,
    events: EventBus,
    sightings: broadcast::Sender<Sighting>,
    counters: Arc<ScanCounters>,
    state: ScannerState,
    window_open: bool,
}

impl ScanController {
    pub fn new(
        capability: Arc<dyn BleCapability>,
        config: ScanConfig,
        retry: RetryPolicy,
        events: EventBus,
        sightings: broadcast::Sender<Sighting>,
    ) -> Result<Self, ScanError> {
        config.validate()?;
        Ok(Self {
            capability,
            config,
            retry,
            events,
            sightings,
            counters: Arc::new(ScanCounters::default()),
            state: ScannerState::Idle,
            window_open: false,
        })
    }

    pub fn state(&self) -> ScannerState {
        self.state
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn counters(&self) -> Arc<ScanCounters> {
        self.counters.clone()
    }

    pub fn status(&self) -> ScannerStatus {
        ScannerStatus {
            state: self.state,
            window_open: self.window_open,
            duty_cycle_percent: self.config.duty_cycle_percent,
            accepted: self.counters.accepted(),
            rejected: self.counters.rejected(),
        }
    }

    /// Idle/Error -> Scanning
    pub async fn start(&mut self) -> Result<(), ScanError> {
        if self.state == ScannerState::Scanning {
            return Ok(());
        }

        if let Err(e) = self.open_window().await {
            self.state = ScannerState::Error;
            warn!("Failed to start scanning: {}", e);
            return Err(e.into());
        }

        self.state = ScannerState::Scanning;
        self.events.status(format!(
            "Scanning started ({}% duty cycle)",
            self.config.duty_cycle_percent
        ));
        Ok(())
    }

    /// -> Idle, releasing the radio
    pub fn stop(&mut self) {
        self.close_window();
        if self.state != ScannerState::Idle {
            self.state = ScannerState::Idle;
            info!("Scanning stopped");
        }
    }

    /// Flip between scan window and pause. Returns how long until the next flip.
    pub async fn toggle_duty_window(&mut self) -> Result<Duration, ScanError> {
        if self.state != ScannerState::Scanning || self.config.is_continuous() {
            return Ok(self.config.window_duration());
        }

        if self.window_open {
            self.close_window();
            return Ok(self.config.pause_duration());
        }

        if let Err(e) = self.open_window().await {
            self.state = ScannerState::Error;
            warn!("Failed to reopen scan window: {}", e);
            return Err(e.into());
        }
        Ok(self.config.window_duration())
    }

    async fn open_window(&mut self) -> Result<(), CapabilityError> {
        let callback = self.callback();
        let capability = self.capability.clone();
        self.retry
            .run("start_scanning", || capability.start_scanning(callback.clone()))
            .await?;
        self.window_open = true;
        Ok(())
    }

    fn close_window(&mut self) {
        if self.window_open {
            self.capability.stop_scanning();
            self.window_open = false;
        }
    }

    /// Validation boundary between the platform and the sighting stream
    fn callback(&self) -> AdvertisementCallback {
        let sightings = self.sightings.clone();
        let counters = self.counters.clone();

        Arc::new(move |raw: RawAdvertisement| match parse_beacon(&raw.payload) {
            Ok(remote) => {
                counters.accepted.fetch_add(1, Ordering::Relaxed);
                trace!("Sighting {} rssi {}", remote.display_name(), raw.rssi);
                // Err only means nobody is consuming right now
                let _ = sightings.send(Sighting {
                    remote,
                    rssi: raw.rssi,
                    observed_at: raw.observed_at,
                });
            }
            Err(e) => {
                counters.rejected.fetch_add(1, Ordering::Relaxed);
                trace!("Ignoring advertisement: {}", e);
            }
        })
    }
}

enum ScannerCommand {
    Start {
        reply: oneshot::Sender<Result<(), ScanError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<ScannerStatus>,
    },
}

/// Handle to the scanner task. Dropping it stops scanning.
pub struct ScannerHandle {
    command_tx: mpsc::Sender<ScannerCommand>,
    task: JoinHandle<()>,
}

impl ScannerHandle {
    pub fn spawn(
        mut controller: ScanController,
        reports: mpsc::UnboundedSender<SupervisorReport>,
    ) -> Self {
        let (command_tx, mut command_rx) = mpsc::channel::<ScannerCommand>(32);

        let task = tokio::spawn(async move {
            let mut next_toggle: Option<Instant> = None;

            loop {
                let deadline = next_toggle;
                let toggle = async move {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                };

                tokio::select! {
                    command = command_rx.recv() => match command {
                        Some(ScannerCommand::Start { reply }) => {
                            let result = controller.start().await;
                            next_toggle = match (&result, controller.config().is_continuous()) {
                                (Ok(()), false) => {
                                    Some(Instant::now() + controller.config().window_duration())
                                }
                                _ => None,
                            };
                            let _ = reply.send(result);
                        }
                        Some(ScannerCommand::Stop { reply }) => {
                            controller.stop();
                            next_toggle = None;
                            let _ = reply.send(());
                        }
                        Some(ScannerCommand::Status { reply }) => {
                            let _ = reply.send(controller.status());
                        }
                        None => {
                            controller.stop();
                            break;
                        }
                    },
                    _ = toggle => {
                        match controller.toggle_duty_window().await {
                            Ok(next) => next_toggle = Some(Instant::now() + next),
                            Err(e) => {
                                next_toggle = None;
                                let _ = reports.send(SupervisorReport::ScannerFailed(e));
                            }
                        }
                    }
                }
            }
        });

        Self { command_tx, task }
    }

    pub async fn start(&self) -> Result<(), ScanError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(ScannerCommand::Start { reply })
            .await
            .map_err(|_| ScanError::TaskStopped)?;
        rx.await.map_err(|_| ScanError::TaskStopped)?
    }

    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .command_tx
            .send(ScannerCommand::Stop { reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub async fn status(&self) -> Result<ScannerStatus, ScanError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(ScannerCommand::Status { reply })
            .await
            .map_err(|_| ScanError::TaskStopped)?;
        rx.await.map_err(|_| ScanError::TaskStopped)
    }

    pub async fn shutdown(self) {
        drop(self.command_tx);
        let _ = self.task.await;
    }
}
