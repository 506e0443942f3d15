/// BLE advertising controller
///
/// Owns the identifier rotator and keeps the broadcast payload current:
/// the successor identifier is pre-generated ahead of expiry and swapped in
/// `rotation_lead_secs` before the old one expires, so there is no window in
/// which an expired identifier is on air.
///
/// The controller runs on its own task behind [`AdvertiserHandle`].

use super::beacon::encode_beacon;
use super::capability::{BleCapability, CapabilityError};
use super::retry::RetryPolicy;
use crate::clock::Clock;
use crate::events::{EventBus, SupervisorReport};
use crate::identity::{BroadcastIdentifier, IdentifierRotator, RotatorError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Successors are prepared once the current identifier has this long left
const SUCCESSOR_PREPARE_WINDOW_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdvertiserState {
    Idle,
    Advertising,
    Error,
}

/// How payload swaps are performed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdvertisingMode {
    /// The platform can overlap advertisement sets; start replaces in place
    MultipleAdvertisement,
    /// One advertisement set only; swap is stop-then-start
    SingleIdentifier,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdvertiseError {
    #[error("Advertising capability error: {0}")]
    Capability(#[from] CapabilityError),
    #[error(transparent)]
    Rotator(#[from] RotatorError),
    #[error("Advertiser task is not running")]
    TaskStopped,
}

/// Snapshot for status queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdvertiserStatus {
    pub state: AdvertiserState,
    pub mode: AdvertisingMode,
    pub current: Option<BroadcastIdentifier>,
}

pub struct AdvertisingController {
    capability: Arc<dyn BleCapability>,
    rotator: IdentifierRotator,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    events: EventBus,
    state: AdvertiserState,
    mode: AdvertisingMode,
}

impl AdvertisingController {
    pub fn new(
        capability: Arc<dyn BleCapability>,
        rotator: IdentifierRotator,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        events: EventBus,
    ) -> Self {
        Self {
            capability,
            rotator,
            clock,
            retry,
            events,
            state: AdvertiserState::Idle,
            mode: AdvertisingMode::MultipleAdvertisement,
        }
    }

    pub fn state(&self) -> AdvertiserState {
        self.state
    }

    /// Capability-query result: whether swaps overlap or stop-then-start
    pub fn mode(&self) -> AdvertisingMode {
        self.mode
    }

    pub fn current_identifier(&self) -> Option<&BroadcastIdentifier> {
        self.rotator.current_identifier()
    }

    pub fn status(&self) -> AdvertiserStatus {
        AdvertiserStatus {
            state: self.state,
            mode: self.mode,
            current: self.rotator.current_identifier().cloned(),
        }
    }

    /// Idle/Error -> Advertising with a freshly rotated identifier
    pub async fn start(&mut self) -> Result<BroadcastIdentifier, AdvertiseError> {
        if self.state == AdvertiserState::Advertising {
            if let Some(current) = self.rotator.current_identifier() {
                return Ok(current.clone());
            }
        }

        self.mode = if self.capability.is_multiple_advertisement_supported() {
            AdvertisingMode::MultipleAdvertisement
        } else {
            AdvertisingMode::SingleIdentifier
        };

        let identifier = match self.rotator.rotate(self.clock.now_secs()) {
            Ok(identifier) => identifier,
            Err(e) => return Err(self.fail(e)),
        };

        if let Err(e) = self.broadcast(&identifier, false).await {
            warn!("Failed to start advertising: {}", e);
            return Err(self.fail(e));
        }

        self.state = AdvertiserState::Advertising;
        self.events.status(format!(
            "Advertising started ({:?}), identifier valid until {}",
            self.mode, identifier.expires_at
        ));
        Ok(identifier)
    }

    /// Advance rotation. Returns the new identifier when a swap happened.
    ///
    /// A failure moves the controller to Error and is returned once; later
    /// ticks are no-ops until the next `start`.
    pub async fn tick(&mut self) -> Result<Option<BroadcastIdentifier>, AdvertiseError> {
        if self.state != AdvertiserState::Advertising {
            return Ok(None);
        }

        let now = self.clock.now_secs();
        let lead = self.rotator.config().rotation_lead_secs;

        if !self.rotator.needs_rotation(now, lead) {
            if self.rotator.needs_rotation(now, SUCCESSOR_PREPARE_WINDOW_SECS.max(lead)) {
                if let Err(e) = self.rotator.prepare_successor(now) {
                    return Err(self.fail(e));
                }
            }
            return Ok(None);
        }

        let identifier = match self.rotator.rotate(now) {
            Ok(identifier) => identifier,
            Err(e) => return Err(self.fail(e)),
        };

        if let Err(e) = self.broadcast(&identifier, true).await {
            warn!("Advertising swap failed: {}", e);
            return Err(self.fail(e));
        }

        debug!("Swapped advertised identifier at {}", now);
        Ok(Some(identifier))
    }

    /// -> Error. Nothing stays on air once rotation can no longer keep the
    /// payload inside its validity window.
    fn fail(&mut self, error: impl Into<AdvertiseError>) -> AdvertiseError {
        self.capability.stop_advertising();
        self.state = AdvertiserState::Error;
        error.into()
    }

    /// -> Idle, releasing the radio
    pub fn stop(&mut self) {
        if self.state != AdvertiserState::Idle {
            self.capability.stop_advertising();
            self.state = AdvertiserState::Idle;
            info!("Advertising stopped");
        }
    }

    async fn broadcast(
        &mut self,
        identifier: &BroadcastIdentifier,
        swapping: bool,
    ) -> Result<(), CapabilityError> {
        let payload = encode_beacon(identifier);
        let capability = self.capability.clone();

        if swapping && self.mode == AdvertisingMode::SingleIdentifier {
            capability.stop_advertising();
        }

        let result = self
            .retry
            .run("start_advertising", || capability.start_advertising(&payload))
            .await;

        match result {
            Err(CapabilityError::MultipleAdvertisementUnsupported)
                if self.mode == AdvertisingMode::MultipleAdvertisement =>
            {
                self.mode = AdvertisingMode::SingleIdentifier;
                self.events
                    .status("Multiple Advertisement is NOT supported, using single identifier mode");
                capability.stop_advertising();
                self.retry
                    .run("start_advertising", || capability.start_advertising(&payload))
                    .await
            }
            other => other,
        }
    }
}

enum AdvertiserCommand {
    Start {
        reply: oneshot::Sender<Result<BroadcastIdentifier, AdvertiseError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<AdvertiserStatus>,
    },
}

/// Handle to the advertiser task. Dropping it stops advertising.
pub struct AdvertiserHandle {
    command_tx: mpsc::Sender<AdvertiserCommand>,
    task: JoinHandle<()>,
}

impl AdvertiserHandle {
    /// Spawn the advertiser task. Tick failures are reported on `reports`.
    pub fn spawn(
        mut controller: AdvertisingController,
        reports: mpsc::UnboundedSender<SupervisorReport>,
    ) -> Self {
        let tick_every = Duration::from_millis(controller.rotator.config().tick_interval_ms.max(10));
        let (command_tx, mut command_rx) = mpsc::channel::<AdvertiserCommand>(32);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    command = command_rx.recv() => match command {
                        Some(AdvertiserCommand::Start { reply }) => {
                            let _ = reply.send(controller.start().await);
                        }
                        Some(AdvertiserCommand::Stop { reply }) => {
                            controller.stop();
                            let _ = reply.send(());
                        }
                        Some(AdvertiserCommand::Status { reply }) => {
                            let _ = reply.send(controller.status());
                        }
                        None => {
                            controller.stop();
                            break;
                        }
                    },
                    _ = ticker.tick() => {
                        if let Err(e) = controller.tick().await {
                            let _ = reports.send(SupervisorReport::AdvertiserFailed(e));
                        }
                    }
                }
            }
        });

        Self { command_tx, task }
    }

    pub async fn start(&self) -> Result<BroadcastIdentifier, AdvertiseError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(AdvertiserCommand::Start { reply })
            .await
            .map_err(|_| AdvertiseError::TaskStopped)?;
        rx.await.map_err(|_| AdvertiseError::TaskStopped)?
    }

    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .command_tx
            .send(AdvertiserCommand::Stop { reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub async fn status(&self) -> Result<AdvertiserStatus, AdvertiseError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(AdvertiserCommand::Status { reply })
            .await
            .map_err(|_| AdvertiseError::TaskStopped)?;
        rx.await.map_err(|_| AdvertiseError::TaskStopped)
    }

    /// Stop advertising and wait for the task to exit
    pub async fn shutdown(self) {
        drop(self.command_tx);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::identity::{MockIdentifierSource, RandomSource, RotationConfig};
    use crate::transport::ble::beacon::parse_beacon;
    use crate::transport::ble::simulated::{RadioCall, SimulatedRadio};

    const START: u64 = 1_700_000_000;

    fn controller(radio: Arc<SimulatedRadio>, clock: &ManualClock) -> AdvertisingController {
        AdvertisingController::new(
            radio,
            IdentifierRotator::new(Box::new(RandomSource), RotationConfig::default()),
            Arc::new(clock.clone()),
            RetryPolicy::default(),
            EventBus::default(),
        )
    }

    fn advertised(radio: &SimulatedRadio) -> Vec<(Vec<u8>, u64)> {
        radio
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                RadioCall::StartAdvertising { payload, at } => Some((payload, at)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_start_broadcasts_current_identifier() {
        let clock = ManualClock::new(START);
        let radio = Arc::new(SimulatedRadio::new(Arc::new(clock.clone())));
        let mut advertiser = controller(radio.clone(), &clock);

        let id = advertiser.start().await.unwrap();

        assert_eq!(advertiser.state(), AdvertiserState::Advertising);
        assert_eq!(advertiser.mode(), AdvertisingMode::MultipleAdvertisement);
        assert!(radio.is_advertising());
        let payload = radio.advertised_payload().unwrap();
        assert_eq!(parse_beacon(&payload).unwrap().as_bytes(), &id.bytes);
    }

    #[tokio::test]
    async fn test_swap_happens_no_later_than_expiry() {
        let clock = ManualClock::new(START);
        let radio = Arc::new(SimulatedRadio::new(Arc::new(clock.clone())));
        let mut advertiser = controller(radio.clone(), &clock);

        let first = advertiser.start().await.unwrap();

        // Walk the clock second by second, ticking like the task does
        let mut swapped = None;
        while clock.now_secs() < first.expires_at + 5 {
            clock.advance(1);
            if let Some(next) = advertiser.tick().await.unwrap() {
                swapped = Some(next);
                break;
            }
        }

        let second = swapped.expect("identifier was never rotated");
        assert_ne!(second.bytes, first.bytes);

        let calls = advertised(&radio);
        assert_eq!(calls.len(), 2);
        let (payload, at) = &calls[1];
        assert_eq!(parse_beacon(payload).unwrap().as_bytes(), &second.bytes);
        assert!(*at <= first.expires_at, "swap at {} after expiry {}", at, first.expires_at);
        assert!(first.expires_at - at <= 1);
    }

    #[tokio::test]
    async fn test_clock_jump_past_expiry_rotates_immediately() {
        let clock = ManualClock::new(START);
        let radio = Arc::new(SimulatedRadio::new(Arc::new(clock.clone())));
        let mut advertiser = controller(radio.clone(), &clock);

        let first = advertiser.start().await.unwrap();
        clock.set(first.expires_at + 120);

        let second = advertiser.tick().await.unwrap().unwrap();
        assert!(second.is_valid_at(clock.now_secs()));
        assert_eq!(advertised(&radio).len(), 2);
    }

    #[tokio::test]
    async fn test_successor_prepared_ahead_of_expiry() {
        let clock = ManualClock::new(START);
        let radio = Arc::new(SimulatedRadio::new(Arc::new(clock.clone())));
        let mut advertiser = controller(radio, &clock);

        let first = advertiser.start().await.unwrap();
        assert!(!advertiser.rotator.has_successor());

        clock.set(first.expires_at - 30);
        assert_eq!(advertiser.tick().await.unwrap(), None);
        assert!(advertiser.rotator.has_successor());
    }

    #[tokio::test]
    async fn test_single_identifier_mode_when_unsupported() {
        let clock = ManualClock::new(START);
        let radio = Arc::new(SimulatedRadio::new(Arc::new(clock.clone())));
        radio.set_multiple_advertisement_supported(false);
        let mut advertiser = controller(radio.clone(), &clock);

        let first = advertiser.start().await.unwrap();
        assert_eq!(advertiser.mode(), AdvertisingMode::SingleIdentifier);

        clock.set(first.expires_at - 1);
        advertiser.tick().await.unwrap().unwrap();

        let calls = radio.calls();
        let n = calls.len();
        assert!(matches!(calls[n - 2], RadioCall::StopAdvertising { .. }));
        assert!(matches!(calls[n - 1], RadioCall::StartAdvertising { .. }));
        assert_eq!(advertiser.state(), AdvertiserState::Advertising);
    }

    #[tokio::test]
    async fn test_downgrades_when_start_reports_unsupported() {
        let clock = ManualClock::new(START);
        let radio = Arc::new(SimulatedRadio::new(Arc::new(clock.clone())));
        radio.fail_next_advertise(CapabilityError::MultipleAdvertisementUnsupported);
        let mut advertiser = controller(radio.clone(), &clock);

        advertiser.start().await.unwrap();

        assert_eq!(advertiser.mode(), AdvertisingMode::SingleIdentifier);
        assert_eq!(advertiser.state(), AdvertiserState::Advertising);
        assert!(radio.is_advertising());
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_radio_is_retried() {
        let clock = ManualClock::new(START);
        let radio = Arc::new(SimulatedRadio::new(Arc::new(clock.clone())));
        radio.inject_busy(2);
        let mut advertiser = controller(radio.clone(), &clock);

        advertiser.start().await.unwrap();
        assert_eq!(advertiser.state(), AdvertiserState::Advertising);
    }

    #[tokio::test]
    async fn test_bluetooth_off_moves_to_error_and_reports_once() {
        let clock = ManualClock::new(START);
        let radio = Arc::new(SimulatedRadio::new(Arc::new(clock.clone())));
        let mut advertiser = controller(radio.clone(), &clock);

        let first = advertiser.start().await.unwrap();
        radio.set_bluetooth_on(false);
        clock.set(first.expires_at);

        let err = advertiser.tick().await.unwrap_err();
        assert_eq!(err, AdvertiseError::Capability(CapabilityError::BluetoothOff));
        assert_eq!(advertiser.state(), AdvertiserState::Error);

        // Subsequent ticks stay quiet
        assert_eq!(advertiser.tick().await, Ok(None));
        assert!(!radio.is_advertising());
    }

    #[tokio::test]
    async fn test_successor_failure_takes_identifier_off_air() {
        let clock = ManualClock::new(START);
        let radio = Arc::new(SimulatedRadio::new(Arc::new(clock.clone())));
        let mut derived = 0;
        let mut source = MockIdentifierSource::new();
        source.expect_derive().returning(move |_| {
            derived += 1;
            if derived == 1 {
                Ok([0x11; crate::identity::IDENTIFIER_LEN])
            } else {
                Err(RotatorError::ExhaustedEntropy("no rng".into()))
            }
        });
        let mut advertiser = AdvertisingController::new(
            radio.clone(),
            IdentifierRotator::new(Box::new(source), RotationConfig::default()),
            Arc::new(clock.clone()),
            RetryPolicy::default(),
            EventBus::default(),
        );

        let first = advertiser.start().await.unwrap();
        assert!(radio.is_advertising());

        clock.set(first.expires_at - 30);
        let err = advertiser.tick().await.unwrap_err();
        assert!(matches!(err, AdvertiseError::Rotator(RotatorError::ExhaustedEntropy(_))));
        assert_eq!(advertiser.state(), AdvertiserState::Error);
        assert!(!radio.is_advertising());

        clock.set(first.expires_at + 600);
        assert_eq!(advertiser.tick().await, Ok(None));
        assert!(radio.advertised_payload().is_none());
    }

    #[tokio::test]
    async fn test_entropy_failure_surfaces_as_rotator_error() {
        let clock = ManualClock::new(START);
        let radio = Arc::new(SimulatedRadio::new(Arc::new(clock.clone())));
        let mut source = MockIdentifierSource::new();
        source
            .expect_derive()
            .returning(|_| Err(RotatorError::ExhaustedEntropy("no rng".into())));
        let mut advertiser = AdvertisingController::new(
            radio.clone(),
            IdentifierRotator::new(Box::new(source), RotationConfig::default()),
            Arc::new(clock),
            RetryPolicy::default(),
            EventBus::default(),
        );

        let err = advertiser.start().await.unwrap_err();
        assert!(matches!(err, AdvertiseError::Rotator(_)));
        assert_eq!(advertiser.state(), AdvertiserState::Error);
        assert!(!radio.is_advertising());
    }

    #[tokio::test]
    async fn test_stop_releases_radio() {
        let clock = ManualClock::new(START);
        let radio = Arc::new(SimulatedRadio::new(Arc::new(clock.clone())));
        let mut advertiser = controller(radio.clone(), &clock);

        advertiser.start().await.unwrap();
        advertiser.stop();

        assert_eq!(advertiser.state(), AdvertiserState::Idle);
        assert!(!radio.is_advertising());
    }

    #[tokio::test]
    async fn test_handle_round_trip() {
        let clock = ManualClock::new(START);
        let radio = Arc::new(SimulatedRadio::new(Arc::new(clock.clone())));
        let (reports, _rx) = mpsc::unbounded_channel();
        let handle = AdvertiserHandle::spawn(controller(radio.clone(), &clock), reports);

        handle.start().await.unwrap();
        assert_eq!(handle.status().await.unwrap().state, AdvertiserState::Advertising);

        handle.stop().await;
        assert_eq!(handle.status().await.unwrap().state, AdvertiserState::Idle);
        assert!(!radio.is_advertising());

        handle.start().await.unwrap();
        handle.shutdown().await;
        assert!(!radio.is_advertising());
    }
}
