// Tracer service controller
//
// Owns the service state machine and supervises the advertiser, scanner,
// encounter worker and store writer. Runs as an actor task; TracerHandle is
// the only way in.

use super::config::{ConfigError, TracerConfig};
use super::state::{EnvironmentChange, Fault, MissingCapability, ServiceState};
use super::stats::{ServiceCounters, ServiceStats};
use crate::clock::Clock;
use crate::encounter::{spawn_encounter_worker, EncounterWorker, Sighting};
use crate::events::{EventBus, EventSubscription, SupervisorReport};
use crate::identity::{IdentifierRotator, IdentifierSource, RotatorError};
use crate::store::{EncounterStore, StoreError, StoreWriter};
use crate::transport::ble::{
    AdvertiseError, AdvertiserHandle, AdvertiserStatus, AdvertisingController, BleCapability,
    CapabilityError, ScanController, ScanError, ScannerHandle, ScannerStatus,
};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Tracer service is not running")]
    Stopped,
}

/// Full status snapshot
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub state: ServiceState,
    pub enabled: bool,
    /// Capability the last check chain stopped at
    pub missing: Option<MissingCapability>,
    pub faults: Vec<Fault>,
    pub advertiser: Option<AdvertiserStatus>,
    pub scanner: Option<ScannerStatus>,
    pub stats: ServiceStats,
}

enum ServiceCommand {
    Enable {
        reply: oneshot::Sender<ServiceState>,
    },
    Disable {
        reply: oneshot::Sender<ServiceState>,
    },
    Refresh {
        reply: oneshot::Sender<ServiceState>,
    },
    Environment {
        change: EnvironmentChange,
        reply: oneshot::Sender<ServiceState>,
    },
    Status {
        reply: oneshot::Sender<ServiceStatus>,
    },
    Sync {
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

pub struct TracerService;

impl TracerService {
    /// Build the pipeline and spawn the service actor, initially Disabled
    pub fn spawn(
        config: TracerConfig,
        capability: Arc<dyn BleCapability>,
        source: Box<dyn IdentifierSource>,
        store: EncounterStore,
        clock: Arc<dyn Clock>,
    ) -> Result<TracerHandle, ServiceError> {
        config.validate()?;

        let events = EventBus::new(config.event_capacity);
        let counters = Arc::new(ServiceCounters::default());
        let state = Arc::new(RwLock::new(ServiceState::Disabled));
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();

        let (sightings_tx, sightings_rx) =
            broadcast::channel::<Sighting>(config.scan.sighting_channel_capacity);

        let scanner = ScannerHandle::spawn(
            ScanController::new(
                capability.clone(),
                config.scan.clone(),
                config.retry.clone(),
                events.clone(),
                sightings_tx,
            )?,
            reports_tx.clone(),
        );

        let advertiser = AdvertiserHandle::spawn(
            AdvertisingController::new(
                capability.clone(),
                IdentifierRotator::new(source, config.rotation.clone()),
                clock.clone(),
                config.retry.clone(),
                events.clone(),
            ),
            reports_tx.clone(),
        );

        let (writer, writer_task) = StoreWriter::spawn(store, counters.clone(), reports_tx);

        let worker = spawn_encounter_worker(
            &config.encounter,
            sightings_rx,
            writer.clone(),
            clock.clone(),
            events.clone(),
            counters.clone(),
        );

        let (command_tx, command_rx) = mpsc::channel(32);

        let actor = ServiceActor {
            config,
            capability,
            clock,
            events: events.clone(),
            counters: counters.clone(),
            state: state.clone(),
            enabled: false,
            missing: None,
            faults: BTreeSet::new(),
            advertiser,
            scanner,
            worker,
            writer,
            writer_task,
        };
        tokio::spawn(actor.run(command_rx, reports_rx));

        Ok(TracerHandle {
            command_tx,
            state,
            events,
            counters,
        })
    }
}

/// Cloneable handle to a running tracer service
#[derive(Clone)]
pub struct TracerHandle {
    command_tx: mpsc::Sender<ServiceCommand>,
    state: Arc<RwLock<ServiceState>>,
    events: EventBus,
    counters: Arc<ServiceCounters>,
}

impl TracerHandle {
    /// Disabled -> Starting, running the capability checks. Reaches Running
    /// if every required capability is present.
    pub async fn enable(&self) -> Result<ServiceState, ServiceError> {
        self.request(|reply| ServiceCommand::Enable { reply }).await
    }

    /// Stop both controllers and persist open encounters -> Disabled
    pub async fn disable(&self) -> Result<ServiceState, ServiceError> {
        self.request(|reply| ServiceCommand::Disable { reply }).await
    }

    /// Re-query capabilities if waiting on one. No-op when Running or Disabled.
    pub async fn refresh(&self) -> Result<ServiceState, ServiceError> {
        self.request(|reply| ServiceCommand::Refresh { reply }).await
    }

    pub async fn notify_environment(
        &self,
        change: EnvironmentChange,
    ) -> Result<ServiceState, ServiceError> {
        self.request(|reply| ServiceCommand::Environment { change, reply })
            .await
    }

    pub async fn status(&self) -> Result<ServiceStatus, ServiceError> {
        self.request(|reply| ServiceCommand::Status { reply }).await
    }

    /// Wait until every closed encounter is written and flushed
    pub async fn sync(&self) -> Result<(), ServiceError> {
        Ok(self.request(|reply| ServiceCommand::Sync { reply }).await??)
    }

    /// Disable, then stop every task
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        self.request(|reply| ServiceCommand::Shutdown { reply }).await
    }

    pub fn state(&self) -> ServiceState {
        *self.state.read()
    }

    pub fn stats(&self) -> ServiceStats {
        self.counters.snapshot()
    }

    pub fn subscribe(&self) -> EventSubscription {
        self.events.subscribe()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> ServiceCommand,
    ) -> Result<T, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(command(reply))
            .await
            .map_err(|_| ServiceError::Stopped)?;
        rx.await.map_err(|_| ServiceError::Stopped)
    }
}

struct ServiceActor {
    config: TracerConfig,
    capability: Arc<dyn BleCapability>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    counters: Arc<ServiceCounters>,
    state: Arc<RwLock<ServiceState>>,
    enabled: bool,
    missing: Option<MissingCapability>,
    faults: BTreeSet<Fault>,
    advertiser: AdvertiserHandle,
    scanner: ScannerHandle,
    worker: EncounterWorker,
    writer: StoreWriter,
    writer_task: JoinHandle<()>,
}

impl ServiceActor {
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<ServiceCommand>,
        mut reports_rx: mpsc::UnboundedReceiver<SupervisorReport>,
    ) {
        let mut supervision =
            tokio::time::interval(Duration::from_secs(self.config.supervision_interval_secs));
        supervision.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut purge =
            tokio::time::interval(Duration::from_secs(self.config.retention.purge_interval_secs));
        purge.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(ServiceCommand::Enable { reply }) => {
                        let _ = reply.send(self.enable().await);
                    }
                    Some(ServiceCommand::Disable { reply }) => {
                        let _ = reply.send(self.disable().await);
                    }
                    Some(ServiceCommand::Refresh { reply }) => {
                        let _ = reply.send(self.refresh().await);
                    }
                    Some(ServiceCommand::Environment { change, reply }) => {
                        let _ = reply.send(self.on_environment(change).await);
                    }
                    Some(ServiceCommand::Status { reply }) => {
                        let _ = reply.send(self.status().await);
                    }
                    Some(ServiceCommand::Sync { reply }) => {
                        let _ = reply.send(self.writer.sync().await);
                    }
                    Some(ServiceCommand::Shutdown { reply }) => {
                        self.teardown().await;
                        let _ = reply.send(());
                        return;
                    }
                    None => {
                        self.teardown().await;
                        return;
                    }
                },
                Some(report) = reports_rx.recv() => self.on_report(report).await,
                _ = supervision.tick() => self.supervise().await,
                _ = purge.tick() => self.purge().await,
            }
        }
    }

    fn current(&self) -> ServiceState {
        *self.state.read()
    }

    fn set_state(&self, to: ServiceState) {
        let from = {
            let mut state = self.state.write();
            std::mem::replace(&mut *state, to)
        };
        if from != to {
            self.events.state_changed(from, to);
        }
    }

    /// Derive the state from the flags while enabled
    fn settle(&self) -> ServiceState {
        if self.enabled {
            let next = if self.missing.is_some() {
                ServiceState::Starting
            } else if self.faults.is_empty() {
                ServiceState::Running
            } else {
                ServiceState::Degraded
            };
            self.set_state(next);
        }
        self.current()
    }

    async fn enable(&mut self) -> ServiceState {
        if self.enabled {
            return self.current();
        }

        self.enabled = true;
        self.retain_storage_fault();
        self.set_state(ServiceState::Starting);
        self.events.status("Tracer service enabled");
        self.start().await
    }

    async fn disable(&mut self) -> ServiceState {
        if !self.enabled {
            return self.current();
        }

        self.set_state(ServiceState::Stopping);
        self.stop_controllers().await;

        let flushed = self.worker.flush().await;
        if let Err(e) = self.writer.sync().await {
            warn!("Failed to persist encounters on disable: {}", e);
        }
        debug!("Flushed {} open encounters on disable", flushed);

        self.enabled = false;
        self.missing = None;
        self.retain_storage_fault();
        self.set_state(ServiceState::Disabled);
        self.events.status("Tracer service disabled");
        ServiceState::Disabled
    }

    /// The writer reports storage faults only on transitions, so this one
    /// outlives enable/disable until a StoreRecovered report clears it.
    fn retain_storage_fault(&mut self) {
        self.faults.retain(|f| matches!(f, Fault::Storage));
    }

    async fn refresh(&mut self) -> ServiceState {
        let waiting = self.missing.is_some() || self.faults.iter().any(Fault::is_environment);
        if !self.enabled || !waiting {
            return self.current();
        }

        self.faults.retain(|f| !f.is_environment());
        self.set_state(ServiceState::Starting);
        self.start().await
    }

    async fn on_environment(&mut self, change: EnvironmentChange) -> ServiceState {
        if !self.enabled {
            debug!("Ignoring {:?} while disabled", change);
            return self.current();
        }

        match change {
            EnvironmentChange::BluetoothOff => {
                self.events.status("Bluetooth is Off");
                self.raise_environment_fault(Fault::BluetoothOff).await;
                self.settle()
            }
            EnvironmentChange::PermissionRevoked => {
                self.events.status("Location permission is NOT granted");
                self.raise_environment_fault(Fault::PermissionRevoked).await;
                self.settle()
            }
            EnvironmentChange::BluetoothOn => {
                self.events.status("Bluetooth is On");
                self.clear_environment_fault(Fault::BluetoothOff).await
            }
            EnvironmentChange::PermissionGranted => {
                self.events.status("Location permission is granted");
                self.clear_environment_fault(Fault::PermissionRevoked).await
            }
        }
    }

    async fn raise_environment_fault(&mut self, fault: Fault) {
        if self.faults.insert(fault) {
            warn!("Tracer degraded: {}", fault);
            self.stop_controllers().await;
        }
    }

    async fn clear_environment_fault(&mut self, fault: Fault) -> ServiceState {
        self.faults.remove(&fault);
        let blocked = self.faults.iter().any(Fault::is_environment);
        if blocked || (self.missing.is_none() && self.current() == ServiceState::Running) {
            return self.settle();
        }

        self.set_state(ServiceState::Starting);
        self.start().await
    }

    /// Capability check chain, then both controllers
    async fn start(&mut self) -> ServiceState {
        self.missing = self.check_capabilities();
        if self.missing.is_some() {
            return self.settle();
        }

        self.faults
            .retain(|f| matches!(f, Fault::Storage) || f.is_environment());

        if let Err(e) = self.advertiser.start().await {
            self.advertiser_failed(&e).await;
        }
        if !self.faults.iter().any(Fault::is_environment) {
            if let Err(e) = self.scanner.start().await {
                self.scanner_failed(&e).await;
            }
        }
        self.settle()
    }

    fn check_capabilities(&self) -> Option<MissingCapability> {
        if !self.capability.is_ble_available() {
            self.events.status(MissingCapability::Ble.to_string());
            return Some(MissingCapability::Ble);
        }
        self.events.status("BLE is available");

        if !self.capability.is_permission_granted() {
            self.events.status(MissingCapability::Permission.to_string());
            return Some(MissingCapability::Permission);
        }
        self.events.status("Location permission is granted");

        if !self.capability.request_bluetooth_on() {
            self.events.status(MissingCapability::Bluetooth.to_string());
            return Some(MissingCapability::Bluetooth);
        }
        self.events.status("Bluetooth is On");

        if self.capability.is_multiple_advertisement_supported() {
            self.events.status("Multiple Advertisement is supported");
        } else {
            self.events.status("Multiple Advertisement is NOT supported");
        }
        None
    }

    async fn stop_controllers(&self) {
        self.advertiser.stop().await;
        self.scanner.stop().await;
    }

    async fn advertiser_failed(&mut self, error: &AdvertiseError) {
        self.events.status(format!("Advertising failed: {}", error));
        let fault = match error {
            AdvertiseError::Capability(e) => capability_fault(e).unwrap_or(Fault::Advertiser),
            AdvertiseError::Rotator(RotatorError::ExhaustedEntropy(_)) => Fault::Entropy,
            AdvertiseError::TaskStopped => Fault::Advertiser,
        };
        self.record_fault(fault).await;
    }

    async fn scanner_failed(&mut self, error: &ScanError) {
        self.events.status(format!("Scanning failed: {}", error));
        let fault = match error {
            ScanError::Capability(e) => capability_fault(e).unwrap_or(Fault::Scanner),
            _ => Fault::Scanner,
        };
        self.record_fault(fault).await;
    }

    async fn record_fault(&mut self, fault: Fault) {
        if fault.is_environment() {
            self.raise_environment_fault(fault).await;
        } else if self.faults.insert(fault) {
            warn!("Tracer degraded: {}", fault);
        }
    }

    async fn on_report(&mut self, report: SupervisorReport) {
        match report {
            SupervisorReport::StoreFailed(e) => {
                self.events.status(format!("Encounter storage failing: {}", e));
                self.faults.insert(Fault::Storage);
            }
            SupervisorReport::StoreRecovered => {
                self.events.status("Encounter storage recovered");
                self.faults.remove(&Fault::Storage);
            }
            SupervisorReport::AdvertiserFailed(e) if self.enabled => {
                self.advertiser_failed(&e).await;
            }
            SupervisorReport::ScannerFailed(e) if self.enabled => {
                self.scanner_failed(&e).await;
            }
            SupervisorReport::AdvertiserFailed(_) | SupervisorReport::ScannerFailed(_) => {}
        }
        self.settle();
    }

    /// Restart failed controllers and retry failed writes
    async fn supervise(&mut self) {
        if !self.enabled || self.missing.is_some() {
            return;
        }
        if self.faults.iter().any(Fault::is_environment) {
            return;
        }

        if self.faults.remove(&Fault::Advertiser) {
            info!("Restarting advertiser");
            if let Err(e) = self.advertiser.start().await {
                self.advertiser_failed(&e).await;
            }
        }
        if self.faults.remove(&Fault::Scanner) {
            info!("Restarting scanner");
            if let Err(e) = self.scanner.start().await {
                self.scanner_failed(&e).await;
            }
        }
        if self.faults.contains(&Fault::Storage) {
            // Recovery arrives as a StoreRecovered report
            let _ = self.writer.sync().await;
        }
        self.settle();
    }

    async fn purge(&mut self) {
        let now = self.clock.now_secs();
        match self.writer.purge(self.config.retention.retention(), now).await {
            Ok(0) => {}
            Ok(n) => info!("Retention purge removed {} encounters", n),
            Err(e) => {
                warn!("Retention purge failed: {}", e);
                self.events.status(format!("Retention purge failed: {}", e));
            }
        }
    }

    async fn status(&self) -> ServiceStatus {
        ServiceStatus {
            state: self.current(),
            enabled: self.enabled,
            missing: self.missing,
            faults: self.faults.iter().copied().collect(),
            advertiser: self.advertiser.status().await.ok(),
            scanner: self.scanner.status().await.ok(),
            stats: self.counters.snapshot(),
        }
    }

    async fn teardown(self) {
        let mut actor = self;
        actor.disable().await;

        let ServiceActor {
            advertiser,
            scanner,
            worker,
            writer,
            writer_task,
            ..
        } = actor;

        advertiser.shutdown().await;
        scanner.shutdown().await;
        worker.shutdown().await;
        drop(writer);
        let _ = writer_task.await;
        info!("Tracer service shut down");
    }
}

/// Environment faults hiding behind a capability error
fn capability_fault(error: &CapabilityError) -> Option<Fault> {
    match error {
        CapabilityError::BluetoothOff => Some(Fault::BluetoothOff),
        CapabilityError::PermissionDenied => Some(Fault::PermissionRevoked),
        _ => None,
    }
}
