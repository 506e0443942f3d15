// Contact Tracer Core: proximity encounter engine
//
// Broadcasts rotating anonymous identifiers over BLE, scans for nearby
// devices doing the same, folds sightings into encounter sessions and keeps
// a local encounter log for later exposure matching.

pub mod clock;
pub mod encounter;
pub mod events;
pub mod identity;
pub mod service;
pub mod store;
pub mod transport;

use thiserror::Error;

pub use clock::{Clock, ManualClock, SystemClock};
pub use encounter::{EncounterConfig, EncounterSession, SessionKey, Sighting};
pub use events::{EventBus, EventSubscription, TracerEvent};
pub use identity::{
    BroadcastIdentifier, IdentifierRotator, IdentifierSource, KeyedSource, RandomSource,
    RotationConfig, RotatorError,
};
pub use service::{
    ConfigError, EnvironmentChange, Fault, MissingCapability, ServiceError, ServiceState,
    ServiceStats, ServiceStatus, TracerConfig, TracerHandle, TracerService,
};
pub use store::{AppendOutcome, EncounterStore, StoreError, StoreStats};
pub use transport::ble::{
    BleCapability, CapabilityError, RemoteIdentifier, SimulatedRadio,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TracerError {
    #[error(transparent)]
    Rotator(#[from] RotatorError),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error(transparent)]
    Advertise(#[from] transport::ble::AdvertiseError),
    #[error(transparent)]
    Scan(#[from] transport::ble::ScanError),
    #[error(transparent)]
    Beacon(#[from] transport::ble::BeaconError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Backend(#[from] store::BackendError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Service(#[from] ServiceError),
}

pub type Result<T> = std::result::Result<T, TracerError>;

// ============================================================================
// CONVENIENCE
// ============================================================================

/// Spawn a tracer against the simulated radio with an in-memory or on-disk
/// encounter log. Returns the radio so callers can drive it.
pub fn spawn_simulated(
    config: TracerConfig,
    store: EncounterStore,
    clock: std::sync::Arc<dyn Clock>,
) -> Result<(TracerHandle, std::sync::Arc<SimulatedRadio>)> {
    let radio = std::sync::Arc::new(SimulatedRadio::new(clock.clone()));
    let handle = TracerService::spawn(
        config,
        radio.clone(),
        Box::new(RandomSource),
        store,
        clock,
    )?;
    Ok((handle, radio))
}
