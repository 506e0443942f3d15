/// Platform BLE capability interface
///
/// The engine never talks to a radio directly. Platform bindings (Kotlin/Swift
/// or a desktop stack) implement [`BleCapability`]; the in-process
/// [`SimulatedRadio`](super::simulated::SimulatedRadio) implements it for the
/// CLI and tests.

use std::sync::Arc;
use thiserror::Error;

/// A raw advertisement as delivered by the platform scanner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAdvertisement {
    /// Service data bytes as received
    pub payload: Vec<u8>,
    /// Received signal strength in dBm
    pub rssi: i16,
    /// Epoch seconds when the platform observed the advertisement
    pub observed_at: u64,
}

/// Callback the platform invokes for every received advertisement.
///
/// Called from platform threads; must not block.
pub type AdvertisementCallback = Arc<dyn Fn(RawAdvertisement) + Send + Sync>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("Bluetooth LE is not available on this device")]
    Unavailable,
    #[error("Bluetooth is turned off")]
    BluetoothOff,
    #[error("Permission denied")]
    PermissionDenied,
    #[error("Radio busy")]
    Busy,
    #[error("Multiple advertisement is not supported")]
    MultipleAdvertisementUnsupported,
    #[error("Platform error: {0}")]
    Platform(String),
}

impl CapabilityError {
    /// Transient errors are retried with backoff; everything else escalates.
    pub fn is_transient(&self) -> bool {
        matches!(self, CapabilityError::Busy)
    }
}

/// Advertise and scan primitives provided by the platform
pub trait BleCapability: Send + Sync {
    // Capability queries
    fn is_ble_available(&self) -> bool;
    fn is_multiple_advertisement_supported(&self) -> bool;
    fn is_permission_granted(&self) -> bool;
    /// Ask the platform to turn Bluetooth on; returns whether it is on afterwards
    fn request_bluetooth_on(&self) -> bool;

    // Advertising. Calling start while already advertising replaces the payload.
    fn start_advertising(&self, payload: &[u8]) -> Result<(), CapabilityError>;
    fn stop_advertising(&self);

    // Scanning
    fn start_scanning(&self, on_advertisement: AdvertisementCallback)
        -> Result<(), CapabilityError>;
    fn stop_scanning(&self);
}
