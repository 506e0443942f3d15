/// BLE (Bluetooth Low Energy) Transport Module
///
/// Protocol-level pieces of the proximity radio. Platform bindings provide the
/// actual hardware through [`BleCapability`]; everything here is testable
/// against [`SimulatedRadio`].
///
/// - **beacon**: beacon payload encoding and validation
/// - **advertiser**: broadcasts the current identifier and swaps it on rotation
/// - **scanner**: scan controller with duty cycle management
/// - **retry**: bounded backoff for a contended radio

pub mod advertiser;
pub mod beacon;
pub mod capability;
pub mod retry;
pub mod scanner;
pub mod simulated;

// Re-export commonly used types
pub use advertiser::{
    AdvertiseError, AdvertiserHandle, AdvertiserState, AdvertiserStatus, AdvertisingController,
    AdvertisingMode,
};

pub use beacon::{
    encode_beacon, parse_beacon, BeaconError, RemoteIdentifier, BEACON_LEN, BEACON_VERSION,
    TRACER_SERVICE_UUID,
};

pub use capability::{AdvertisementCallback, BleCapability, CapabilityError, RawAdvertisement};

pub use retry::RetryPolicy;

pub use scanner::{
    ScanConfig, ScanController, ScanCounters, ScanError, ScannerHandle, ScannerState,
    ScannerStatus,
};

pub use simulated::{RadioCall, SimulatedRadio};
