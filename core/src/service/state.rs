use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceState {
    Disabled,
    Starting,
    Running,
    Degraded,
    Stopping,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Disabled => write!(f, "Disabled"),
            ServiceState::Starting => write!(f, "Starting"),
            ServiceState::Running => write!(f, "Running"),
            ServiceState::Degraded => write!(f, "Degraded"),
            ServiceState::Stopping => write!(f, "Stopping"),
        }
    }
}

/// Environment notifications from the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvironmentChange {
    BluetoothOff,
    BluetoothOn,
    PermissionRevoked,
    PermissionGranted,
}

/// A required capability that a start attempt found missing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissingCapability {
    Ble,
    Permission,
    Bluetooth,
}

impl std::fmt::Display for MissingCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MissingCapability::Ble => write!(f, "BLE is NOT available"),
            MissingCapability::Permission => write!(f, "Location permission is NOT granted"),
            MissingCapability::Bluetooth => write!(f, "Bluetooth is Off"),
        }
    }
}

/// Why a running service is degraded. Ordered so the environment comes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Fault {
    BluetoothOff,
    PermissionRevoked,
    Advertiser,
    Scanner,
    Entropy,
    Storage,
}

impl Fault {
    /// Cleared only by an environment notification or refresh
    pub fn is_environment(&self) -> bool {
        matches!(self, Fault::BluetoothOff | Fault::PermissionRevoked)
    }

    /// Eligible for a restart attempt by the supervision loop
    pub fn is_supervised(&self) -> bool {
        matches!(self, Fault::Advertiser | Fault::Scanner)
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fault::BluetoothOff => write!(f, "Bluetooth turned off"),
            Fault::PermissionRevoked => write!(f, "permission revoked"),
            Fault::Advertiser => write!(f, "advertiser failed"),
            Fault::Scanner => write!(f, "scanner failed"),
            Fault::Entropy => write!(f, "identifier entropy exhausted"),
            Fault::Storage => write!(f, "encounter storage failing"),
        }
    }
}
