// Service module: tracer lifecycle and supervision

mod config;
mod controller;
mod state;
mod stats;

pub use config::{ConfigError, RetentionConfig, TracerConfig};
pub use controller::{ServiceError, ServiceStatus, TracerHandle, TracerService};
pub use state::{EnvironmentChange, Fault, MissingCapability, ServiceState};
pub use stats::{ServiceCounters, ServiceStats};
