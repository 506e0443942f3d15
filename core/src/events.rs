//! Event stream and supervision reports
//!
//! [`TracerEvent`]s are the ordered, user-facing status log. Any number of
//! consumers can hold an
//! [`EventSubscription`]; dropping it unsubscribes.
//!
//! [`SupervisorReport`]s flow the other way: from the worker tasks up to the
//! service actor, one report per failure transition.

use crate::service::ServiceState;
use crate::store::StoreError;
use crate::transport::ble::{AdvertiseError, ScanError};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

/// Default capacity of the event channel
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TracerEvent {
    /// Human readable status line
    Status { message: String },
    /// A remote device started a new encounter
    NearbyDeviceFound { name: String, rssi: i16 },
    StateChanged { from: ServiceState, to: ServiceState },
}

impl std::fmt::Display for TracerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TracerEvent::Status { message } => write!(f, "{}", message),
            TracerEvent::NearbyDeviceFound { name, rssi } => {
                write!(f, "Found Nearby Device: {} (RSSI: {})", name, rssi)
            }
            TracerEvent::StateChanged { from, to } => write!(f, "Service {} -> {}", from, to),
        }
    }
}

/// Fan-out publisher for [`TracerEvent`]s
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TracerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn status(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        self.publish(TracerEvent::Status { message });
    }

    pub fn nearby_device_found(&self, name: String, rssi: i16) {
        self.publish(TracerEvent::NearbyDeviceFound { name, rssi });
    }

    pub fn state_changed(&self, from: ServiceState, to: ServiceState) {
        info!("Tracer service {} -> {}", from, to);
        self.publish(TracerEvent::StateChanged { from, to });
    }

    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
            missed: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn publish(&self, event: TracerEvent) {
        // No subscribers is not an error
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// A scoped subscription to the event stream
pub struct EventSubscription {
    rx: broadcast::Receiver<TracerEvent>,
    missed: u64,
}

impl EventSubscription {
    /// Next event, or `None` once the bus is gone. Lagged events are skipped
    /// and counted in [`missed`](Self::missed).
    pub async fn recv(&mut self) -> Option<TracerEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => self.missed += n,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next buffered event without waiting
    pub fn try_recv(&mut self) -> Option<TracerEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => self.missed += n,
                Err(_) => return None,
            }
        }
    }

    /// Drain everything currently buffered
    pub fn drain(&mut self) -> Vec<TracerEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    pub fn missed(&self) -> u64 {
        self.missed
    }
}

/// Failure notifications from worker tasks to the service actor
#[derive(Debug, Clone)]
pub enum SupervisorReport {
    AdvertiserFailed(AdvertiseError),
    ScannerFailed(ScanError),
    StoreFailed(StoreError),
    StoreRecovered,
}
