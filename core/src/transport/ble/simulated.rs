//! In-process radio implementing [`BleCapability`]
//!
//! Used by the CLI simulator and by tests. Records every radio call with the
//! clock time it happened at, and lets callers flip the environment (Bluetooth
//! power, permission, multi-advertisement support) or inject failures.

use super::capability::{AdvertisementCallback, BleCapability, CapabilityError, RawAdvertisement};
use crate::clock::Clock;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

/// A call made against the radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCall {
    StartAdvertising { payload: Vec<u8>, at: u64 },
    StopAdvertising { at: u64 },
    StartScanning { at: u64 },
    StopScanning { at: u64 },
}

struct RadioInner {
    ble_available: bool,
    bluetooth_on: bool,
    permission_granted: bool,
    multiple_advertisement: bool,
    allow_bluetooth_request: bool,
    advertising: Option<Vec<u8>>,
    scan_callback: Option<AdvertisementCallback>,
    busy_remaining: u32,
    advertise_failures: VecDeque<CapabilityError>,
    calls: Vec<RadioCall>,
}

pub struct SimulatedRadio {
    clock: Arc<dyn Clock>,
    inner: Mutex<RadioInner>,
}

impl SimulatedRadio {
    /// A healthy radio: BLE present, Bluetooth on, permission granted,
    /// multiple advertisement supported
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(RadioInner {
                ble_available: true,
                bluetooth_on: true,
                permission_granted: true,
                multiple_advertisement: true,
                allow_bluetooth_request: true,
                advertising: None,
                scan_callback: None,
                busy_remaining: 0,
                advertise_failures: VecDeque::new(),
                calls: Vec::new(),
            }),
        }
    }

    pub fn set_ble_available(&self, available: bool) {
        self.inner.lock().ble_available = available;
    }

    /// Turning Bluetooth off silently kills advertising and scanning
    pub fn set_bluetooth_on(&self, on: bool) {
        let mut inner = self.inner.lock();
        inner.bluetooth_on = on;
        if !on {
            inner.advertising = None;
            inner.scan_callback = None;
        }
    }

    pub fn set_permission_granted(&self, granted: bool) {
        let mut inner = self.inner.lock();
        inner.permission_granted = granted;
        if !granted {
            inner.scan_callback = None;
        }
    }

    pub fn set_multiple_advertisement_supported(&self, supported: bool) {
        self.inner.lock().multiple_advertisement = supported;
    }

    /// Whether `request_bluetooth_on` succeeds
    pub fn allow_bluetooth_request(&self, allow: bool) {
        self.inner.lock().allow_bluetooth_request = allow;
    }

    /// Report `Busy` for the next `n` start attempts (advertising or scanning)
    pub fn inject_busy(&self, n: u32) {
        self.inner.lock().busy_remaining = n;
    }

    /// Fail the next advertising start with `error`
    pub fn fail_next_advertise(&self, error: CapabilityError) {
        self.inner.lock().advertise_failures.push_back(error);
    }

    pub fn is_advertising(&self) -> bool {
        self.inner.lock().advertising.is_some()
    }

    pub fn advertised_payload(&self) -> Option<Vec<u8>> {
        self.inner.lock().advertising.clone()
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.lock().scan_callback.is_some()
    }

    pub fn calls(&self) -> Vec<RadioCall> {
        self.inner.lock().calls.clone()
    }

    /// Deliver an advertisement to the active scan callback.
    ///
    /// Returns false if nobody is scanning.
    pub fn deliver(&self, payload: Vec<u8>, rssi: i16) -> bool {
        let callback = self.inner.lock().scan_callback.clone();
        match callback {
            Some(callback) => {
                callback(RawAdvertisement {
                    payload,
                    rssi,
                    observed_at: self.clock.now_secs(),
                });
                true
            }
            None => false,
        }
    }

    fn check_ready(inner: &mut RadioInner) -> Result<(), CapabilityError> {
        if !inner.ble_available {
            return Err(CapabilityError::Unavailable);
        }
        if !inner.bluetooth_on {
            return Err(CapabilityError::BluetoothOff);
        }
        if !inner.permission_granted {
            return Err(CapabilityError::PermissionDenied);
        }
        if inner.busy_remaining > 0 {
            inner.busy_remaining -= 1;
            return Err(CapabilityError::Busy);
        }
        Ok(())
    }
}

impl BleCapability for SimulatedRadio {
    fn is_ble_available(&self) -> bool {
        self.inner.lock().ble_available
    }

    fn is_multiple_advertisement_supported(&self) -> bool {
        self.inner.lock().multiple_advertisement
    }

    fn is_permission_granted(&self) -> bool {
        self.inner.lock().permission_granted
    }

    fn request_bluetooth_on(&self) -> bool {
        let mut inner = self.inner.lock();
        if !inner.bluetooth_on && inner.allow_bluetooth_request && inner.ble_available {
            debug!("Simulated radio: Bluetooth turned on by request");
            inner.bluetooth_on = true;
        }
        inner.bluetooth_on
    }

    fn start_advertising(&self, payload: &[u8]) -> Result<(), CapabilityError> {
        let now = self.clock.now_secs();
        let mut inner = self.inner.lock();
        Self::check_ready(&mut inner)?;

        if let Some(error) = inner.advertise_failures.pop_front() {
            return Err(error);
        }
        if !inner.multiple_advertisement && inner.advertising.is_some() {
            return Err(CapabilityError::MultipleAdvertisementUnsupported);
        }

        inner.advertising = Some(payload.to_vec());
        inner.calls.push(RadioCall::StartAdvertising {
            payload: payload.to_vec(),
            at: now,
        });
        Ok(())
    }

    fn stop_advertising(&self) {
        let now = self.clock.now_secs();
        let mut inner = self.inner.lock();
        inner.advertising = None;
        inner.calls.push(RadioCall::StopAdvertising { at: now });
    }

    fn start_scanning(&self, on_advertisement: AdvertisementCallback) -> Result<(), CapabilityError> {
        let now = self.clock.now_secs();
        let mut inner = self.inner.lock();
        Self::check_ready(&mut inner)?;

        inner.scan_callback = Some(on_advertisement);
        inner.calls.push(RadioCall::StartScanning { at: now });
        Ok(())
    }

    fn stop_scanning(&self) {
        let now = self.clock.now_secs();
        let mut inner = self.inner.lock();
        inner.scan_callback = None;
        inner.calls.push(RadioCall::StopScanning { at: now });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn radio() -> SimulatedRadio {
        SimulatedRadio::new(Arc::new(ManualClock::new(100)))
    }

    #[test]
    fn test_single_advertisement_radio_rejects_second_start() {
        let radio = radio();
        radio.set_multiple_advertisement_supported(false);

        radio.start_advertising(&[1]).unwrap();
        assert_eq!(
            radio.start_advertising(&[2]),
            Err(CapabilityError::MultipleAdvertisementUnsupported)
        );

        radio.stop_advertising();
        radio.start_advertising(&[2]).unwrap();
        assert_eq!(radio.advertised_payload(), Some(vec![2]));
    }

    #[test]
    fn test_bluetooth_off_kills_radio_activity() {
        let radio = radio();
        radio.start_advertising(&[1]).unwrap();
        radio.start_scanning(Arc::new(|_| {})).unwrap();

        radio.set_bluetooth_on(false);

        assert!(!radio.is_advertising());
        assert!(!radio.is_scanning());
        assert_eq!(radio.start_advertising(&[1]), Err(CapabilityError::BluetoothOff));
    }

    #[test]
    fn test_request_bluetooth_on() {
        let radio = radio();
        radio.set_bluetooth_on(false);
        radio.allow_bluetooth_request(false);
        assert!(!radio.request_bluetooth_on());

        radio.allow_bluetooth_request(true);
        assert!(radio.request_bluetooth_on());
    }

    #[test]
    fn test_busy_injection_counts_down() {
        let radio = radio();
        radio.inject_busy(1);
        assert_eq!(radio.start_advertising(&[1]), Err(CapabilityError::Busy));
        assert!(radio.start_advertising(&[1]).is_ok());
    }

    #[test]
    fn test_deliver_reaches_callback() {
        let radio = radio();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();

        assert!(!radio.deliver(vec![0], -50));
        radio
            .start_scanning(Arc::new(move |adv| {
                assert_eq!(adv.observed_at, 100);
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        assert!(radio.deliver(vec![0], -50));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_calls_are_recorded_with_time() {
        let radio = radio();
        radio.start_advertising(&[7]).unwrap();
        radio.stop_advertising();

        assert_eq!(
            radio.calls(),
            vec![
                RadioCall::StartAdvertising { payload: vec![7], at: 100 },
                RadioCall::StopAdvertising { at: 100 },
            ]
        );
    }
}
