// Sightings through deduplication into the encounter log

use contact_tracer_core::transport::ble::{encode_beacon, parse_beacon};
use contact_tracer_core::{
    BroadcastIdentifier, EncounterStore, ManualClock, RandomSource, RemoteIdentifier,
    SimulatedRadio, TracerConfig, TracerEvent, TracerHandle, TracerService,
};
use std::sync::Arc;
use std::time::Duration;

const T0: u64 = 1_700_000_000;

struct Harness {
    clock: ManualClock,
    radio: Arc<SimulatedRadio>,
    store: EncounterStore,
    tracer: TracerHandle,
}

async fn harness() -> Harness {
    let clock = ManualClock::new(T0);
    let radio = Arc::new(SimulatedRadio::new(Arc::new(clock.clone())));
    let store = EncounterStore::in_memory();
    let tracer = TracerService::spawn(
        TracerConfig::default(),
        radio.clone(),
        Box::new(RandomSource),
        store.clone(),
        Arc::new(clock.clone()),
    )
    .unwrap();
    tracer.enable().await.unwrap();
    Harness {
        clock,
        radio,
        store,
        tracer,
    }
}

fn peer(fill: u8) -> Vec<u8> {
    encode_beacon(&BroadcastIdentifier {
        bytes: [fill; 16],
        issued_at: T0,
        expires_at: T0 + 900,
    })
}

async fn wait_for_sightings(tracer: &TracerHandle, n: u64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while tracer.stats().sightings_received < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("sightings not consumed");
}

#[tokio::test]
async fn test_sightings_fold_into_sessions_and_persist_on_disable() {
    let h = harness().await;
    let mut events = h.tracer.subscribe();

    for i in 0..5u64 {
        h.clock.set(T0 + i * 10);
        h.radio.deliver(peer(0xA1), -55 - i as i16);
        h.radio.deliver(peer(0xB2), -80);
    }
    wait_for_sightings(&h.tracer, 10).await;

    h.tracer.disable().await.unwrap();

    let sessions = h.store.list_since(0).unwrap();
    assert_eq!(sessions.len(), 2);

    let a = sessions
        .iter()
        .find(|s| s.remote == RemoteIdentifier([0xA1; 16]))
        .unwrap();
    assert_eq!(a.sighting_count, 5);
    assert_eq!(a.first_seen, T0);
    assert_eq!(a.last_seen, T0 + 40);
    assert_eq!(a.duration_secs, 40);
    assert_eq!(a.rssi_max, -55);
    assert_eq!(a.rssi_min, -59);

    let nearby: Vec<String> = events
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            TracerEvent::NearbyDeviceFound { name, .. } => Some(name),
            _ => None,
        })
        .collect();
    assert_eq!(nearby, vec!["a1a1a1a1".to_string(), "b2b2b2b2".to_string()]);

    let stats = h.tracer.stats();
    assert_eq!(stats.sessions_opened, 2);
    assert_eq!(stats.sessions_persisted, 2);
    h.tracer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_gap_splits_sessions() {
    let h = harness().await;

    h.radio.deliver(peer(0x01), -60);
    h.clock.set(T0 + 100);
    h.radio.deliver(peer(0x01), -60);
    h.clock.set(T0 + 500);
    h.radio.deliver(peer(0x01), -60);
    wait_for_sightings(&h.tracer, 3).await;

    h.tracer.disable().await.unwrap();

    let sessions = h.store.list_since(0).unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!((sessions[0].first_seen, sessions[0].last_seen), (T0, T0 + 100));
    assert_eq!((sessions[1].first_seen, sessions[1].last_seen), (T0 + 500, T0 + 500));
    h.tracer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_foreign_advertisements_never_reach_the_log() {
    let h = harness().await;

    h.radio.deliver(vec![0x6F, 0xFD, 0x01, 0x02], -40);
    let mut wrong_version = peer(0x33);
    wrong_version[2] = 0x7F;
    h.radio.deliver(wrong_version, -40);
    h.radio.deliver(peer(0x44), -70);
    wait_for_sightings(&h.tracer, 1).await;

    let status = h.tracer.status().await.unwrap();
    assert_eq!(status.scanner.unwrap().rejected, 2);

    h.tracer.disable().await.unwrap();
    let sessions = h.store.list_since(0).unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].remote, RemoteIdentifier([0x44; 16]));
    h.tracer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_advertised_payload_parses_as_current_identifier() {
    let h = harness().await;

    let payload = h.radio.advertised_payload().unwrap();
    let remote = parse_beacon(&payload).unwrap();
    let current = h.tracer.status().await.unwrap().advertiser.unwrap().current.unwrap();

    assert_eq!(remote.as_bytes(), &current.bytes);
    assert!(current.is_valid_at(T0));
    h.tracer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_disabled_service_ignores_sightings() {
    let h = harness().await;
    h.tracer.disable().await.unwrap();

    assert!(!h.radio.deliver(peer(0x09), -60));
    assert_eq!(h.tracer.stats().sightings_received, 0);
    h.tracer.shutdown().await.unwrap();
}
