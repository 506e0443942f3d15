// Simulated neighbourhood
//
// Drives the full engine against the in-process radio: synthetic peers walk
// in and out of range, advertise their own rotating identifiers and drift in
// signal strength. Simulated time runs faster than wall time.

use crate::config::Config;
use anyhow::{Context, Result};
use colored::*;
use contact_tracer_core::transport::ble::encode_beacon;
use contact_tracer_core::{
    BroadcastIdentifier, Clock, EncounterStore, IdentifierSource, KeyedSource, ManualClock,
    RandomSource, ServiceStats, SimulatedRadio, StoreStats, TracerEvent, TracerService,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct SimulationOptions {
    pub peers: usize,
    pub seconds: u64,
    pub memory: bool,
    /// Wall-clock milliseconds per simulated second
    pub step_ms: u64,
}

pub struct SimulationReport {
    pub stats: ServiceStats,
    pub store: StoreStats,
}

struct SyntheticPeer {
    identifier: BroadcastIdentifier,
    rssi: i16,
    in_range: bool,
    next_toggle: u64,
}

impl SyntheticPeer {
    fn new(rng: &mut impl Rng, now: u64, validity: u64) -> Self {
        Self {
            identifier: fresh_identifier(rng, now, validity),
            rssi: rng.gen_range(-90..=-45),
            in_range: rng.gen_bool(0.5),
            next_toggle: now + rng.gen_range(10..120),
        }
    }

    /// Advance one simulated second. Returns a beacon if the peer is heard.
    fn step(&mut self, rng: &mut impl Rng, now: u64, validity: u64) -> Option<(Vec<u8>, i16)> {
        if now >= self.next_toggle {
            self.in_range = !self.in_range;
            self.next_toggle = if self.in_range {
                now + rng.gen_range(60..600)
            } else {
                now + rng.gen_range(120..900)
            };
        }
        if now >= self.identifier.expires_at {
            self.identifier = fresh_identifier(rng, now, validity);
        }
        if !self.in_range {
            return None;
        }

        self.rssi = (self.rssi + rng.gen_range(-3..=3)).clamp(-100, -30);
        // Not every advertisement is heard
        if rng.gen_bool(0.8) {
            Some((encode_beacon(&self.identifier), self.rssi))
        } else {
            None
        }
    }
}

fn fresh_identifier(rng: &mut impl Rng, now: u64, validity: u64) -> BroadcastIdentifier {
    let mut bytes = [0u8; 16];
    rng.fill(&mut bytes);
    BroadcastIdentifier {
        bytes,
        issued_at: now,
        expires_at: now + validity,
    }
}

pub async fn run(config: &Config, options: &SimulationOptions) -> Result<SimulationReport> {
    let start = chrono::Utc::now().timestamp().max(0) as u64;
    let clock = ManualClock::new(start);
    let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());

    let store = if options.memory {
        EncounterStore::in_memory()
    } else {
        let path = config.encounter_db()?;
        EncounterStore::open(&path)
            .with_context(|| format!("Failed to open encounter log at {}", path.display()))?
    };

    let source: Box<dyn IdentifierSource> = match &config.user_id {
        Some(user_id) => Box::new(KeyedSource::from_user_id(user_id)),
        None => Box::new(RandomSource),
    };

    let radio = Arc::new(SimulatedRadio::new(shared_clock.clone()));
    let tracer = TracerService::spawn(
        config.tracer.clone(),
        radio.clone(),
        source,
        store.clone(),
        shared_clock.clone(),
    )
    .context("Failed to start tracer service")?;

    let mut events = tracer.subscribe();
    let printer_clock = shared_clock.clone();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(printer_clock.now_secs(), &event);
        }
    });

    tracer.enable().await?;

    let validity = config.tracer.rotation.validity_secs;
    let mut rng = StdRng::from_entropy();
    let mut peers: Vec<SyntheticPeer> = (0..options.peers)
        .map(|_| SyntheticPeer::new(&mut rng, start, validity))
        .collect();

    for _ in 0..options.seconds {
        clock.advance(1);
        let now = clock.now_secs();
        let heard: Vec<(Vec<u8>, i16)> = peers
            .iter_mut()
            .filter_map(|peer| peer.step(&mut rng, now, validity))
            .collect();
        for (payload, rssi) in heard {
            radio.deliver(payload, rssi);
        }
        if options.step_ms == 0 {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(Duration::from_millis(options.step_ms)).await;
        }
    }

    tracer.disable().await?;
    let stats = tracer.stats();
    info!(
        "Simulation finished: {} sightings, {} sessions persisted",
        stats.sightings_received, stats.sessions_persisted
    );
    tracer.shutdown().await?;
    // The printer ends once the last event publisher is gone
    drop(tracer);
    let _ = printer.await;

    Ok(SimulationReport {
        stats,
        store: store.stats()?,
    })
}

fn print_event(now: u64, event: &TracerEvent) {
    let time = crate::format_timestamp(now).dimmed();
    match event {
        TracerEvent::Status { .. } => println!("{} {}", time, event),
        TracerEvent::NearbyDeviceFound { .. } => println!("{} {}", time, event.to_string().bright_green()),
        TracerEvent::StateChanged { .. } => println!("{} {}", time, event.to_string().bright_cyan()),
    }
}
