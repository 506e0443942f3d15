// Encounter module: sighting deduplication into sessions

mod dedup;
mod session;
mod worker;

pub use dedup::{EncounterConfig, EncounterDeduplicator};
pub use session::{EncounterSession, SessionKey, Sighting, MAX_RSSI_SAMPLES, SESSION_KEY_PREFIX};
pub use worker::{spawn_encounter_worker, EncounterWorker};
