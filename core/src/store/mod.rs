// Store module: encounter persistence

pub mod backend;
pub mod encounters;
pub mod writer;

pub use backend::{BackendError, MemoryStorage, SledStorage, StorageBackend};
pub use encounters::{AppendOutcome, EncounterStore, StoreError, StoreStats};
pub use writer::{StoreWriter, MAX_PENDING_SESSIONS};
