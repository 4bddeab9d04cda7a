//! Chat synchronization engine and durable storage.
//!
//! Provides:
//! - `SyncEngine` - Single-writer actor per conversation scope
//! - `SnapshotWriter` - Coalescing, generation-tagged snapshot saves
//! - `IdGenerator` - Time-derived, strictly increasing message ids
//! - Storage implementations (memory, file)

pub mod engine;
pub mod error;
pub mod id;
pub mod persist;
pub mod storage;

pub use engine::{SyncEngine, TimelineSnapshot, restore_session};
pub use error::{Notice, SyncError};
pub use id::IdGenerator;
pub use persist::SnapshotWriter;
