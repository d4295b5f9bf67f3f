//! Durable state for crash recovery.
//!
//! A single snapshot file holds the position, live order and risk state,
//! replaced atomically on every committed transition.

pub mod snapshot;

pub use snapshot::{JsonFileStore, MemoryStore, PersistedSnapshot, SnapshotStore, SNAPSHOT_VERSION};
