//! Activation store backends for the skein orchestration engine.
//!
//! Both backends satisfy the same contract: linearizable counter
//! increments and list appends, consistent existence checks, transit
//! upserts by `(from, to, message_id)`, and whole-namespace cleanup.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
