//! Transparency log service: durable entries, a Merkle tree over them, and
//! signed checkpoints.

mod checkpoint;
mod entry;
pub mod postgres;
pub mod schema;
mod service;
mod state;
mod store;

pub use checkpoint::Checkpoint;
pub use entry::{canonical_json, EntryType, EvidencePointer, LogEntry, MAX_ENTRY_PAYLOAD};
pub use postgres::PostgresLogStore;
pub use service::{AppendReceipt, ConsistencyReport, TransparencyLog};
pub use state::MerkleState;
pub use store::{LogStore, MemoryLogStore, StoredEntry};
