//! Tamper-evident audit trail for the SynthGuard privacy engine.
//!
//! Every budget reservation, commit, release and check result is appended as
//! an [`AuditEntry`] whose `prev_hash` commits to the full serialized form of
//! the entry before it. Entry 0 links to [`ChainHash::genesis`]. Re-verifying
//! the chain pinpoints the first entry that was altered or removed.
//!
//! Physical storage is a collaborator behind [`AuditStore`]; the crate ships
//! an in-memory store and an append-only JSON-lines file store.

pub mod entry;
pub mod error;
pub mod hash;
pub mod payload;
pub mod store;
pub mod trail;

pub use entry::AuditEntry;
pub use error::{AuditError, ChainError, ChainFault, StoreError};
pub use hash::ChainHash;
pub use payload::{AuditPayload, DisclosureSummary, FrameworkSummary, ReleaseCause};
pub use store::{AuditStore, JsonLinesAuditStore, MemoryAuditStore};
pub use trail::{verify_entries, verify_store, AuditTrail, Checkpoint};
