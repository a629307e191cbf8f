use std::{fmt, path::PathBuf};
use thiserror::Error;

/// What exactly failed at the reported sequence number.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainFault {
    /// No entry with the expected sequence number is stored.
    Missing,
    /// The stored payload no longer hashes to `payload_hash`.
    PayloadHashMismatch,
    /// `prev_hash` does not match the digest of the preceding entry.
    PrevHashMismatch,
    /// The sequence number is stored more than once.
    Duplicate,
    /// The entry is stored after one with a higher sequence number.
    OutOfOrder,
}

impl fmt::Display for ChainFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ChainFault::Missing => "entry missing",
            ChainFault::PayloadHashMismatch => "payload hash mismatch",
            ChainFault::PrevHashMismatch => "previous-hash link mismatch",
            ChainFault::Duplicate => "sequence number stored twice",
            ChainFault::OutOfOrder => "entry stored out of order",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("audit chain broken at sequence {at_sequence_no}: {fault}")]
    ChainBroken { at_sequence_no: u64, fault: ChainFault },
}

impl ChainError {
    pub fn at_sequence_no(&self) -> u64 {
        match self {
            ChainError::ChainBroken { at_sequence_no, .. } => *at_sequence_no,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("audit log {path} unavailable: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("audit log line {line} is not a valid entry: {source}")]
    Corrupt {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode audit entry: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("store expected sequence {expected}, got {actual}")]
    OutOfSequence { expected: u64, actual: u64 },
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to serialize audit payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("audit trail stopped after a failed write at sequence {sequence_no}")]
    WriteFailed { sequence_no: u64 },
    #[error("range {from}..={to} is outside the chain (next sequence {next_sequence_no})")]
    RangeOutOfBounds {
        from: u64,
        to: u64,
        next_sequence_no: u64,
    },
}
