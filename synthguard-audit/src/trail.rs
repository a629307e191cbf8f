use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::{
    entry::AuditEntry,
    error::{AuditError, ChainError, ChainFault},
    hash::ChainHash,
    payload::AuditPayload,
    store::{AuditStore, MemoryAuditStore},
};

/// Head of the chain at some point in time. An archiver that moves a prefix
/// of the log to cold storage keeps the checkpoint so the remaining suffix
/// stays verifiable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub next_sequence_no: u64,
    pub head: ChainHash,
}

struct ChainState {
    next_sequence_no: u64,
    head: ChainHash,
    /// Sealed entries waiting for the store, in sequence order.
    queued: VecDeque<AuditEntry>,
    /// Every sequence number below this one is in the store.
    stored: u64,
    /// First sequence number the store refused. The chain cannot continue
    /// past a gap, so the trail stops accepting entries.
    failed: Option<u64>,
}

/// Append-only hash chain.
///
/// Sequence numbers and hash links are assigned under a short chain lock.
/// Writes happen under a separate store lock: whoever holds it drains every
/// queued entry in order, so concurrent appenders share one pass over the
/// store instead of each waiting on the other's sync.
pub struct AuditTrail {
    chain: Mutex<ChainState>,
    store: Mutex<Box<dyn AuditStore>>,
}

impl AuditTrail {
    pub fn in_memory() -> Self {
        Self::resume(Box::new(MemoryAuditStore::new()), 0, ChainHash::genesis())
    }

    /// Resumes the chain after the last stored entry.
    pub fn open(store: impl AuditStore + 'static) -> Result<Self, AuditError> {
        let (next_sequence_no, head) = match store.last()? {
            Some(last) => (last.sequence_no + 1, last.digest()?),
            None => (0, ChainHash::genesis()),
        };
        debug!(next_sequence_no, head = %head, "audit trail opened");
        Ok(Self::resume(Box::new(store), next_sequence_no, head))
    }

    fn resume(store: Box<dyn AuditStore>, next_sequence_no: u64, head: ChainHash) -> Self {
        Self {
            chain: Mutex::new(ChainState {
                next_sequence_no,
                head,
                queued: VecDeque::new(),
                stored: next_sequence_no,
                failed: None,
            }),
            store: Mutex::new(store),
        }
    }

    pub fn append(&self, payload: AuditPayload) -> Result<AuditEntry, AuditError> {
        self.append_at(payload, Utc::now())
    }

    /// Seals `payload` as the next entry and returns once it is stored.
    pub fn append_at(
        &self,
        payload: AuditPayload,
        timestamp: DateTime<Utc>,
    ) -> Result<AuditEntry, AuditError> {
        let entry = {
            let mut chain = self.chain.lock();
            if let Some(sequence_no) = chain.failed {
                return Err(AuditError::WriteFailed { sequence_no });
            }
            let entry = AuditEntry::seal(chain.next_sequence_no, timestamp, chain.head, payload)?;
            chain.head = entry.digest()?;
            chain.next_sequence_no += 1;
            chain.queued.push_back(entry.clone());
            entry
        };
        self.write_queued()?;

        let chain = self.chain.lock();
        if chain.stored <= entry.sequence_no {
            return Err(AuditError::WriteFailed {
                sequence_no: chain.failed.unwrap_or(entry.sequence_no),
            });
        }
        debug!(
            sequence_no = entry.sequence_no,
            kind = entry.payload.kind(),
            dataset_id = entry.payload.dataset_id(),
            "audit entry appended"
        );
        Ok(entry)
    }

    fn write_queued(&self) -> Result<(), AuditError> {
        let mut store = self.store.lock();
        loop {
            let batch: Vec<AuditEntry> = {
                let mut chain = self.chain.lock();
                if let Some(sequence_no) = chain.failed {
                    chain.queued.clear();
                    return Err(AuditError::WriteFailed { sequence_no });
                }
                chain.queued.drain(..).collect()
            };
            let Some(last) = batch.last().map(|entry| entry.sequence_no) else {
                return Ok(());
            };
            for entry in &batch {
                if let Err(err) = store.append(entry) {
                    error!(sequence_no = entry.sequence_no, error = %err, "audit store write failed");
                    let mut chain = self.chain.lock();
                    chain.failed = Some(entry.sequence_no);
                    chain.queued.clear();
                    return Err(err.into());
                }
            }
            self.chain.lock().stored = last + 1;
        }
    }

    /// Sequence number the next sealed entry will receive.
    pub fn next_sequence_no(&self) -> u64 {
        self.chain.lock().next_sequence_no
    }

    /// Number of entries known to be in the store.
    pub fn stored(&self) -> u64 {
        self.chain.lock().stored
    }

    pub fn is_empty(&self) -> bool {
        self.next_sequence_no() == 0
    }

    pub fn checkpoint(&self) -> Checkpoint {
        let chain = self.chain.lock();
        Checkpoint {
            next_sequence_no: chain.next_sequence_no,
            head: chain.head,
        }
    }

    pub fn entries(&self, from: u64, to: u64) -> Result<Vec<AuditEntry>, AuditError> {
        Ok(self.store.lock().read_range(from, to)?)
    }

    /// Recomputes hashes over `from..=to` and fails at the first entry that
    /// is missing, duplicated, out of order, carries a payload that no longer
    /// matches its hash, or does not link to its predecessor.
    pub fn verify_chain(&self, from: u64, to: u64) -> Result<(), AuditError> {
        let store = self.store.lock();
        check_range(from, to, self.stored())?;
        let anchor = anchor_for(store.as_ref(), from)?;
        let entries = store.read_range(from, to)?;
        verify_entries(&entries, from, to, anchor).inspect_err(|err| {
            warn!(error = %err, "audit chain verification failed");
        })
    }

    pub fn verify_all(&self) -> Result<(), AuditError> {
        match self.stored() {
            0 => Ok(()),
            stored => self.verify_chain(0, stored - 1),
        }
    }

    /// Verifies the suffix written after `checkpoint`, anchored at the
    /// checkpoint head instead of the (possibly archived) predecessor.
    pub fn verify_from_checkpoint(&self, checkpoint: &Checkpoint, to: u64) -> Result<(), AuditError> {
        let store = self.store.lock();
        let from = checkpoint.next_sequence_no;
        check_range(from, to, self.stored())?;
        let entries = store.read_range(from, to)?;
        verify_entries(&entries, from, to, checkpoint.head)
    }
}

impl std::fmt::Debug for AuditTrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let checkpoint = self.checkpoint();
        f.debug_struct("AuditTrail")
            .field("next_sequence_no", &checkpoint.next_sequence_no)
            .field("head", &checkpoint.head)
            .finish()
    }
}

fn check_range(from: u64, to: u64, next_sequence_no: u64) -> Result<(), AuditError> {
    if from > to || to >= next_sequence_no {
        return Err(AuditError::RangeOutOfBounds {
            from,
            to,
            next_sequence_no,
        });
    }
    Ok(())
}

fn anchor_for(store: &dyn AuditStore, from: u64) -> Result<ChainHash, AuditError> {
    if from == 0 {
        return Ok(ChainHash::genesis());
    }
    let previous = store.read_range(from - 1, from - 1)?;
    match previous.first() {
        Some(entry) => Ok(entry.digest()?),
        None => Err(ChainError::ChainBroken {
            at_sequence_no: from - 1,
            fault: ChainFault::Missing,
        }
        .into()),
    }
}

/// Checks that `entries`, in storage order, hold every sequence number in
/// `from..=to` exactly once and in ascending order, each with an intact
/// payload hash and a `prev_hash` equal to the digest of its predecessor
/// (`anchor` for the first one).
pub fn verify_entries(
    entries: &[AuditEntry],
    from: u64,
    to: u64,
    anchor: ChainHash,
) -> Result<(), AuditError> {
    let mut by_sequence = BTreeMap::new();
    let mut previous: Option<u64> = None;
    for entry in entries {
        let sequence_no = entry.sequence_no;
        let fault = if by_sequence.insert(sequence_no, entry).is_some() {
            Some(ChainFault::Duplicate)
        } else if previous.is_some_and(|previous| sequence_no < previous) {
            Some(ChainFault::OutOfOrder)
        } else {
            None
        };
        if let Some(fault) = fault {
            return Err(ChainError::ChainBroken {
                at_sequence_no: sequence_no,
                fault,
            }
            .into());
        }
        previous = Some(sequence_no);
    }
    let mut expected_prev = anchor;
    for sequence_no in from..=to {
        let broken = |fault| ChainError::ChainBroken {
            at_sequence_no: sequence_no,
            fault,
        };
        let Some(entry) = by_sequence.get(&sequence_no) else {
            return Err(broken(ChainFault::Missing).into());
        };
        if !entry.payload_intact()? {
            return Err(broken(ChainFault::PayloadHashMismatch).into());
        }
        if entry.prev_hash != expected_prev {
            return Err(broken(ChainFault::PrevHashMismatch).into());
        }
        expected_prev = entry.digest()?;
    }
    Ok(())
}

/// Verifies a store without an attached trail, e.g. a log file handed to an
/// operator. `to` defaults to the last stored entry.
pub fn verify_store(store: &dyn AuditStore, from: u64, to: Option<u64>) -> Result<u64, AuditError> {
    let Some(last) = store.last()? else {
        return Ok(0);
    };
    let to = to.unwrap_or(last.sequence_no);
    check_range(from, to, last.sequence_no + 1)?;
    let anchor = anchor_for(store, from)?;
    let entries = store.read_range(from, to)?;
    verify_entries(&entries, from, to, anchor)?;
    Ok(to - from + 1)
}
