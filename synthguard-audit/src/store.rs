use std::{
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use tracing::warn;

use crate::{entry::AuditEntry, error::StoreError};

/// Physical medium behind an [`AuditTrail`](crate::AuditTrail).
///
/// Stores only ever append; the trail guarantees sequence numbers arrive in
/// order and stores reject anything else.
pub trait AuditStore: Send {
    fn append(&mut self, entry: &AuditEntry) -> Result<(), StoreError>;

    /// Entries whose sequence numbers fall in `from..=to`, in storage order.
    fn read_range(&self, from: u64, to: u64) -> Result<Vec<AuditEntry>, StoreError>;

    fn last(&self) -> Result<Option<AuditEntry>, StoreError>;
}

fn check_sequence(next: u64, entry: &AuditEntry) -> Result<(), StoreError> {
    if entry.sequence_no != next {
        return Err(StoreError::OutOfSequence {
            expected: next,
            actual: entry.sequence_no,
        });
    }
    Ok(())
}

fn highest(entries: &[AuditEntry]) -> Option<&AuditEntry> {
    entries.iter().max_by_key(|e| e.sequence_no)
}

#[derive(Clone, Debug, Default)]
pub struct MemoryAuditStore {
    pub(crate) entries: Vec<AuditEntry>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl AuditStore for MemoryAuditStore {
    fn append(&mut self, entry: &AuditEntry) -> Result<(), StoreError> {
        let next = self.entries.last().map_or(0, |e| e.sequence_no + 1);
        check_sequence(next, entry)?;
        self.entries.push(entry.clone());
        Ok(())
    }

    fn read_range(&self, from: u64, to: u64) -> Result<Vec<AuditEntry>, StoreError> {
        Ok(self
            .entries
            .iter()
            .filter(|e| (from..=to).contains(&e.sequence_no))
            .cloned()
            .collect())
    }

    fn last(&self) -> Result<Option<AuditEntry>, StoreError> {
        Ok(self.entries.last().cloned())
    }
}

/// One JSON document per line, opened in append mode and synced per entry.
pub struct JsonLinesAuditStore {
    path: PathBuf,
    file: File,
    next_sequence_no: u64,
}

impl JsonLinesAuditStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source| StoreError::Io {
            path: path.clone(),
            source,
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;
        let entries = Self::read_all(&path)?;
        if let Some(pair) = entries
            .windows(2)
            .find(|pair| pair[1].sequence_no <= pair[0].sequence_no)
        {
            warn!(
                path = %path.display(),
                sequence_no = pair[1].sequence_no,
                after = pair[0].sequence_no,
                "audit log sequence numbers are not strictly increasing"
            );
        }
        let next_sequence_no = highest(&entries).map_or(0, |e| e.sequence_no + 1);
        Ok(Self {
            path,
            file,
            next_sequence_no,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parses every entry in the log. Blank lines are skipped.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<AuditEntry>, StoreError> {
        let path = path.as_ref();
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let mut entries = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|source| StoreError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let entry = serde_json::from_str(&line).map_err(|source| StoreError::Corrupt {
                line: index + 1,
                source,
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

impl AuditStore for JsonLinesAuditStore {
    fn append(&mut self, entry: &AuditEntry) -> Result<(), StoreError> {
        check_sequence(self.next_sequence_no, entry)?;
        let line = serde_json::to_string(entry)?;
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        writeln!(self.file, "{line}").map_err(io_err)?;
        self.file.flush().map_err(io_err)?;
        self.file.sync_data().map_err(io_err)?;
        self.next_sequence_no += 1;
        Ok(())
    }

    fn read_range(&self, from: u64, to: u64) -> Result<Vec<AuditEntry>, StoreError> {
        Ok(Self::read_all(&self.path)?
            .into_iter()
            .filter(|e| (from..=to).contains(&e.sequence_no))
            .collect())
    }

    /// Entry with the highest sequence number, wherever it sits in the file,
    /// so a duplicated or moved line never rewinds the chain.
    fn last(&self) -> Result<Option<AuditEntry>, StoreError> {
        Ok(highest(&Self::read_all(&self.path)?).cloned())
    }
}

impl std::fmt::Debug for JsonLinesAuditStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonLinesAuditStore")
            .field("path", &self.path)
            .field("next_sequence_no", &self.next_sequence_no)
            .finish()
    }
}
