//! Append-only journal backing the durable document store
//!
//! No pages, no WAL/checkpoint split: every committed operation appends one
//! batch of mutations, and opening the store replays all batches in order.
//!
//! # Format
//!
//! ```text
//! journal.log:
//! [u32 len][json batch][u32 checksum]   ← {sequence, timestamp, mutations}
//! [u32 len][json batch][u32 checksum]
//! ...
//! ```
//!
//! A torn or corrupt tail is dropped on replay (last complete batch wins).
//! A failed append is cut back to the last acknowledged batch before the
//! error is returned; if that truncate fails too, the journal refuses further
//! writes until it is compacted or reopened.
//! [`JournalStore::compact`] rewrites the file as a single snapshot batch.
//!
//! One process at a time: `open` takes an exclusive lock on `LOCK` in the data
//! directory and holds it until the store is dropped.

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use super::documents::{Documents, Mutation};
use super::store::{DocumentStore, Persist};
use crate::error::{Error, Result};

pub const JOURNAL_FILE: &str = "journal.log";
pub const LOCK_FILE: &str = "LOCK";

/// Larger length prefixes are treated as corruption.
const MAX_BATCH_BYTES: usize = 64 * 1024 * 1024;

/// One atomic group of mutations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalBatch {
    /// Monotonically increasing within one journal file
    pub sequence: u64,
    /// Milliseconds since epoch
    pub timestamp: i64,
    pub mutations: Vec<Mutation>,
}

fn checksum(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

impl JournalBatch {
    pub fn new(sequence: u64, mutations: Vec<Mutation>) -> Self {
        Self {
            sequence,
            timestamp: chrono::Utc::now().timestamp_millis(),
            mutations,
        }
    }

    /// Length-prefixed, checksummed encoding
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)
            .map_err(|e| Error::Serialization(format!("Failed to encode batch: {}", e)))?;

        let mut out = Vec::with_capacity(json.len() + 8);
        out.extend_from_slice(&(json.len() as u32).to_le_bytes());
        out.extend_from_slice(&json);
        out.extend_from_slice(&checksum(&json).to_le_bytes());
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 {
            return Err(Error::Serialization("Batch too short".to_string()));
        }

        let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        if bytes.len() < len + 8 {
            return Err(Error::Serialization(format!(
                "Incomplete batch: expected {} bytes, got {}",
                len + 8,
                bytes.len()
            )));
        }

        let json = &bytes[4..4 + len];
        let stored = u32::from_le_bytes([
            bytes[4 + len],
            bytes[5 + len],
            bytes[6 + len],
            bytes[7 + len],
        ]);
        if stored != checksum(json) {
            return Err(Error::Serialization("Checksum mismatch".to_string()));
        }

        serde_json::from_slice(json)
            .map_err(|e| Error::Serialization(format!("Failed to decode batch: {}", e)))
    }
}

/// Read every complete batch from `reader`, stopping at the first torn or
/// corrupt record. Also returns the byte length of the valid prefix.
fn read_batches(reader: &mut impl Read) -> (Vec<JournalBatch>, u64) {
    let mut batches = Vec::new();
    let mut valid_len = 0u64;

    loop {
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                warn!(error = %e, "Error reading journal batch length");
                break;
            }
        }

        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_BATCH_BYTES {
            warn!(len, "Dropping journal tail with implausible batch length");
            break;
        }

        let mut record = vec![0u8; len + 8];
        record[0..4].copy_from_slice(&len_bytes);
        if let Err(e) = reader.read_exact(&mut record[4..]) {
            warn!(error = %e, "Dropping torn journal tail");
            break;
        }

        match JournalBatch::from_bytes(&record) {
            Ok(batch) => {
                valid_len += record.len() as u64;
                batches.push(batch);
            }
            Err(e) => {
                warn!(error = %e, "Dropping corrupt journal tail");
                break;
            }
        }
    }

    (batches, valid_len)
}

/// File half of the journaled store
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    file: File,
    /// Bytes covered by acknowledged batches
    len: u64,
    next_sequence: u64,
    /// Set when a failed append could not be cut back
    poisoned: bool,
    /// Held for the exclusive data-dir lock
    _lock: File,
}

impl Journal {
    fn open_append(path: &Path) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| Error::Storage(format!("Failed to open journal {:?}: {}", path, e)))
    }

    /// Open (or create) the journal in `dir` and replay it.
    fn open(dir: &Path) -> Result<(Self, Documents)> {
        std::fs::create_dir_all(dir)
            .map_err(|e| Error::Storage(format!("Failed to create data dir {:?}: {}", dir, e)))?;

        let lock = Self::lock_dir(dir)?;

        let path = dir.join(JOURNAL_FILE);
        let mut docs = Documents::new();
        let mut next_sequence = 0u64;
        let mut valid_len = 0u64;

        if path.exists() {
            info!(path = ?path, "Replaying channel journal");

            let file = File::open(&path)
                .map_err(|e| Error::Storage(format!("Failed to open journal: {}", e)))?;
            let (batches, replayed_len) = read_batches(&mut BufReader::new(file));
            valid_len = replayed_len;

            let mut mutations = 0usize;
            for batch in &batches {
                docs.apply_all(&batch.mutations);
                mutations += batch.mutations.len();
                next_sequence = next_sequence.max(batch.sequence + 1);
            }

            info!(
                batches = batches.len(),
                mutations,
                channels = docs.list_all().len(),
                "Journal replay complete"
            );
        } else {
            info!(path = ?path, "No journal found, starting fresh");
        }

        let file = Self::open_append(&path)?;

        // Cut off whatever replay rejected so new batches follow the last good one.
        let on_disk = file
            .metadata()
            .map_err(|e| Error::Storage(format!("Failed to stat journal: {}", e)))?
            .len();
        if on_disk > valid_len {
            warn!(
                dropped_bytes = on_disk - valid_len,
                "Truncating journal to last complete batch"
            );
            file.set_len(valid_len)
                .map_err(|e| Error::Storage(format!("Failed to truncate journal: {}", e)))?;
        }

        Ok((
            Self {
                path,
                file,
                len: valid_len,
                next_sequence,
                poisoned: false,
                _lock: lock,
            },
            docs,
        ))
    }

    /// Replace the journal with a single batch holding `snapshot`.
    fn rewrite(&mut self, snapshot: Vec<Mutation>) -> Result<()> {
        let temp_path = self.path.with_extension("log.tmp");
        let mut temp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| Error::Storage(format!("Failed to create temp journal: {}", e)))?;

        let bytes = JournalBatch::new(0, snapshot).to_bytes()?;
        temp.write_all(&bytes)
            .map_err(|e| Error::Storage(format!("Failed to write compacted journal: {}", e)))?;
        temp.sync_all()
            .map_err(|e| Error::Storage(format!("Failed to sync compacted journal: {}", e)))?;

        std::fs::rename(&temp_path, &self.path)
            .map_err(|e| Error::Storage(format!("Failed to replace journal: {}", e)))?;

        self.file = Self::open_append(&self.path)?;
        self.len = bytes.len() as u64;
        self.next_sequence = 1;
        self.poisoned = false;
        Ok(())
    }

    fn lock_dir(dir: &Path) -> Result<File> {
        let lock_path = dir.join(LOCK_FILE);
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| Error::Storage(format!("Failed to open {:?}: {}", lock_path, e)))?;

        lock.try_lock_exclusive().map_err(|e| {
            Error::Storage(format!(
                "Data dir {:?} is locked by another process: {}",
                dir, e
            ))
        })?;

        Ok(lock)
    }

    /// Cut the file back to the acknowledged prefix. Failing to do so
    /// poisons the journal.
    fn truncate_to_acknowledged(&mut self) -> Result<()> {
        if let Err(e) = self.file.set_len(self.len) {
            self.poisoned = true;
            error!(
                path = ?self.path,
                len = self.len,
                error = %e,
                "Failed to truncate journal, refusing further writes"
            );
            return Err(Error::Storage(format!(
                "Failed to truncate journal to {} bytes: {}",
                self.len, e
            )));
        }
        Ok(())
    }

    fn append(&mut self, bytes: &[u8]) -> Result<()> {
        if self.poisoned {
            return Err(Error::Storage(format!(
                "Journal {:?} is poisoned by an earlier failed append",
                self.path
            )));
        }

        let on_disk = self
            .file
            .metadata()
            .map_err(|e| Error::Storage(format!("Failed to stat journal: {}", e)))?
            .len();
        if on_disk > self.len {
            warn!(
                on_disk,
                acknowledged = self.len,
                "Unacknowledged bytes at journal tail, truncating"
            );
            self.truncate_to_acknowledged()?;
        }

        let written = self
            .file
            .write_all(bytes)
            .and_then(|()| self.file.sync_data());
        if let Err(e) = written {
            warn!(error = %e, "Journal append failed, rolling back");
            self.truncate_to_acknowledged()?;
            return Err(Error::Storage(format!(
                "Failed to append journal batch: {}",
                e
            )));
        }

        self.len += bytes.len() as u64;
        Ok(())
    }
}

impl Persist for Journal {
    fn persist(&mut self, mutations: &[Mutation]) -> Result<()> {
        let sequence = self.next_sequence;
        let bytes = JournalBatch::new(sequence, mutations.to_vec()).to_bytes()?;
        self.append(&bytes)?;

        self.next_sequence += 1;
        debug!(sequence, mutations = mutations.len(), "Appended journal batch");
        Ok(())
    }
}

/// Durable store: document collections replayed from a journal on open
pub type JournalStore = DocumentStore<Journal>;

impl JournalStore {
    /// Open the store in `dir`, replaying any existing journal.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let (journal, docs) = Journal::open(dir.as_ref())?;
        Ok(Self::with_persist(docs, journal))
    }

    /// Rewrite the journal as a snapshot of current state.
    pub fn compact(&self) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        info!(path = ?inner.persist.path, "Compacting channel journal");
        let snapshot = inner.docs.snapshot();
        let entries = snapshot.len();
        inner.persist.rewrite(snapshot)?;
        info!(entries, "Journal compaction complete");

        Ok(())
    }

    pub fn journal_path(&self) -> PathBuf {
        self.inner.lock().persist.path.clone()
    }
}
