use super::{RaftError, RaftResult};
use crate::raftpb;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub data: Vec<u8>,
    pub entry_type: EntryType,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum EntryType {
    /// A state machine command.
    Normal,
    /// Appended by a new leader to commit entries of earlier terms.
    Noop,
}

impl From<LogEntry> for raftpb::LogEntry {
    fn from(entry: LogEntry) -> Self {
        let entry_type = match entry.entry_type {
            EntryType::Normal => raftpb::EntryType::Normal,
            EntryType::Noop => raftpb::EntryType::Noop,
        };
        raftpb::LogEntry {
            index: entry.index,
            term: entry.term,
            data: entry.data,
            entry_type: entry_type as i32,
        }
    }
}

impl From<raftpb::LogEntry> for LogEntry {
    fn from(entry: raftpb::LogEntry) -> Self {
        let entry_type = match raftpb::EntryType::try_from(entry.entry_type) {
            Ok(raftpb::EntryType::Noop) => EntryType::Noop,
            _ => EntryType::Normal,
        };
        LogEntry {
            index: entry.index,
            term: entry.term,
            data: entry.data,
            entry_type,
        }
    }
}

/// Term and vote, which must survive a restart.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<u64>,
}

const LOG_TREE: &str = "raft_log";

pub struct RaftLog {
    db: sled::Db,
    tree: sled::Tree,
    first_index: AtomicU64,
    last_index: AtomicU64,
    last_term: AtomicU64,
    snapshot_index: AtomicU64,
    snapshot_term: AtomicU64,
    /// Cached snapshot data for sending to followers
    snapshot_data: parking_lot::Mutex<Option<Vec<u8>>>,
}

fn log_err(context: &str, e: impl std::fmt::Display) -> RaftError {
    RaftError::LogError(format!("{}: {}", context, e))
}

fn read_u64(bytes: &[u8], name: &str) -> RaftResult<u64> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| RaftError::LogError(format!("Invalid {} size", name)))?;
    Ok(u64::from_le_bytes(array))
}

impl RaftLog {
    /// Opens the log in the `raft_log` tree of `db` and recovers its state.
    pub fn new(db: sled::Db) -> RaftResult<Self> {
        let tree = db
            .open_tree(LOG_TREE)
            .map_err(|e| log_err("Open tree error", e))?;
        let log = Self {
            db,
            tree,
            first_index: AtomicU64::new(1),
            last_index: AtomicU64::new(0),
            last_term: AtomicU64::new(0),
            snapshot_index: AtomicU64::new(0),
            snapshot_term: AtomicU64::new(0),
            snapshot_data: parking_lot::Mutex::new(None),
        };

        // Recover state from disk
        log.recover()?;
        Ok(log)
    }

    /// Opens the log in a sled database at `path`.
    pub fn open(path: &std::path::Path) -> RaftResult<Self> {
        let db = sled::open(path).map_err(|e| log_err("Open error", e))?;
        Self::new(db)
    }

    /// Flushes everything to disk and releases this handle on the database.
    /// Returns the database so the caller decides when it is dropped.
    pub fn close(self) -> RaftResult<sled::Db> {
        self.flush()?;
        self.db.flush().map_err(|e| log_err("Flush error", e))?;
        Ok(self.db)
    }

    fn get_u64(&self, key: &str) -> RaftResult<Option<u64>> {
        match self.tree.get(key).map_err(|e| log_err("Database error", e))? {
            Some(bytes) => Ok(Some(read_u64(&bytes, key)?)),
            None => Ok(None),
        }
    }

    fn recover(&self) -> RaftResult<()> {
        if let Some(idx) = self.get_u64("snapshot_index")? {
            self.snapshot_index.store(idx, Ordering::Release);
            self.first_index.store(idx + 1, Ordering::Release);
            self.last_index.store(idx, Ordering::Release);
        }

        if let Some(term) = self.get_u64("snapshot_term")? {
            self.snapshot_term.store(term, Ordering::Release);
            self.last_term.store(term, Ordering::Release);
        }

        if let Some(data) = self
            .tree
            .get("snapshot_data")
            .map_err(|e| log_err("Database error", e))?
        {
            *self.snapshot_data.lock() = Some(data.to_vec());
        }

        if let Some(idx) = self.get_u64("last_index")? {
            if idx > self.snapshot_index() {
                self.last_index.store(idx, Ordering::Release);
                if let Some(entry) = self.get(idx)? {
                    self.last_term.store(entry.term, Ordering::Release);
                }
            }
        }

        Ok(())
    }

    pub fn hard_state(&self) -> RaftResult<HardState> {
        match self
            .tree
            .get("hard_state")
            .map_err(|e| log_err("Database error", e))?
        {
            Some(bytes) => {
                bincode::deserialize(&bytes).map_err(|e| log_err("Deserialize error", e))
            }
            None => Ok(HardState::default()),
        }
    }

    pub fn save_hard_state(&self, state: HardState) -> RaftResult<()> {
        let value = bincode::serialize(&state).map_err(|e| log_err("Serialize error", e))?;
        self.tree
            .insert("hard_state", value)
            .map_err(|e| log_err("Insert error", e))?;
        Ok(())
    }

    pub fn append(&self, entries: &[LogEntry]) -> RaftResult<()> {
        let Some(last_entry) = entries.last() else {
            return Ok(());
        };

        let mut batch = sled::Batch::default();

        for entry in entries {
            let key = format!("entry:{}", entry.index);
            let value = bincode::serialize(entry).map_err(|e| log_err("Serialize error", e))?;
            batch.insert(key.as_bytes(), value);
        }

        batch.insert(b"last_index", last_entry.index.to_le_bytes().to_vec());

        self.tree
            .apply_batch(batch)
            .map_err(|e| log_err("Apply batch error", e))?;

        self.last_index.store(last_entry.index, Ordering::Release);
        self.last_term.store(last_entry.term, Ordering::Release);

        Ok(())
    }

    pub fn get(&self, index: u64) -> RaftResult<Option<LogEntry>> {
        if index < self.first_index.load(Ordering::Acquire) {
            return Ok(None);
        }

        let key = format!("entry:{}", index);
        match self.tree.get(&key) {
            Ok(Some(bytes)) => {
                let entry = bincode::deserialize::<LogEntry>(&bytes)
                    .map_err(|e| log_err("Deserialize error", e))?;
                Ok(Some(entry))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(log_err("Database error", e)),
        }
    }

    /// Entries in `[start, end)`, clipped to what the log holds.
    pub fn get_range(&self, start: u64, end: u64) -> RaftResult<Vec<LogEntry>> {
        let first = self.first_index.load(Ordering::Acquire);
        let last = self.last_index.load(Ordering::Acquire);

        if start > last || end <= first {
            return Ok(Vec::new());
        }

        let actual_start = std::cmp::max(start, first);
        let actual_end = std::cmp::min(end, last + 1);

        let mut entries = Vec::new();
        for index in actual_start..actual_end {
            if let Some(entry) = self.get(index)? {
                entries.push(entry);
            }
        }

        Ok(entries)
    }

    /// Removes every entry after `index`.
    pub fn truncate_after(&self, index: u64) -> RaftResult<()> {
        let last = self.last_index.load(Ordering::Acquire);

        if index >= last {
            return Ok(());
        }

        let mut batch = sled::Batch::default();
        for i in (index + 1)..=last {
            batch.remove(format!("entry:{}", i).as_bytes());
        }
        batch.insert(b"last_index", index.to_le_bytes().to_vec());

        self.tree
            .apply_batch(batch)
            .map_err(|e| log_err("Apply batch error", e))?;

        let term = self.term_at(index)?.unwrap_or(0);
        self.last_index.store(index, Ordering::Release);
        self.last_term.store(term, Ordering::Release);

        Ok(())
    }

    /// Removes every entry before `index`.
    pub fn truncate_before(&self, index: u64) -> RaftResult<()> {
        let first = self.first_index.load(Ordering::Acquire);

        if index <= first {
            return Ok(());
        }

        let mut batch = sled::Batch::default();
        for i in first..index {
            batch.remove(format!("entry:{}", i).as_bytes());
        }
        self.tree
            .apply_batch(batch)
            .map_err(|e| log_err("Apply batch error", e))?;

        self.first_index.store(index, Ordering::Release);

        Ok(())
    }

    pub fn last_index(&self) -> u64 {
        self.last_index.load(Ordering::Acquire)
    }

    pub fn last_term(&self) -> u64 {
        self.last_term.load(Ordering::Acquire)
    }

    pub fn first_index(&self) -> u64 {
        self.first_index.load(Ordering::Acquire)
    }

    pub fn term_at(&self, index: u64) -> RaftResult<Option<u64>> {
        if index == 0 {
            return Ok(Some(0));
        }

        let snapshot_index = self.snapshot_index();
        if index == snapshot_index {
            return Ok(Some(self.snapshot_term()));
        }
        if index < snapshot_index {
            return Ok(None);
        }

        match self.get(index)? {
            Some(entry) => Ok(Some(entry.term)),
            None => Ok(None),
        }
    }

    pub fn has_entry(&self, index: u64, term: u64) -> bool {
        match self.term_at(index) {
            Ok(Some(t)) => t == term,
            _ => false,
        }
    }

    fn save_snapshot(&self, index: u64, term: u64, data: Vec<u8>) -> RaftResult<()> {
        let mut batch = sled::Batch::default();
        batch.insert(b"snapshot_index", index.to_le_bytes().to_vec());
        batch.insert(b"snapshot_term", term.to_le_bytes().to_vec());
        batch.insert(b"snapshot_data", data.clone());

        self.tree
            .apply_batch(batch)
            .map_err(|e| log_err("Apply batch error", e))?;

        self.snapshot_index.store(index, Ordering::Release);
        self.snapshot_term.store(term, Ordering::Release);
        *self.snapshot_data.lock() = Some(data);

        Ok(())
    }

    /// Records a snapshot of the state machine at `index` and drops the
    /// entries it covers.
    pub fn compact(&self, index: u64, term: u64, data: Vec<u8>) -> RaftResult<()> {
        if index <= self.snapshot_index() {
            return Ok(());
        }
        self.save_snapshot(index, term, data)?;
        self.truncate_before(index + 1)
    }

    /// Replaces the whole log with a snapshot received from the leader.
    pub fn reset_to_snapshot(&self, index: u64, term: u64, data: Vec<u8>) -> RaftResult<()> {
        let mut batch = sled::Batch::default();
        for i in self.first_index()..=self.last_index() {
            batch.remove(format!("entry:{}", i).as_bytes());
        }
        batch.insert(b"last_index", index.to_le_bytes().to_vec());
        self.tree
            .apply_batch(batch)
            .map_err(|e| log_err("Apply batch error", e))?;

        self.save_snapshot(index, term, data)?;
        self.first_index.store(index + 1, Ordering::Release);
        self.last_index.store(index, Ordering::Release);
        self.last_term.store(term, Ordering::Release);
        Ok(())
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot_index.load(Ordering::Acquire)
    }

    pub fn snapshot_term(&self) -> u64 {
        self.snapshot_term.load(Ordering::Acquire)
    }

    /// Forces everything written so far to disk.
    pub fn flush(&self) -> RaftResult<()> {
        self.tree.flush().map_err(|e| log_err("Flush error", e))?;
        Ok(())
    }

    /// Returns the latest snapshot data if available.
    pub fn snapshot_data(&self) -> Option<Vec<u8>> {
        self.snapshot_data.lock().clone()
    }
}
