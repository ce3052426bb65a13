//! Clone registry: a bounded record of per-turn sandbox clones.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

/// Interpreter id of the root.
pub const ROOT_ID: u64 = 0;

pub const DEFAULT_CLONE_HISTORY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneRecord {
    pub id: u64,
    pub parent: u64,
    pub session_id: String,
    pub turn_index: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct CloneRegistry {
    next_id: AtomicU64,
    capacity: usize,
    records: Mutex<VecDeque<CloneRecord>>,
}

impl CloneRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            next_id: AtomicU64::new(ROOT_ID + 1),
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<CloneRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Appends a record, dropping the oldest when full.
    pub(crate) fn record(&self, record: CloneRecord) {
        let mut records = self.lock();
        while records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Most recent records, oldest first.
    pub fn records(&self) -> Vec<CloneRecord> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of clones ever created.
    pub fn total_created(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed) - (ROOT_ID + 1)
    }
}

impl Default for CloneRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CLONE_HISTORY)
    }
}
