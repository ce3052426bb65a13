//! Replay cache: consumed token bindings, bounded in size and time.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

/// Default number of entries remembered before the oldest is evicted.
pub const DEFAULT_REPLAY_CAPACITY: usize = 4096;

#[derive(Debug, Default)]
struct Inner {
    /// Insertion order with each entry's expiry (unix millis).
    order: VecDeque<(String, i64)>,
    seen: HashSet<String>,
}

/// Remembers which token bindings have been consumed.
///
/// An entry is kept until its token would have expired anyway; past that
/// point the TTL check rejects the token before the cache is consulted.
/// When full, the oldest entry is evicted first.
#[derive(Debug)]
pub struct ReplayCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl ReplayCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Marks `key` consumed until `expires_at`.
    ///
    /// Returns `false` if the key was already consumed.
    pub fn insert(&self, key: &str, now: i64, expires_at: i64) -> bool {
        let mut inner = self.lock();

        while let Some((_, exp)) = inner.order.front() {
            if *exp > now {
                break;
            }
            if let Some((old, _)) = inner.order.pop_front() {
                inner.seen.remove(&old);
            }
        }

        if inner.seen.contains(key) {
            return false;
        }

        while inner.order.len() >= self.capacity {
            if let Some((old, _)) = inner.order.pop_front() {
                debug!("Replay cache full, evicting {old}");
                inner.seen.remove(&old);
            }
        }

        inner.seen.insert(key.to_string());
        inner.order.push_back((key.to_string(), expires_at));
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().seen.contains(key)
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_CAPACITY)
    }
}
