//! Registry of expected echoes.
//!
//! Before the client writes hub-originated data to disk it registers the
//! change it expects the watcher to report. When the matching notification
//! arrives the processor consumes one registration and drops the event, so
//! the write is not sent back to the hub.
//!
//! Registrations for the same key stack as a count. Each one may carry a
//! deadline: a write that fails before touching disk would otherwise leave a
//! registration behind that swallows the next genuine change.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::sync::change::SuppressionKey;

/// Default lifetime of a registration.
pub const DEFAULT_ECHO_TTL: Duration = Duration::from_secs(120);

type Pending = HashMap<SuppressionKey, VecDeque<Option<Instant>>>;

/// Thread-safe multiset of expected echoes.
///
/// Cloning yields another handle to the same registry, so one instance can be
/// shared between the remote-apply side and the change processor.
#[derive(Debug, Clone)]
pub struct EchoSuppressionRegistry {
    pending: Arc<Mutex<Pending>>,
    ttl: Option<Duration>,
}

impl Default for EchoSuppressionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EchoSuppressionRegistry {
    /// Registry whose registrations never expire.
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            ttl: None,
        }
    }

    /// Registry whose registrations lapse after `ttl`.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            ttl: Some(ttl),
        }
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Expect one more notification matching `key`. Returns the new count.
    pub fn register(&self, key: SuppressionKey) -> usize {
        let now = Instant::now();
        let deadline = self.ttl.map(|ttl| now + ttl);
        let mut pending = self.lock();

        if self.ttl.is_some() {
            prune_all(&mut pending, now);
        }

        let entry = pending.entry(key.clone()).or_default();
        entry.push_back(deadline);
        let count = entry.len();
        debug!(key = %key, count, "registered expected echo");
        count
    }

    /// Consume one registration for `key`.
    ///
    /// Returns `true` when the notification was an expected echo and must be
    /// suppressed, `false` when it is a genuine change.
    pub fn try_consume(&self, key: &SuppressionKey) -> bool {
        let now = Instant::now();
        let mut pending = self.lock();

        let Some(entry) = pending.get_mut(key) else {
            return false;
        };

        prune_entry(entry, now);
        let consumed = entry.pop_front().is_some();
        if entry.is_empty() {
            pending.remove(key);
        }

        trace!(key = %key, consumed, "echo lookup");
        consumed
    }

    /// Withdraw one registration for `key`, e.g. after the write it announced
    /// failed. Returns whether anything was removed.
    pub fn unregister(&self, key: &SuppressionKey) -> bool {
        let mut pending = self.lock();

        let Some(entry) = pending.get_mut(key) else {
            return false;
        };

        // Drop the newest registration; the older ones belong to writes that
        // may still be in flight.
        let removed = entry.pop_back().is_some();
        if entry.is_empty() {
            pending.remove(key);
        }

        if removed {
            debug!(key = %key, "withdrew expected echo");
        }
        removed
    }

    /// Number of live registrations for `key`.
    pub fn pending(&self, key: &SuppressionKey) -> usize {
        let now = Instant::now();
        let mut pending = self.lock();

        let Some(entry) = pending.get_mut(key) else {
            return 0;
        };

        prune_entry(entry, now);
        let count = entry.len();
        if count == 0 {
            pending.remove(key);
        }
        count
    }

    /// Number of distinct keys with at least one live registration.
    pub fn len(&self) -> usize {
        let mut pending = self.lock();
        prune_all(&mut pending, Instant::now());
        pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired registration. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut pending = self.lock();
        let removed = prune_all(&mut pending, Instant::now());
        if removed > 0 {
            debug!(removed, "purged expired echo registrations");
        }
        removed
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        // Every critical section leaves the map consistent, so a poisoned
        // lock is still safe to use.
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn prune_entry(entry: &mut VecDeque<Option<Instant>>, now: Instant) -> usize {
    let before = entry.len();
    entry.retain(|deadline| deadline.map_or(true, |at| at > now));
    before - entry.len()
}

fn prune_all(pending: &mut Pending, now: Instant) -> usize {
    let mut removed = 0;
    pending.retain(|_, entry| {
        removed += prune_entry(entry, now);
        !entry.is_empty()
    });
    removed
}
