use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// One table of operation locks: key to acquisition time.
///
/// Implementations never fail. A table that cannot answer behaves as empty,
/// which makes the caller allow the request.
pub trait LockTable: Send + Sync {
    fn name(&self) -> &str;

    fn acquire(&self, key: &str, at: Instant);

    fn release(&self, key: &str) -> bool;

    /// Drops entries older than `max_age`; returns how many were removed.
    fn sweep(&self, now: Instant, max_age: Duration) -> usize;

    fn age(&self, key: &str, now: Instant) -> Option<Duration>;

    /// Age of the youngest entry whose key starts with `prefix`.
    fn youngest_with_prefix(&self, prefix: &str, now: Instant) -> Option<Duration>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn held_within(&self, key: &str, now: Instant, window: Duration) -> bool {
        self.age(key, now).is_some_and(|age| age < window)
    }
}

#[derive(Debug)]
pub struct InMemoryLockTable {
    name: String,
    entries: Mutex<HashMap<String, Instant>>,
}

impl InMemoryLockTable {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LockTable for InMemoryLockTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn acquire(&self, key: &str, at: Instant) {
        self.entries().insert(key.to_string(), at);
    }

    fn release(&self, key: &str) -> bool {
        self.entries().remove(key).is_some()
    }

    fn sweep(&self, now: Instant, max_age: Duration) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, at| now.saturating_duration_since(*at) <= max_age);
        before - entries.len()
    }

    fn age(&self, key: &str, now: Instant) -> Option<Duration> {
        self.entries()
            .get(key)
            .map(|at| now.saturating_duration_since(*at))
    }

    fn youngest_with_prefix(&self, prefix: &str, now: Instant) -> Option<Duration> {
        self.entries()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(_, at)| now.saturating_duration_since(*at))
            .min()
    }

    fn len(&self) -> usize {
        self.entries().len()
    }
}
