use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use indexmap::IndexMap;

pub const DEFAULT_HISTORY_LIMIT: usize = 5;

/// Media state for one conversation thread.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ThreadContext {
    pub thread_id: String,
    pub recent_path: Option<String>,
    pub uploaded_images: VecDeque<String>,
    pub image_labels: IndexMap<String, String>,
}

impl ThreadContext {
    pub fn new(thread_id: &str) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.uploaded_images.is_empty() && self.recent_path.is_none()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.uploaded_images.iter().any(|existing| existing == path)
    }

    pub fn label_for(&self, path: &str) -> Option<&str> {
        self.image_labels.get(path).map(String::as_str)
    }

    /// Appends `path` as the newest entry, evicting from the front past `limit`.
    /// A path already in the history moves to the back instead of repeating.
    fn push(&mut self, path: &str, label: Option<&str>, limit: usize) {
        self.uploaded_images.retain(|existing| existing != path);
        self.uploaded_images.push_back(path.to_string());
        while self.uploaded_images.len() > limit.max(1) {
            if let Some(evicted) = self.uploaded_images.pop_front() {
                self.image_labels.shift_remove(&evicted);
            }
        }
        if let Some(label) = label.map(str::trim).filter(|value| !value.is_empty()) {
            self.image_labels
                .insert(path.to_string(), label.to_ascii_lowercase());
        }
    }
}

/// Storage seam for thread contexts.
///
/// Every method is a single critical section: implementations must apply
/// append-then-evict and check-then-set sequences atomically per thread.
pub trait ContextStore: Send + Sync {
    fn get_or_create(&self, thread_id: &str) -> ThreadContext;

    /// Read-only view; never creates an entry.
    fn snapshot(&self, thread_id: &str) -> Option<ThreadContext>;

    fn record_artifact(&self, thread_id: &str, path: &str, label: Option<&str>);

    /// Appends recovered entries that are not tracked yet, without touching
    /// `recent_path` unless it is unset. Returns the entries actually added.
    fn restore(&self, thread_id: &str, recovered: &[(String, Option<String>)]) -> Vec<String>;

    /// Points `recent_path` at an already tracked entry. Returns false and
    /// leaves the context untouched when `path` is not tracked.
    fn set_recent(&self, thread_id: &str, path: &str) -> bool;

    fn clear(&self, thread_id: &str) -> bool;

    fn get_recent(&self, thread_id: &str) -> Option<String> {
        self.snapshot(thread_id)
            .and_then(|context| context.recent_path)
    }

    fn get_history(&self, thread_id: &str) -> Vec<String> {
        self.snapshot(thread_id)
            .map(|context| context.uploaded_images.into_iter().collect())
            .unwrap_or_default()
    }
}

/// Process-local store. State is lost on restart; the recovery scanner
/// rebuilds it from conversation history.
#[derive(Debug)]
pub struct InMemoryContextStore {
    threads: Mutex<HashMap<String, ThreadContext>>,
    history_limit: usize,
}

impl InMemoryContextStore {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            threads: Mutex::new(HashMap::new()),
            history_limit: history_limit.max(1),
        }
    }

    pub fn thread_count(&self) -> usize {
        self.threads().len()
    }

    fn threads(&self) -> MutexGuard<'_, HashMap<String, ThreadContext>> {
        self.threads
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for InMemoryContextStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextStore for InMemoryContextStore {
    fn get_or_create(&self, thread_id: &str) -> ThreadContext {
        self.threads()
            .entry(thread_id.to_string())
            .or_insert_with(|| ThreadContext::new(thread_id))
            .clone()
    }

    fn snapshot(&self, thread_id: &str) -> Option<ThreadContext> {
        self.threads().get(thread_id).cloned()
    }

    fn record_artifact(&self, thread_id: &str, path: &str, label: Option<&str>) {
        let mut threads = self.threads();
        let context = threads
            .entry(thread_id.to_string())
            .or_insert_with(|| ThreadContext::new(thread_id));
        context.push(path, label, self.history_limit);
        context.recent_path = Some(path.to_string());
    }

    fn restore(&self, thread_id: &str, recovered: &[(String, Option<String>)]) -> Vec<String> {
        let mut threads = self.threads();
        let context = threads
            .entry(thread_id.to_string())
            .or_insert_with(|| ThreadContext::new(thread_id));
        let mut added = Vec::new();
        for (path, label) in recovered {
            if context.contains(path) || added.contains(path) {
                continue;
            }
            context.push(path, label.as_deref(), self.history_limit);
            added.push(path.clone());
        }
        if context.recent_path.is_none() {
            context.recent_path = context.uploaded_images.back().cloned();
        }
        added
    }

    fn set_recent(&self, thread_id: &str, path: &str) -> bool {
        let mut threads = self.threads();
        match threads.get_mut(thread_id) {
            Some(context) if context.contains(path) => {
                context.recent_path = Some(path.to_string());
                true
            }
            _ => false,
        }
    }

    fn clear(&self, thread_id: &str) -> bool {
        self.threads().remove(thread_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::{ContextStore, InMemoryContextStore};

    #[test]
    fn history_is_capped_with_oldest_evicted_first() {
        let store = InMemoryContextStore::new();
        for idx in 0..8 {
            store.record_artifact("t1", &format!("img-{idx}.png"), None);
        }
        assert_eq!(
            store.get_history("t1"),
            vec![
                "img-3.png",
                "img-4.png",
                "img-5.png",
                "img-6.png",
                "img-7.png"
            ]
        );
    }

    #[test]
    fn record_sets_recent_to_latest_path() {
        let store = InMemoryContextStore::new();
        store.record_artifact("t1", "a.png", Some("cat"));
        assert_eq!(store.get_recent("t1").as_deref(), Some("a.png"));
        store.record_artifact("t1", "b.png", None);
        assert_eq!(store.get_recent("t1").as_deref(), Some("b.png"));

        let context = store.get_or_create("t1");
        assert_eq!(context.label_for("a.png"), Some("cat"));
        assert_eq!(context.label_for("b.png"), None);
    }

    #[test]
    fn eviction_drops_labels_of_evicted_paths() {
        let store = InMemoryContextStore::with_history_limit(2);
        store.record_artifact("t1", "a.png", Some("cat"));
        store.record_artifact("t1", "b.png", Some("dog"));
        store.record_artifact("t1", "c.png", Some("bird"));

        let context = store.get_or_create("t1");
        assert_eq!(context.uploaded_images.len(), 2);
        assert!(context.label_for("a.png").is_none());
        assert_eq!(context.label_for("c.png"), Some("bird"));
    }

    #[test]
    fn re_recording_a_path_moves_it_to_the_back() {
        let store = InMemoryContextStore::new();
        store.record_artifact("t1", "a.png", None);
        store.record_artifact("t1", "b.png", None);
        store.record_artifact("t1", "a.png", None);
        assert_eq!(store.get_history("t1"), vec!["b.png", "a.png"]);
    }

    #[test]
    fn snapshot_does_not_create_and_get_or_create_does() {
        let store = InMemoryContextStore::new();
        assert!(store.snapshot("fresh").is_none());
        assert_eq!(store.thread_count(), 0);

        let context = store.get_or_create("fresh");
        assert!(context.is_empty());
        assert_eq!(context.thread_id, "fresh");
        assert_eq!(store.thread_count(), 1);
    }

    #[test]
    fn clear_removes_the_whole_context() {
        let store = InMemoryContextStore::new();
        store.record_artifact("t1", "a.png", None);
        store.record_artifact("t2", "b.png", None);
        assert!(store.clear("t1"));
        assert!(!store.clear("t1"));
        assert!(store.get_recent("t1").is_none());
        assert_eq!(store.get_recent("t2").as_deref(), Some("b.png"));
    }

    #[test]
    fn restore_skips_tracked_entries_and_keeps_existing_recent() {
        let store = InMemoryContextStore::new();
        store.record_artifact("t1", "a.png", None);
        let added = store.restore(
            "t1",
            &[
                ("a.png".to_string(), None),
                ("b.png".to_string(), Some("dog".to_string())),
                ("b.png".to_string(), None),
            ],
        );
        assert_eq!(added, vec!["b.png"]);
        assert_eq!(store.get_history("t1"), vec!["a.png", "b.png"]);
        assert_eq!(store.get_recent("t1").as_deref(), Some("a.png"));
    }

    #[test]
    fn restore_defaults_recent_to_last_recovered_entry() {
        let store = InMemoryContextStore::new();
        store.restore(
            "t1",
            &[("a.png".to_string(), None), ("b.png".to_string(), None)],
        );
        assert_eq!(store.get_recent("t1").as_deref(), Some("b.png"));
    }

    #[test]
    fn set_recent_only_accepts_tracked_paths() {
        let store = InMemoryContextStore::new();
        assert!(!store.set_recent("t1", "a.png"));
        assert!(store.snapshot("t1").is_none());

        store.record_artifact("t1", "a.png", None);
        store.record_artifact("t1", "b.png", None);
        assert!(!store.set_recent("t1", "c.png"));
        assert_eq!(store.get_recent("t1").as_deref(), Some("b.png"));
        assert!(store.set_recent("t1", "a.png"));
        assert_eq!(store.get_recent("t1").as_deref(), Some("a.png"));
        assert_eq!(store.get_history("t1"), vec!["a.png", "b.png"]);
    }

    #[test]
    fn concurrent_records_never_exceed_the_cap() {
        let store = Arc::new(InMemoryContextStore::new());
        let handles = (0..8)
            .map(|worker| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for idx in 0..25 {
                        store.record_artifact("shared", &format!("w{worker}-{idx}.png"), None);
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            let _ = handle.join();
        }

        let context = store.get_or_create("shared");
        assert_eq!(context.uploaded_images.len(), 5);
        let recent = context.recent_path.unwrap_or_default();
        assert_eq!(context.uploaded_images.back(), Some(&recent));
    }
}
