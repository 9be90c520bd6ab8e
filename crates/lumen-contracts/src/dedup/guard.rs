use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use crate::clock::Clock;
use crate::request::{GenerationRequest, OperationKind};

use super::table::{InMemoryLockTable, LockTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupWindows {
    /// Same prompt twice inside one agent turn.
    pub execution_turn: Duration,
    /// UI double-clicks and client retries.
    pub request: Duration,
    /// Entries older than this are swept from every table.
    pub retention: Duration,
}

impl Default for DedupWindows {
    fn default() -> Self {
        Self {
            execution_turn: Duration::from_secs(10),
            request: Duration::from_secs(30),
            retention: Duration::from_secs(300),
        }
    }
}

/// Which check tripped. Suppression is an outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suppression {
    ExecutionTurn,
    SimilarRequest,
    ExactRequest,
    GlobalPrompt,
}

impl Suppression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecutionTurn => "execution_turn",
            Self::SimilarRequest => "similar_request",
            Self::ExactRequest => "exact_request",
            Self::GlobalPrompt => "global_prompt",
        }
    }

    pub fn message(&self, kind: OperationKind) -> String {
        let label = kind.label();
        match self {
            Self::ExecutionTurn => format!(
                "This {label} was already requested a moment ago and is being processed. \
                 Skipping the duplicate call."
            ),
            Self::SimilarRequest => format!(
                "A matching {label} is already in progress for this conversation. \
                 Please wait for it to finish."
            ),
            Self::ExactRequest => {
                format!("This exact {label} is already in progress. Please wait for the result.")
            }
            Self::GlobalPrompt => format!(
                "This {label} was just processed. Ask again in a few seconds if you want \
                 another version."
            ),
        }
    }
}

/// Proof of admission. Dropping it releases the exact-request entry; the
/// other tables keep their marks until they age out.
pub struct LockLease {
    table: Arc<dyn LockTable>,
    key: String,
    fingerprint: String,
    released: bool,
}

impl LockLease {
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.table.release(&self.key);
            self.released = true;
        }
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for LockLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockLease")
            .field("key", &self.key)
            .field("released", &self.released)
            .finish()
    }
}

#[derive(Debug)]
pub enum Admission {
    Admitted(LockLease),
    Suppressed(Suppression),
}

/// The four tables, swappable for a shared backend.
pub struct DedupTables {
    pub exact: Arc<dyn LockTable>,
    pub global: Arc<dyn LockTable>,
    pub recency: Arc<dyn LockTable>,
    pub turn: Arc<dyn LockTable>,
}

impl DedupTables {
    pub fn in_memory() -> Self {
        Self {
            exact: Arc::new(InMemoryLockTable::new("exact_request")),
            global: Arc::new(InMemoryLockTable::new("global_prompt")),
            recency: Arc::new(InMemoryLockTable::new("thread_recency")),
            turn: Arc::new(InMemoryLockTable::new("execution_turn")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockTableSizes {
    pub exact: usize,
    pub global: usize,
    pub recency: usize,
    pub turn: usize,
}

impl LockTableSizes {
    pub fn total(&self) -> usize {
        self.exact + self.global + self.recency + self.turn
    }
}

pub struct DedupGuard {
    tables: DedupTables,
    windows: DedupWindows,
    clock: Arc<dyn Clock>,
    admission: Mutex<()>,
}

impl DedupGuard {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_tables(clock, DedupWindows::default(), DedupTables::in_memory())
    }

    pub fn with_tables(clock: Arc<dyn Clock>, windows: DedupWindows, tables: DedupTables) -> Self {
        Self {
            tables,
            windows,
            clock,
            admission: Mutex::new(()),
        }
    }

    pub fn windows(&self) -> DedupWindows {
        self.windows
    }

    /// Runs the checks in order (execution turn, similar, exact, global) and,
    /// when none trips, marks all four tables and sweeps stale entries. The
    /// whole sequence is one critical section.
    pub fn admit(&self, request: &GenerationRequest) -> Admission {
        let _admission = self
            .admission
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = self.clock.now();
        let fingerprint = request.fingerprint();
        let prompt_key = prompt_key(&request.thread_id, request.kind, &fingerprint);
        let exact_key = exact_key(&prompt_key, &request.target_key());
        let thread_key = thread_key(&request.thread_id);

        let suppression = if self
            .tables
            .turn
            .held_within(&prompt_key, now, self.windows.execution_turn)
        {
            Some(Suppression::ExecutionTurn)
        } else if self
            .tables
            .exact
            .youngest_with_prefix(&format!("{prompt_key}|"), now)
            .is_some_and(|age| age < self.windows.request)
            && !self.tables.exact.held_within(&exact_key, now, self.windows.request)
        {
            Some(Suppression::SimilarRequest)
        } else if self
            .tables
            .exact
            .held_within(&exact_key, now, self.windows.request)
        {
            Some(Suppression::ExactRequest)
        } else if self
            .tables
            .global
            .held_within(&prompt_key, now, self.windows.request)
        {
            Some(Suppression::GlobalPrompt)
        } else {
            None
        };

        if let Some(reason) = suppression {
            info!(
                thread_id = %request.thread_id,
                operation = request.kind.as_str(),
                fingerprint = %fingerprint,
                reason = reason.as_str(),
                "duplicate generation request suppressed"
            );
            return Admission::Suppressed(reason);
        }

        if request.kind.is_edit_class() {
            if let Some(age) = self.tables.recency.age(&thread_key, now) {
                if age < self.windows.request {
                    debug!(
                        thread_id = %request.thread_id,
                        operation = request.kind.as_str(),
                        since_last_edit_ms = age.as_millis() as u64,
                        "rapid repeated edit on thread"
                    );
                }
            }
            self.tables.recency.acquire(&thread_key, now);
        }
        self.tables.exact.acquire(&exact_key, now);
        self.tables.global.acquire(&prompt_key, now);
        self.tables.turn.acquire(&prompt_key, now);

        let swept = [
            &self.tables.exact,
            &self.tables.global,
            &self.tables.recency,
            &self.tables.turn,
        ]
        .iter()
        .map(|table| table.sweep(now, self.windows.retention))
        .sum::<usize>();
        if swept > 0 {
            debug!(swept, "swept stale operation locks");
        }

        Admission::Admitted(LockLease {
            table: Arc::clone(&self.tables.exact),
            key: exact_key,
            fingerprint,
            released: false,
        })
    }

    /// Time since the last edit-class operation on the thread.
    pub fn last_edit_age(&self, thread_id: &str) -> Option<Duration> {
        self.tables
            .recency
            .age(&thread_key(thread_id), self.clock.now())
    }

    pub fn table_sizes(&self) -> LockTableSizes {
        LockTableSizes {
            exact: self.tables.exact.len(),
            global: self.tables.global.len(),
            recency: self.tables.recency.len(),
            turn: self.tables.turn.len(),
        }
    }
}

fn thread_key(thread_id: &str) -> String {
    thread_id.to_string()
}

fn prompt_key(thread_id: &str, kind: OperationKind, fingerprint: &str) -> String {
    format!("{thread_id}|{}|{fingerprint}", kind.as_str())
}

fn exact_key(prompt_key: &str, target_key: &str) -> String {
    format!("{prompt_key}|{target_key}")
}
