mod fingerprint;
mod guard;
mod table;

pub use fingerprint::{fingerprint, normalize_prompt};
pub use guard::{
    Admission, DedupGuard, DedupTables, DedupWindows, LockLease, LockTableSizes, Suppression,
};
pub use table::{InMemoryLockTable, LockTable};
