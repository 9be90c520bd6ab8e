use std::sync::Mutex;

use tracing::warn;

use crate::error::DispatchError;

/// Per-call context supplied by the agent host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    pub thread_id: Option<String>,
    /// Recent conversation messages, oldest first. Used to rebuild media
    /// context after a restart.
    pub history: Vec<String>,
}

impl Invocation {
    pub fn for_thread(thread_id: &str) -> Self {
        Self {
            thread_id: Some(thread_id.to_string()),
            history: Vec::new(),
        }
    }

    pub fn with_history<I, S>(mut self, messages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.history = messages.into_iter().map(Into::into).collect();
        self
    }
}

/// Resolves the thread a tool call belongs to.
///
/// With the legacy fallback enabled, calls that arrive without a thread id
/// reuse the last thread seen by this process. That can attribute a call to
/// the wrong conversation under concurrency, so each use is logged.
#[derive(Debug, Default)]
pub struct ThreadResolver {
    legacy_fallback: bool,
    last_known: Mutex<Option<String>>,
}

impl ThreadResolver {
    pub fn new(legacy_fallback: bool) -> Self {
        Self {
            legacy_fallback,
            last_known: Mutex::new(None),
        }
    }

    pub fn resolve(&self, invocation: &Invocation) -> Result<String, DispatchError> {
        let mut last_known = self
            .last_known
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(thread_id) = invocation
            .thread_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            *last_known = Some(thread_id.to_string());
            return Ok(thread_id.to_string());
        }
        if self.legacy_fallback {
            if let Some(thread_id) = last_known.clone() {
                warn!(
                    thread_id = %thread_id,
                    "tool call without thread id; reusing last known thread (legacy fallback)"
                );
                return Ok(thread_id);
            }
        }
        Err(DispatchError::MissingThread)
    }
}
