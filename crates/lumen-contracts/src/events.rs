use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

const RESERVED_KEYS: &[&str] = &["type", "session_id", "thread_id", "ts"];

#[derive(Debug, Serialize)]
struct EventRecord<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    session_id: &'a str,
    thread_id: &'a str,
    ts: String,
    #[serde(flatten)]
    payload: EventPayload,
}

/// Dispatcher audit trail in JSON Lines. Clones share one append handle, so
/// lines from concurrent requests never interleave.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: Arc<PathBuf>,
    session_id: Arc<str>,
    handle: Arc<Mutex<Option<File>>>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        let session_id: String = session_id.into();
        Self {
            path: Arc::new(path.into()),
            session_id: Arc::from(session_id),
            handle: Arc::new(Mutex::new(None)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Appends one event. Payload keys that collide with the envelope
    /// (`type`, `session_id`, `thread_id`, `ts`) are dropped.
    pub fn record(&self, kind: &str, thread_id: &str, mut payload: EventPayload) -> anyhow::Result<()> {
        payload.retain(|key, _| !RESERVED_KEYS.contains(&key.as_str()));
        let record = EventRecord {
            kind,
            session_id: &self.session_id,
            thread_id,
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            payload,
        };
        let mut line = serde_json::to_vec(&record).context("event is not serializable")?;
        line.push(b'\n');

        let mut handle = self.handle();
        if handle.is_none() {
            *handle = Some(self.open()?);
        }
        if let Some(file) = handle.as_mut() {
            if let Err(err) = file.write_all(&line) {
                // Reopen on the next event in case the file was rotated away.
                *handle = None;
                return Err(err).with_context(|| format!("failed to append to {}", self.path.display()));
            }
        }
        Ok(())
    }

    fn open(&self) -> anyhow::Result<File> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path.as_path())
            .with_context(|| format!("failed to open {}", self.path.display()))
    }

    fn handle(&self) -> MutexGuard<'_, Option<File>> {
        self.handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
