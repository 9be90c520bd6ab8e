use std::path::PathBuf;
use std::time::Duration;

use lumen_contracts::context::DEFAULT_HISTORY_LIMIT;
use lumen_contracts::dedup::DedupWindows;

use crate::non_empty_env;
use crate::storage::StorageLayout;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub storage_root: PathBuf,
    pub assets_dir: String,
    pub videos_dir: String,
    pub static_route: String,
    pub provider: String,
    pub api_base: Option<String>,
    pub api_key: Option<String>,
    /// Send source images to the job API as base64 data URLs instead of
    /// uploading them first.
    pub inline_uploads: bool,
    /// Accept tool calls without a thread id by reusing the last thread seen.
    /// Every use is logged as a warning.
    pub legacy_thread_fallback: bool,
    pub events_path: Option<PathBuf>,
    pub write_receipts: bool,
    pub dedup: DedupWindows,
    pub history_limit: usize,
    pub fusion_max_images: usize,
    pub fusion_recency: Duration,
    pub recovery_window: usize,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("static"),
            assets_dir: "assets".to_string(),
            videos_dir: "videos".to_string(),
            static_route: "/static".to_string(),
            provider: "dryrun".to_string(),
            api_base: None,
            api_key: None,
            inline_uploads: false,
            legacy_thread_fallback: true,
            events_path: None,
            write_receipts: true,
            dedup: DedupWindows::default(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            fusion_max_images: 5,
            fusion_recency: Duration::from_secs(600),
            recovery_window: 10,
            poll_interval: Duration::from_secs(2),
            poll_timeout: Duration::from_secs(600),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(root) = non_empty_env("LUMEN_STORAGE_ROOT") {
            config.storage_root = PathBuf::from(root);
        }
        if let Some(route) = non_empty_env("LUMEN_STATIC_ROUTE") {
            config.static_route = route;
        }
        if let Some(provider) = non_empty_env("LUMEN_PROVIDER") {
            config.provider = provider.to_ascii_lowercase();
        }
        config.api_base = non_empty_env("LUMEN_API_BASE")
            .map(|value| value.trim_end_matches('/').to_string());
        config.api_key = non_empty_env("LUMEN_API_KEY");
        if let Some(flag) = non_empty_env("LUMEN_INLINE_UPLOADS").and_then(|raw| parse_flag(&raw)) {
            config.inline_uploads = flag;
        }
        if let Some(flag) = non_empty_env("LUMEN_LEGACY_THREAD_FALLBACK").and_then(|raw| parse_flag(&raw)) {
            config.legacy_thread_fallback = flag;
        }
        config.events_path = non_empty_env("LUMEN_EVENTS_PATH").map(PathBuf::from);
        if let Some(flag) = non_empty_env("LUMEN_WRITE_RECEIPTS").and_then(|raw| parse_flag(&raw)) {
            config.write_receipts = flag;
        }
        config
    }

    pub fn layout(&self) -> StorageLayout {
        StorageLayout::new(
            &self.storage_root,
            &self.assets_dir,
            &self.videos_dir,
            &self.static_route,
        )
    }

    /// Values that must never appear in user-facing text.
    pub fn secrets(&self) -> Vec<String> {
        self.api_key.iter().cloned().collect()
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
