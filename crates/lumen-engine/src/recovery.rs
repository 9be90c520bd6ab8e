use regex::Regex;

use lumen_contracts::context::LabelStrategy;

use crate::storage::StorageLayout;

const IMAGE_EXTENSIONS: &str = "png|jpe?g|webp|gif";

/// Finds image artifacts referenced in recent conversation messages.
///
/// Any spelling of a reference (static-route URL, absolute path, relative
/// `assets/<file>`) is normalized to the canonical on-disk path, so entries
/// already tracked under another spelling are not added twice.
pub struct RecoveryScanner<'a> {
    layout: &'a StorageLayout,
    labeler: &'a dyn LabelStrategy,
    window: usize,
    pattern: Option<Regex>,
}

impl<'a> RecoveryScanner<'a> {
    pub fn new(layout: &'a StorageLayout, labeler: &'a dyn LabelStrategy, window: usize) -> Self {
        let assets = layout
            .assets_dir()
            .file_name()
            .and_then(|value| value.to_str())
            .map(regex::escape)
            .unwrap_or_else(|| "assets".to_string());
        let pattern = Regex::new(&format!(
            r"(?i)(?:^|[^A-Za-z0-9_.-]){assets}/([A-Za-z0-9_-][A-Za-z0-9_.-]*\.(?:{IMAGE_EXTENSIONS}))\b"
        ))
        .ok();
        Self {
            layout,
            labeler,
            window,
            pattern,
        }
    }

    /// Existing artifacts referenced in the last `window` messages, oldest
    /// first, each with a label inferred from the message that mentions it.
    pub fn scan(&self, messages: &[String]) -> Vec<(String, Option<String>)> {
        let Some(pattern) = self.pattern.as_ref() else {
            return Vec::new();
        };
        let start = messages.len().saturating_sub(self.window);
        let mut found: Vec<(String, Option<String>)> = Vec::new();
        for message in &messages[start..] {
            for captures in pattern.captures_iter(message) {
                let Some(name) = captures.get(1).map(|m| m.as_str()) else {
                    continue;
                };
                let path = self.layout.assets_dir().join(name);
                if !path.is_file() {
                    continue;
                }
                let canonical = path.to_string_lossy().to_string();
                if found.iter().any(|(existing, _)| existing == &canonical) {
                    continue;
                }
                found.push((canonical, self.labeler.infer(message)));
            }
        }
        found
    }
}
