use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

// Marked suffixes that callers append to make otherwise identical prompts
// unique. Unmarked dates, clock times and short numbers belong to the prompt.
const UNIQUENESS_SUFFIX_PATTERNS: &[&str] = &[
    r"(?i)\s*[\[(]\s*(?:ts|timestamp|nonce|req|request|request_id|req_id|run_id)\s*[:=#]\s*[\w.:+\-]+\s*[\])]\s*$",
    r"(?i)\s*[,;|]?\s*\b(?:ts|timestamp|nonce|request_id|req_id)\s*=\s*[\w.:+\-]+\s*$",
    r"(?i)\s*[\[(]?[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}[\])]?\s*$",
    r"\s*[-@]?\s*\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?\s*$",
    r"[\s_#@-]+\d{13,}\s*$",
];

fn suffix_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        UNIQUENESS_SUFFIX_PATTERNS
            .iter()
            .filter_map(|pattern| Regex::new(pattern).ok())
            .collect()
    })
}

/// Strips machine-appended uniqueness suffixes, lowercases, and collapses
/// whitespace so cosmetically different prompts compare equal.
pub fn normalize_prompt(prompt: &str) -> String {
    let mut current = prompt.trim().to_string();
    loop {
        let before = current.len();
        for pattern in suffix_patterns() {
            current = pattern.replace(&current, "").to_string();
        }
        if current.len() == before {
            break;
        }
    }
    current
        .split_whitespace()
        .collect::<Vec<&str>>()
        .join(" ")
        .to_lowercase()
}

/// Short hex digest of the normalized prompt.
pub fn fingerprint(prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_prompt(prompt).as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}
