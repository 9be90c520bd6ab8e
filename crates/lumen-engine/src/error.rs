use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use crate::error_chain_text;

const PROVIDER_DETAIL_CHARS: usize = 300;
const REDACTED: &str = "[redacted]";

/// Why a tool call produced no artifact. `Display` is the text shown to the
/// user, so no variant may carry credentials or raw provider payloads.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error(
        "Configuration error: this tool call did not include a conversation thread id. \
         The host must pass the thread id with every invocation."
    )]
    MissingThread,
    #[error("Please describe what you would like me to create.")]
    EmptyPrompt,
    #[error(
        "I don't have an image to work with yet. Please upload an image or generate one \
         first, then ask again."
    )]
    NoTarget,
    #[error(
        "Combining images needs at least 2 recent images in this conversation, but I found \
         {found}. Please upload or generate more images first."
    )]
    InsufficientImages { found: usize },
    #[error("The generation provider '{0}' is not available.")]
    ProviderUnavailable(String),
    #[error("Uploading the source image failed: {0}")]
    Upload(String),
    #[error("The generation service rejected the request: {0}")]
    Submit(String),
    #[error("The generation service returned a response without a usable {0} link.")]
    UnrecognizedResponse(&'static str),
    #[error("Downloading the generated result failed: {0}")]
    Download(String),
    #[error("Saving the generated result failed: {0}")]
    Storage(String),
    #[error("That file could not be used: {0}")]
    InvalidUpload(String),
}

impl DispatchError {
    /// Stable identifier for events and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingThread => "missing_thread",
            Self::EmptyPrompt => "empty_prompt",
            Self::NoTarget => "no_target",
            Self::InsufficientImages { .. } => "insufficient_images",
            Self::ProviderUnavailable(_) => "provider_unavailable",
            Self::Upload(_) => "upload_failed",
            Self::Submit(_) => "submit_failed",
            Self::UnrecognizedResponse(_) => "unrecognized_response",
            Self::Download(_) => "download_failed",
            Self::Storage(_) => "storage_failed",
            Self::InvalidUpload(_) => "invalid_upload",
        }
    }

    /// Failures after admission; the request reached the provider or disk.
    pub fn is_execution_failure(&self) -> bool {
        matches!(
            self,
            Self::Upload(_)
                | Self::Submit(_)
                | Self::UnrecognizedResponse(_)
                | Self::Download(_)
                | Self::Storage(_)
        )
    }
}

/// Short, credential-free summary of an internal error chain.
pub fn provider_detail(err: &anyhow::Error, secrets: &[String]) -> String {
    redact_secrets(&error_chain_text(err, PROVIDER_DETAIL_CHARS), secrets)
}

/// Masks configured secret values and anything shaped like a bearer token or
/// key parameter.
pub fn redact_secrets(text: &str, secrets: &[String]) -> String {
    let mut out = text.to_string();
    for secret in secrets {
        let secret = secret.trim();
        if secret.len() >= 4 {
            out = out.replace(secret, REDACTED);
        }
    }
    for (pattern, replacement) in redaction_patterns() {
        out = pattern.replace_all(&out, *replacement).into_owned();
    }
    out
}

fn redaction_patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (r"(?i)\b(bearer|token|key)\s+[A-Za-z0-9._~+/=-]{8,}", "$1 [redacted]"),
            (
                r"(?i)\b(api[_-]?key|access[_-]?token|token|secret)=[^&\s]+",
                "$1=[redacted]",
            ),
            (r"\b(sk|r8|pk)[-_][A-Za-z0-9_-]{8,}", "[redacted]"),
        ]
        .into_iter()
        .filter_map(|(pattern, replacement)| {
            Regex::new(pattern).ok().map(|regex| (regex, replacement))
        })
        .collect()
    })
}
