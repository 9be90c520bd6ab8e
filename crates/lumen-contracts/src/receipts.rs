use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::dedup::normalize_prompt;
use crate::request::GenerationRequest;

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;

const BINARY_KEYS: &[&str] = &["b64_json", "image", "image_bytes", "data", "video_bytes"];
const SECRET_KEYS: &[&str] = &[
    "api_key",
    "apikey",
    "x-api-key",
    "authorization",
    "access_token",
    "token",
    "secret",
    "password",
];

pub fn receipt_path_for(artifact_path: &Path) -> PathBuf {
    let name = artifact_path
        .file_name()
        .map(|value| value.to_string_lossy().to_string())
        .unwrap_or_else(|| "artifact".to_string());
    artifact_path.with_file_name(format!("{name}.receipt.json"))
}

pub fn build_receipt(
    request: &GenerationRequest,
    provider: &str,
    provider_response: &Value,
    artifact_path: &Path,
    display_ref: &str,
) -> Value {
    let mut root = Map::new();
    root.insert(
        "schema_version".to_string(),
        Value::Number(RECEIPT_SCHEMA_VERSION.into()),
    );
    root.insert(
        "operation".to_string(),
        Value::String(request.kind.as_str().to_string()),
    );
    root.insert(
        "thread_id".to_string(),
        Value::String(request.thread_id.clone()),
    );
    root.insert("prompt".to_string(), Value::String(request.prompt.clone()));
    root.insert(
        "normalized_prompt".to_string(),
        Value::String(normalize_prompt(&request.prompt)),
    );
    root.insert(
        "fingerprint".to_string(),
        Value::String(request.fingerprint()),
    );
    root.insert(
        "sources".to_string(),
        Value::Array(request.targets.iter().cloned().map(Value::String).collect()),
    );
    if let Some(video) = &request.video {
        root.insert(
            "video".to_string(),
            serde_json::to_value(video).unwrap_or(Value::Null),
        );
    }
    root.insert("provider".to_string(), Value::String(provider.to_string()));
    root.insert(
        "provider_response".to_string(),
        sanitize_payload(provider_response),
    );

    let mut artifacts = Map::new();
    artifacts.insert(
        "path".to_string(),
        Value::String(artifact_path.to_string_lossy().to_string()),
    );
    artifacts.insert("display".to_string(), Value::String(display_ref.to_string()));
    root.insert("artifact".to_string(), Value::Object(artifacts));
    Value::Object(root)
}

pub fn write_receipt(path: &Path, payload: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(payload)?)?;
    Ok(())
}

/// Replaces inline binary payloads, data URLs and credential-bearing fields
/// with `<omitted>`.
pub fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => value.clone(),
        Value::String(text) => {
            if text.starts_with("data:") {
                Value::String("<omitted>".to_string())
            } else {
                value.clone()
            }
        }
        Value::Array(rows) => Value::Array(rows.iter().map(sanitize_payload).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, row) in map {
                let lowered = key.to_ascii_lowercase();
                if BINARY_KEYS.contains(&lowered.as_str()) || SECRET_KEYS.contains(&lowered.as_str())
                {
                    out.insert(key.clone(), Value::String("<omitted>".to_string()));
                    continue;
                }
                out.insert(key.clone(), sanitize_payload(row));
            }
            Value::Object(out)
        }
    }
}
