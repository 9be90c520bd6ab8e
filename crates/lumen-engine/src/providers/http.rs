use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use lumen_contracts::providers::NamedProvider;
use lumen_contracts::request::OperationKind;
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use serde_json::{Map, Value};

use super::{JobRequest, MediaBytes, MediaProvider};
use crate::config::EngineConfig;
use crate::{map_object, mime_for_path, non_empty_env, response_json_or_error, truncate_text};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Prediction-style job API: `POST {base}/predictions`, then poll the
/// returned `urls.get` until the job settles. Uploads go to `{base}/files`.
#[derive(Debug, Clone)]
pub struct HttpJobProvider {
    api_base: Option<String>,
    api_key: Option<String>,
    inline_uploads: bool,
    poll_interval: Duration,
    poll_timeout: Duration,
    http: HttpClient,
}

impl HttpJobProvider {
    pub fn from_config(config: &EngineConfig) -> Self {
        let http = HttpClient::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| HttpClient::new());
        Self {
            api_base: config.api_base.clone(),
            api_key: config.api_key.clone(),
            inline_uploads: config.inline_uploads,
            poll_interval: config.poll_interval,
            poll_timeout: config.poll_timeout,
            http,
        }
    }

    fn api_base(&self) -> Result<&str> {
        match self.api_base.as_deref() {
            Some(base) => Ok(base),
            None => bail!("LUMEN_API_BASE not set"),
        }
    }

    fn api_key(&self) -> Result<&str> {
        match self.api_key.as_deref() {
            Some(key) => Ok(key),
            None => bail!("LUMEN_API_KEY not set"),
        }
    }

    /// Model slug per operation, overridable with `LUMEN_MODEL_<OPERATION>`.
    fn model_for(kind: OperationKind) -> String {
        let env_key = format!("LUMEN_MODEL_{}", kind.as_str().to_ascii_uppercase());
        non_empty_env(&env_key).unwrap_or_else(|| {
            match kind {
                OperationKind::GenerateImage => "lumen/image-generate",
                OperationKind::EditImage => "lumen/image-edit",
                OperationKind::TextToVideo => "lumen/text-to-video",
                OperationKind::ImageToVideo => "lumen/image-to-video",
                OperationKind::FuseImages => "lumen/image-fuse",
            }
            .to_string()
        })
    }

    fn build_input(job: &JobRequest) -> Map<String, Value> {
        let mut input = Map::new();
        input.insert("prompt".to_string(), Value::String(job.prompt.clone()));
        match job.kind {
            OperationKind::EditImage | OperationKind::ImageToVideo => {
                if let Some(source) = job.sources.first() {
                    input.insert("image".to_string(), Value::String(source.clone()));
                }
            }
            OperationKind::FuseImages => {
                input.insert(
                    "images".to_string(),
                    Value::Array(job.sources.iter().cloned().map(Value::String).collect()),
                );
            }
            OperationKind::GenerateImage | OperationKind::TextToVideo => {}
        }
        if !job.kind.produces_video() {
            input.insert("num_outputs".to_string(), Value::Number(job.count.max(1).into()));
        }
        if let Some(video) = &job.video {
            if let Value::Object(settings) = serde_json::to_value(video).unwrap_or(Value::Null) {
                for (key, value) in settings {
                    input.entry(key).or_insert(value);
                }
            }
        }
        input
    }

    fn poll_prediction(&self, poll_url: &str, api_key: &str) -> Result<Value> {
        let started = Instant::now();
        loop {
            let response = self
                .http
                .get(poll_url)
                .bearer_auth(api_key)
                .send()
                .with_context(|| format!("job poll request failed ({poll_url})"))?;
            let payload = response_json_or_error("job poll", response)?;
            match job_status(&payload).as_str() {
                "succeeded" => return Ok(payload),
                "failed" | "canceled" => bail!("job failed: {}", failure_text(&payload)),
                _ => {}
            }
            if started.elapsed() >= self.poll_timeout {
                bail!(
                    "job polling timed out after {:.1}s",
                    self.poll_timeout.as_secs_f64()
                );
            }
            thread::sleep(self.poll_interval);
        }
    }
}

impl NamedProvider for HttpJobProvider {
    fn name(&self) -> &str {
        "http"
    }
}

impl MediaProvider for HttpJobProvider {
    fn upload(&self, path: &Path) -> Result<String> {
        if self.inline_uploads {
            return data_url_for(path);
        }
        let endpoint = format!("{}/files", self.api_base()?);
        let api_key = self.api_key()?;
        let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
        let file_name = path
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or("image.png")
            .to_string();
        let mut part = MultipartPart::bytes(bytes).file_name(file_name);
        if let Some(mime) = mime_for_path(path) {
            part = part
                .mime_str(mime)
                .with_context(|| format!("invalid mime '{mime}' for {}", path.display()))?;
        }
        let form = MultipartForm::new().part("content", part);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .with_context(|| format!("file upload failed ({endpoint})"))?;
        let payload = response_json_or_error("file upload", response)?;
        payload
            .get("urls")
            .and_then(|urls| urls.get("get"))
            .or_else(|| payload.get("url"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("file upload response missing URL"))
    }

    fn submit(&self, job: &JobRequest) -> Result<Value> {
        let endpoint = format!("{}/predictions", self.api_base()?);
        let api_key = self.api_key()?;
        let payload = map_object(serde_json::json!({
            "model": Self::model_for(job.kind),
            "input": Value::Object(Self::build_input(job)),
        }));
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .header("Prefer", "wait")
            .json(&Value::Object(payload))
            .send()
            .with_context(|| format!("job request failed ({endpoint})"))?;
        let prediction = response_json_or_error("job", response)?;
        match job_status(&prediction).as_str() {
            "succeeded" | "" => Ok(prediction),
            "starting" | "processing" | "queued" => {
                let poll_url = prediction
                    .get("urls")
                    .and_then(Value::as_object)
                    .and_then(|obj| obj.get("get"))
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .ok_or_else(|| anyhow::anyhow!("job response missing poll URL"))?;
                self.poll_prediction(poll_url, api_key)
            }
            _ => bail!("job failed: {}", failure_text(&prediction)),
        }
    }

    fn download(&self, url: &str) -> Result<MediaBytes> {
        let response = self
            .http
            .get(url)
            .send()
            .with_context(|| format!("failed downloading result ({url})"))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            bail!("result download failed ({code}): {}", truncate_text(&body, 512));
        }
        let mime_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .context("failed reading result bytes")?
            .to_vec();
        Ok(MediaBytes { bytes, mime_type })
    }
}

fn data_url_for(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    let mime = mime_for_path(path).unwrap_or("image/png");
    Ok(format!("data:{mime};base64,{}", BASE64.encode(bytes)))
}

fn job_status(payload: &Value) -> String {
    payload
        .get("status")
        .and_then(Value::as_str)
        .map(|value| value.trim().to_ascii_lowercase())
        .unwrap_or_default()
}

fn failure_text(payload: &Value) -> String {
    let detail = payload
        .get("error")
        .map(|error| match error {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| payload.to_string());
    truncate_text(&detail, 512)
}
