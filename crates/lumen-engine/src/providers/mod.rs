mod dryrun;
mod http;

use std::path::Path;

use anyhow::Result;
use lumen_contracts::providers::{NamedProvider, ProviderRegistry};
use lumen_contracts::request::{OperationKind, VideoSettings};
use serde_json::Value;

use crate::config::EngineConfig;

pub use dryrun::DryrunProvider;
pub use http::HttpJobProvider;

#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub kind: OperationKind,
    pub prompt: String,
    /// Remote URLs for the source media, in selection order.
    pub sources: Vec<String>,
    pub count: u32,
    pub video: Option<VideoSettings>,
}

#[derive(Debug, Clone)]
pub struct MediaBytes {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

/// External generation service. Calls block; the dispatcher holds the
/// exact-request lock for their whole duration.
pub trait MediaProvider: NamedProvider + Send + Sync {
    /// Uploads a local file and returns a URL the service can read.
    fn upload(&self, path: &Path) -> Result<String>;

    /// Runs a job to completion and returns the raw response document.
    fn submit(&self, job: &JobRequest) -> Result<Value>;

    fn download(&self, url: &str) -> Result<MediaBytes>;
}

pub type MediaProviderRegistry = ProviderRegistry<Box<dyn MediaProvider>>;

pub fn default_provider_registry(config: &EngineConfig) -> MediaProviderRegistry {
    let mut registry = MediaProviderRegistry::default();
    registry.register(Box::new(DryrunProvider::new()));
    registry.register(Box::new(HttpJobProvider::from_config(config)));
    registry
}
