use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lumen_contracts::clock::{Clock, SystemClock};
use lumen_contracts::context::{ContextStore, InMemoryContextStore, LabelStrategy, VocabularyLabeler};
use lumen_contracts::dedup::{Admission, DedupGuard, DedupTables, Suppression};
use lumen_contracts::events::{EventLog, EventPayload};
use lumen_contracts::providers::NamedProvider;
use lumen_contracts::receipts::{build_receipt, receipt_path_for, write_receipt};
use lumen_contracts::request::{GenerationRequest, OperationKind, VideoSettings};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{provider_detail, DispatchError};
use crate::extract::{extract_image_urls, extract_video_url};
use crate::map_object;
use crate::providers::{default_provider_registry, JobRequest, MediaProvider, MediaProviderRegistry};
use crate::recovery::RecoveryScanner;
use crate::selection::{is_accessible, is_remote, select_fusion_sources, select_target, SelectionError};
use crate::storage::{markup, media_kind_for_path, MediaKind, StorageLayout};
use crate::thread_scope::{Invocation, ThreadResolver};

const UPLOAD_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "gif"];

/// What a generation call came to.
#[derive(Debug)]
pub enum Outcome {
    Completed(Artifact),
    Suppressed {
        kind: OperationKind,
        reason: Suppression,
    },
    Failed {
        kind: OperationKind,
        error: DispatchError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub kind: OperationKind,
    pub path: PathBuf,
    pub display_ref: String,
}

impl Outcome {
    /// The text returned to the chat model.
    pub fn message(&self) -> String {
        match self {
            Self::Completed(artifact) => {
                let media = if artifact.kind.produces_video() {
                    MediaKind::Video
                } else {
                    MediaKind::Image
                };
                format!(
                    "{}\n\n{}",
                    completion_line(artifact.kind),
                    markup(media, &artifact.display_ref, alt_text(artifact.kind))
                )
            }
            Self::Suppressed { kind, reason } => reason.message(*kind),
            Self::Failed { kind, error } if error.is_execution_failure() => {
                format!("Sorry, the {} failed. {error}", kind.label())
            }
            Self::Failed { error, .. } => error.to_string(),
        }
    }

    pub fn artifact(&self) -> Option<&Artifact> {
        match self {
            Self::Completed(artifact) => Some(artifact),
            _ => None,
        }
    }
}

fn completion_line(kind: OperationKind) -> &'static str {
    match kind {
        OperationKind::GenerateImage => "Here is your generated image:",
        OperationKind::EditImage => "Here is your edited image:",
        OperationKind::TextToVideo => "Here is your video:",
        OperationKind::ImageToVideo => "Here is your animated video:",
        OperationKind::FuseImages => "Here is your combined image:",
    }
}

fn alt_text(kind: OperationKind) -> &'static str {
    match kind {
        OperationKind::GenerateImage => "Generated image",
        OperationKind::EditImage => "Edited image",
        OperationKind::FuseImages => "Combined image",
        OperationKind::TextToVideo | OperationKind::ImageToVideo => "Video",
    }
}

fn file_prefix(kind: OperationKind) -> &'static str {
    match kind {
        OperationKind::GenerateImage => "generated",
        OperationKind::EditImage => "edited",
        OperationKind::TextToVideo => "video",
        OperationKind::ImageToVideo => "animated",
        OperationKind::FuseImages => "fused",
    }
}

struct Produced {
    path: PathBuf,
    provider: String,
    response: Value,
    result_url: String,
}

/// Entry point for every media tool call.
///
/// Resolves the thread, selects source media, admits the call through the
/// deduplication guard, runs it against the configured provider and records
/// the artifact. Every operation returns chat text; nothing here panics or
/// propagates an error to the caller.
pub struct Dispatcher {
    config: EngineConfig,
    layout: StorageLayout,
    store: Arc<dyn ContextStore>,
    guard: DedupGuard,
    providers: MediaProviderRegistry,
    labeler: Box<dyn LabelStrategy>,
    threads: ThreadResolver,
    clock: Arc<dyn Clock>,
    events: Option<EventLog>,
}

impl Dispatcher {
    pub fn new(config: EngineConfig) -> anyhow::Result<Self> {
        let providers = default_provider_registry(&config);
        if providers.get(&config.provider).is_none() {
            anyhow::bail!(
                "unknown provider '{}' (available: {})",
                config.provider,
                providers.list().join(", ")
            );
        }
        let layout = config.layout();
        layout.ensure_dirs()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Ok(Self {
            layout,
            store: Arc::new(InMemoryContextStore::with_history_limit(config.history_limit)),
            guard: DedupGuard::with_tables(clock.clone(), config.dedup, DedupTables::in_memory()),
            providers,
            labeler: Box::new(VocabularyLabeler::default()),
            threads: ThreadResolver::new(config.legacy_thread_fallback),
            clock,
            events: None,
            config,
        })
    }

    pub fn with_store(mut self, store: Arc<dyn ContextStore>) -> Self {
        self.store = store;
        self
    }

    /// Replaces the clock and starts a fresh guard driven by it.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.guard = DedupGuard::with_tables(clock.clone(), self.config.dedup, DedupTables::in_memory());
        self.clock = clock;
        self
    }

    pub fn with_lock_tables(mut self, tables: DedupTables) -> Self {
        self.guard = DedupGuard::with_tables(self.clock.clone(), self.config.dedup, tables);
        self
    }

    /// Registers `provider` and makes it the active one.
    pub fn with_provider(mut self, provider: Box<dyn MediaProvider>) -> Self {
        self.config.provider = provider.name().to_string();
        self.providers.register(provider);
        self
    }

    pub fn with_labeler(mut self, labeler: Box<dyn LabelStrategy>) -> Self {
        self.labeler = labeler;
        self
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn store(&self) -> &dyn ContextStore {
        self.store.as_ref()
    }

    pub fn guard(&self) -> &DedupGuard {
        &self.guard
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.list()
    }

    pub fn generate_image(&self, invocation: &Invocation, prompt: &str, count: u32) -> String {
        self.dispatch(invocation, OperationKind::GenerateImage, prompt, count, None)
            .message()
    }

    pub fn edit_image(&self, invocation: &Invocation, prompt: &str) -> String {
        self.dispatch(invocation, OperationKind::EditImage, prompt, 1, None)
            .message()
    }

    pub fn text_to_video(
        &self,
        invocation: &Invocation,
        prompt: &str,
        video: &VideoSettings,
    ) -> String {
        self.dispatch(invocation, OperationKind::TextToVideo, prompt, 1, Some(video.clone()))
            .message()
    }

    pub fn image_to_video(
        &self,
        invocation: &Invocation,
        prompt: &str,
        video: &VideoSettings,
    ) -> String {
        self.dispatch(invocation, OperationKind::ImageToVideo, prompt, 1, Some(video.clone()))
            .message()
    }

    pub fn fuse_images(&self, invocation: &Invocation, prompt: &str, count: u32) -> String {
        self.dispatch(invocation, OperationKind::FuseImages, prompt, count, None)
            .message()
    }

    /// Runs one generation operation end to end.
    pub fn dispatch(
        &self,
        invocation: &Invocation,
        kind: OperationKind,
        prompt: &str,
        count: u32,
        video: Option<VideoSettings>,
    ) -> Outcome {
        let thread_id = match self.threads.resolve(invocation) {
            Ok(thread_id) => thread_id,
            Err(error) => {
                warn!(operation = kind.as_str(), "rejected tool call without thread id");
                return Outcome::Failed { kind, error };
            }
        };
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Outcome::Failed {
                kind,
                error: DispatchError::EmptyPrompt,
            };
        }

        let targets = match self.select_sources(&thread_id, kind, prompt, &invocation.history) {
            Ok(targets) => targets,
            Err(error) => {
                info!(thread_id = %thread_id, operation = kind.as_str(), reason = error.code(), "no usable source media");
                return Outcome::Failed { kind, error };
            }
        };

        let mut request = GenerationRequest::new(&thread_id, kind, prompt)
            .with_targets(targets)
            .with_count(count.max(1));
        if kind.produces_video() {
            request = request.with_video(video.unwrap_or_default());
        }

        let lease = match self.guard.admit(&request) {
            Admission::Admitted(lease) => lease,
            Admission::Suppressed(reason) => {
                self.emit(
                    "generation_suppressed",
                    &thread_id,
                    json!({
                        "operation": kind.as_str(),
                        "reason": reason.as_str(),
                        "fingerprint": request.fingerprint(),
                    }),
                );
                return Outcome::Suppressed { kind, reason };
            }
        };

        self.emit(
            "generation_started",
            &thread_id,
            json!({
                "operation": kind.as_str(),
                "fingerprint": lease.fingerprint(),
                "sources": request.targets,
                "provider": self.config.provider,
            }),
        );

        let result = self.execute(&request);
        lease.release();

        match result {
            Ok(produced) => Outcome::Completed(self.finish(&request, produced)),
            Err(error) => {
                warn!(
                    thread_id = %thread_id,
                    operation = kind.as_str(),
                    error = %error,
                    "generation failed"
                );
                self.emit(
                    "generation_failed",
                    &thread_id,
                    json!({
                        "operation": kind.as_str(),
                        "error_code": error.code(),
                        "error": error.to_string(),
                    }),
                );
                Outcome::Failed { kind, error }
            }
        }
    }

    fn select_sources(
        &self,
        thread_id: &str,
        kind: OperationKind,
        prompt: &str,
        history: &[String],
    ) -> Result<Vec<String>, DispatchError> {
        match kind {
            OperationKind::GenerateImage | OperationKind::TextToVideo => Ok(Vec::new()),
            OperationKind::EditImage | OperationKind::ImageToVideo => {
                let context = self.store.snapshot(thread_id);
                let first = select_target(context.as_ref(), prompt, &self.layout);
                let selected = match first {
                    Ok(selected) => Ok(selected),
                    Err(SelectionError::NoTarget) if !history.is_empty() => {
                        let added = self.recover_context(thread_id, history);
                        if added.is_empty() {
                            Err(SelectionError::NoTarget)
                        } else {
                            self.repoint_stale_recent(thread_id, &added);
                            let context = self.store.snapshot(thread_id);
                            select_target(context.as_ref(), prompt, &self.layout)
                        }
                    }
                    Err(err) => Err(err),
                };
                selected
                    .map(|image| {
                        debug!(thread_id = %thread_id, reference = %image.reference, reason = ?image.reason, "selected source image");
                        vec![image.reference]
                    })
                    .map_err(selection_error)
            }
            OperationKind::FuseImages => {
                let context = self.store.snapshot(thread_id);
                select_fusion_sources(
                    context.as_ref(),
                    &self.layout,
                    self.clock.wall(),
                    self.config.fusion_max_images,
                    self.config.fusion_recency,
                )
                .map_err(selection_error)
            }
        }
    }

    fn provider(&self) -> Result<&dyn MediaProvider, DispatchError> {
        self.providers
            .get(&self.config.provider)
            .map(|provider| provider.as_ref())
            .ok_or_else(|| DispatchError::ProviderUnavailable(self.config.provider.clone()))
    }

    fn execute(&self, request: &GenerationRequest) -> Result<Produced, DispatchError> {
        let provider = self.provider()?;
        let secrets = self.config.secrets();

        let mut sources = Vec::with_capacity(request.targets.len());
        for target in &request.targets {
            if is_remote(target) && self.layout.resolve_route(target).is_none() {
                sources.push(target.clone());
                continue;
            }
            let local = self
                .layout
                .canonicalize_reference(target)
                .unwrap_or_else(|| PathBuf::from(target));
            let url = provider
                .upload(&local)
                .map_err(|err| DispatchError::Upload(provider_detail(&err, &secrets)))?;
            sources.push(url);
        }

        let job = JobRequest {
            kind: request.kind,
            prompt: request.prompt.clone(),
            sources,
            count: request.count,
            video: request.video.clone(),
        };
        let response = provider
            .submit(&job)
            .map_err(|err| DispatchError::Submit(provider_detail(&err, &secrets)))?;

        let result_url = if request.kind.produces_video() {
            let (shape, url) =
                extract_video_url(&response).ok_or(DispatchError::UnrecognizedResponse("video"))?;
            debug!(shape, "matched video response shape");
            url
        } else {
            extract_image_urls(&response)
                .into_iter()
                .next()
                .ok_or(DispatchError::UnrecognizedResponse("image"))?
        };

        let media = provider
            .download(&result_url)
            .map_err(|err| DispatchError::Download(provider_detail(&err, &secrets)))?;
        let media_kind = if request.kind.produces_video() {
            MediaKind::Video
        } else {
            MediaKind::Image
        };
        let ext = output_extension(media.mime_type.as_deref(), &result_url, media_kind);
        let path = self
            .layout
            .write_new(
                media_kind,
                file_prefix(request.kind),
                ext,
                &media.bytes,
                self.clock.wall(),
            )
            .map_err(|err| DispatchError::Storage(provider_detail(&err, &secrets)))?;

        Ok(Produced {
            path,
            provider: provider.name().to_string(),
            response,
            result_url,
        })
    }

    fn finish(&self, request: &GenerationRequest, produced: Produced) -> Artifact {
        let thread_id = request.thread_id.as_str();
        let display_ref = self.layout.display_ref(&produced.path);
        let path_text = produced.path.to_string_lossy().to_string();

        if !request.kind.produces_video() {
            let inherited = request
                .targets
                .first()
                .and_then(|source| {
                    self.store
                        .snapshot(thread_id)
                        .and_then(|context| context.label_for(source).map(str::to_string))
                });
            let label = self.labeler.infer(&request.prompt).or(inherited);
            self.store
                .record_artifact(thread_id, &path_text, label.as_deref());
        }

        if self.config.write_receipts {
            let receipt = build_receipt(
                request,
                &produced.provider,
                &produced.response,
                &produced.path,
                &display_ref,
            );
            if let Err(err) = write_receipt(&receipt_path_for(&produced.path), &receipt) {
                warn!(path = %produced.path.display(), error = %err, "failed to write receipt");
            }
        }

        info!(
            thread_id = %thread_id,
            operation = request.kind.as_str(),
            path = %produced.path.display(),
            "artifact recorded"
        );
        self.emit(
            "artifact_recorded",
            thread_id,
            json!({
                "operation": request.kind.as_str(),
                "path": path_text,
                "display": display_ref,
                "result_url": produced.result_url,
            }),
        );

        Artifact {
            kind: request.kind,
            path: produced.path,
            display_ref,
        }
    }

    /// Rebuilds thread context from conversation messages after a restart.
    /// Returns the canonical paths that were added.
    pub fn recover_context(&self, thread_id: &str, messages: &[String]) -> Vec<String> {
        let scanner = RecoveryScanner::new(&self.layout, self.labeler.as_ref(), self.config.recovery_window);
        let recovered = scanner.scan(messages);
        if recovered.is_empty() {
            return Vec::new();
        }
        let added = self.store.restore(thread_id, &recovered);
        if !added.is_empty() {
            info!(thread_id = %thread_id, count = added.len(), "recovered media context from history");
            self.emit(
                "context_recovered",
                thread_id,
                json!({ "paths": added }),
            );
        }
        added
    }

    // A recent path whose file is gone would hide what recovery just added.
    fn repoint_stale_recent(&self, thread_id: &str, added: &[String]) {
        let stale = self
            .store
            .get_recent(thread_id)
            .map(|recent| !is_accessible(&recent, &self.layout))
            .unwrap_or(true);
        if !stale {
            return;
        }
        if let Some(latest) = added.last() {
            if self.store.set_recent(thread_id, latest) {
                debug!(thread_id = %thread_id, recent = %latest, "recent path moved to recovered artifact");
            }
        }
    }

    /// Copies a user-supplied image into storage and makes it the current
    /// target for the thread.
    pub fn register_upload(&self, invocation: &Invocation, source: &Path, note: Option<&str>) -> String {
        match self.register_upload_inner(invocation, source, note) {
            Ok(display_ref) => format!(
                "Image uploaded and ready to edit:\n\n{}",
                markup(MediaKind::Image, &display_ref, "Uploaded image")
            ),
            Err(error) => error.to_string(),
        }
    }

    fn register_upload_inner(
        &self,
        invocation: &Invocation,
        source: &Path,
        note: Option<&str>,
    ) -> Result<String, DispatchError> {
        let thread_id = self.threads.resolve(invocation)?;
        if media_kind_for_path(source) != Some(MediaKind::Image) {
            return Err(DispatchError::InvalidUpload(format!(
                "expected one of {}",
                UPLOAD_EXTENSIONS.join(", ")
            )));
        }
        let ext = source
            .extension()
            .and_then(|value| value.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| "png".to_string());
        let bytes = fs::read(source).map_err(|err| {
            DispatchError::InvalidUpload(format!("{} ({err})", source.display()))
        })?;
        let path = self
            .layout
            .write_new(MediaKind::Image, "upload", &ext, &bytes, self.clock.wall())
            .map_err(|err| DispatchError::Storage(provider_detail(&err, &[])))?;

        let stem = source
            .file_stem()
            .and_then(|value| value.to_str())
            .unwrap_or_default()
            .replace(['_', '-'], " ");
        let label = note
            .and_then(|note| self.labeler.infer(note))
            .or_else(|| self.labeler.infer(&stem));
        let path_text = path.to_string_lossy().to_string();
        self.store
            .record_artifact(&thread_id, &path_text, label.as_deref());

        let display_ref = self.layout.display_ref(&path);
        self.emit(
            "artifact_recorded",
            &thread_id,
            json!({
                "operation": "upload",
                "path": path_text,
                "display": display_ref,
                "label": label,
            }),
        );
        Ok(display_ref)
    }

    pub fn reset_thread(&self, invocation: &Invocation) -> String {
        let thread_id = match self.threads.resolve(invocation) {
            Ok(thread_id) => thread_id,
            Err(error) => return error.to_string(),
        };
        let cleared = self.store.clear(&thread_id);
        self.emit("thread_cleared", &thread_id, json!({ "had_context": cleared }));
        "Conversation media cleared. Upload or generate a new image to continue.".to_string()
    }

    pub fn describe_thread(&self, invocation: &Invocation) -> String {
        let thread_id = match self.threads.resolve(invocation) {
            Ok(thread_id) => thread_id,
            Err(error) => return error.to_string(),
        };
        let Some(context) = self.store.snapshot(&thread_id).filter(|context| !context.is_empty()) else {
            return format!("Thread {thread_id} has no images yet.");
        };
        let mut lines = vec![format!(
            "Thread {thread_id}: {} image(s) tracked.",
            context.uploaded_images.len()
        )];
        let current = context
            .recent_path
            .as_deref()
            .map(|path| self.display_for_reference(path))
            .unwrap_or_else(|| "none".to_string());
        lines.push(format!("Current target: {current}"));
        for (idx, path) in context.uploaded_images.iter().enumerate() {
            let mut line = format!("{}. {}", idx + 1, self.display_for_reference(path));
            if let Some(label) = context.label_for(path) {
                line.push_str(&format!(" [{label}]"));
            }
            lines.push(line);
        }
        lines.join("\n")
    }

    fn display_for_reference(&self, reference: &str) -> String {
        match self.layout.canonicalize_reference(reference) {
            Some(path) => self.layout.display_ref(&path),
            None => reference.to_string(),
        }
    }

    fn emit(&self, event_type: &str, thread_id: &str, payload: Value) {
        let Some(events) = self.events.as_ref() else {
            return;
        };
        let payload: EventPayload = map_object(payload);
        if let Err(err) = events.record(event_type, thread_id, payload) {
            warn!(event_type, error = %err, "failed to write event");
        }
    }
}

fn selection_error(error: SelectionError) -> DispatchError {
    match error {
        SelectionError::NoTarget => DispatchError::NoTarget,
        SelectionError::InsufficientImages { found } => DispatchError::InsufficientImages { found },
    }
}

fn output_extension(mime: Option<&str>, url: &str, kind: MediaKind) -> &'static str {
    if let Some(mime) = mime {
        let lowered = mime.to_ascii_lowercase();
        for (needle, ext) in [
            ("jpeg", "jpg"),
            ("jpg", "jpg"),
            ("webp", "webp"),
            ("png", "png"),
            ("gif", "gif"),
            ("webm", "webm"),
            ("mp4", "mp4"),
            ("quicktime", "mov"),
        ] {
            if lowered.contains(needle) {
                return ext;
            }
        }
    }
    let path_part = url.split(['?', '#']).next().unwrap_or(url);
    let from_url = media_kind_for_path(Path::new(path_part))
        .filter(|found| *found == kind)
        .and_then(|_| Path::new(path_part).extension())
        .and_then(|value| value.to_str())
        .map(str::to_ascii_lowercase);
    match (from_url.as_deref(), kind) {
        (Some("jpg" | "jpeg"), _) => "jpg",
        (Some("webp"), _) => "webp",
        (Some("gif"), _) => "gif",
        (Some("webm"), _) => "webm",
        (Some("mov"), _) => "mov",
        (_, MediaKind::Image) => "png",
        (_, MediaKind::Video) => "mp4",
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use anyhow::bail;
    use lumen_contracts::clock::{Clock, ManualClock};
    use lumen_contracts::dedup::Suppression;
    use lumen_contracts::events::EventLog;
    use lumen_contracts::providers::NamedProvider;
    use lumen_contracts::request::{OperationKind, VideoSettings};
    use serde_json::{json, Value};

    use super::{output_extension, Dispatcher, Outcome};
    use crate::config::EngineConfig;
    use crate::error::DispatchError;
    use crate::providers::{JobRequest, MediaBytes, MediaProvider};
    use crate::storage::{MediaKind, StorageLayout};
    use crate::thread_scope::Invocation;

    #[derive(Clone, Default)]
    struct Calls {
        uploads: Arc<Mutex<Vec<PathBuf>>>,
        submits: Arc<AtomicUsize>,
        jobs: Arc<Mutex<Vec<JobRequest>>>,
    }

    impl Calls {
        fn submits(&self) -> usize {
            self.submits.load(Ordering::SeqCst)
        }

        fn uploads(&self) -> Vec<PathBuf> {
            self.uploads.lock().map(|rows| rows.clone()).unwrap_or_default()
        }
    }

    struct FakeProvider {
        calls: Calls,
        image_response: Value,
        video_response: Value,
        fail_submit: Option<String>,
    }

    impl FakeProvider {
        fn new(calls: &Calls) -> Self {
            Self {
                calls: calls.clone(),
                image_response: json!({"output": ["https://cdn.example/out.png"]}),
                video_response: json!({"video": {"url": "https://cdn.example/out.mp4"}}),
                fail_submit: None,
            }
        }
    }

    impl NamedProvider for FakeProvider {
        fn name(&self) -> &str {
            "fake"
        }
    }

    impl MediaProvider for FakeProvider {
        fn upload(&self, path: &Path) -> anyhow::Result<String> {
            if let Ok(mut rows) = self.calls.uploads.lock() {
                rows.push(path.to_path_buf());
            }
            let name = path
                .file_name()
                .and_then(|value| value.to_str())
                .unwrap_or("x");
            Ok(format!("https://uploads.example/{name}"))
        }

        fn submit(&self, job: &JobRequest) -> anyhow::Result<Value> {
            self.calls.submits.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut rows) = self.calls.jobs.lock() {
                rows.push(job.clone());
            }
            if let Some(message) = &self.fail_submit {
                bail!("{message}");
            }
            if job.kind.produces_video() {
                Ok(self.video_response.clone())
            } else {
                Ok(self.image_response.clone())
            }
        }

        fn download(&self, url: &str) -> anyhow::Result<MediaBytes> {
            let mime = if url.ends_with(".mp4") { "video/mp4" } else { "image/png" };
            Ok(MediaBytes {
                bytes: format!("bytes for {url}").into_bytes(),
                mime_type: Some(mime.to_string()),
            })
        }
    }

    struct Harness {
        _temp: tempfile::TempDir,
        root: PathBuf,
        clock: ManualClock,
        calls: Calls,
        dispatcher: Dispatcher,
    }

    fn harness_with(
        configure: impl FnOnce(&mut EngineConfig),
        provider: impl FnOnce(&Calls) -> FakeProvider,
    ) -> anyhow::Result<Harness> {
        let temp = tempfile::tempdir()?;
        let root = temp.path().to_path_buf();
        let mut config = EngineConfig {
            storage_root: root.join("static"),
            api_key: Some("sk-test-secret-value".to_string()),
            legacy_thread_fallback: false,
            ..EngineConfig::default()
        };
        configure(&mut config);
        let clock = ManualClock::new();
        let calls = Calls::default();
        let dispatcher = Dispatcher::new(config)?
            .with_clock(Arc::new(clock.clone()))
            .with_provider(Box::new(provider(&calls)))
            .with_events(EventLog::new(root.join("events.jsonl"), "session-test"));
        Ok(Harness {
            _temp: temp,
            root,
            clock,
            calls,
            dispatcher,
        })
    }

    fn harness() -> anyhow::Result<Harness> {
        harness_with(|_| {}, FakeProvider::new)
    }

    fn seed_image(harness: &Harness, thread: &str, label: Option<&str>) -> anyhow::Result<String> {
        let layout = harness.dispatcher.layout();
        let path = layout.write_new(MediaKind::Image, "upload", "png", b"png", harness.clock_wall())?;
        let text = path.to_string_lossy().to_string();
        harness.dispatcher.store().record_artifact(thread, &text, label);
        Ok(text)
    }

    impl Harness {
        fn clock_wall(&self) -> std::time::SystemTime {
            self.clock.wall()
        }

        fn events(&self) -> Vec<Value> {
            fs::read_to_string(self.root.join("events.jsonl"))
                .unwrap_or_default()
                .lines()
                .filter_map(|line| serde_json::from_str(line).ok())
                .collect()
        }
    }

    #[test]
    fn generate_records_the_artifact_and_returns_markup() -> anyhow::Result<()> {
        let h = harness()?;
        let invocation = Invocation::for_thread("t1");
        let outcome = h.dispatcher.dispatch(&invocation, OperationKind::GenerateImage, "a cat in a hat", 1, None);

        let artifact = outcome.artifact().cloned().ok_or_else(|| anyhow::anyhow!("no artifact"))?;
        assert!(artifact.path.is_file());
        assert!(artifact.display_ref.starts_with("/static/assets/generated_"));
        assert!(outcome.message().contains(&format!("![Generated image]({})", artifact.display_ref)));

        let context = h.dispatcher.store().snapshot("t1").ok_or_else(|| anyhow::anyhow!("no context"))?;
        let path_text = artifact.path.to_string_lossy().to_string();
        assert_eq!(context.recent_path.as_deref(), Some(path_text.as_str()));
        assert_eq!(context.label_for(&path_text), Some("cat"));

        let receipt: Value = serde_json::from_str(&fs::read_to_string(
            lumen_contracts::receipts::receipt_path_for(&artifact.path),
        )?)?;
        assert_eq!(receipt["operation"], json!("generate_image"));
        assert_eq!(receipt["provider"], json!("fake"));

        let types: Vec<Value> = h.events().into_iter().map(|event| event["type"].clone()).collect();
        assert_eq!(types, vec![json!("generation_started"), json!("artifact_recorded")]);
        assert_eq!(h.dispatcher.guard().table_sizes().exact, 0);
        Ok(())
    }

    #[test]
    fn identical_edits_within_the_window_reach_the_provider_once() -> anyhow::Result<()> {
        let h = harness()?;
        seed_image(&h, "t1", Some("cat"))?;
        let invocation = Invocation::for_thread("t1");

        let first = h.dispatcher.edit_image(&invocation, "make it blue");
        assert!(first.starts_with("Here is your edited image:"));
        let second = h.dispatcher.edit_image(&invocation, "make it blue");
        assert!(second.contains("already"));
        assert_eq!(h.calls.submits(), 1);

        let suppressed: Vec<Value> = h
            .events()
            .into_iter()
            .filter(|event| event["type"] == json!("generation_suppressed"))
            .collect();
        assert_eq!(suppressed.len(), 1);
        Ok(())
    }

    #[test]
    fn identical_edit_after_the_window_runs_again() -> anyhow::Result<()> {
        let h = harness()?;
        seed_image(&h, "t1", None)?;
        let invocation = Invocation::for_thread("t1");

        h.dispatcher.edit_image(&invocation, "make it blue");
        h.clock.advance(Duration::from_secs(31));
        let again = h.dispatcher.edit_image(&invocation, "make it blue");
        assert!(again.starts_with("Here is your edited image:"));
        assert_eq!(h.calls.submits(), 2);
        Ok(())
    }

    #[test]
    fn distinct_style_edits_all_run() -> anyhow::Result<()> {
        let h = harness()?;
        seed_image(&h, "t1", None)?;
        let invocation = Invocation::for_thread("t1");
        for style in ["watercolor", "pixel art", "oil painting", "charcoal sketch", "neon"] {
            let reply = h.dispatcher.edit_image(&invocation, &format!("make it {style}"));
            assert!(reply.starts_with("Here is your edited image:"), "{reply}");
        }
        assert_eq!(h.calls.submits(), 5);
        Ok(())
    }

    #[test]
    fn edits_chain_from_the_latest_result() -> anyhow::Result<()> {
        let h = harness()?;
        let original = seed_image(&h, "t1", Some("cat"))?;
        let invocation = Invocation::for_thread("t1");

        let first = h
            .dispatcher
            .dispatch(&invocation, OperationKind::EditImage, "make it blue", 1, None);
        let edited = first.artifact().map(|a| a.path.to_string_lossy().to_string());
        assert_eq!(h.dispatcher.store().get_recent("t1"), edited);
        assert_eq!(h.calls.uploads(), vec![PathBuf::from(&original)]);

        h.dispatcher.edit_image(&invocation, "add a hat");
        let uploads = h.calls.uploads();
        assert_eq!(uploads.len(), 2);
        assert_eq!(Some(uploads[1].to_string_lossy().to_string()), edited);

        // Label carries over so "the cat" still resolves after an edit.
        let context = h.dispatcher.store().snapshot("t1").ok_or_else(|| anyhow::anyhow!("no context"))?;
        assert_eq!(context.label_for(edited.as_deref().unwrap_or_default()), Some("cat"));
        Ok(())
    }

    #[test]
    fn animation_targets_the_labeled_subject() -> anyhow::Result<()> {
        let h = harness()?;
        let cat = seed_image(&h, "t1", Some("cat"))?;
        let dog = seed_image(&h, "t1", Some("dog"))?;
        seed_image(&h, "t1", None)?;
        let invocation = Invocation::for_thread("t1");

        let reply = h
            .dispatcher
            .image_to_video(&invocation, "make the dog run", &VideoSettings::default());
        assert!(reply.contains("<video controls src=\"/static/videos/animated_"), "{reply}");
        assert_eq!(h.calls.uploads(), vec![PathBuf::from(&dog)]);
        assert_ne!(cat, dog);

        let jobs = h.calls.jobs.lock().map(|rows| rows.clone()).unwrap_or_default();
        assert_eq!(jobs[0].video, Some(VideoSettings::default()));
        Ok(())
    }

    #[test]
    fn edit_without_images_leaves_no_trace() -> anyhow::Result<()> {
        let h = harness()?;
        let reply = h.dispatcher.edit_image(&Invocation::for_thread("t1"), "make it blue");

        assert!(reply.contains("upload"));
        assert_eq!(h.calls.submits(), 0);
        assert_eq!(h.dispatcher.guard().table_sizes().total(), 0);
        assert!(h.dispatcher.store().snapshot("t1").is_none());
        Ok(())
    }

    #[test]
    fn unrecognized_video_shape_fails_cleanly() -> anyhow::Result<()> {
        let h = harness_with(
            |_| {},
            |calls| FakeProvider {
                video_response: json!({"result": {"href": "https://cdn.example/v.mp4"}}),
                ..FakeProvider::new(calls)
            },
        )?;
        let invocation = Invocation::for_thread("t1");
        let outcome = h.dispatcher.dispatch(
            &invocation,
            OperationKind::TextToVideo,
            "waves at night",
            1,
            Some(VideoSettings::default()),
        );

        assert!(matches!(
            outcome,
            Outcome::Failed {
                error: DispatchError::UnrecognizedResponse("video"),
                ..
            }
        ));
        assert!(outcome.message().starts_with("Sorry, the video generation failed."));
        assert_eq!(h.dispatcher.guard().table_sizes().exact, 0);
        assert_eq!(fs::read_dir(h.dispatcher.layout().videos_dir())?.count(), 0);
        assert!(h.dispatcher.store().snapshot("t1").is_none());
        Ok(())
    }

    #[test]
    fn provider_failure_is_redacted_and_global_lock_still_applies() -> anyhow::Result<()> {
        let h = harness_with(
            |_| {},
            |calls| FakeProvider {
                fail_submit: Some("401 unauthorized for key sk-test-secret-value".to_string()),
                ..FakeProvider::new(calls)
            },
        )?;
        let invocation = Invocation::for_thread("t1");

        let reply = h.dispatcher.generate_image(&invocation, "a lighthouse", 1);
        assert!(reply.starts_with("Sorry, the image generation failed."));
        assert!(!reply.contains("sk-test-secret-value"));
        assert_eq!(h.dispatcher.guard().table_sizes().exact, 0);

        h.clock.advance(Duration::from_secs(11));
        let retry = h.dispatcher.generate_image(&invocation, "a lighthouse", 1);
        assert_eq!(retry, Suppression::GlobalPrompt.message(OperationKind::GenerateImage));

        h.clock.advance(Duration::from_secs(20));
        h.dispatcher.generate_image(&invocation, "a lighthouse", 1);
        assert_eq!(h.calls.submits(), 2);

        let failed = h
            .events()
            .into_iter()
            .find(|event| event["type"] == json!("generation_failed"))
            .ok_or_else(|| anyhow::anyhow!("no failure event"))?;
        assert_eq!(failed["error_code"], json!("submit_failed"));
        assert!(!failed.to_string().contains("sk-test-secret-value"));
        Ok(())
    }

    #[test]
    fn fusion_requires_two_recent_images() -> anyhow::Result<()> {
        let h = harness()?;
        seed_image(&h, "t1", None)?;
        let invocation = Invocation::for_thread("t1");

        let reply = h.dispatcher.fuse_images(&invocation, "blend them", 1);
        assert_eq!(reply, DispatchError::InsufficientImages { found: 1 }.to_string());
        assert_eq!(h.calls.submits(), 0);

        seed_image(&h, "t1", None)?;
        let reply = h.dispatcher.fuse_images(&invocation, "blend them", 1);
        assert!(reply.starts_with("Here is your combined image:"), "{reply}");
        assert_eq!(h.calls.uploads().len(), 2);

        let jobs = h.calls.jobs.lock().map(|rows| rows.clone()).unwrap_or_default();
        assert_eq!(jobs[0].sources.len(), 2);
        assert_eq!(jobs[0].count, 1);

        h.clock.advance(Duration::from_secs(31));
        let reply = h.dispatcher.fuse_images(&invocation, "blend them into a collage", 3);
        assert!(reply.starts_with("Here is your combined image:"), "{reply}");
        let jobs = h.calls.jobs.lock().map(|rows| rows.clone()).unwrap_or_default();
        assert_eq!(jobs.last().map(|job| job.count), Some(3));
        Ok(())
    }

    #[test]
    fn stale_images_are_excluded_from_fusion() -> anyhow::Result<()> {
        let h = harness()?;
        seed_image(&h, "t1", None)?;
        seed_image(&h, "t1", None)?;
        h.clock.advance(Duration::from_secs(601));

        let reply = h.dispatcher.fuse_images(&Invocation::for_thread("t1"), "blend them", 1);
        assert_eq!(reply, DispatchError::InsufficientImages { found: 0 }.to_string());
        Ok(())
    }

    #[test]
    fn recovery_rebuilds_context_after_restart() -> anyhow::Result<()> {
        let h = harness()?;
        let layout = StorageLayout::new(&h.root.join("static"), "assets", "videos", "/static");
        let saved = layout.write_new(MediaKind::Image, "generated", "png", b"png", h.clock_wall())?;
        let name = saved.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();
        let invocation = Invocation::for_thread("t1").with_history([
            "draw a horse".to_string(),
            format!("Here is your generated image:\n\n![Generated image](/static/assets/{name})"),
        ]);

        let reply = h
            .dispatcher
            .image_to_video(&invocation, "make it gallop", &VideoSettings::default());
        assert!(reply.contains("<video"), "{reply}");
        assert_eq!(h.calls.uploads(), vec![saved.clone()]);

        let history = h.dispatcher.store().get_history("t1");
        assert_eq!(history, vec![saved.to_string_lossy().to_string()]);
        assert!(h
            .events()
            .iter()
            .any(|event| event["type"] == json!("context_recovered")));
        Ok(())
    }

    #[test]
    fn recovery_replaces_a_recent_path_whose_file_is_gone() -> anyhow::Result<()> {
        let h = harness()?;
        let stale = seed_image(&h, "t1", None)?;
        fs::remove_file(&stale)?;
        let saved = h
            .dispatcher
            .layout()
            .write_new(MediaKind::Image, "generated", "png", b"png", h.clock_wall())?;
        let name = saved.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();
        let invocation = Invocation::for_thread("t1")
            .with_history([format!("![img](/static/assets/{name})")]);

        let reply = h
            .dispatcher
            .image_to_video(&invocation, "make it move", &VideoSettings::default());
        assert!(reply.contains("<video"), "{reply}");
        assert_eq!(h.calls.uploads(), vec![saved.clone()]);
        let saved_text = saved.to_string_lossy().to_string();
        assert_eq!(h.dispatcher.store().get_history("t1"), vec![stale, saved_text.clone()]);
        assert_eq!(h.dispatcher.store().get_recent("t1"), Some(saved_text));
        Ok(())
    }

    #[test]
    fn recovery_does_not_duplicate_tracked_entries() -> anyhow::Result<()> {
        let h = harness()?;
        let tracked = seed_image(&h, "t1", Some("cat"))?;
        let name = Path::new(&tracked)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        let added = h.dispatcher.recover_context(
            "t1",
            &[format!("![img](/static/assets/{name})"), format!("assets/{name}")],
        );
        assert!(added.is_empty());
        assert_eq!(h.dispatcher.store().get_history("t1"), vec![tracked]);
        Ok(())
    }

    #[test]
    fn missing_thread_id_is_rejected_without_side_effects() -> anyhow::Result<()> {
        let h = harness()?;
        let reply = h.dispatcher.generate_image(&Invocation::default(), "a cat", 1);
        assert_eq!(reply, DispatchError::MissingThread.to_string());
        assert_eq!(h.calls.submits(), 0);
        assert_eq!(h.dispatcher.guard().table_sizes().total(), 0);
        Ok(())
    }

    #[test]
    fn legacy_fallback_reuses_the_last_thread() -> anyhow::Result<()> {
        let h = harness_with(|config| config.legacy_thread_fallback = true, FakeProvider::new)?;
        h.dispatcher.generate_image(&Invocation::for_thread("t9"), "a cat", 1);
        h.clock.advance(Duration::from_secs(1));
        h.dispatcher.generate_image(&Invocation::default(), "a dog", 1);
        assert_eq!(h.dispatcher.store().get_history("t9").len(), 2);
        Ok(())
    }

    #[test]
    fn threads_do_not_share_context_or_locks() -> anyhow::Result<()> {
        let h = harness()?;
        seed_image(&h, "a", None)?;
        seed_image(&h, "b", None)?;
        h.dispatcher.edit_image(&Invocation::for_thread("a"), "make it blue");
        let other = h.dispatcher.edit_image(&Invocation::for_thread("b"), "make it blue");
        assert!(other.starts_with("Here is your edited image:"));
        assert_eq!(h.calls.submits(), 2);
        assert_eq!(h.dispatcher.store().get_history("a").len(), 2);
        assert_eq!(h.dispatcher.store().get_history("b").len(), 2);
        Ok(())
    }

    #[test]
    fn concurrent_duplicates_reach_the_provider_once() -> anyhow::Result<()> {
        let h = harness()?;
        seed_image(&h, "t1", None)?;
        let dispatcher = &h.dispatcher;
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| dispatcher.edit_image(&Invocation::for_thread("t1"), "make it blue"));
            }
        });
        assert_eq!(h.calls.submits(), 1);
        Ok(())
    }

    #[test]
    fn uploads_are_copied_labeled_and_targeted() -> anyhow::Result<()> {
        let h = harness()?;
        let source = h.root.join("my_cat.JPG");
        fs::write(&source, b"jpeg")?;
        let invocation = Invocation::for_thread("t1");

        let reply = h.dispatcher.register_upload(&invocation, &source, None);
        assert!(reply.contains("![Uploaded image](/static/assets/upload_"), "{reply}");

        let context = h.dispatcher.store().snapshot("t1").ok_or_else(|| anyhow::anyhow!("no context"))?;
        let recent = context.recent_path.clone().unwrap_or_default();
        assert!(recent.ends_with(".jpg"));
        assert!(Path::new(&recent).is_file());
        assert_eq!(context.label_for(&recent), Some("cat"));

        let text = h.root.join("notes.txt");
        fs::write(&text, b"hi")?;
        let rejected = h.dispatcher.register_upload(&invocation, &text, None);
        assert!(rejected.starts_with("That file could not be used"));
        Ok(())
    }

    #[test]
    fn reset_and_describe_thread() -> anyhow::Result<()> {
        let h = harness()?;
        let invocation = Invocation::for_thread("t1");
        assert_eq!(h.dispatcher.describe_thread(&invocation), "Thread t1 has no images yet.");

        seed_image(&h, "t1", Some("cat"))?;
        let described = h.dispatcher.describe_thread(&invocation);
        assert!(described.starts_with("Thread t1: 1 image(s) tracked."));
        assert!(described.contains("Current target: /static/assets/upload_"));
        assert!(described.contains("[cat]"));

        h.dispatcher.reset_thread(&invocation);
        assert!(h.dispatcher.store().snapshot("t1").is_none());
        let reply = h.dispatcher.edit_image(&invocation, "make it blue");
        assert_eq!(reply, DispatchError::NoTarget.to_string());
        Ok(())
    }

    #[test]
    fn empty_prompt_is_rejected() -> anyhow::Result<()> {
        let h = harness()?;
        let reply = h.dispatcher.generate_image(&Invocation::for_thread("t1"), "   ", 1);
        assert_eq!(reply, DispatchError::EmptyPrompt.to_string());
        Ok(())
    }

    #[test]
    fn unknown_provider_is_a_startup_error() {
        let config = EngineConfig {
            provider: "nope".to_string(),
            ..EngineConfig::default()
        };
        assert!(Dispatcher::new(config).is_err());
    }

    #[test]
    fn output_extension_prefers_mime_then_url() {
        assert_eq!(output_extension(Some("image/jpeg"), "x", MediaKind::Image), "jpg");
        assert_eq!(output_extension(None, "https://x/a.webp?sig=1", MediaKind::Image), "webp");
        assert_eq!(output_extension(None, "https://x/a", MediaKind::Video), "mp4");
        assert_eq!(output_extension(None, "https://x/a.png", MediaKind::Video), "mp4");
    }
}
