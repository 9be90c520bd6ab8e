use std::io::{self, ErrorKind, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use lumen_contracts::chat::{parse_intent, Intent, CHAT_HELP_COMMANDS};
use lumen_contracts::events::EventLog;
use lumen_contracts::request::{OperationKind, VideoSettings};
use lumen_engine::{Dispatcher, EngineConfig, Invocation};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Messages kept for context recovery, matching the scanner window.
const TRANSCRIPT_LIMIT: usize = 10;

#[derive(Debug, Parser)]
#[command(name = "lumen-rs", version, about = "Conversational image and video generation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Chat(ChatArgs),
    Run(RunArgs),
}

#[derive(Debug, Args)]
struct CommonArgs {
    /// Storage root holding the assets and videos directories.
    #[arg(long)]
    root: Option<PathBuf>,
    #[arg(long)]
    provider: Option<String>,
    #[arg(long)]
    thread: Option<String>,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[arg(long, default_value = "generate_image")]
    operation: String,
    #[arg(long)]
    prompt: String,
    #[arg(long, default_value_t = 1)]
    count: u32,
    /// Earlier conversation messages, oldest first, for context recovery.
    #[arg(long = "message")]
    messages: Vec<String>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("lumen-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Chat(args) => {
            run_chat(args)?;
            Ok(0)
        }
        Command::Run(args) => run_once(args),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn build_dispatcher(common: &CommonArgs, session_id: &str) -> Result<Dispatcher> {
    let mut config = EngineConfig::from_env();
    if let Some(root) = &common.root {
        config.storage_root = root.clone();
    }
    if let Some(provider) = &common.provider {
        config.provider = provider.trim().to_ascii_lowercase();
    }
    if let Some(events) = &common.events {
        config.events_path = Some(events.clone());
    }
    let events_path = config.events_path.clone();
    let mut dispatcher = Dispatcher::new(config).context("failed to start dispatcher")?;
    if let Some(path) = events_path {
        dispatcher = dispatcher.with_events(EventLog::new(path, session_id));
    }
    Ok(dispatcher)
}

fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn run_chat(args: ChatArgs) -> Result<()> {
    let session_id = new_session_id();
    let dispatcher = build_dispatcher(&args.common, &session_id)?;
    let thread_id = args
        .common
        .thread
        .clone()
        .unwrap_or_else(|| format!("chat-{session_id}"));
    info!(thread_id = %thread_id, provider = %dispatcher.config().provider, "chat session started");
    let mut session = ChatSession::new(&dispatcher, thread_id);

    println!("Lumen chat started. Type /help for commands.");
    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input = line.trim_end_matches(['\n', '\r']);
        if let Some(reply) = session.handle(input) {
            println!("{reply}");
        }
    }
    Ok(())
}

fn run_once(args: RunArgs) -> Result<i32> {
    let session_id = new_session_id();
    let dispatcher = build_dispatcher(&args.common, &session_id)?;
    let kind: OperationKind = serde_json::from_value(Value::String(args.operation.clone()))
        .with_context(|| format!("unknown operation '{}'", args.operation))?;
    let mut invocation = Invocation::default().with_history(args.messages.iter().cloned());
    invocation.thread_id = args.common.thread.clone();

    let video = kind.produces_video().then(VideoSettings::default);
    let outcome = dispatcher.dispatch(&invocation, kind, &args.prompt, args.count, video);
    println!("{}", outcome.message());
    Ok(if outcome.artifact().is_some() { 0 } else { 2 })
}

/// Per-thread chat state: the active thread, its generation settings and a
/// short transcript used for context recovery.
struct ChatSession<'a> {
    dispatcher: &'a Dispatcher,
    thread_id: String,
    count: u32,
    video: VideoSettings,
    transcript: Vec<String>,
}

impl<'a> ChatSession<'a> {
    fn new(dispatcher: &'a Dispatcher, thread_id: String) -> Self {
        Self {
            dispatcher,
            thread_id,
            count: 1,
            video: VideoSettings::default(),
            transcript: Vec::new(),
        }
    }

    fn invocation(&self) -> Invocation {
        Invocation::for_thread(&self.thread_id).with_history(self.transcript.iter().cloned())
    }

    fn remember(&mut self, text: &str) {
        self.transcript.push(text.to_string());
        let excess = self.transcript.len().saturating_sub(TRANSCRIPT_LIMIT);
        self.transcript.drain(..excess);
    }

    fn handle(&mut self, input: &str) -> Option<String> {
        let intent = parse_intent(input);
        let reply = match intent.action.as_str() {
            "noop" => return None,
            "help" => format!("Commands: {}", CHAT_HELP_COMMANDS.join(" ")),
            "generate_image" | "edit_image" | "text_to_video" | "image_to_video"
            | "fuse_images" => self.run_operation(&intent),
            "update_settings" => self.apply_settings(&intent),
            "invalid_setting" => format!(
                "Invalid value for {}: '{}'",
                arg_text(&intent, "setting"),
                arg_text(&intent, "value")
            ),
            "upload" => {
                let path = arg_text(&intent, "path");
                if path.is_empty() {
                    "/upload requires a path".to_string()
                } else {
                    let reply = self
                        .dispatcher
                        .register_upload(&self.invocation(), &PathBuf::from(&path), None);
                    self.remember(&reply);
                    reply
                }
            }
            "set_thread" => {
                let requested = arg_text(&intent, "thread_id");
                if requested.is_empty() {
                    format!("Current thread: {}", self.thread_id)
                } else {
                    self.thread_id = requested;
                    self.transcript.clear();
                    format!("Switched to thread {}", self.thread_id)
                }
            }
            "reset" => {
                self.transcript.clear();
                self.dispatcher.reset_thread(&self.invocation())
            }
            "history" => self.dispatcher.describe_thread(&self.invocation()),
            "unknown" => format!("Unknown command: /{}", arg_text(&intent, "command")),
            other => format!("Unsupported action: {other}"),
        };
        Some(reply)
    }

    fn run_operation(&mut self, intent: &Intent) -> String {
        let Some(prompt) = intent.prompt.clone() else {
            return format!("/{} requires a prompt", command_for(&intent.action));
        };
        let Ok(kind) = serde_json::from_value::<OperationKind>(Value::String(intent.action.clone()))
        else {
            return format!("Unsupported action: {}", intent.action);
        };
        let invocation = self.invocation();
        let reply = match kind {
            OperationKind::GenerateImage => {
                self.dispatcher.generate_image(&invocation, &prompt, self.count)
            }
            OperationKind::EditImage => self.dispatcher.edit_image(&invocation, &prompt),
            OperationKind::TextToVideo => {
                self.dispatcher.text_to_video(&invocation, &prompt, &self.video)
            }
            OperationKind::ImageToVideo => {
                self.dispatcher.image_to_video(&invocation, &prompt, &self.video)
            }
            OperationKind::FuseImages => {
                self.dispatcher.fuse_images(&invocation, &prompt, self.count)
            }
        };
        self.remember(&prompt);
        self.remember(&reply);
        reply
    }

    fn apply_settings(&mut self, intent: &Intent) -> String {
        let mut applied = Vec::new();
        for (key, value) in &intent.settings_update {
            let number = value.as_u64().and_then(|raw| u32::try_from(raw).ok());
            let text = value.as_str().map(str::to_string);
            match (key.as_str(), number, text) {
                ("count", Some(count), _) => self.count = count,
                ("num_frames", Some(frames), _) => self.video.num_frames = frames,
                ("frames_per_second", Some(fps), _) => self.video.frames_per_second = fps,
                ("resolution", _, Some(resolution)) => self.video.resolution = resolution,
                ("aspect_ratio", _, Some(aspect)) => self.video.aspect_ratio = aspect,
                _ => continue,
            }
            applied.push(format!("{key}={value}"));
        }
        if applied.is_empty() {
            "No settings changed".to_string()
        } else {
            format!("Settings updated: {}", applied.join(", "))
        }
    }
}

fn arg_text(intent: &Intent, key: &str) -> String {
    intent
        .command_args
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default()
        .to_string()
}

fn command_for(action: &str) -> &'static str {
    match action {
        "edit_image" => "edit",
        "text_to_video" => "video",
        "image_to_video" => "animate",
        "fuse_images" => "fuse",
        _ => "generate",
    }
}
