use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::Level;

use chatstream_core::ids::SessionId;
use chatstream_core::messages::Message;
use chatstream_engine::{ChatEngine, EngineConfig, SubmitRequest};
use chatstream_source::mock::{MockResponse, MockSessions, MockSource, MockUploader};
use chatstream_source::ndjson::decode_transcript;
use chatstream_telemetry::{init_telemetry, LogFormat, TelemetryConfig};

#[derive(Parser)]
#[command(name = "chatstream", about = "Streaming chat engine tools")]
struct Cli {
    /// Emit logs as JSON instead of human-readable lines.
    #[arg(long, global = true)]
    json_logs: bool,

    /// Log engine internals at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run packet transcripts (one JSONL file per turn) through the engine
    /// and print the resulting conversation.
    Replay {
        #[arg(required = true)]
        transcripts: Vec<PathBuf>,
        /// User message for each turn, in order.
        #[arg(short, long)]
        message: Vec<String>,
        /// Engine config as JSON.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Existing history (JSON array of messages) to continue from.
        #[arg(long)]
        history: Option<PathBuf>,
    },
    /// Count the packet kinds in a transcript.
    Inspect { transcript: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let telemetry = init_telemetry(TelemetryConfig {
        format: if cli.json_logs { LogFormat::Json } else { LogFormat::Pretty },
        ..Default::default()
    });
    if cli.verbose {
        if let Err(e) = telemetry.set_module_level("chatstream_engine", Level::DEBUG) {
            tracing::warn!(error = %e, "could not raise engine log level");
        }
    }

    match cli.command {
        Command::Replay {
            transcripts,
            message,
            config,
            history,
        } => replay(&transcripts, &message, config.as_deref(), history.as_deref()).await,
        Command::Inspect { transcript } => inspect(&transcript),
    }
}

async fn replay(
    transcripts: &[PathBuf],
    messages: &[String],
    config: Option<&Path>,
    history: Option<&Path>,
) -> Result<()> {
    let config = match config {
        Some(path) => serde_json::from_str::<EngineConfig>(&read(path)?)
            .with_context(|| format!("invalid engine config {}", path.display()))?,
        None => EngineConfig::default(),
    };

    let mut responses = Vec::with_capacity(transcripts.len());
    for path in transcripts {
        let packets = decode_transcript(&read(path)?)
            .with_context(|| format!("failed to decode {}", path.display()))?;
        responses.push(MockResponse::Packets(packets));
    }

    let engine = ChatEngine::new(
        Arc::new(MockSource::new(responses)),
        Arc::new(MockSessions::new()),
        Arc::new(MockUploader::empty()),
        config,
    );

    if let Some(path) = history {
        let history: Vec<Message> = serde_json::from_str(&read(path)?)
            .with_context(|| format!("invalid history {}", path.display()))?;
        engine.load_session(SessionId::from_raw("replay"), history)?;
    }

    let mut turns = Vec::with_capacity(transcripts.len());
    for (i, path) in transcripts.iter().enumerate() {
        let text = messages.get(i).cloned().unwrap_or_else(|| format!("turn {}", i + 1));
        let turn = match engine.submit(SubmitRequest::new(text)).await {
            Ok(report) => json!({
                "transcript": path.display().to_string(),
                "session": report.session.to_string(),
                "outcome": format!("{:?}", report.outcome).to_lowercase(),
            }),
            Err(e) => {
                tracing::warn!(transcript = %path.display(), error = %e, kind = e.error_kind(), "turn failed");
                json!({
                    "transcript": path.display().to_string(),
                    "outcome": "failed",
                    "error": e.to_string(),
                })
            }
        };
        turns.push(turn);
    }

    let session = engine.current_session();
    let output = json!({
        "session": session.to_string(),
        "turns": turns,
        "chat_state": engine.current_chat_state(&session),
        "can_continue": engine.can_continue(&session),
        "chain": engine.current_chain(&session),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn inspect(path: &Path) -> Result<()> {
    let packets = decode_transcript(&read(path)?)
        .with_context(|| format!("failed to decode {}", path.display()))?;
    let mut kinds: BTreeMap<&'static str, usize> = BTreeMap::new();
    for packet in &packets {
        *kinds.entry(packet.kind()).or_default() += 1;
    }
    let output = json!({
        "packets": packets.len(),
        "kinds": kinds,
        "starts_with_ids": packets.first().is_some_and(|p| p.kind() == "id_assignment"),
        "errors": packets.iter().filter(|p| p.is_error()).count(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}
