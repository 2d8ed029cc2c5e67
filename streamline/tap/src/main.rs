//! Streamline Tap - One-Shot Stream Consumer
//!
//! Opens a single event stream, feeds it through the engine and prints the
//! response as it arrives. Content goes to stdout; stages, errors and logs go
//! to stderr.
//!
//! # Usage
//!
//! ```bash
//! # GET an event stream
//! streamline-tap https://example.com/events
//!
//! # POST a JSON payload with a token and extra headers
//! streamline-tap https://example.com/chat/stream \
//!     --payload '{"prompt": "hello"}' \
//!     --token "$TOKEN" -H "X-Client: tap"
//!
//! # Print the final session snapshot as JSON
//! streamline-tap https://example.com/chat/stream --json
//!
//! # Verbose logging
//! RUST_LOG=debug streamline-tap https://example.com/events
//! ```
//!
//! # Signals
//!
//! - `SIGINT`: Cancel the stream (closes the connection and fails the message)

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use streamline_core::{
    default_config_path, load_config_from_path, ChunkDecoder, ConfigOverrides, EngineEvent,
    EngineSink, ErrorInfo, HttpEventSource, MessageId, MessageRole, MessageStatus, StageStatus,
    StreamAdapter, StreamEngine, StreamOutcome, StreamRequest, StreamlineConfig,
};

/// Streamline Tap - open one event stream and print the response
#[derive(Parser, Debug)]
#[command(name = "streamline-tap")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Event stream URL
    url: String,

    /// JSON body to POST (GET when omitted)
    #[arg(short = 'p', long, value_name = "JSON")]
    payload: Option<String>,

    /// Bearer token
    #[arg(short = 't', long, value_name = "TOKEN")]
    token: Option<String>,

    /// Extra header, repeatable
    #[arg(short = 'H', long = "header", value_name = "NAME:VALUE")]
    headers: Vec<String>,

    /// Session to stream into
    #[arg(short = 's', long, value_name = "ID")]
    session: Option<String>,

    /// Configuration file
    #[arg(short = 'c', long, env = "STREAMLINE_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Fail on payloads that need a fallback to decode
    #[arg(long)]
    strict: bool,

    /// Print the final snapshot as JSON instead of streaming text
    #[arg(long)]
    json: bool,

    /// Log level
    #[arg(short = 'l', long, env = "STREAMLINE_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if self.strict {
            overrides = overrides.with_strict(true);
        }
        if let Some(ref session) = self.session {
            overrides = overrides.with_default_session(session.clone());
        }
        if let Some(ref token) = self.token {
            overrides = overrides.with_bearer_token(token.clone());
        }
        overrides
    }

    /// Apply CLI overrides and re-check the result
    fn apply_overrides(&self, config: &mut StreamlineConfig) -> Result<()> {
        self.overrides().apply(config);
        config.validate().context("Invalid configuration")
    }

    fn request(&self) -> Result<StreamRequest> {
        let mut request = match self.payload {
            Some(ref raw) => {
                let payload: Value =
                    serde_json::from_str(raw).context("--payload is not valid JSON")?;
                StreamRequest::post(&self.url, payload)
            }
            None => StreamRequest::get(&self.url),
        };

        for header in &self.headers {
            let (name, value) = header
                .split_once(':')
                .with_context(|| format!("Invalid header {header:?}, expected NAME:VALUE"))?;
            request = request.with_header(name.trim(), value.trim());
        }

        Ok(request)
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "streamline_tap={level},streamline_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn stage_label(status: &StageStatus) -> String {
    match status {
        StageStatus::InProgress => "..".to_string(),
        StageStatus::Completed => "ok".to_string(),
        StageStatus::Error => "!!".to_string(),
        StageStatus::Unrecognized(value) => value.to_string(),
    }
}

/// Print content deltas and stage changes until the engine stops sending
async fn print_events(mut events: mpsc::Receiver<EngineEvent>, quiet: bool) {
    let mut printed: HashMap<MessageId, usize> = HashMap::new();
    let mut stages: HashMap<String, (Option<u8>, String)> = HashMap::new();
    let mut stdout = std::io::stdout();

    while let Some(event) = events.recv().await {
        if quiet {
            continue;
        }

        match event {
            EngineEvent::Snapshot(snapshot) => {
                for stage in &snapshot.stages {
                    let seen = (stage.status.ordinal(), stage.message.clone());
                    if stages.get(&stage.content) != Some(&seen) {
                        eprintln!(
                            "[{}] {} {}",
                            stage_label(&stage.status),
                            stage.content,
                            stage.message
                        );
                        stages.insert(stage.content.clone(), seen);
                    }
                }

                for message in snapshot
                    .messages
                    .iter()
                    .filter(|m| m.sender == MessageRole::Assistant && m.status != MessageStatus::Error)
                {
                    let done = printed.entry(message.id.clone()).or_insert(0);
                    if let Some(delta) = message.content.get(*done..) {
                        if !delta.is_empty() {
                            print!("{delta}");
                            let _ = stdout.flush();
                            *done = message.content.len();
                        }
                    }
                }
            }
            EngineEvent::StreamError { error, .. } => eprintln!("\nerror: {error}"),
            EngineEvent::Cleared { .. } => {
                printed.clear();
                stages.clear();
            }
        }
    }

    if !quiet {
        println!();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let mut config = load_config_from_path(args.config.clone().or_else(default_config_path))
        .context("Failed to load configuration")?;
    args.apply_overrides(&mut config)?;
    info!(source = %config.source(), session = %config.default_session, "Configuration loaded");

    let request = args.request()?;
    let adapter = StreamAdapter::new(
        HttpEventSource::new(config.http_config()).context("Failed to create HTTP client")?,
    )
    .with_decoder(ChunkDecoder::new(config.decode_mode));

    let engine = Arc::new(StreamEngine::with_config(config.engine_config()));
    let session = config.default_session.clone();
    let (subscriber, events) = engine.subscribe();
    let printer = tokio::spawn(print_events(events, args.json));

    let connection = adapter
        .open(&request)
        .await
        .with_context(|| format!("Failed to open {}", request.url))?;
    let cancel = connection.cancel_handle();
    let message_id = engine.start_stream(&session, None);
    let mut sink = EngineSink::new(&engine, session.clone(), message_id.clone());

    let outcome = tokio::select! {
        outcome = adapter.pump(connection, &mut sink) => outcome,
        _ = signal::ctrl_c() => {
            warn!("Interrupted, cancelling stream");
            // Closing the connection and failing the message go together
            cancel.cancel();
            engine.end_stream(
                &session,
                Some(&message_id),
                Some(ErrorInfo::new("cancelled by user").with_kind("cancelled")),
            )?;
            StreamOutcome::Cancelled
        }
    };

    engine.unsubscribe(subscriber);
    printer.await.context("Printer task failed")?;

    if args.json {
        let snapshot = engine.snapshot(&session);
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }

    match outcome {
        StreamOutcome::Completed => {
            info!(message_id = %message_id, "Stream completed");
            Ok(())
        }
        StreamOutcome::Cancelled => {
            info!(message_id = %message_id, "Stream cancelled");
            Ok(())
        }
        StreamOutcome::Failed(e) => {
            error!(message_id = %message_id, error = %e, "Stream failed");
            anyhow::bail!("Stream failed: {e}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamline_core::DecodeMode;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["streamline-tap", "http://localhost/stream"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_strict_flag_reaches_config() {
        let mut config = StreamlineConfig::new();
        args(&["--strict"]).apply_overrides(&mut config).unwrap();
        assert_eq!(config.decode_mode, DecodeMode::Strict);
        assert_eq!(config.engine_config().decode_mode, DecodeMode::Strict);
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let mut config = StreamlineConfig::new();
        assert!(args(&["--session", "  "]).apply_overrides(&mut config).is_err());
    }

    #[test]
    fn test_request_from_args() {
        let request = args(&["-p", r#"{"q":1}"#, "-H", "X-Client: tap"])
            .request()
            .unwrap();
        assert_eq!(request.payload, serde_json::json!({"q": 1}));
        assert_eq!(request.headers, vec![("X-Client".to_string(), "tap".to_string())]);

        assert!(args(&["-H", "no-colon"]).request().is_err());
        assert!(args(&[]).request().unwrap().payload.is_null());
    }
}
