//! Streamline Core - Streaming Session Engine
//!
//! This crate turns an incremental, server-pushed event stream (content
//! tokens, progress stages, errors, completion signals) into a coherent view
//! of one or more in-flight AI responses. It knows nothing about rendering,
//! persistence, or prompt construction: UI layers subscribe to snapshots and
//! render what they are told.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Event Source                              │
//! │        (HTTP/SSE via HttpEventSource, or ScriptedEventSource)     │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 │ SourceEvent (open / frame / error)
//! ┌───────────────────────────────▼──────────────────────────────────┐
//! │  StreamAdapter ── envelope::translate ──► ChunkDecoder            │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 │ Chunk (content / stage / error / done)
//! ┌───────────────────────────────▼──────────────────────────────────┐
//! │                         StreamEngine                              │
//! │  ┌─────────────────────┐  ┌─────────────────────┐                │
//! │  │ SessionState "a"    │  │ SessionState "b"    │  ...            │
//! │  │  Messages + Stages  │  │  Messages + Stages  │                │
//! │  └─────────────────────┘  └─────────────────────┘                │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 │ EngineEvent (snapshot / error)
//!                                 ▼
//!                          UI subscribers
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use streamline_core::{
//!     HttpEventSource, HttpSourceConfig, SessionId, StreamAdapter, StreamEngine, StreamRequest,
//! };
//!
//! let engine = StreamEngine::new();
//! let (_id, mut events) = engine.subscribe();
//!
//! let adapter = StreamAdapter::new(HttpEventSource::new(HttpSourceConfig::default())?);
//! let request = StreamRequest::post("https://example.com/chat/stream", payload)
//!     .with_bearer_token(token);
//!
//! let (message_id, outcome) = adapter
//!     .drive(&engine, &SessionId::default(), None, &request)
//!     .await;
//! ```
//!
//! # Module Overview
//!
//! - [`chunk`]: Wire-level chunk variants and the best-effort decoder
//! - [`stage`]: Progress stages and the upsert-by-label ledger
//! - [`message`]: Messages and their pending → streaming → terminal state machine
//! - [`session`]: Per-session state (messages, stages, active stream slot)
//! - [`engine`]: The session manager that routes chunks and notifies subscribers
//! - [`subscribers`]: Subscriber registry and engine events
//! - [`transport`]: Event-source capability, HTTP implementation, and the adapter
//! - [`config`]: TOML + environment configuration
//!
//! # Pairing Requirement
//!
//! [`StreamEngine::end_stream`] only updates local state. It never severs the
//! underlying connection; callers that cancel a stream must also call
//! [`transport::CancelHandle::cancel`] (or [`transport::Connection::close`]),
//! otherwise the connection stays open even though the message is terminal.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod chunk;
pub mod config;
pub mod engine;
pub mod message;
pub mod session;
pub mod stage;
pub mod subscribers;
pub mod transport;

// Re-exports for convenience
pub use chunk::{Chunk, ChunkDecoder, ChunkInput, DecodeError, DecodeMode, ErrorInfo, StageUpdate};
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, StreamlineConfig, StreamlineToml,
};
pub use engine::{EngineConfig, EngineError, SessionHandle, StreamEngine};
pub use message::{
    AppendOutcome, Message, MessageId, MessageRole, MessageStatus, TransitionError,
};
pub use session::{InitialMessage, SessionId, SessionSnapshot, SessionState, StreamFailure};
pub use stage::{Stage, StageDetail, StageId, StageLedger, StageStatus};
pub use subscribers::{BroadcastResult, EngineEvent, SubscriberId, SubscriberRegistry};
pub use transport::{
    CancelHandle, ChunkSink, Connection, EngineSink, EventSource, HttpEventSource,
    HttpSourceConfig, ScriptedEventSource, SourceEvent, StreamAdapter, StreamOutcome,
    StreamRequest, TransportError,
};
