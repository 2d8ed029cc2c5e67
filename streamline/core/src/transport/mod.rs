//! Transport Adapter
//!
//! Opens server-pushed event streams and turns their named frames into
//! chunks for the engine.
//!
//! # Available Sources
//!
//! - **HTTP**: `text/event-stream` over reqwest ([`HttpEventSource`])
//! - **Scripted**: replays a fixed list of events ([`ScriptedEventSource`])
//!
//! # Usage
//!
//! ```ignore
//! use streamline_core::transport::{HttpEventSource, HttpSourceConfig, StreamAdapter, StreamRequest};
//!
//! let adapter = StreamAdapter::new(HttpEventSource::new(HttpSourceConfig::default())?);
//! let request = StreamRequest::post(url, payload).with_bearer_token(token);
//! let (message_id, outcome) = adapter.drive(&engine, &session, None, &request).await;
//! ```
//!
//! No layer here retries. A dropped connection ends the stream with a
//! `connection_error` chunk; retrying is up to the caller.

mod adapter;
pub mod envelope;
mod http;
mod scripted;
mod traits;

pub use adapter::{ChunkSink, EngineSink, StreamAdapter, StreamOutcome};
pub use http::{HttpEventSource, HttpSourceConfig};
pub use scripted::ScriptedEventSource;
pub use traits::{CancelHandle, Connection, EventSource, SourceEvent, StreamRequest, TransportError};
