//! End-to-end scenarios: scripted event streams driven through the adapter
//! into the engine.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use streamline_core::{
    Chunk, ConfigOverrides, EngineEvent, ErrorInfo, InitialMessage, MessageStatus,
    ScriptedEventSource, SessionId, SourceEvent, StageDetail, StageStatus, StreamAdapter,
    StreamEngine, StreamOutcome, StreamRequest, StreamlineConfig,
};

fn request() -> StreamRequest {
    StreamRequest::post("mem://chat/stream", json!({"prompt": "analyze my wallets"}))
        .with_bearer_token("token")
}

#[tokio::test]
async fn test_full_turn_with_stages() {
    let engine = StreamEngine::new();
    let session = SessionId::default();
    let adapter = StreamAdapter::new(ScriptedEventSource::from_frames([
        ("stage", r#"{"stage":"Analyzing Wallets","status":0,"message":"starting"}"#),
        (
            "stage",
            r#"{"type":"stage","stage":{"content":"Analyzing Wallets","message":"1 of 2","status":0,"detail":{"current":1,"total":2,"wallet":"0xaaa","is_high_value":false}}}"#,
        ),
        ("content", r#"{"choices":[{"delta":{"content":"Two "}}]}"#),
        ("stage", r#"{"stage":"Summarizing","status":0}"#),
        (
            "stage",
            r#"{"type":"stage","stage":{"content":"Analyzing Wallets","message":"done","status":1,"detail":{"high_value_count":1,"total":2,"processed":2}}}"#,
        ),
        ("content", r#"{"choices":[{"delta":{"content":"wallets found."}}]}"#),
        ("message", "[DONE]"),
    ]));

    let (id, outcome) = adapter
        .drive(&engine, &session, Some(InitialMessage::with_id("turn-1")), &request())
        .await;

    assert_eq!(outcome, StreamOutcome::Completed);

    let messages = engine.messages(&session);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, id);
    assert_eq!(messages[0].content, "Two wallets found.");
    assert_eq!(messages[0].status, MessageStatus::Completed);

    let stages = engine.stages(&session);
    let labels: Vec<&str> = stages.iter().map(|s| s.content.as_str()).collect();
    assert_eq!(labels, vec!["Analyzing Wallets", "Summarizing"]);
    assert_eq!(stages[0].status, StageStatus::Completed);
    assert_eq!(
        stages[0].detail,
        Some(StageDetail::Completed {
            high_value_count: 1,
            total: 2,
            processed: 2,
        })
    );

    assert!(!engine.is_any_streaming());
    assert_eq!(adapter.source().requests()[0].bearer_token.as_deref(), Some("token"));
}

#[tokio::test]
async fn test_connection_error_fails_message() {
    let engine = StreamEngine::new();
    let session = SessionId::default();
    let adapter = StreamAdapter::new(ScriptedEventSource::new(vec![
        SourceEvent::Open,
        SourceEvent::frame("content", "partial answer"),
        SourceEvent::Error {
            message: "upstream unavailable".to_string(),
            status: Some(503),
        },
    ]));

    let (id, outcome) = adapter.drive(&engine, &session, None, &request()).await;
    assert!(matches!(outcome, StreamOutcome::Failed(_)));

    let snapshot = engine.snapshot(&session);
    let message = snapshot.message(&id).unwrap();
    assert_eq!(message.status, MessageStatus::Error);
    assert_eq!(message.content, "Error: upstream unavailable");
    assert_eq!(message.error_type(), Some("connection_error"));
    assert_eq!(message.error_status(), Some(503));

    let failure = snapshot.last_error.unwrap();
    assert_eq!(failure.message_id, id);
    assert!(!snapshot.is_streaming);
}

#[tokio::test]
async fn test_engine_usable_after_failure() {
    let engine = StreamEngine::new();
    let session = SessionId::default();

    let failing = StreamAdapter::new(ScriptedEventSource::from_frames([(
        "error",
        r#"{"message":"rate limited","type":"rate_limit","status":429}"#,
    )]));
    let (first, _) = failing.drive(&engine, &session, None, &request()).await;

    let working = StreamAdapter::new(ScriptedEventSource::from_frames([
        ("content", "ok"),
        ("done", ""),
    ]));
    let (second, outcome) = working.drive(&engine, &session, None, &request()).await;

    assert_eq!(outcome, StreamOutcome::Completed);
    let messages = engine.messages(&session);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].id, first);
    assert_eq!(messages[0].status, MessageStatus::Error);
    assert_eq!(messages[1].id, second);
    assert_eq!(messages[1].content, "ok");
    // A fresh stream clears the recorded error
    assert!(engine.last_error(&session).is_none());
}

#[tokio::test]
async fn test_concurrent_sessions() {
    let engine = Arc::new(StreamEngine::new());

    let mut tasks = Vec::new();
    for name in ["alpha", "beta", "gamma"] {
        let engine = Arc::clone(&engine);
        tasks.push(tokio::spawn(async move {
            let session = SessionId::from(name);
            let adapter = StreamAdapter::new(ScriptedEventSource::from_frames([
                ("stage", format!(r#"{{"stage":"{name}","status":0}}"#)),
                ("content", format!("hello from {name}")),
                ("done", String::new()),
            ]));
            adapter.drive(&engine, &session, None, &request()).await
        }));
    }

    for task in tasks {
        let (_, outcome) = task.await.unwrap();
        assert_eq!(outcome, StreamOutcome::Completed);
    }

    for name in ["alpha", "beta", "gamma"] {
        let session = SessionId::from(name);
        let messages = engine.messages(&session);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, format!("hello from {name}"));

        let stages = engine.stages(&session);
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].content, name);
    }
    assert_eq!(engine.session_ids().len(), 3);
}

#[tokio::test]
async fn test_cancel_pairs_with_end_stream() {
    let engine = StreamEngine::new();
    let session = SessionId::default();
    let adapter = StreamAdapter::new(
        ScriptedEventSource::from_frames([("content", "thinking...")]).keep_open(),
    );

    let connection = adapter.open(&request()).await.unwrap();
    let cancel = connection.cancel_handle();
    let id = engine.start_stream(&session, None);

    let mut sink = streamline_core::EngineSink::new(&engine, session.clone(), id.clone());
    let outcome = {
        let pump = adapter.pump(connection, &mut sink);
        tokio::pin!(pump);
        assert!(tokio::time::timeout(Duration::from_millis(20), &mut pump)
            .await
            .is_err());

        cancel.cancel();
        pump.await
    };
    assert_eq!(outcome, StreamOutcome::Cancelled);

    // Cancelling the connection leaves the message as it was
    assert!(engine.is_streaming(&session));

    tokio_test::assert_ok!(engine.end_stream(
        &session,
        Some(&id),
        Some(ErrorInfo::new("cancelled by user").with_kind("cancelled")),
    ));

    let snapshot = engine.snapshot(&session);
    let message = snapshot.message(&id).unwrap();
    assert_eq!(message.status, MessageStatus::Error);
    assert_eq!(message.error_type(), Some("cancelled"));
    assert!(!snapshot.is_streaming);
}

#[tokio::test]
async fn test_subscriber_receives_ordered_events() {
    let engine = StreamEngine::new();
    let (_sub, mut events) = engine.subscribe();
    let session = SessionId::from("ui");

    let adapter = StreamAdapter::new(ScriptedEventSource::from_frames([
        ("content", "a"),
        ("content", "b"),
        ("error", "model crashed"),
    ]));
    let (id, _) = adapter.drive(&engine, &session, None, &request()).await;

    let mut contents = Vec::new();
    let mut errors = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            EngineEvent::Snapshot(snapshot) => {
                contents.push(snapshot.message(&id).unwrap().content.clone());
            }
            EngineEvent::StreamError { error, .. } => errors.push(error),
            EngineEvent::Cleared { .. } => {}
        }
    }

    assert_eq!(contents, vec!["", "a", "ab", "Error: model crashed"]);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind.as_deref(), Some("stream_error"));
}

#[tokio::test]
async fn test_sequenced_duplicates_dropped() {
    let engine = StreamEngine::new();
    let session = SessionId::default();
    let id = engine.start_stream(&session, None);

    for raw in [
        r#"{"type":"content","content":"Hel","seq":1}"#,
        r#"{"type":"content","content":"lo","seq":2}"#,
        r#"{"type":"content","content":"lo","seq":2}"#,
        r#"{"type":"done"}"#,
    ] {
        tokio_test::assert_ok!(engine.process_chunk(&session, raw, Some(&id)));
    }

    assert_eq!(engine.messages(&session)[0].content, "Hello");
}

#[test]
fn test_typed_chunks_bypass_decoding() {
    let engine = StreamEngine::new();
    let handle = engine.default_session();
    handle.start_stream(None);

    handle.process_chunk(Chunk::content("[DONE]"), None).unwrap();
    assert!(handle.is_streaming());
    assert_eq!(handle.messages()[0].content, "[DONE]");
}

fn strict_engine() -> StreamEngine {
    let mut config = StreamlineConfig::new();
    ConfigOverrides::new().with_strict(true).apply(&mut config);
    StreamEngine::with_config(config.engine_config())
}

#[tokio::test]
async fn test_strict_config_fails_malformed_frame() {
    let engine = strict_engine();
    let session = SessionId::default();
    let adapter = StreamAdapter::new(ScriptedEventSource::from_frames([
        ("content", "ok "),
        ("message", "not json"),
        ("content", "never applied"),
    ]));

    let (id, outcome) = adapter.drive(&engine, &session, None, &request()).await;

    let StreamOutcome::Failed(error) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(error.kind.as_deref(), Some("decode_error"));

    let snapshot = engine.snapshot(&session);
    let message = snapshot.message(&id).unwrap();
    assert_eq!(message.status, MessageStatus::Error);
    assert_eq!(message.error_type(), Some("decode_error"));
    assert!(!snapshot.is_streaming);
    assert_eq!(snapshot.last_error.unwrap().message_id, id);
}

#[tokio::test]
async fn test_strict_config_rejects_unknown_type_with_content() {
    let engine = strict_engine();
    let session = SessionId::default();
    let adapter = StreamAdapter::new(ScriptedEventSource::from_frames([(
        "message",
        r#"{"type":"annotation","content":"x"}"#,
    )]));

    let (id, outcome) = adapter.drive(&engine, &session, None, &request()).await;

    assert!(matches!(outcome, StreamOutcome::Failed(ref e) if e.kind.as_deref() == Some("decode_error")));
    let snapshot = engine.snapshot(&session);
    assert_eq!(snapshot.message(&id).unwrap().status, MessageStatus::Error);
}

#[tokio::test]
async fn test_lenient_engine_keeps_unknown_type_content() {
    let engine = StreamEngine::new();
    let session = SessionId::default();
    let adapter = StreamAdapter::new(ScriptedEventSource::from_frames([
        ("message", r#"{"type":"annotation","content":"x"}"#),
        ("done", ""),
    ]));

    let (_, outcome) = adapter.drive(&engine, &session, None, &request()).await;
    assert_eq!(outcome, StreamOutcome::Completed);
    assert_eq!(engine.messages(&session)[0].content, "x");
}
