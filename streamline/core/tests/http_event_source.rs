//! HTTP event source against a local one-shot server.

use pretty_assertions::assert_eq;
use serde_json::json;
use streamline_core::{
    DecodeMode, EngineConfig, HttpEventSource, HttpSourceConfig, MessageStatus, SessionId,
    StreamAdapter, StreamEngine, StreamOutcome, StreamRequest,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const SSE_HEAD: &str =
    "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n";

async fn read_request(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
            let body_len = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + body_len {
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Serve one response, returning the URL and the captured request
async fn serve_once(response: String) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let request = read_request(&mut stream).await;
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.shutdown().await.unwrap();
        request
    });

    (format!("http://{addr}/chat/stream"), handle)
}

fn adapter() -> StreamAdapter<HttpEventSource> {
    StreamAdapter::new(HttpEventSource::new(HttpSourceConfig::default()).unwrap())
}

#[tokio::test]
async fn test_sse_stream_end_to_end() {
    let body = concat!(
        "event: stage\n",
        "data: {\"stage\":\"Searching\",\"status\":0}\n\n",
        "event: content\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        "data: lo\n\n",
        "event: stage\n",
        "data: {\"stage\":\"Searching\",\"status\":1,\"message\":\"done\"}\n\n",
        "data: [DONE]\n\n",
    );
    let (url, server) = serve_once(format!("{SSE_HEAD}{body}")).await;

    let engine = StreamEngine::new();
    let session = SessionId::default();
    let request = StreamRequest::post(url, json!({"prompt": "hello"}))
        .with_bearer_token("secret-token")
        .with_header("X-Client", "streamline-tests");

    let (id, outcome) = adapter().drive(&engine, &session, None, &request).await;
    assert_eq!(outcome, StreamOutcome::Completed);

    let messages = engine.messages(&session);
    assert_eq!(messages[0].id, id);
    assert_eq!(messages[0].content, "Hello");
    assert_eq!(messages[0].status, MessageStatus::Completed);

    let stages = engine.stages(&session);
    assert_eq!(stages.len(), 1);
    assert_eq!(stages[0].message, "done");

    let captured = server.await.unwrap().to_lowercase();
    assert!(captured.starts_with("post /chat/stream"));
    assert!(captured.contains("authorization: bearer secret-token"));
    assert!(captured.contains("accept: text/event-stream"));
    assert!(captured.contains("x-client: streamline-tests"));
    assert!(captured.contains("\"prompt\":\"hello\""));
}

#[tokio::test]
async fn test_non_success_status_is_connection_error() {
    let (url, _server) = serve_once(
        "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 4\r\nConnection: close\r\n\r\nboom"
            .to_string(),
    )
    .await;

    let engine = StreamEngine::new();
    let session = SessionId::default();
    let (id, outcome) = adapter()
        .drive(&engine, &session, None, &StreamRequest::get(url))
        .await;

    let StreamOutcome::Failed(error) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(error.is_connection_error());
    assert_eq!(error.status, Some(500));

    let snapshot = engine.snapshot(&session);
    let message = snapshot.message(&id).unwrap();
    assert_eq!(message.status, MessageStatus::Error);
    assert_eq!(message.error_status(), Some(500));
}

#[tokio::test]
async fn test_refused_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let engine = StreamEngine::new();
    let session = SessionId::default();
    let (_, outcome) = adapter()
        .drive(
            &engine,
            &session,
            None,
            &StreamRequest::get(format!("http://{addr}/stream")),
        )
        .await;

    let StreamOutcome::Failed(error) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(error.is_connection_error());
    assert!(!engine.is_streaming(&session));
}

#[tokio::test]
async fn test_close_without_done_completes() {
    let body = "event: content\ndata: {\"content\":\"partial\"}\n\n";
    let (url, _server) = serve_once(format!("{SSE_HEAD}{body}")).await;

    let engine = StreamEngine::new();
    let session = SessionId::default();
    let (_, outcome) = adapter()
        .drive(&engine, &session, None, &StreamRequest::get(url))
        .await;

    assert_eq!(outcome, StreamOutcome::Completed);
    let messages = engine.messages(&session);
    assert_eq!(messages[0].content, "partial");
    assert_eq!(messages[0].status, MessageStatus::Completed);
}

#[tokio::test]
async fn test_strict_engine_rejects_malformed_sse_frame() {
    let body = "event: content\ndata: {\"content\":\"ok\"}\n\ndata: not json\n\n";
    let (url, _server) = serve_once(format!("{SSE_HEAD}{body}")).await;

    let engine = StreamEngine::with_config(EngineConfig {
        decode_mode: DecodeMode::Strict,
        ..EngineConfig::default()
    });
    let session = SessionId::default();
    let (id, outcome) = adapter()
        .drive(&engine, &session, None, &StreamRequest::get(url))
        .await;

    let StreamOutcome::Failed(error) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(error.kind.as_deref(), Some("decode_error"));

    let snapshot = engine.snapshot(&session);
    let message = snapshot.message(&id).unwrap();
    assert_eq!(message.status, MessageStatus::Error);
    assert_eq!(message.error_type(), Some("decode_error"));
}
