//! HTTP stream transport tests against a minimal in-process SSE server.
//!
//! The fixture speaks just enough HTTP/1.1 for the transport: a GET opens
//! the event stream, each POST carries one JSON-RPC frame and is answered
//! with 202, and responses travel back as `data:` events on the stream.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use toolmux::{Orchestrator, OrchestratorConfig, ProviderSpec, ToolmuxError};

const SSE_HEADERS: &str =
    "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncache-control: no-cache\r\n\r\n";

// ---------------------------------------------------------------------------
// Fixture server
// ---------------------------------------------------------------------------

/// Bind an ephemeral port and serve the fixture until the handle is aborted.
async fn spawn_fixture() -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (event_tx, event_rx) = mpsc::unbounded_channel::<String>();
    // the first GET claims the event stream
    let stream_rx = Arc::new(Mutex::new(Some(event_rx)));

    let server = tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(handle_connection(
                socket,
                event_tx.clone(),
                Arc::clone(&stream_rx),
            ));
        }
    });
    (format!("http://{addr}/mcp"), server)
}

async fn handle_connection(
    mut socket: TcpStream,
    event_tx: mpsc::UnboundedSender<String>,
    stream_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<String>>>>,
) {
    let mut buf: Vec<u8> = Vec::new();
    // keep-alive loop: one iteration per request on this connection
    loop {
        let header_end = loop {
            if let Some(pos) = find_subsequence(&buf, b"\r\n\r\n") {
                break pos;
            }
            let mut chunk = [0u8; 4096];
            match socket.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        };
        let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
        buf.drain(..header_end + 4);

        if head.starts_with("GET") {
            if socket.write_all(SSE_HEADERS.as_bytes()).await.is_err() {
                return;
            }
            let Some(mut rx) = stream_rx.lock().await.take() else {
                return;
            };
            while let Some(frame) = rx.recv().await {
                let event = format!("data: {frame}\n\n");
                if socket.write_all(event.as_bytes()).await.is_err() {
                    return;
                }
            }
            return;
        }

        // POST: read the body, queue the answer onto the event stream
        let content_length = head
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                if name.trim().eq_ignore_ascii_case("content-length") {
                    value.trim().parse::<usize>().ok()
                } else {
                    None
                }
            })
            .unwrap_or(0);
        while buf.len() < content_length {
            let mut chunk = [0u8; 4096];
            match socket.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
        let body: Vec<u8> = buf.drain(..content_length).collect();
        if let Ok(frame) = serde_json::from_slice::<Value>(&body) {
            if let Some(response) = answer(&frame) {
                let _ = event_tx.send(response.to_string());
            }
        }
        if socket
            .write_all(b"HTTP/1.1 202 Accepted\r\ncontent-length: 0\r\n\r\n")
            .await
            .is_err()
        {
            return;
        }
    }
}

/// Frame-level behavior of the fixture: notifications get no answer,
/// requests get a result keyed to their correlation id.
fn answer(frame: &Value) -> Option<Value> {
    let id = frame.get("id")?.clone();
    let method = frame.get("method").and_then(Value::as_str).unwrap_or_default();
    let result = match method {
        "initialize" => json!({
            "protocolVersion": "2025-03-26",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "sse-fixture", "version": "0.0.1"}
        }),
        "tools/list" => json!({
            "tools": [{
                "name": "echo",
                "description": "Echo arguments back over the event stream",
                "inputSchema": {"type": "object"}
            }]
        }),
        "tools/call" => {
            let arguments = frame
                .pointer("/params/arguments")
                .cloned()
                .unwrap_or(Value::Null);
            json!({
                "content": [{"type": "text", "text": "echoed"}],
                "structuredContent": arguments
            })
        }
        other => {
            return Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32601, "message": format!("unknown method {other}")}
            }));
        }
    };
    Some(json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn http_stream_provider_round_trips() {
    let (url, server) = spawn_fixture().await;
    let orchestrator = Orchestrator::new(OrchestratorConfig::new(vec![
        ProviderSpec::http_stream("sse", url),
    ]))
    .unwrap();
    let report = orchestrator.start().await;
    assert!(report.fully_ready(), "{:?}", report.failed);

    let names: Vec<String> = orchestrator
        .list_tools()
        .await
        .iter()
        .map(|t| t.namespaced_name.clone())
        .collect();
    assert_eq!(names, vec!["sse.echo"]);

    let out = orchestrator
        .call_tool("sse.echo", json!({"via": "sse"}))
        .await
        .unwrap();
    assert_eq!(out.provider_id, "sse");
    assert_eq!(out.payload["structuredContent"], json!({"via": "sse"}));

    orchestrator.stop().await;
    server.abort();
}

#[tokio::test]
async fn concurrent_sse_calls_route_by_correlation_id() {
    let (url, server) = spawn_fixture().await;
    let orchestrator = Arc::new(
        Orchestrator::new(OrchestratorConfig::new(vec![ProviderSpec::http_stream(
            "sse", url,
        )]))
        .unwrap(),
    );
    let report = orchestrator.start().await;
    assert!(report.fully_ready(), "{:?}", report.failed);

    let mut calls = Vec::new();
    for i in 0..4u32 {
        let orchestrator = Arc::clone(&orchestrator);
        calls.push(tokio::spawn(async move {
            let out = orchestrator
                .call_tool("sse.echo", json!({"seq": i}))
                .await
                .unwrap();
            (i, out)
        }));
    }
    for call in calls {
        let (i, out) = call.await.unwrap();
        assert_eq!(out.payload["structuredContent"]["seq"], json!(i));
    }

    orchestrator.stop().await;
    server.abort();
}

#[tokio::test]
async fn unreachable_http_provider_fails_to_start() {
    let mut spec = ProviderSpec::http_stream("dead", "http://127.0.0.1:9/mcp");
    spec.max_restarts = 0;
    spec.connect_timeout_ms = 2_000;
    let orchestrator = Orchestrator::new(OrchestratorConfig::new(vec![spec])).unwrap();

    let report = orchestrator.start().await;
    assert!(report.ready.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "dead");
    assert!(matches!(report.failed[0].1, ToolmuxError::Connect { .. }));

    orchestrator.stop().await;
}
