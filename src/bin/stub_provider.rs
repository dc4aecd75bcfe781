//! Minimal tool provider over stdio, used by the integration tests and as a
//! manual smoke-test peer.
//!
//! The first argument selects the served catalog (`echo`, `weather`, `fs`);
//! the remaining flags make the provider misbehave on demand so failure
//! paths can be driven deterministically. Calls are served concurrently, so
//! a slow call never blocks a fast one. Logs go to stderr; stdout carries
//! only protocol frames.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

/// Tools per `tools/list` page; small enough that the echo catalog needs a
/// cursor to finish.
const PAGE_SIZE: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Echo,
    Weather,
    Fs,
}

#[derive(Debug, Clone)]
struct Options {
    mode: Mode,
    /// Delay every `tools/call` response by this many milliseconds.
    sleep_ms: u64,
    /// Emit one non-JSON line before the first call response.
    garbage: bool,
    /// Answer `initialize` with an error.
    reject_initialize: bool,
    /// Exit right after answering the handshake.
    exit_after_initialize: bool,
    /// Never answer `tools/call`.
    mute: bool,
}

fn parse_args() -> Result<Options> {
    let mut args = std::env::args().skip(1);
    let mode = match args.next().as_deref() {
        Some("echo") => Mode::Echo,
        Some("weather") => Mode::Weather,
        Some("fs") => Mode::Fs,
        Some(other) => bail!("unknown mode '{other}' (expected echo, weather, or fs)"),
        None => bail!(
            "usage: stub_provider <echo|weather|fs> [--sleep-ms N] [--garbage] \
             [--reject-initialize] [--exit-after-initialize] [--mute]"
        ),
    };
    let mut opts = Options {
        mode,
        sleep_ms: 0,
        garbage: false,
        reject_initialize: false,
        exit_after_initialize: false,
        mute: false,
    };
    while let Some(flag) = args.next() {
        match flag.as_str() {
            "--sleep-ms" => {
                let value = args.next().context("--sleep-ms needs a value")?;
                opts.sleep_ms = value.parse().context("--sleep-ms needs an integer")?;
            }
            "--garbage" => opts.garbage = true,
            "--reject-initialize" => opts.reject_initialize = true,
            "--exit-after-initialize" => opts.exit_after_initialize = true,
            "--mute" => opts.mute = true,
            other => bail!("unknown flag '{other}'"),
        }
    }
    Ok(opts)
}

fn catalog(mode: Mode) -> Vec<Value> {
    match mode {
        Mode::Echo => vec![
            json!({
                "name": "echo",
                "description": "Echo the arguments back as structuredContent",
                "inputSchema": {
                    "type": "object",
                    "properties": {"delay_ms": {"type": "number"}}
                }
            }),
            json!({
                "name": "fail",
                "description": "Always answer with a JSON-RPC error",
                "inputSchema": {"type": "object"}
            }),
            json!({
                "name": "broken",
                "description": "Report a tool-level failure via isError",
                "inputSchema": {"type": "object"}
            }),
            json!({
                "name": "die",
                "description": "Exit the process without responding",
                "inputSchema": {"type": "object"}
            }),
        ],
        Mode::Weather => vec![json!({
            "name": "get_forecast",
            "description": "Forecast for a coordinate pair",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "latitude": {"type": "number"},
                    "longitude": {"type": "number"}
                },
                "required": ["latitude", "longitude"]
            }
        })],
        Mode::Fs => vec![json!({
            "name": "list_directory",
            "description": "List a directory",
            "inputSchema": {
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            }
        })],
    }
}

/// Shared stdout handle; responses from concurrent call handlers interleave
/// whole lines, never bytes.
#[derive(Clone)]
struct Writer {
    out: Arc<Mutex<tokio::io::Stdout>>,
}

impl Writer {
    fn new() -> Self {
        Self {
            out: Arc::new(Mutex::new(tokio::io::stdout())),
        }
    }

    async fn write_value(&self, value: &Value) -> Result<()> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        let mut out = self.out.lock().await;
        out.write_all(&line).await?;
        out.flush().await?;
        Ok(())
    }

    async fn write_raw(&self, line: &str) -> Result<()> {
        let mut out = self.out.lock().await;
        out.write_all(line.as_bytes()).await?;
        out.write_all(b"\n").await?;
        out.flush().await?;
        Ok(())
    }
}

struct ServerState {
    opts: Options,
    fail_calls: AtomicU32,
    garbage_pending: AtomicBool,
}

fn error_response(id: &Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message}
    })
}

fn list_response(id: &Value, mode: Mode, params: Option<&Value>) -> Value {
    let tools = catalog(mode);
    let start = params
        .and_then(|p| p.get("cursor"))
        .and_then(Value::as_str)
        .and_then(|c| c.parse::<usize>().ok())
        .unwrap_or(0)
        .min(tools.len());
    let end = (start + PAGE_SIZE).min(tools.len());
    let mut result = json!({ "tools": tools[start..end].to_vec() });
    if end < tools.len() {
        result["nextCursor"] = json!(end.to_string());
    }
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

async fn handle_call(writer: Writer, state: Arc<ServerState>, id: Value, params: Value) {
    if let Err(e) = try_handle_call(writer, state, id, params).await {
        tracing::warn!(error = %e, "call handler failed");
    }
}

async fn try_handle_call(
    writer: Writer,
    state: Arc<ServerState>,
    id: Value,
    params: Value,
) -> Result<()> {
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);

    if state.opts.sleep_ms > 0 {
        tokio::time::sleep(Duration::from_millis(state.opts.sleep_ms)).await;
    }
    let per_call_delay = arguments.get("delay_ms").and_then(Value::as_u64).unwrap_or(0);
    if per_call_delay > 0 {
        tokio::time::sleep(Duration::from_millis(per_call_delay)).await;
    }
    if state.garbage_pending.swap(false, Ordering::SeqCst) {
        writer.write_raw("this is not json").await?;
    }

    let response = match (state.opts.mode, name.as_str()) {
        (Mode::Echo, "echo") => json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "content": [{"type": "text", "text": "echoed"}],
                "structuredContent": arguments
            }
        }),
        (Mode::Echo, "fail") => {
            let attempt = state.fail_calls.fetch_add(1, Ordering::SeqCst) + 1;
            error_response(
                &id,
                -32000,
                &format!("tool failure requested (attempt {attempt})"),
            )
        }
        (Mode::Echo, "broken") => json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "content": [{"type": "text", "text": "tool exploded"}],
                "isError": true
            }
        }),
        (Mode::Echo, "die") => {
            tracing::info!("die tool invoked, exiting");
            std::process::exit(0);
        }
        (Mode::Weather, "get_forecast") => json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {"content": [{"type": "text", "text": "sunny, 25C"}]}
        }),
        (Mode::Fs, "list_directory") => json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {"content": [
                {"type": "text", "text": "a.txt"},
                {"type": "text", "text": "b.txt"}
            ]}
        }),
        (_, other) => error_response(&id, -32602, &format!("no such tool: {other}")),
    };
    writer.write_value(&response).await
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let opts = parse_args()?;
    tracing::info!(mode = ?opts.mode, "stub provider starting");

    let writer = Writer::new();
    let state = Arc::new(ServerState {
        opts: opts.clone(),
        fail_calls: AtomicU32::new(0),
        garbage_pending: AtomicBool::new(opts.garbage),
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let frame: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring unparseable frame");
                continue;
            }
        };
        let method = frame
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let id = frame.get("id").cloned();
        let params = frame.get("params").cloned().unwrap_or(Value::Null);

        match (method.as_str(), id) {
            ("initialize", Some(id)) => {
                if opts.reject_initialize {
                    writer
                        .write_value(&error_response(&id, -32600, "initialize rejected"))
                        .await?;
                    continue;
                }
                writer
                    .write_value(&json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": {
                            "protocolVersion": "2025-03-26",
                            "capabilities": {"tools": {"listChanged": true}},
                            "serverInfo": {
                                "name": "stub-provider",
                                "version": env!("CARGO_PKG_VERSION")
                            }
                        }
                    }))
                    .await?;
                if opts.exit_after_initialize {
                    tracing::info!("exiting after initialize");
                    return Ok(());
                }
            }
            ("tools/list", Some(id)) => {
                writer
                    .write_value(&list_response(&id, opts.mode, frame.get("params")))
                    .await?;
            }
            ("tools/call", Some(id)) => {
                if opts.mute {
                    tracing::info!("muting tools/call");
                    continue;
                }
                tokio::spawn(handle_call(
                    writer.clone(),
                    Arc::clone(&state),
                    id,
                    params,
                ));
            }
            (other, Some(id)) => {
                writer
                    .write_value(&error_response(
                        &id,
                        -32601,
                        &format!("method not found: {other}"),
                    ))
                    .await?;
            }
            ("notifications/initialized", None) => {}
            ("shutdown", None) => tracing::info!("shutdown notification received"),
            (other, None) => tracing::debug!(method = other, "notification ignored"),
        }
    }
    tracing::info!("stdin closed, exiting");
    Ok(())
}
