//! Wire protocol: JSON-RPC 2.0 framing as MCP providers speak it.
//!
//! One frame is one complete JSON text (one line on stdio, one event on an
//! HTTP stream). This module owns the message shapes and the strict inbound
//! decoder; it never touches a transport.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol revision sent in the initialize handshake.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED: &str = "notifications/initialized";
pub const METHOD_LIST_TOOLS: &str = "tools/list";
pub const METHOD_CALL_TOOL: &str = "tools/call";
pub const METHOD_TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
/// Best-effort notification sent before closing a provider's stdin.
pub const METHOD_SHUTDOWN: &str = "shutdown";

// ─── JSON-RPC 2.0 messages ──────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no id, no reply expected).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    pub id: u64,
    pub result: Option<Value>,
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// ─── Inbound frame decoding ──────────────────────────────────────────────────

/// A decoded inbound frame.
#[derive(Debug, Clone)]
pub enum Frame {
    /// Response to one of our requests, routed by correlation id.
    Response(JsonRpcResponse),
    /// Provider-initiated notification.
    Notification { method: String, params: Option<Value> },
    /// Provider-initiated request. This client serves none, but answering
    /// method-not-found keeps sessions alive against providers that ping.
    Request { id: Value, method: String },
}

/// Decode one frame, enforcing the response shape strictly.
///
/// A frame that is not a JSON object, a response whose id is not one of our
/// integer correlation ids, or a response carrying neither (or both of)
/// `result` and `error` is malformed; the caller fails the session.
pub fn decode_frame(frame: &str) -> std::result::Result<Frame, String> {
    let value: Value =
        serde_json::from_str(frame).map_err(|e| format!("frame is not valid JSON: {e}"))?;
    if !value.is_object() {
        return Err("frame is not a JSON object".to_string());
    }

    if let Some(method) = value.get("method").and_then(Value::as_str) {
        let method = method.to_string();
        return match value.get("id") {
            Some(id) if !id.is_null() => Ok(Frame::Request { id: id.clone(), method }),
            _ => Ok(Frame::Notification { method, params: value.get("params").cloned() }),
        };
    }

    match value.get("id") {
        None => Err("frame has neither method nor id".to_string()),
        Some(Value::Null) => Err("response with null id cannot be correlated".to_string()),
        Some(_) => {
            let response: JsonRpcResponse = serde_json::from_value(value)
                .map_err(|e| format!("malformed response frame: {e}"))?;
            match (&response.result, &response.error) {
                (None, None) => Err("response carries neither result nor error".to_string()),
                (Some(_), Some(_)) => Err("response carries both result and error".to_string()),
                _ => Ok(Frame::Response(response)),
            }
        }
    }
}

/// Serialized error response for a provider-initiated request we do not serve.
pub fn method_not_found_response(id: &Value, method: &str) -> String {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": error_codes::METHOD_NOT_FOUND,
            "message": format!("method not supported: {method}"),
        },
    })
    .to_string()
}

// ─── MCP protocol bodies ─────────────────────────────────────────────────────

/// Parameters for the initialize request.
pub fn initialize_params() -> Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

/// Initialize response payload. `protocolVersion` is mandatory; a provider
/// that omits it fails the handshake.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default, rename = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Implementation info returned in the initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// Tool definition as it appears in a `tools/list` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Value,
}

/// One page of a `tools/list` result.
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<ToolDef>,
    #[serde(default, rename = "nextCursor")]
    pub next_cursor: Option<String>,
}

/// Whether a `tools/call` result reports a protocol-level tool failure.
pub fn is_tool_error(result: &Value) -> bool {
    result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Concatenated `text` fields of a result's content blocks, used as human
/// readable detail for tool failures.
pub fn content_text(result: &Value) -> String {
    result
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

// ─── Standard error codes ────────────────────────────────────────────────────

/// Well-known JSON-RPC / MCP error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Tool executed and reported failure (`isError` result).
    pub const TOOL_EXECUTION_ERROR: i32 = -32000;
}

// ─── Tests ───────────────────────────────────────────────────────────────────
