//! Crate-wide error taxonomy.
//!
//! Every failure surfaced by the orchestrator is one of these kinds, so
//! callers can branch on the variant instead of parsing strings. The enum is
//! `Clone` because a single session failure fans out to every call still
//! pending on that session.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ToolmuxError>;

/// Errors that can occur while connecting providers or dispatching tool calls.
#[derive(Debug, Error, Clone)]
pub enum ToolmuxError {
    /// The provider could not be reached: process failed to spawn, endpoint
    /// unreachable, or the connection attempt timed out.
    #[error("failed to connect provider '{provider}': {reason}")]
    Connect {
        provider: String,
        reason: String,
    },

    /// The provider is reachable but the initialize exchange or the first
    /// tool listing failed.
    #[error("handshake with provider '{provider}' failed: {reason}")]
    Handshake {
        provider: String,
        reason: String,
    },

    /// A call did not complete before its deadline.
    #[error("call to provider '{provider}' timed out after {elapsed_ms}ms")]
    Timeout {
        provider: String,
        elapsed_ms: u64,
    },

    /// The process exited or the stream closed while the session was live.
    #[error("connection to provider '{provider}' lost: {reason}")]
    ConnectionLost {
        provider: String,
        reason: String,
    },

    /// The provider sent a frame this client cannot accept: not JSON, a
    /// response with neither result nor error, or an unparseable payload.
    #[error("protocol violation from provider '{provider}': {reason}")]
    Protocol {
        provider: String,
        reason: String,
    },

    /// The namespaced tool name is not in the registry.
    #[error("unknown tool: '{name}'")]
    UnknownTool {
        name: String,
    },

    /// Tool call arguments failed validation against the declared schema.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments {
        tool: String,
        reason: String,
    },

    /// The tool resolved to a provider whose session is not ready for calls.
    #[error("provider '{provider}' unavailable (session {state})")]
    ProviderUnavailable {
        provider: String,
        state: String,
    },

    /// The provider executed the call and reported a failure result. Passed
    /// through verbatim and never retried.
    #[error("provider '{provider}' reported error [{code}]: {message}")]
    Application {
        provider: String,
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The call was resolved by a shutdown or drain, not by the provider.
    #[error("call to provider '{provider}' cancelled by shutdown")]
    Cancelled {
        provider: String,
    },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    Config {
        reason: String,
    },
}

impl ToolmuxError {
    /// Whether a fresh attempt of the same call could plausibly succeed.
    ///
    /// Only deadline expiry and mid-flight connection loss qualify. Frames
    /// are whole lines or whole events, so a partially received response is
    /// never observed and every pre-completion connection loss counts.
    /// Application and protocol failures are deterministic and must surface.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ToolmuxError::Timeout { .. } | ToolmuxError::ConnectionLost { .. }
        )
    }
}
