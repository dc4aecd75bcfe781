//! Per-provider protocol session.
//!
//! A session owns one transport and drives it through a fixed state machine:
//!
//! ```text
//! disconnected -> connecting -> handshaking -> ready -> draining -> closed
//! any non-terminal state -> failed (absorbing)
//! ```
//!
//! A dedicated reader task decodes every inbound frame and routes responses
//! by correlation id through a pending-call map, so concurrent calls complete
//! out of order without ever exchanging results. Callers suspend on a
//! one-shot slot; on deadline expiry the slot is removed first, which makes a
//! late response undeliverable instead of cross-talk.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::ProviderSpec;
use crate::error::{Result, ToolmuxError};
use crate::protocol::{self, Frame, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ToolDef};
use crate::transport::Transport;

/// Ceiling on tools/list pagination so a misbehaving provider cannot hold
/// the handshake hostage with an endless cursor chain.
const MAX_LIST_PAGES: usize = 32;

/// How long a closing session waits for its process to exit before killing.
const PROCESS_EXIT_GRACE: Duration = Duration::from_secs(2);

/// Exit grace when tearing down a transport that is already broken.
const FAIL_CLOSE_GRACE: Duration = Duration::from_millis(250);

// ─── State machine ───────────────────────────────────────────────────────────

/// Session lifecycle states. `Failed` and `Closed` are terminal; a session
/// never leaves `Failed`, recovery means the orchestrator builds a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    Draining,
    Failed,
    Closed,
}

impl SessionState {
    pub fn accepts_calls(&self) -> bool {
        matches!(self, SessionState::Ready)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Closed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Handshaking => "handshaking",
            SessionState::Ready => "ready",
            SessionState::Draining => "draining",
            SessionState::Failed => "failed",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Out-of-band signals surfaced to the session's owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The provider announced a changed catalog; re-list and rebuild.
    ToolListChanged,
}

// ─── Pending calls ───────────────────────────────────────────────────────────

/// In-flight calls keyed by correlation id. Completing, failing, or
/// discarding an entry resolves exactly one suspended caller.
struct PendingCalls {
    slots: Mutex<HashMap<u64, oneshot::Sender<Result<JsonRpcResponse>>>>,
    idle: Notify,
}

impl PendingCalls {
    fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            idle: Notify::new(),
        }
    }

    async fn insert(&self, id: u64) -> oneshot::Receiver<Result<JsonRpcResponse>> {
        let (tx, rx) = oneshot::channel();
        self.slots.lock().await.insert(id, tx);
        rx
    }

    /// Route a response to its caller. Returns false when no slot is waiting
    /// for this id, i.e. the response is late and must be discarded.
    async fn complete(&self, response: JsonRpcResponse) -> bool {
        let (sender, now_empty) = {
            let mut slots = self.slots.lock().await;
            let sender = slots.remove(&response.id);
            (sender, slots.is_empty())
        };
        let routed = match sender {
            Some(tx) => tx.send(Ok(response)).is_ok(),
            None => false,
        };
        if now_empty {
            self.idle.notify_waiters();
        }
        routed
    }

    /// Remove a slot without resolving it (deadline expiry).
    async fn discard(&self, id: u64) {
        let now_empty = {
            let mut slots = self.slots.lock().await;
            slots.remove(&id);
            slots.is_empty()
        };
        if now_empty {
            self.idle.notify_waiters();
        }
    }

    /// Resolve every pending call with the same failure.
    async fn fail_all(&self, err: ToolmuxError) {
        let drained: Vec<_> = {
            let mut slots = self.slots.lock().await;
            slots.drain().collect()
        };
        for (_, tx) in drained {
            let _ = tx.send(Err(err.clone()));
        }
        self.idle.notify_waiters();
    }

    async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    /// Wait until no calls are in flight.
    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.slots.lock().await.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

// ─── Session ─────────────────────────────────────────────────────────────────

/// A live connection to one provider. `connect` returns only once the
/// session is Ready; afterwards the state moves only through the reader task
/// (failure detection) or `shutdown`.
pub struct Session {
    provider_id: String,
    transport: Arc<Transport>,
    state: watch::Sender<SessionState>,
    pending: PendingCalls,
    next_correlation: AtomicU64,
    tools: RwLock<Vec<ToolDef>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    failure: Mutex<Option<String>>,
}

impl Session {
    /// Open the transport and drive the handshake: initialize, the
    /// initialized notification, then the first tool listing. Every step is
    /// bounded by the spec's connect timeout.
    pub async fn connect(
        spec: &ProviderSpec,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>)> {
        let connect_timeout = spec.connect_timeout();
        tracing::info!(
            provider = %spec.id,
            transport = spec.transport.kind_name(),
            "connecting provider"
        );

        let (state, _) = watch::channel(SessionState::Connecting);
        let transport = match timeout(connect_timeout, Transport::open(spec)).await {
            Ok(Ok(t)) => Arc::new(t),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(ToolmuxError::Connect {
                    provider: spec.id.clone(),
                    reason: format!(
                        "connection attempt timed out after {}ms",
                        spec.connect_timeout_ms
                    ),
                });
            }
        };

        let session = Arc::new(Session {
            provider_id: spec.id.clone(),
            transport,
            state,
            pending: PendingCalls::new(),
            next_correlation: AtomicU64::new(1),
            tools: RwLock::new(Vec::new()),
            reader: Mutex::new(None),
            failure: Mutex::new(None),
        });
        session.state.send_replace(SessionState::Handshaking);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(Self::read_loop(Arc::clone(&session), events_tx));
        *session.reader.lock().await = Some(reader);

        if let Err(e) = session.handshake(connect_timeout).await {
            let e = session.with_diagnostics(e).await;
            session.fail(e.clone()).await;
            return Err(e);
        }
        session.state.send_replace(SessionState::Ready);
        Ok((session, events_rx))
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// The catalog from the most recent successful listing.
    pub async fn cached_tools(&self) -> Vec<ToolDef> {
        self.tools.read().await.clone()
    }

    /// What broke this session, if it is Failed.
    pub async fn failure_reason(&self) -> Option<String> {
        self.failure.lock().await.clone()
    }

    // ─── Handshake and listing ───────────────────────────────────────────

    async fn handshake(&self, limit: Duration) -> Result<()> {
        let response = self
            .round_trip(
                protocol::METHOD_INITIALIZE,
                Some(protocol::initialize_params()),
                limit,
            )
            .await
            .map_err(|e| self.handshake_error(format!("initialize failed: {e}")))?;

        let result = match (response.result, response.error) {
            (Some(result), _) => result,
            (None, Some(err)) => {
                return Err(self.handshake_error(format!(
                    "initialize rejected [{}]: {}",
                    err.code, err.message
                )));
            }
            (None, None) => {
                return Err(self.handshake_error("empty initialize response".to_string()));
            }
        };
        let init: protocol::InitializeResult = serde_json::from_value(result)
            .map_err(|e| self.handshake_error(format!("malformed initialize result: {e}")))?;
        let server_name = init
            .server_info
            .as_ref()
            .and_then(|info| info.name.clone())
            .unwrap_or_default();
        tracing::debug!(
            provider = %self.provider_id,
            protocol = %init.protocol_version,
            server = %server_name,
            "handshake accepted"
        );

        self.notify(protocol::METHOD_INITIALIZED, None)
            .await
            .map_err(|e| self.handshake_error(format!("initialized notification failed: {e}")))?;

        self.refresh_tools(limit)
            .await
            .map_err(|e| self.handshake_error(format!("initial tool listing failed: {e}")))?;
        Ok(())
    }

    fn handshake_error(&self, reason: String) -> ToolmuxError {
        ToolmuxError::Handshake {
            provider: self.provider_id.clone(),
            reason,
        }
    }

    /// Append the provider's stderr tail to connect and handshake failures.
    async fn with_diagnostics(&self, err: ToolmuxError) -> ToolmuxError {
        let Some(stderr) = self.transport.diagnostics().await else {
            return err;
        };
        match err {
            ToolmuxError::Handshake { provider, reason } => ToolmuxError::Handshake {
                provider,
                reason: format!("{reason} | stderr: {stderr}"),
            },
            ToolmuxError::Connect { provider, reason } => ToolmuxError::Connect {
                provider,
                reason: format!("{reason} | stderr: {stderr}"),
            },
            other => other,
        }
    }

    /// Run `tools/list` to exhaustion, following cursor pagination, and
    /// replace the cached catalog wholesale. Duplicate raw names within one
    /// provider are a protocol violation.
    pub async fn refresh_tools(&self, limit: Duration) -> Result<Vec<ToolDef>> {
        let mut tools: Vec<ToolDef> = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.take().map(|c| serde_json::json!({ "cursor": c }));
            let response = self
                .round_trip(protocol::METHOD_LIST_TOOLS, params, limit)
                .await?;
            if let Some(err) = response.error {
                return Err(ToolmuxError::Application {
                    provider: self.provider_id.clone(),
                    code: err.code,
                    message: format!("tools/list rejected: {}", err.message),
                    data: err.data,
                });
            }
            let Some(result) = response.result else {
                return Err(self.protocol_error("tools/list response missing result".to_string()));
            };
            let page: protocol::ListToolsResult = serde_json::from_value(result)
                .map_err(|e| self.protocol_error(format!("malformed tools/list result: {e}")))?;
            tools.extend(page.tools);
            cursor = page.next_cursor;
            if cursor.is_none() {
                let mut seen = HashSet::new();
                for def in &tools {
                    if !seen.insert(def.name.as_str()) {
                        return Err(self.protocol_error(format!(
                            "duplicate tool name '{}' in catalog",
                            def.name
                        )));
                    }
                }
                *self.tools.write().await = tools.clone();
                return Ok(tools);
            }
        }
        Err(self.protocol_error(format!(
            "tools/list did not terminate within {MAX_LIST_PAGES} pages"
        )))
    }

    fn protocol_error(&self, reason: String) -> ToolmuxError {
        ToolmuxError::Protocol {
            provider: self.provider_id.clone(),
            reason,
        }
    }

    // ─── Calls ───────────────────────────────────────────────────────────

    /// One `tools/call` round trip. Returns the provider's raw result
    /// payload; protocol-level tool failures and error responses become
    /// Application errors.
    pub async fn call_tool(
        &self,
        raw_name: &str,
        arguments: Value,
        limit: Duration,
    ) -> Result<Value> {
        let params = serde_json::json!({ "name": raw_name, "arguments": arguments });
        let response = self
            .round_trip(protocol::METHOD_CALL_TOOL, Some(params), limit)
            .await?;
        if let Some(err) = response.error {
            return Err(ToolmuxError::Application {
                provider: self.provider_id.clone(),
                code: err.code,
                message: err.message,
                data: err.data,
            });
        }
        let result = response
            .result
            .ok_or_else(|| self.protocol_error("tools/call response missing result".to_string()))?;
        if protocol::is_tool_error(&result) {
            let detail = protocol::content_text(&result);
            let message = if detail.is_empty() {
                "tool reported failure".to_string()
            } else {
                detail
            };
            return Err(ToolmuxError::Application {
                provider: self.provider_id.clone(),
                code: protocol::error_codes::TOOL_EXECUTION_ERROR,
                message,
                data: None,
            });
        }
        Ok(result)
    }

    /// Send one request and suspend on its completion slot. On deadline
    /// expiry the slot is removed before returning, so a late response finds
    /// nothing to wake.
    async fn round_trip(
        &self,
        method: &str,
        params: Option<Value>,
        limit: Duration,
    ) -> Result<JsonRpcResponse> {
        let state = self.state();
        if !matches!(state, SessionState::Ready | SessionState::Handshaking) {
            return Err(self.unavailable(state));
        }

        let id = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let rx = self.pending.insert(id).await;

        // the session may have failed between the state check and the insert
        let state = self.state();
        if state.is_terminal() {
            self.pending.discard(id).await;
            return Err(self.unavailable(state));
        }

        let request = JsonRpcRequest::new(id, method, params);
        let frame = match serde_json::to_string(&request) {
            Ok(frame) => frame,
            Err(e) => {
                self.pending.discard(id).await;
                return Err(self.protocol_error(format!("failed to serialize request: {e}")));
            }
        };
        if let Err(e) = self.transport.send(&frame).await {
            self.pending.discard(id).await;
            return Err(e);
        }

        match timeout(limit, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ToolmuxError::ConnectionLost {
                provider: self.provider_id.clone(),
                reason: "session dropped the pending call".to_string(),
            }),
            Err(_) => {
                self.pending.discard(id).await;
                Err(ToolmuxError::Timeout {
                    provider: self.provider_id.clone(),
                    elapsed_ms: limit.as_millis() as u64,
                })
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let note = JsonRpcNotification::new(method, params);
        let frame = serde_json::to_string(&note)
            .map_err(|e| self.protocol_error(format!("failed to serialize notification: {e}")))?;
        self.transport.send(&frame).await
    }

    fn unavailable(&self, state: SessionState) -> ToolmuxError {
        ToolmuxError::ProviderUnavailable {
            provider: self.provider_id.clone(),
            state: state.to_string(),
        }
    }

    // ─── Reader task ─────────────────────────────────────────────────────

    async fn read_loop(session: Arc<Session>, events: mpsc::UnboundedSender<SessionEvent>) {
        loop {
            match session.transport.receive().await {
                Ok(Some(frame)) => match protocol::decode_frame(&frame) {
                    Ok(Frame::Response(response)) => {
                        let id = response.id;
                        if !session.pending.complete(response).await {
                            tracing::debug!(
                                provider = %session.provider_id,
                                correlation = id,
                                "late response discarded"
                            );
                        }
                    }
                    Ok(Frame::Notification { method, .. }) => {
                        if method == protocol::METHOD_TOOLS_LIST_CHANGED {
                            let _ = events.send(SessionEvent::ToolListChanged);
                        } else {
                            tracing::debug!(
                                provider = %session.provider_id,
                                method = %method,
                                "notification ignored"
                            );
                        }
                    }
                    Ok(Frame::Request { id, method }) => {
                        let reply = protocol::method_not_found_response(&id, &method);
                        if let Err(e) = session.transport.send(&reply).await {
                            tracing::debug!(
                                provider = %session.provider_id,
                                error = %e,
                                "could not answer provider request"
                            );
                        }
                    }
                    Err(reason) => {
                        session
                            .fail(ToolmuxError::Protocol {
                                provider: session.provider_id.clone(),
                                reason,
                            })
                            .await;
                        break;
                    }
                },
                Ok(None) => {
                    match session.state() {
                        SessionState::Draining => {
                            // provider hung up mid-drain: resolve stragglers now
                            session
                                .pending
                                .fail_all(ToolmuxError::ConnectionLost {
                                    provider: session.provider_id.clone(),
                                    reason: "stream closed while draining".to_string(),
                                })
                                .await;
                        }
                        state if state.is_terminal() => {}
                        _ => {
                            session
                                .fail(ToolmuxError::ConnectionLost {
                                    provider: session.provider_id.clone(),
                                    reason: "stream closed by provider".to_string(),
                                })
                                .await;
                        }
                    }
                    break;
                }
                Err(e) => {
                    if !session.state().is_terminal() {
                        session.fail(e).await;
                    }
                    break;
                }
            }
        }
    }

    // ─── Teardown ────────────────────────────────────────────────────────

    /// Move to Failed (absorbing), resolve every pending call with the
    /// failure, and tear the transport down. Later calls are no-ops.
    async fn fail(&self, err: ToolmuxError) {
        let entered = self.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = SessionState::Failed;
                true
            }
        });
        if !entered {
            return;
        }
        tracing::warn!(provider = %self.provider_id, error = %err, "session failed");
        *self.failure.lock().await = Some(err.to_string());
        self.pending.fail_all(err).await;
        self.transport.close(FAIL_CLOSE_GRACE).await;
    }

    /// Drain and close: no new calls are accepted, in-flight calls may
    /// finish until the grace deadline, stragglers resolve Cancelled, then
    /// the transport closes. Idempotent.
    pub async fn shutdown(&self, grace: Duration) {
        let entered = self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == SessionState::Draining {
                false
            } else {
                *state = SessionState::Draining;
                true
            }
        });
        if !entered {
            self.transport.close(FAIL_CLOSE_GRACE).await;
            self.await_reader().await;
            return;
        }

        tracing::info!(provider = %self.provider_id, "draining session");
        if timeout(grace, self.pending.wait_idle()).await.is_err() {
            let outstanding = self.pending.len().await;
            tracing::warn!(
                provider = %self.provider_id,
                outstanding,
                "grace period elapsed, cancelling in-flight calls"
            );
        }
        self.pending
            .fail_all(ToolmuxError::Cancelled {
                provider: self.provider_id.clone(),
            })
            .await;
        let _ = self.notify(protocol::METHOD_SHUTDOWN, None).await;
        self.transport.close(PROCESS_EXIT_GRACE).await;
        self.state.send_if_modified(|state| {
            if *state == SessionState::Draining {
                *state = SessionState::Closed;
                true
            } else {
                false
            }
        });
        self.await_reader().await;
        tracing::info!(provider = %self.provider_id, "session closed");
    }

    async fn await_reader(&self) {
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn response(id: u64) -> JsonRpcResponse {
        JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(serde_json::json!({"ok": true})),
            error: None,
        }
    }

    #[tokio::test]
    async fn complete_resolves_matching_slot() {
        let pending = PendingCalls::new();
        let rx = pending.insert(1).await;
        assert!(pending.complete(response(1)).await);
        let resp = rx.await.unwrap().unwrap();
        assert_eq!(resp.id, 1);
    }

    #[tokio::test]
    async fn late_response_finds_no_slot() {
        let pending = PendingCalls::new();
        let rx = pending.insert(5).await;
        pending.discard(5).await;
        assert!(!pending.complete(response(5)).await);
        // the suspended caller sees the slot vanish, not a stray value
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn responses_route_by_correlation_id() {
        let pending = PendingCalls::new();
        let rx_a = pending.insert(1).await;
        let rx_b = pending.insert(2).await;
        // out-of-order completion
        assert!(pending.complete(response(2)).await);
        assert!(pending.complete(response(1)).await);
        assert_eq!(rx_b.await.unwrap().unwrap().id, 2);
        assert_eq!(rx_a.await.unwrap().unwrap().id, 1);
    }

    #[tokio::test]
    async fn fail_all_fans_out_the_same_error() {
        let pending = PendingCalls::new();
        let rx_a = pending.insert(1).await;
        let rx_b = pending.insert(2).await;
        pending
            .fail_all(ToolmuxError::ConnectionLost {
                provider: "p".to_string(),
                reason: "gone".to_string(),
            })
            .await;
        for rx in [rx_a, rx_b] {
            match rx.await.unwrap() {
                Err(ToolmuxError::ConnectionLost { provider, .. }) => assert_eq!(provider, "p"),
                other => panic!("expected connection lost, got {other:?}"),
            }
        }
        assert_eq!(pending.len().await, 0);
    }

    #[tokio::test]
    async fn wait_idle_wakes_when_last_slot_clears() {
        let pending = Arc::new(PendingCalls::new());
        let _rx = pending.insert(9).await;
        let waiter = {
            let pending = Arc::clone(&pending);
            tokio::spawn(async move { pending.wait_idle().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        pending.discard(9).await;
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait_idle should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn wait_idle_returns_immediately_when_empty() {
        let pending = PendingCalls::new();
        timeout(Duration::from_millis(100), pending.wait_idle())
            .await
            .expect("empty map is idle");
    }

    #[test]
    fn state_predicates() {
        assert!(SessionState::Ready.accepts_calls());
        assert!(!SessionState::Draining.accepts_calls());
        assert!(SessionState::Failed.is_terminal());
        assert!(SessionState::Closed.is_terminal());
        assert!(!SessionState::Handshaking.is_terminal());
        assert_eq!(SessionState::Draining.to_string(), "draining");
    }
}
