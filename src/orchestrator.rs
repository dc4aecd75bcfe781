//! Multi-provider orchestration.
//!
//! The orchestrator owns one slot per configured provider: the spec, the
//! current session (if any), and a monitor task that watches session state.
//! Provider failures stay inside their slot. A crashing, hanging, or
//! garbage-emitting provider affects only calls routed to it; every other
//! provider keeps serving through the shared registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::config::{validate_specs, ProviderSpec};
use crate::dispatch::{dispatch, ToolOutput};
use crate::error::{Result, ToolmuxError};
use crate::registry::{ToolDescriptor, ToolRegistry};
use crate::session::{Session, SessionEvent, SessionState};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Base delay between reconnect attempts (doubles each time).
const RESTART_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default grace period for draining in-flight calls on `stop`.
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;

// ─── Configuration and reports ───────────────────────────────────────────────

/// Top-level orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub providers: Vec<ProviderSpec>,
    /// How long `stop` lets in-flight calls finish before cancelling them.
    pub shutdown_grace_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
        }
    }
}

impl OrchestratorConfig {
    pub fn new(providers: Vec<ProviderSpec>) -> Self {
        Self {
            providers,
            ..Self::default()
        }
    }
}

/// Outcome of `start`: which providers came up and which did not. Zero ready
/// providers is a report, not an error; the caller decides what it means.
#[derive(Debug)]
pub struct StartReport {
    pub ready: Vec<String>,
    pub failed: Vec<(String, ToolmuxError)>,
}

impl StartReport {
    /// Every configured provider is up.
    pub fn fully_ready(&self) -> bool {
        self.failed.is_empty()
    }

    /// At least one provider is up.
    pub fn any_ready(&self) -> bool {
        !self.ready.is_empty()
    }
}

/// Point-in-time view of one provider, for status surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub provider_id: String,
    pub state: SessionState,
    pub transport: &'static str,
    pub tool_count: usize,
    pub connected_at: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub last_error: Option<String>,
}

// ─── Provider slots ──────────────────────────────────────────────────────────

/// Everything the orchestrator holds for one provider. The slot outlives any
/// individual session; reconnects swap the session, never the slot.
struct ProviderSlot {
    spec: Arc<ProviderSpec>,
    session: RwLock<Option<Arc<Session>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    restart_count: AtomicU32,
    connected_at: Mutex<Option<DateTime<Utc>>>,
    last_error: Mutex<Option<String>>,
}

impl ProviderSlot {
    fn new(spec: ProviderSpec) -> Self {
        Self {
            spec: Arc::new(spec),
            session: RwLock::new(None),
            monitor: Mutex::new(None),
            restart_count: AtomicU32::new(0),
            connected_at: Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }

    async fn stand_down_monitor(&self) {
        if let Some(monitor) = self.monitor.lock().await.take() {
            monitor.abort();
            let _ = monitor.await;
        }
    }
}

// ─── Orchestrator ────────────────────────────────────────────────────────────

/// Owns all provider connections and the aggregated tool registry.
pub struct Orchestrator {
    slots: RwLock<HashMap<String, Arc<ProviderSlot>>>,
    registry: Arc<ToolRegistry>,
    stopping: Arc<AtomicBool>,
    shutdown_grace: Duration,
}

impl Orchestrator {
    /// Validate the provider table and build an orchestrator. No connections
    /// are made until `start`.
    pub fn new(config: OrchestratorConfig) -> Result<Self> {
        validate_specs(&config.providers)?;
        let slots = config
            .providers
            .into_iter()
            .map(|spec| (spec.id.clone(), Arc::new(ProviderSlot::new(spec))))
            .collect();
        Ok(Self {
            slots: RwLock::new(slots),
            registry: Arc::new(ToolRegistry::new()),
            stopping: Arc::new(AtomicBool::new(false)),
            shutdown_grace: Duration::from_millis(config.shutdown_grace_ms),
        })
    }

    /// Connect every configured provider concurrently. Failures are isolated
    /// per provider and collected in the report.
    pub async fn start(&self) -> StartReport {
        self.stopping.store(false, Ordering::SeqCst);
        let slots: Vec<Arc<ProviderSlot>> =
            self.slots.read().await.values().cloned().collect();

        let mut handles = Vec::with_capacity(slots.len());
        for slot in slots {
            let id = slot.spec.id.clone();
            let registry = Arc::clone(&self.registry);
            let stopping = Arc::clone(&self.stopping);
            handles.push((
                id,
                tokio::spawn(connect_provider(slot, registry, stopping)),
            ));
        }

        let mut ready = Vec::new();
        let mut failed = Vec::new();
        for (id, handle) in handles {
            match handle.await {
                Ok(Ok(())) => ready.push(id),
                Ok(Err(e)) => {
                    if let Some(slot) = self.slots.read().await.get(&id) {
                        *slot.last_error.lock().await = Some(e.to_string());
                    }
                    failed.push((id, e));
                }
                Err(e) => {
                    let reason = format!("connect task panicked: {e}");
                    failed.push((
                        id.clone(),
                        ToolmuxError::Connect {
                            provider: id,
                            reason,
                        },
                    ));
                }
            }
        }
        ready.sort();
        failed.sort_by(|a, b| a.0.cmp(&b.0));
        tracing::info!(
            ready = ready.len(),
            failed = failed.len(),
            "orchestrator started"
        );
        StartReport { ready, failed }
    }

    /// The current registry snapshot, sorted by namespaced name.
    pub async fn list_tools(&self) -> Arc<[ToolDescriptor]> {
        self.registry.snapshot().await
    }

    /// Call a tool by namespaced name with the provider's configured
    /// call timeout.
    pub async fn call_tool(&self, namespaced_name: &str, arguments: Value) -> Result<ToolOutput> {
        self.run_call(namespaced_name, arguments, None).await
    }

    /// Call a tool with an explicit per-call timeout overriding the
    /// provider's default.
    pub async fn call_tool_with_timeout(
        &self,
        namespaced_name: &str,
        arguments: Value,
        limit: Duration,
    ) -> Result<ToolOutput> {
        self.run_call(namespaced_name, arguments, Some(limit)).await
    }

    async fn run_call(
        &self,
        namespaced_name: &str,
        arguments: Value,
        limit: Option<Duration>,
    ) -> Result<ToolOutput> {
        let descriptor = self.registry.resolve(namespaced_name).await?;
        descriptor.validate_arguments(&arguments)?;

        let slot = self
            .slots
            .read()
            .await
            .get(&descriptor.provider_id)
            .cloned()
            .ok_or_else(|| ToolmuxError::ProviderUnavailable {
                provider: descriptor.provider_id.clone(),
                state: "removed".to_string(),
            })?;
        let session =
            slot.session
                .read()
                .await
                .clone()
                .ok_or_else(|| ToolmuxError::ProviderUnavailable {
                    provider: descriptor.provider_id.clone(),
                    state: SessionState::Disconnected.to_string(),
                })?;
        let state = session.state();
        if !state.accepts_calls() {
            return Err(ToolmuxError::ProviderUnavailable {
                provider: descriptor.provider_id.clone(),
                state: state.to_string(),
            });
        }

        let limit = limit.unwrap_or_else(|| slot.spec.call_timeout());
        dispatch(&session, &descriptor, arguments, limit, slot.spec.max_retries).await
    }

    /// Per-provider status, sorted by provider id.
    pub async fn status(&self) -> Vec<ProviderStatus> {
        let slots = self.slots.read().await;
        let mut out = Vec::with_capacity(slots.len());
        for (id, slot) in slots.iter() {
            let state = match slot.session.read().await.as_ref() {
                Some(session) => session.state(),
                None => SessionState::Disconnected,
            };
            out.push(ProviderStatus {
                provider_id: id.clone(),
                state,
                transport: slot.spec.transport.kind_name(),
                tool_count: self.registry.provider_tool_count(id).await,
                connected_at: *slot.connected_at.lock().await,
                restart_count: slot.restart_count.load(Ordering::SeqCst),
                last_error: slot.last_error.lock().await.clone(),
            });
        }
        out.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        out
    }

    /// Tear down any existing session for `id` and connect a fresh one.
    pub async fn restart_provider(&self, id: &str) -> Result<()> {
        let slot = self
            .slots
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ToolmuxError::Config {
                reason: format!("unknown provider '{id}'"),
            })?;
        // stand the monitor down so no reconnect races this restart
        slot.stand_down_monitor().await;
        if let Some(session) = slot.session.write().await.take() {
            session.shutdown(Duration::ZERO).await;
        }
        connect_provider(
            Arc::clone(&slot),
            Arc::clone(&self.registry),
            Arc::clone(&self.stopping),
        )
        .await?;
        slot.restart_count.fetch_add(1, Ordering::SeqCst);
        tracing::info!(provider = %id, "provider restarted");
        Ok(())
    }

    /// Drain a provider's session, purge its registry entries, and forget it.
    pub async fn remove_provider(&self, id: &str) -> Result<()> {
        let slot =
            self.slots
                .write()
                .await
                .remove(id)
                .ok_or_else(|| ToolmuxError::Config {
                    reason: format!("unknown provider '{id}'"),
                })?;
        slot.stand_down_monitor().await;
        if let Some(session) = slot.session.write().await.take() {
            session.shutdown(self.shutdown_grace).await;
        }
        self.registry.remove_provider(id).await;
        tracing::info!(provider = %id, "provider removed");
        Ok(())
    }

    /// Drain every session concurrently: in-flight calls may finish within
    /// the shutdown grace, stragglers resolve Cancelled, transports close.
    /// Idempotent; afterwards every call fails with `ProviderUnavailable`.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let slots: Vec<Arc<ProviderSlot>> =
            self.slots.read().await.values().cloned().collect();

        // monitors first so no reconnect races the drain
        for slot in &slots {
            slot.stand_down_monitor().await;
        }

        let grace = self.shutdown_grace;
        let mut handles = Vec::new();
        for slot in &slots {
            if let Some(session) = slot.session.write().await.take() {
                handles.push(tokio::spawn(async move { session.shutdown(grace).await }));
            }
        }
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("orchestrator stopped");
    }
}

// ─── Connection and monitoring ───────────────────────────────────────────────

/// Connect one provider, publish its catalog, and spawn its monitor. The
/// session lands in the slot immediately after the handshake so a concurrent
/// teardown can always reach it. Refuses once the orchestrator is stopping
/// and leaves an already-live session in place rather than orphaning it.
///
/// Boxed because the monitor re-enters this function when reconnecting a
/// failed provider; the recursion needs a concrete future type.
fn connect_provider(
    slot: Arc<ProviderSlot>,
    registry: Arc<ToolRegistry>,
    stopping: Arc<AtomicBool>,
) -> BoxFuture<'static, Result<()>> {
    Box::pin(async move {
        if stopping.load(Ordering::SeqCst) {
            return Err(ToolmuxError::ProviderUnavailable {
                provider: slot.spec.id.clone(),
                state: "stopped".to_string(),
            });
        }
        let live = slot
            .session
            .read()
            .await
            .as_ref()
            .is_some_and(|session| !session.state().is_terminal());
        if live {
            tracing::debug!(provider = %slot.spec.id, "session already live, leaving it in place");
            return Ok(());
        }

        let (session, events) = Session::connect(&slot.spec).await?;
        *slot.session.write().await = Some(Arc::clone(&session));

        let tools = session.cached_tools().await;
        let count = registry.rebuild(&slot.spec.id, tools).await;
        *slot.connected_at.lock().await = Some(Utc::now());
        *slot.last_error.lock().await = None;
        tracing::info!(provider = %slot.spec.id, tools = count, "provider ready");

        let monitor = tokio::spawn(monitor_provider(
            Arc::clone(&slot),
            registry,
            stopping,
            session,
            events,
        ));
        *slot.monitor.lock().await = Some(monitor);
        Ok(())
    })
}

/// Watch one session until it ends. Services catalog-change notifications
/// while the session is healthy; hands a failure to the reconnect policy.
async fn monitor_provider(
    slot: Arc<ProviderSlot>,
    registry: Arc<ToolRegistry>,
    stopping: Arc<AtomicBool>,
    session: Arc<Session>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
) {
    let mut state_rx = session.watch_state();
    let failed = loop {
        let state = *state_rx.borrow_and_update();
        if state == SessionState::Failed {
            break true;
        }
        if state == SessionState::Closed {
            break false;
        }
        tokio::select! {
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break false;
                }
            }
            event = events.recv() => match event {
                Some(SessionEvent::ToolListChanged) => {
                    tracing::info!(provider = %slot.spec.id, "tool list change announced, refreshing");
                    match session.refresh_tools(slot.spec.call_timeout()).await {
                        Ok(tools) => {
                            let count = registry.rebuild(&slot.spec.id, tools).await;
                            tracing::info!(provider = %slot.spec.id, tools = count, "catalog refreshed");
                        }
                        Err(e) => {
                            tracing::warn!(provider = %slot.spec.id, error = %e, "catalog refresh failed");
                        }
                    }
                }
                None => {
                    // reader gone; the next state transition settles the cause
                    if state_rx.changed().await.is_err() {
                        break false;
                    }
                }
            }
        }
    };
    if failed {
        handle_failure(slot, registry, stopping, session).await;
    }
}

/// Reconnect policy for a failed session: purge or retain the catalog per
/// `cache_tool_list`, then retry with exponential backoff up to the spec's
/// `max_restarts`.
async fn handle_failure(
    slot: Arc<ProviderSlot>,
    registry: Arc<ToolRegistry>,
    stopping: Arc<AtomicBool>,
    session: Arc<Session>,
) {
    let reason = session.failure_reason().await;
    *slot.last_error.lock().await = reason.clone();
    tracing::warn!(
        provider = %slot.spec.id,
        error = reason.as_deref().unwrap_or("unknown"),
        "provider session failed"
    );

    if slot.spec.cache_tool_list {
        tracing::info!(
            provider = %slot.spec.id,
            "serving cached catalog while the provider is down"
        );
    } else {
        registry.remove_provider(&slot.spec.id).await;
    }

    let max_restarts = slot.spec.max_restarts;
    for attempt in 1..=max_restarts {
        if stopping.load(Ordering::SeqCst) {
            return;
        }
        let delay = RESTART_BASE_DELAY * 2u32.pow(attempt - 1);
        tracing::info!(
            provider = %slot.spec.id,
            attempt,
            max_restarts,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        sleep(delay).await;
        if stopping.load(Ordering::SeqCst) {
            return;
        }
        match connect_provider(
            Arc::clone(&slot),
            Arc::clone(&registry),
            Arc::clone(&stopping),
        )
        .await
        {
            Ok(()) => {
                slot.restart_count.fetch_add(1, Ordering::SeqCst);
                tracing::info!(provider = %slot.spec.id, attempt, "provider reconnected");
                return;
            }
            Err(e) => {
                *slot.last_error.lock().await = Some(e.to_string());
                tracing::warn!(
                    provider = %slot.spec.id,
                    attempt,
                    error = %e,
                    "reconnect attempt failed"
                );
            }
        }
    }
    tracing::error!(
        provider = %slot.spec.id,
        attempts = max_restarts,
        "reconnect attempts exhausted, provider stays down"
    );
}

// ─── Tests ───────────────────────────────────────────────────────────────────
