//! Call dispatch with bounded retry.
//!
//! One dispatch covers the full life of a logical tool call: a uuid call id
//! that is stable across retries, per-attempt deadlines enforced by the
//! session, and exponential backoff for the transient failure kinds only.

use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;
use crate::registry::ToolDescriptor;
use crate::session::{Session, SessionState};

/// Base delay before the first retry; doubles per attempt.
pub(crate) const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// Successful outcome of one dispatched call.
#[derive(Debug, Clone, Serialize)]
pub struct ToolOutput {
    /// Raw result value tree from the provider, passed through opaque.
    pub payload: Value,
    pub provider_id: String,
    /// Wall time for the whole dispatch, retries included.
    pub elapsed_ms: u64,
}

/// Run one logical call against a session, retrying transient failures up to
/// `max_retries` times. Application errors, protocol violations, and
/// cancellations surface on the first occurrence.
pub(crate) async fn dispatch(
    session: &Session,
    descriptor: &ToolDescriptor,
    arguments: Value,
    limit: Duration,
    max_retries: u32,
) -> Result<ToolOutput> {
    let call_id = Uuid::new_v4();
    let started = Instant::now();
    let mut attempt: u32 = 0;
    tracing::debug!(
        call_id = %call_id,
        tool = %descriptor.namespaced_name,
        provider = %descriptor.provider_id,
        "dispatching call"
    );
    loop {
        match session
            .call_tool(&descriptor.raw_name, arguments.clone(), limit)
            .await
        {
            Ok(payload) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                tracing::debug!(
                    call_id = %call_id,
                    tool = %descriptor.namespaced_name,
                    elapsed_ms,
                    attempts = attempt + 1,
                    "call completed"
                );
                return Ok(ToolOutput {
                    payload,
                    provider_id: descriptor.provider_id.clone(),
                    elapsed_ms,
                });
            }
            Err(e) => {
                let retriable = e.is_transient()
                    && attempt < max_retries
                    && session.state() == SessionState::Ready;
                if !retriable {
                    tracing::debug!(
                        call_id = %call_id,
                        tool = %descriptor.namespaced_name,
                        error = %e,
                        attempts = attempt + 1,
                        "call failed"
                    );
                    return Err(e);
                }
                attempt += 1;
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                tracing::warn!(
                    call_id = %call_id,
                    tool = %descriptor.namespaced_name,
                    error = %e,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
