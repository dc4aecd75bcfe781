//! toolmux: multi-provider tool orchestration over JSON-RPC.
//!
//! This crate handles:
//! - Connecting to tool providers over subprocess stdio or HTTP streams
//! - The initialize handshake and framed JSON-RPC 2.0 exchange
//! - Tool discovery and aggregation into one dot-namespaced registry
//! - Call dispatch with per-call timeouts, bounded retry, and correlation
//! - Provider lifecycle (start, reconnect with backoff, graceful shutdown)
//!
//! The entry point is [`Orchestrator`]: build one from an
//! [`OrchestratorConfig`], `start()` it, then route calls by namespaced tool
//! name. Provider failures never cross slot boundaries; a sick provider only
//! fails calls addressed to it.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod orchestrator;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use config::{load_providers_config, ProviderSpec, ProvidersConfig, TransportKind};
pub use dispatch::ToolOutput;
pub use error::{Result, ToolmuxError};
pub use orchestrator::{
    Orchestrator, OrchestratorConfig, ProviderStatus, StartReport, DEFAULT_SHUTDOWN_GRACE_MS,
};
pub use registry::{ToolDescriptor, ToolRegistry, NAMESPACE_SEPARATOR};
pub use session::{Session, SessionEvent, SessionState};
