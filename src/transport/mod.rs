//! Byte-level provider connections.
//!
//! One `Transport` per session: open, framed send/receive, close. A frame is
//! an opaque JSON text here (one line on stdio, one event on an HTTP stream);
//! interpreting frames is the session's job.

mod http;
mod stdio;

use std::time::Duration;

pub use http::HttpStreamTransport;
pub use stdio::StdioTransport;

use crate::config::{ProviderSpec, TransportKind};
use crate::error::Result;

/// A connected provider endpoint, one of the two supported kinds.
pub enum Transport {
    Stdio(StdioTransport),
    HttpStream(HttpStreamTransport),
}

impl Transport {
    /// Establish the connection described by the spec. The caller bounds the
    /// whole attempt with the spec's connect timeout.
    pub async fn open(spec: &ProviderSpec) -> Result<Self> {
        match &spec.transport {
            TransportKind::Subprocess {
                command,
                args,
                env,
                working_dir,
            } => {
                let transport = StdioTransport::spawn(
                    &spec.id,
                    command,
                    args,
                    env,
                    working_dir.as_deref(),
                )
                .await?;
                Ok(Transport::Stdio(transport))
            }
            TransportKind::HttpStream { url, headers } => {
                let transport = HttpStreamTransport::connect(
                    &spec.id,
                    url,
                    headers,
                    spec.connect_timeout(),
                )
                .await?;
                Ok(Transport::HttpStream(transport))
            }
        }
    }

    /// Transmit one framed message.
    pub async fn send(&self, frame: &str) -> Result<()> {
        match self {
            Transport::Stdio(t) => t.send(frame).await,
            Transport::HttpStream(t) => t.send(frame).await,
        }
    }

    /// Next inbound framed message. `Ok(None)` means the peer closed the
    /// stream cleanly.
    pub async fn receive(&self) -> Result<Option<String>> {
        match self {
            Transport::Stdio(t) => t.receive().await,
            Transport::HttpStream(t) => t.receive().await,
        }
    }

    /// Signal graceful termination, force-terminate after the grace period.
    pub async fn close(&self, grace: Duration) {
        match self {
            Transport::Stdio(t) => t.close(grace).await,
            Transport::HttpStream(t) => t.close().await,
        }
    }

    /// Best-effort human-readable failure detail (subprocess stderr tail).
    pub async fn diagnostics(&self) -> Option<String> {
        match self {
            Transport::Stdio(t) => t.diagnostics().await,
            Transport::HttpStream(_) => None,
        }
    }
}
