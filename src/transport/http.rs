//! HTTP stream transport: a long-lived server-sent-event response carries
//! inbound frames, outbound frames are POSTed individually.
//!
//! The event stream is pumped into a channel by a dedicated task so that
//! closing the transport never has to wrestle a blocked read; chunk
//! boundaries may fall anywhere, including inside a UTF-8 code point, and
//! the decoder carries partial data between chunks.

use std::collections::HashMap;
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::error::{Result, ToolmuxError};

/// Bi-directional framed transport over HTTP: SSE down, POST up.
pub struct HttpStreamTransport {
    provider_id: String,
    client: reqwest::Client,
    url: String,
    headers: HeaderMap,
    inbound: Mutex<mpsc::UnboundedReceiver<Result<String>>>,
    pump: JoinHandle<()>,
}

impl HttpStreamTransport {
    /// Open the event stream with `Accept: text/event-stream` plus the
    /// spec's extra headers.
    pub(crate) async fn connect(
        provider_id: &str,
        url: &str,
        headers: &HashMap<String, String>,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let header_map = build_header_map(provider_id, headers)?;
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ToolmuxError::Connect {
                provider: provider_id.to_string(),
                reason: format!("failed to build http client: {e}"),
            })?;

        let response = client
            .get(url)
            .headers(header_map.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| ToolmuxError::Connect {
                provider: provider_id.to_string(),
                reason: format!("GET {url}: {e}"),
            })?
            .error_for_status()
            .map_err(|e| ToolmuxError::Connect {
                provider: provider_id.to_string(),
                reason: format!("event stream rejected: {e}"),
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let provider = provider_id.to_string();
        let pump = tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut decoder = SseDecoder::default();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        decoder.push(&bytes);
                        loop {
                            match decoder.next_event() {
                                Ok(Some(event)) => {
                                    if tx.send(Ok(event)).is_err() {
                                        return;
                                    }
                                }
                                Ok(None) => break,
                                Err(reason) => {
                                    let _ = tx.send(Err(ToolmuxError::Protocol {
                                        provider: provider.clone(),
                                        reason,
                                    }));
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(ToolmuxError::ConnectionLost {
                            provider: provider.clone(),
                            reason: format!("event stream error: {e}"),
                        }));
                        return;
                    }
                }
            }
            // stream ended cleanly; dropping the sender surfaces EOF
        });

        Ok(Self {
            provider_id: provider_id.to_string(),
            client,
            url: url.to_string(),
            headers: header_map,
            inbound: Mutex::new(rx),
            pump,
        })
    }

    /// POST one frame. A non-2xx answer counts as connection loss, not an
    /// application result; results arrive on the event stream.
    pub(crate) async fn send(&self, frame: &str) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(frame.to_string())
            .send()
            .await
            .map_err(|e| ToolmuxError::ConnectionLost {
                provider: self.provider_id.clone(),
                reason: format!("POST {}: {e}", self.url),
            })?;
        if !response.status().is_success() {
            return Err(ToolmuxError::ConnectionLost {
                provider: self.provider_id.clone(),
                reason: format!("POST {} returned {}", self.url, response.status()),
            });
        }
        Ok(())
    }

    /// Next event payload. `Ok(None)` means the stream ended cleanly.
    pub(crate) async fn receive(&self) -> Result<Option<String>> {
        match self.inbound.lock().await.recv().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    /// Abort the in-flight GET, dropping the event stream.
    pub(crate) async fn close(&self) {
        self.pump.abort();
        tracing::debug!(provider = %self.provider_id, "event stream closed");
    }
}

fn build_header_map(provider_id: &str, headers: &HashMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let header_name =
            HeaderName::try_from(name.as_str()).map_err(|e| ToolmuxError::Connect {
                provider: provider_id.to_string(),
                reason: format!("invalid header name '{name}': {e}"),
            })?;
        let header_value =
            HeaderValue::try_from(value.as_str()).map_err(|e| ToolmuxError::Connect {
                provider: provider_id.to_string(),
                reason: format!("invalid value for header '{name}': {e}"),
            })?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

// ─── SSE decoding ────────────────────────────────────────────────────────────

/// Incremental server-sent-event decoder. Bytes go in, complete event data
/// payloads come out; everything else (comments, event names, ids) is
/// dropped.
#[derive(Default)]
pub(crate) struct SseDecoder {
    buf: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub(crate) fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete event's data payload, or `None` until more bytes
    /// arrive. Multiple `data:` lines of one event are joined with newlines.
    pub(crate) fn next_event(&mut self) -> std::result::Result<Option<String>, String> {
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = self.buf.drain(..=pos).collect();
            let mut line = String::from_utf8(line_bytes)
                .map_err(|e| format!("event stream is not valid UTF-8: {e}"))?;
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            if line.is_empty() {
                if !self.data.is_empty() {
                    return Ok(Some(std::mem::take(&mut self.data).join("\n")));
                }
                continue;
            }
            if let Some(rest) = line.strip_prefix("data:") {
                self.data.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
            }
            // comments and other fields (event:, id:, retry:) are ignored
        }
        Ok(None)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
