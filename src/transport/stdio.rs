//! Subprocess transport: newline-delimited JSON over a child's stdio.
//!
//! stdin and stdout carry the protocol; stderr is the provider's log channel
//! and is drained continuously so a chatty provider can never block on a
//! full pipe. The most recent stderr lines are kept for failure diagnostics.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::error::{Result, ToolmuxError};

/// Lines of provider stderr retained for diagnostics.
const STDERR_TAIL_LINES: usize = 40;

/// Bi-directional framed transport over a child process's stdio.
pub struct StdioTransport {
    provider_id: String,
    writer: Mutex<Option<ChildStdin>>,
    reader: Mutex<BufReader<ChildStdout>>,
    child: Mutex<Child>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl StdioTransport {
    /// Spawn the provider process with the parent environment plus the
    /// spec's overrides, wiring all three stdio pipes.
    pub(crate) async fn spawn(
        provider_id: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        working_dir: Option<&Path>,
    ) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args);
        for (key, value) in env {
            cmd.env(key, value);
        }
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| ToolmuxError::Connect {
            provider: provider_id.to_string(),
            reason: format!("failed to spawn '{command}': {e}"),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| ToolmuxError::Connect {
            provider: provider_id.to_string(),
            reason: "failed to capture stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| ToolmuxError::Connect {
            provider: provider_id.to_string(),
            reason: "failed to capture stdout".to_string(),
        })?;

        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));
        if let Some(stderr) = child.stderr.take() {
            let tail = Arc::clone(&stderr_tail);
            let provider = provider_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(provider = %provider, "stderr: {line}");
                    let mut tail = tail.lock().await;
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            });
        }

        Ok(Self {
            provider_id: provider_id.to_string(),
            writer: Mutex::new(Some(stdin)),
            reader: Mutex::new(BufReader::new(stdout)),
            child: Mutex::new(child),
            stderr_tail,
        })
    }

    /// Write one frame, newline-terminated. Frames must be single lines.
    pub(crate) async fn send(&self, frame: &str) -> Result<()> {
        if frame.contains('\n') {
            return Err(ToolmuxError::Protocol {
                provider: self.provider_id.clone(),
                reason: "outbound frame contains an embedded newline".to_string(),
            });
        }
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or_else(|| ToolmuxError::ConnectionLost {
            provider: self.provider_id.clone(),
            reason: "stdin already closed".to_string(),
        })?;
        writer
            .write_all(frame.as_bytes())
            .await
            .map_err(|e| self.write_error(e))?;
        writer.write_all(b"\n").await.map_err(|e| self.write_error(e))?;
        writer.flush().await.map_err(|e| self.write_error(e))?;
        Ok(())
    }

    fn write_error(&self, e: std::io::Error) -> ToolmuxError {
        ToolmuxError::ConnectionLost {
            provider: self.provider_id.clone(),
            reason: format!("failed to write to stdin: {e}"),
        }
    }

    /// Next frame from stdout. Blank lines are framing noise and skipped;
    /// `Ok(None)` means the process closed its stdout.
    pub(crate) async fn receive(&self) -> Result<Option<String>> {
        let mut reader = self.reader.lock().await;
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => return Ok(None),
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    return Ok(Some(trimmed.to_string()));
                }
                Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                    return Err(ToolmuxError::Protocol {
                        provider: self.provider_id.clone(),
                        reason: format!("stdout is not valid UTF-8: {e}"),
                    });
                }
                Err(e) => {
                    return Err(ToolmuxError::ConnectionLost {
                        provider: self.provider_id.clone(),
                        reason: format!("failed to read stdout: {e}"),
                    });
                }
            }
        }
    }

    /// Close stdin (EOF is the conventional stop request for a stdio
    /// provider), wait up to `grace` for exit, then kill. Never leaves a
    /// running child behind.
    pub(crate) async fn close(&self, grace: Duration) {
        self.writer.lock().await.take();
        let mut child = self.child.lock().await;
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(
                    provider = %self.provider_id,
                    status = %status,
                    "provider process exited"
                );
            }
            _ => {
                tracing::warn!(
                    provider = %self.provider_id,
                    grace_ms = grace.as_millis() as u64,
                    "provider did not exit within grace period, killing"
                );
                let _ = child.kill().await;
            }
        }
    }

    /// Recent stderr output, newest last.
    pub(crate) async fn diagnostics(&self) -> Option<String> {
        let tail = self.stderr_tail.lock().await;
        if tail.is_empty() {
            None
        } else {
            Some(tail.iter().cloned().collect::<Vec<_>>().join("\n"))
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env() -> HashMap<String, String> {
        HashMap::new()
    }

    #[tokio::test]
    async fn spawn_nonexistent_command_is_connect_error() {
        let result = StdioTransport::spawn(
            "ghost",
            "/nonexistent/binary/xyz",
            &[],
            &no_env(),
            None,
        )
        .await;
        match result {
            Err(ToolmuxError::Connect { provider, .. }) => assert_eq!(provider, "ghost"),
            other => panic!("expected connect error, got {:?}", other.is_ok()),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn frames_round_trip_through_cat() {
        let transport = StdioTransport::spawn("cat", "cat", &[], &no_env(), None)
            .await
            .unwrap();
        transport.send(r#"{"jsonrpc":"2.0","id":1}"#).await.unwrap();
        let frame = transport.receive().await.unwrap().unwrap();
        assert_eq!(frame, r#"{"jsonrpc":"2.0","id":1}"#);
        transport.close(Duration::from_millis(500)).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn receive_skips_blank_lines() {
        let transport = StdioTransport::spawn(
            "sh",
            "sh",
            &["-c".to_string(), r#"echo; echo; echo '{"ok":true}'"#.to_string()],
            &no_env(),
            None,
        )
        .await
        .unwrap();
        let frame = transport.receive().await.unwrap().unwrap();
        assert_eq!(frame, r#"{"ok":true}"#);
        transport.close(Duration::from_millis(500)).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn send_rejects_embedded_newline() {
        let transport = StdioTransport::spawn("cat", "cat", &[], &no_env(), None)
            .await
            .unwrap();
        let err = transport.send("{\"a\":1}\n{\"b\":2}").await.unwrap_err();
        assert!(matches!(err, ToolmuxError::Protocol { .. }));
        transport.close(Duration::from_millis(500)).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn close_kills_process_that_ignores_eof() {
        let transport = StdioTransport::spawn(
            "sleep",
            "sleep",
            &["30".to_string()],
            &no_env(),
            None,
        )
        .await
        .unwrap();
        let started = std::time::Instant::now();
        transport.close(Duration::from_millis(100)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn diagnostics_captures_stderr_tail() {
        let transport = StdioTransport::spawn(
            "sh",
            "sh",
            &["-c".to_string(), "echo boom >&2; sleep 1".to_string()],
            &no_env(),
            None,
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let diag = transport.diagnostics().await.unwrap();
        assert!(diag.contains("boom"));
        transport.close(Duration::from_millis(100)).await;
    }
}
