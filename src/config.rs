//! Provider configuration: the table of tool providers the orchestrator owns.
//!
//! Specs come either from a JSON config file (`{"providers": {"<id>": ...}}`,
//! map key = provider id) or are built programmatically. The two transport
//! shapes are distinguished structurally: an entry with `command` is a
//! subprocess provider, an entry with `url` is an HTTP stream provider.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, ToolmuxError};
use crate::registry::NAMESPACE_SEPARATOR;

/// Default budget for transport open plus handshake, per round trip.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
/// Default per-attempt budget for a tool call.
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;
/// Default number of additional attempts for transient call failures.
pub const DEFAULT_MAX_RETRIES: u32 = 1;
/// Default number of reconnect attempts after a session fails.
pub const DEFAULT_MAX_RESTARTS: u32 = 3;

// ─── Runtime spec ────────────────────────────────────────────────────────────

/// Everything the orchestrator needs to own one provider.
#[derive(Debug, Clone)]
pub struct ProviderSpec {
    /// Unique id; doubles as the namespace prefix for the provider's tools.
    pub id: String,
    pub transport: TransportKind,
    pub connect_timeout_ms: u64,
    pub call_timeout_ms: u64,
    /// Keep serving the previously fetched tool catalog while the provider
    /// is down instead of purging it.
    pub cache_tool_list: bool,
    pub max_retries: u32,
    pub max_restarts: u32,
}

impl ProviderSpec {
    /// Spec for a subprocess provider with default timeouts and policies.
    pub fn subprocess<I, S>(id: impl Into<String>, command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            transport: TransportKind::Subprocess {
                command: command.into(),
                args: args.into_iter().map(Into::into).collect(),
                env: HashMap::new(),
                working_dir: None,
            },
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            cache_tool_list: false,
            max_retries: DEFAULT_MAX_RETRIES,
            max_restarts: DEFAULT_MAX_RESTARTS,
        }
    }

    /// Spec for an HTTP stream provider with default timeouts and policies.
    pub fn http_stream(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            transport: TransportKind::HttpStream {
                url: url.into(),
                headers: HashMap::new(),
            },
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            cache_tool_list: false,
            max_retries: DEFAULT_MAX_RETRIES,
            max_restarts: DEFAULT_MAX_RESTARTS,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// How a provider is reached.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TransportKind {
    Subprocess {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        /// Extra environment merged over the parent environment.
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        working_dir: Option<PathBuf>,
    },
    HttpStream {
        url: String,
        /// Extra request headers, e.g. static auth tokens.
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl TransportKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            TransportKind::Subprocess { .. } => "subprocess",
            TransportKind::HttpStream { .. } => "http-stream",
        }
    }
}

// ─── Config file form ────────────────────────────────────────────────────────

/// Top-level provider configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct ProvidersConfig {
    pub providers: HashMap<String, ProviderEntry>,
}

/// One provider entry as written in the config file. The id comes from the
/// map key, everything else from the entry body.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEntry {
    #[serde(flatten)]
    pub transport: TransportKind,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default)]
    pub cache_tool_list: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_call_timeout_ms() -> u64 {
    DEFAULT_CALL_TIMEOUT_MS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_max_restarts() -> u32 {
    DEFAULT_MAX_RESTARTS
}

impl ProviderEntry {
    fn into_spec(self, id: String) -> ProviderSpec {
        ProviderSpec {
            id,
            transport: self.transport,
            connect_timeout_ms: self.connect_timeout_ms,
            call_timeout_ms: self.call_timeout_ms,
            cache_tool_list: self.cache_tool_list,
            max_retries: self.max_retries,
            max_restarts: self.max_restarts,
        }
    }
}

impl ProvidersConfig {
    /// Turn the file form into validated runtime specs, sorted by id so the
    /// startup order is deterministic.
    pub fn into_specs(self) -> Result<Vec<ProviderSpec>> {
        let mut specs: Vec<ProviderSpec> = self
            .providers
            .into_iter()
            .map(|(id, entry)| entry.into_spec(id))
            .collect();
        specs.sort_by(|a, b| a.id.cmp(&b.id));
        for spec in &mut specs {
            expand_spec(spec);
        }
        validate_specs(&specs)?;
        Ok(specs)
    }
}

/// Load and validate a provider table from a JSON config file.
pub fn load_providers_config(path: impl AsRef<Path>) -> Result<Vec<ProviderSpec>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| ToolmuxError::Config {
        reason: format!("cannot read {}: {e}", path.display()),
    })?;
    let config: ProvidersConfig =
        serde_json::from_str(&text).map_err(|e| ToolmuxError::Config {
            reason: format!("cannot parse {}: {e}", path.display()),
        })?;
    config.into_specs()
}

// ─── Validation ──────────────────────────────────────────────────────────────

/// Reject specs that would break namespacing or hang the orchestrator.
pub(crate) fn validate_specs(specs: &[ProviderSpec]) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for spec in specs {
        if spec.id.is_empty() {
            return Err(ToolmuxError::Config {
                reason: "provider id must not be empty".to_string(),
            });
        }
        if spec.id.contains(NAMESPACE_SEPARATOR) {
            return Err(ToolmuxError::Config {
                reason: format!(
                    "provider id '{}' must not contain '{NAMESPACE_SEPARATOR}'",
                    spec.id
                ),
            });
        }
        if !seen.insert(spec.id.as_str()) {
            return Err(ToolmuxError::Config {
                reason: format!("duplicate provider id '{}'", spec.id),
            });
        }
        if spec.connect_timeout_ms == 0 || spec.call_timeout_ms == 0 {
            return Err(ToolmuxError::Config {
                reason: format!("provider '{}' has a zero timeout", spec.id),
            });
        }
        match &spec.transport {
            TransportKind::Subprocess { command, .. } if command.is_empty() => {
                return Err(ToolmuxError::Config {
                    reason: format!("provider '{}' has an empty command", spec.id),
                });
            }
            TransportKind::HttpStream { url, .. } if url.is_empty() => {
                return Err(ToolmuxError::Config {
                    reason: format!("provider '{}' has an empty url", spec.id),
                });
            }
            _ => {}
        }
    }
    Ok(())
}

// ─── Environment expansion ───────────────────────────────────────────────────

/// Expand `${VAR}` placeholders from the process environment. Unset
/// variables leave the placeholder intact so the failure is visible at the
/// provider instead of silently becoming an empty string.
fn expand_placeholders(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(value) => out.push_str(&value),
                    Err(_) => {
                        out.push_str(&rest[start..start + 2 + end + 1]);
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn expand_spec(spec: &mut ProviderSpec) {
    match &mut spec.transport {
        TransportKind::Subprocess { env, .. } => {
            for value in env.values_mut() {
                *value = expand_placeholders(value);
            }
        }
        TransportKind::HttpStream { url, headers } => {
            *url = expand_placeholders(url);
            for value in headers.values_mut() {
                *value = expand_placeholders(value);
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("providers.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn load_mixed_transports() {
        let (_dir, path) = write_config(
            r#"{
                "providers": {
                    "weather": {"command": "python3", "args": ["weather.py"]},
                    "search": {"url": "https://example.com/mcp", "cache_tool_list": true}
                }
            }"#,
        );
        let specs = load_providers_config(&path).unwrap();
        assert_eq!(specs.len(), 2);
        // sorted by id
        assert_eq!(specs[0].id, "search");
        assert_eq!(specs[1].id, "weather");
        assert!(matches!(specs[0].transport, TransportKind::HttpStream { .. }));
        assert!(specs[0].cache_tool_list);
        assert!(matches!(specs[1].transport, TransportKind::Subprocess { .. }));
        assert_eq!(specs[1].call_timeout_ms, DEFAULT_CALL_TIMEOUT_MS);
    }

    #[test]
    fn load_tolerates_unknown_fields() {
        let (_dir, path) = write_config(
            r#"{
                "providers": {
                    "fs": {"command": "fs-server", "comment": "local files", "priority": 3}
                }
            }"#,
        );
        let specs = load_providers_config(&path).unwrap();
        assert_eq!(specs[0].id, "fs");
    }

    #[test]
    fn load_rejects_entry_without_command_or_url() {
        let (_dir, path) = write_config(r#"{"providers": {"bad": {"args": ["x"]}}}"#);
        let err = load_providers_config(&path).unwrap_err();
        assert!(matches!(err, ToolmuxError::Config { .. }));
    }

    #[test]
    fn load_rejects_missing_file() {
        let err = load_providers_config("/nonexistent/providers.json").unwrap_err();
        assert!(matches!(err, ToolmuxError::Config { .. }));
    }

    #[test]
    fn validate_rejects_separator_in_id() {
        let specs = vec![ProviderSpec::subprocess("my.provider", "cmd", Vec::<String>::new())];
        assert!(validate_specs(&specs).is_err());
    }

    #[test]
    fn validate_rejects_duplicate_ids() {
        let specs = vec![
            ProviderSpec::subprocess("fs", "cmd", Vec::<String>::new()),
            ProviderSpec::subprocess("fs", "other", Vec::<String>::new()),
        ];
        assert!(validate_specs(&specs).is_err());
    }

    #[test]
    fn validate_rejects_zero_timeout() {
        let mut spec = ProviderSpec::subprocess("fs", "cmd", Vec::<String>::new());
        spec.call_timeout_ms = 0;
        assert!(validate_specs(&[spec]).is_err());
    }

    #[test]
    fn expand_replaces_known_vars_and_keeps_unknown() {
        std::env::set_var("TOOLMUX_TEST_TOKEN", "sekrit");
        assert_eq!(
            expand_placeholders("Bearer ${TOOLMUX_TEST_TOKEN}"),
            "Bearer sekrit"
        );
        assert_eq!(
            expand_placeholders("${TOOLMUX_TEST_UNSET_VAR}/x"),
            "${TOOLMUX_TEST_UNSET_VAR}/x"
        );
        assert_eq!(expand_placeholders("no placeholders"), "no placeholders");
        assert_eq!(expand_placeholders("dangling ${OPEN"), "dangling ${OPEN");
    }

    #[test]
    fn expansion_applies_to_env_and_headers() {
        std::env::set_var("TOOLMUX_TEST_KEY", "k123");
        let (_dir, path) = write_config(
            r#"{
                "providers": {
                    "sub": {"command": "srv", "env": {"API_KEY": "${TOOLMUX_TEST_KEY}"}},
                    "web": {"url": "https://example.com", "headers": {"x-key": "${TOOLMUX_TEST_KEY}"}}
                }
            }"#,
        );
        let specs = load_providers_config(&path).unwrap();
        match &specs[0].transport {
            TransportKind::Subprocess { env, .. } => {
                assert_eq!(env.get("API_KEY").unwrap(), "k123");
            }
            other => panic!("expected subprocess, got {other:?}"),
        }
        match &specs[1].transport {
            TransportKind::HttpStream { headers, .. } => {
                assert_eq!(headers.get("x-key").unwrap(), "k123");
            }
            other => panic!("expected http stream, got {other:?}"),
        }
    }
}
