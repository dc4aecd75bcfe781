//! Aggregated tool registry.
//!
//! Each provider contributes a catalog of tools; the registry fuses them into
//! one namespace by prefixing every raw tool name with its provider id. Reads
//! go through an immutable snapshot that is rebuilt wholesale whenever any
//! provider's catalog changes, so lookups never block on a refresh and a
//! handed-out snapshot stays internally consistent forever.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::{Result, ToolmuxError};
use crate::protocol::ToolDef;

/// Separator between provider id and raw tool name in namespaced names.
pub const NAMESPACE_SEPARATOR: char = '.';

/// Build the namespaced form of a tool name, `provider.raw_name`.
pub fn namespaced(provider_id: &str, raw_name: &str) -> String {
    format!("{provider_id}{NAMESPACE_SEPARATOR}{raw_name}")
}

// ─── Descriptors ─────────────────────────────────────────────────────────────

/// One tool as exposed by the registry: the provider's raw definition plus
/// the namespaced name callers use to reach it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    /// Name the provider knows the tool by.
    pub raw_name: String,
    /// `provider.raw_name`, unique across the whole registry.
    pub namespaced_name: String,
    pub description: String,
    /// JSON Schema for the tool's arguments, passed through verbatim.
    pub input_schema: Value,
    pub provider_id: String,
}

impl ToolDescriptor {
    fn from_def(provider_id: &str, def: ToolDef) -> Self {
        Self {
            namespaced_name: namespaced(provider_id, &def.name),
            raw_name: def.name,
            description: def.description,
            input_schema: def.input_schema,
            provider_id: provider_id.to_string(),
        }
    }

    /// Check the arguments against the schema's `required` list. This is a
    /// pre-flight check only; full schema validation stays the provider's
    /// job.
    pub fn validate_arguments(&self, arguments: &Value) -> Result<()> {
        let Some(required) = self.input_schema.get("required").and_then(Value::as_array) else {
            return Ok(());
        };
        let names: Vec<&str> = required.iter().filter_map(Value::as_str).collect();
        if names.is_empty() {
            return Ok(());
        }
        let Some(fields) = arguments.as_object() else {
            return Err(ToolmuxError::InvalidArguments {
                tool: self.namespaced_name.clone(),
                reason: format!(
                    "arguments must be an object with required fields [{}]",
                    names.join(", ")
                ),
            });
        };
        let missing: Vec<&str> = names
            .iter()
            .copied()
            .filter(|name| !fields.contains_key(*name))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ToolmuxError::InvalidArguments {
                tool: self.namespaced_name.clone(),
                reason: format!("missing required fields [{}]", missing.join(", ")),
            })
        }
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

struct Inner {
    /// Per-provider catalogs, the source of truth for rebuilds.
    catalogs: HashMap<String, Vec<ToolDescriptor>>,
    /// Flattened view sorted by namespaced name. Replaced, never mutated.
    snapshot: Arc<[ToolDescriptor]>,
}

impl Inner {
    fn rebuild_snapshot(&mut self) {
        let mut all: Vec<ToolDescriptor> = self
            .catalogs
            .values()
            .flat_map(|catalog| catalog.iter().cloned())
            .collect();
        all.sort_by(|a, b| a.namespaced_name.cmp(&b.namespaced_name));
        self.snapshot = all.into();
    }
}

/// Thread-safe registry of every tool across every provider.
pub struct ToolRegistry {
    inner: RwLock<Inner>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                catalogs: HashMap::new(),
                snapshot: Vec::new().into(),
            }),
        }
    }

    /// Replace one provider's catalog wholesale and publish a fresh
    /// snapshot. Returns the number of tools the provider now contributes.
    pub async fn rebuild(&self, provider_id: &str, tools: Vec<ToolDef>) -> usize {
        let catalog: Vec<ToolDescriptor> = tools
            .into_iter()
            .map(|def| ToolDescriptor::from_def(provider_id, def))
            .collect();
        let count = catalog.len();
        let mut inner = self.inner.write().await;
        inner.catalogs.insert(provider_id.to_string(), catalog);
        inner.rebuild_snapshot();
        tracing::debug!(provider = %provider_id, tools = count, "registry rebuilt");
        count
    }

    /// Drop a provider's contribution entirely. Returns false when the
    /// provider had none.
    pub async fn remove_provider(&self, provider_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        let removed = inner.catalogs.remove(provider_id).is_some();
        if removed {
            inner.rebuild_snapshot();
            tracing::debug!(provider = %provider_id, "registry entries removed");
        }
        removed
    }

    /// The current immutable view, sorted by namespaced name.
    pub async fn snapshot(&self) -> Arc<[ToolDescriptor]> {
        Arc::clone(&self.inner.read().await.snapshot)
    }

    /// Look up a tool by its exact namespaced name.
    pub async fn resolve(&self, namespaced_name: &str) -> Result<ToolDescriptor> {
        let snapshot = self.snapshot().await;
        snapshot
            .binary_search_by(|tool| tool.namespaced_name.as_str().cmp(namespaced_name))
            .map(|idx| snapshot[idx].clone())
            .map_err(|_| ToolmuxError::UnknownTool {
                name: namespaced_name.to_string(),
            })
    }

    /// How many tools one provider currently contributes.
    pub async fn provider_tool_count(&self, provider_id: &str) -> usize {
        self.inner
            .read()
            .await
            .catalogs
            .get(provider_id)
            .map_or(0, Vec::len)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.snapshot.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn def(name: &str) -> ToolDef {
        ToolDef {
            name: name.to_string(),
            description: format!("{name} tool"),
            input_schema: json!({"type": "object"}),
        }
    }

    #[tokio::test]
    async fn rebuild_replaces_catalog_wholesale() {
        let registry = ToolRegistry::new();
        registry
            .rebuild("weather", vec![def("get_forecast"), def("get_alerts")])
            .await;
        assert_eq!(registry.len().await, 2);

        registry.rebuild("weather", vec![def("get_forecast")]).await;
        assert_eq!(registry.len().await, 1);
        assert!(registry.resolve("weather.get_alerts").await.is_err());
        assert!(registry.resolve("weather.get_forecast").await.is_ok());
    }

    #[tokio::test]
    async fn same_raw_name_across_providers_does_not_collide() {
        let registry = ToolRegistry::new();
        registry.rebuild("alpha", vec![def("echo")]).await;
        registry.rebuild("beta", vec![def("echo")]).await;

        let a = registry.resolve("alpha.echo").await.unwrap();
        let b = registry.resolve("beta.echo").await.unwrap();
        assert_eq!(a.provider_id, "alpha");
        assert_eq!(b.provider_id, "beta");
        assert_eq!(a.raw_name, "echo");
        assert_eq!(b.raw_name, "echo");
    }

    #[tokio::test]
    async fn snapshot_order_ignores_insertion_order() {
        let forward = ToolRegistry::new();
        forward.rebuild("alpha", vec![def("echo")]).await;
        forward.rebuild("beta", vec![def("echo")]).await;

        let reverse = ToolRegistry::new();
        reverse.rebuild("beta", vec![def("echo")]).await;
        reverse.rebuild("alpha", vec![def("echo")]).await;

        let names = |snapshot: Arc<[ToolDescriptor]>| {
            snapshot
                .iter()
                .map(|t| t.namespaced_name.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(
            names(forward.snapshot().await),
            names(reverse.snapshot().await)
        );
        assert_eq!(
            names(forward.snapshot().await),
            vec!["alpha.echo".to_string(), "beta.echo".to_string()]
        );
    }

    #[tokio::test]
    async fn old_snapshots_survive_rebuilds() {
        let registry = ToolRegistry::new();
        registry.rebuild("fs", vec![def("list_directory")]).await;
        let before = registry.snapshot().await;

        registry.rebuild("fs", Vec::new()).await;
        assert_eq!(registry.len().await, 0);
        // the earlier view is untouched
        assert_eq!(before.len(), 1);
        assert_eq!(before[0].namespaced_name, "fs.list_directory");
    }

    #[tokio::test]
    async fn resolve_requires_exact_namespaced_name() {
        let registry = ToolRegistry::new();
        registry.rebuild("weather", vec![def("get_forecast")]).await;

        match registry.resolve("get_forecast").await {
            Err(ToolmuxError::UnknownTool { name }) => assert_eq!(name, "get_forecast"),
            other => panic!("expected unknown tool, got {other:?}"),
        }
        assert!(registry.resolve("weather.get_forecast ").await.is_err());
        assert!(registry.resolve("Weather.get_forecast").await.is_err());
    }

    #[tokio::test]
    async fn remove_provider_purges_only_its_tools() {
        let registry = ToolRegistry::new();
        registry.rebuild("alpha", vec![def("echo")]).await;
        registry.rebuild("beta", vec![def("echo")]).await;

        assert!(registry.remove_provider("alpha").await);
        assert!(!registry.remove_provider("alpha").await);
        assert!(registry.resolve("alpha.echo").await.is_err());
        assert!(registry.resolve("beta.echo").await.is_ok());
        assert_eq!(registry.provider_tool_count("alpha").await, 0);
        assert_eq!(registry.provider_tool_count("beta").await, 1);
    }

    #[test]
    fn required_fields_are_enforced() {
        let descriptor = ToolDescriptor::from_def(
            "weather",
            ToolDef {
                name: "get_forecast".to_string(),
                description: String::new(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "latitude": {"type": "number"},
                        "longitude": {"type": "number"}
                    },
                    "required": ["latitude", "longitude"]
                }),
            },
        );

        assert!(descriptor
            .validate_arguments(&json!({"latitude": 48.2, "longitude": 16.4}))
            .is_ok());

        match descriptor.validate_arguments(&json!({"latitude": 48.2})) {
            Err(ToolmuxError::InvalidArguments { tool, reason }) => {
                assert_eq!(tool, "weather.get_forecast");
                assert!(reason.contains("longitude"));
            }
            other => panic!("expected invalid arguments, got {other:?}"),
        }

        assert!(descriptor.validate_arguments(&json!("not an object")).is_err());
    }

    #[test]
    fn schema_without_required_accepts_anything() {
        let descriptor = ToolDescriptor::from_def("echo", def("echo"));
        assert!(descriptor.validate_arguments(&json!({})).is_ok());
        assert!(descriptor.validate_arguments(&json!(null)).is_ok());
    }
}
