//! Plugin registry: gating, config validation, and registration commit.
//!
//! Failures are isolated per plugin — a bad config or a panicking schema
//! disables only that plugin, surfaced as a diagnostic. Registrations from
//! failed plugins are never applied.

use crate::config::PluginsConfig;
use crate::plugins::traits::{GatewayMethod, Plugin, PluginApi, PluginCli, PluginService, PluginTool};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginStatus {
    Loaded,
    Disabled,
    Error,
}

#[derive(Clone)]
pub struct PluginRecord {
    pub id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: PluginStatus,
    pub diagnostics: Vec<String>,
}

#[derive(Default)]
pub struct PluginRegistry {
    records: Vec<PluginRecord>,
    tools: HashMap<String, PluginTool>,
    gateway_methods: HashMap<String, GatewayMethod>,
    services: Vec<Arc<dyn PluginService>>,
    cli_commands: Vec<Arc<dyn PluginCli>>,
}

impl PluginRegistry {
    /// Load `plugins` under the gating config. `core_tools` are the
    /// gateway's own tool names; plugin tools may not shadow them.
    pub fn load(
        plugins: Vec<Box<dyn Plugin>>,
        config: &PluginsConfig,
        core_tools: &[String],
    ) -> Self {
        let mut registry = Self::default();

        for plugin in plugins {
            let id = plugin.id().to_string();
            let mut record = PluginRecord {
                id: id.clone(),
                name: plugin.name().map(str::to_string),
                description: plugin.description().map(str::to_string),
                status: PluginStatus::Loaded,
                diagnostics: Vec::new(),
            };

            if !gated_in(&id, config) {
                record.status = PluginStatus::Disabled;
                registry.records.push(record);
                continue;
            }

            let user_config = config
                .entries
                .get(&id)
                .map(|entry| entry.config.clone())
                .unwrap_or(serde_json::Value::Null);

            let parsed_config = match plugin.config_schema() {
                Some(schema) => match schema.parse(&user_config) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        record.status = PluginStatus::Error;
                        record.diagnostics.push(format!("config rejected: {err:#}"));
                        tracing::warn!(plugin = %id, "Plugin config rejected: {err:#}");
                        registry.records.push(record);
                        continue;
                    }
                },
                None => user_config,
            };

            let mut api = PluginApi::new(&id, parsed_config);
            if let Err(err) = plugin.register(&mut api) {
                record.status = PluginStatus::Error;
                record.diagnostics.push(format!("register failed: {err:#}"));
                tracing::warn!(plugin = %id, "Plugin registration failed: {err:#}");
                registry.records.push(record);
                continue;
            }

            registry.commit(&mut record, api, core_tools);
            tracing::info!(plugin = %id, "Plugin loaded");
            registry.records.push(record);
        }

        registry
    }

    fn commit(&mut self, record: &mut PluginRecord, api: PluginApi, core_tools: &[String]) {
        for tool in api.tools {
            let collides =
                core_tools.iter().any(|t| t == &tool.name) || self.tools.contains_key(&tool.name);
            if collides {
                record
                    .diagnostics
                    .push(format!("tool '{}' collides with an existing tool", tool.name));
                tracing::warn!(
                    plugin = %record.id,
                    tool = %tool.name,
                    "Rejecting colliding plugin tool"
                );
                continue;
            }
            self.tools.insert(tool.name.clone(), tool);
        }
        for (name, method) in api.gateway_methods {
            if self.gateway_methods.contains_key(&name) {
                record
                    .diagnostics
                    .push(format!("gateway method '{name}' already registered"));
                continue;
            }
            self.gateway_methods.insert(name, method);
        }
        self.services.extend(api.services);
        self.cli_commands.extend(api.cli_commands);
    }

    pub fn records(&self) -> &[PluginRecord] {
        &self.records
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn tool(&self, name: &str) -> Option<&PluginTool> {
        self.tools.get(name)
    }

    pub fn gateway_method(&self, name: &str) -> Option<&GatewayMethod> {
        self.gateway_methods.get(name)
    }

    pub fn services(&self) -> &[Arc<dyn PluginService>] {
        &self.services
    }

    pub fn cli_commands(&self) -> &[Arc<dyn PluginCli>] {
        &self.cli_commands
    }
}

/// Gating: `id ∈ allow` (when allow is non-empty) AND `id ∉ deny` AND the
/// per-entry `enabled` flag is not false.
fn gated_in(id: &str, config: &PluginsConfig) -> bool {
    if !config.allow.is_empty() && !config.allow.iter().any(|a| a == id) {
        return false;
    }
    if config.deny.iter().any(|d| d == id) {
        return false;
    }
    config
        .entries
        .get(id)
        .and_then(|entry| entry.enabled)
        .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::PluginEntryConfig;
    use crate::plugins::traits::{ConfigSchema, ToolExecute};
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct EchoExecute;

    #[async_trait]
    impl ToolExecute for EchoExecute {
        async fn execute(&self, args: Value) -> Result<Value> {
            Ok(args)
        }
    }

    struct StrictSchema;

    impl ConfigSchema for StrictSchema {
        fn parse(&self, value: &Value) -> Result<Value> {
            if value.get("token").and_then(Value::as_str).is_some() {
                Ok(value.clone())
            } else {
                anyhow::bail!("missing required 'token'")
            }
        }
    }

    struct TestPlugin {
        id: &'static str,
        tool: Option<&'static str>,
        strict: bool,
        fail_register: bool,
    }

    impl Plugin for TestPlugin {
        fn id(&self) -> &str {
            self.id
        }

        fn config_schema(&self) -> Option<&dyn ConfigSchema> {
            self.strict.then_some(&StrictSchema as &dyn ConfigSchema)
        }

        fn register(&self, api: &mut PluginApi) -> Result<()> {
            if self.fail_register {
                anyhow::bail!("deliberate failure");
            }
            if let Some(tool) = self.tool {
                api.register_tool(PluginTool {
                    name: tool.to_string(),
                    description: "test tool".into(),
                    parameters: json!({"type": "object"}),
                    execute: Arc::new(EchoExecute),
                });
            }
            api.register_gateway_method(format!("{}.status", self.id), Arc::new(|v| Ok(v)));
            Ok(())
        }
    }

    fn plugin(id: &'static str, tool: Option<&'static str>) -> Box<dyn Plugin> {
        Box::new(TestPlugin {
            id,
            tool,
            strict: false,
            fail_register: false,
        })
    }

    #[test]
    fn allow_list_gates_when_non_empty() {
        let mut config = PluginsConfig::default();
        config.allow = vec!["alpha".into()];

        let registry = PluginRegistry::load(
            vec![plugin("alpha", Some("alpha-tool")), plugin("beta", None)],
            &config,
            &[],
        );

        let statuses: HashMap<_, _> = registry
            .records()
            .iter()
            .map(|r| (r.id.clone(), r.status))
            .collect();
        assert_eq!(statuses["alpha"], PluginStatus::Loaded);
        assert_eq!(statuses["beta"], PluginStatus::Disabled);
        assert!(registry.tool("alpha-tool").is_some());
    }

    #[test]
    fn deny_list_and_entry_enabled_flag_gate_out() {
        let mut config = PluginsConfig::default();
        config.deny = vec!["bad".into()];
        config.entries.insert(
            "off".into(),
            PluginEntryConfig {
                enabled: Some(false),
                ..PluginEntryConfig::default()
            },
        );

        let registry = PluginRegistry::load(
            vec![plugin("bad", Some("bad-tool")), plugin("off", Some("off-tool"))],
            &config,
            &[],
        );
        assert!(registry.tool("bad-tool").is_none());
        assert!(registry.tool("off-tool").is_none());
    }

    #[test]
    fn bad_config_marks_error_and_applies_nothing() {
        let mut config = PluginsConfig::default();
        config.entries.insert(
            "strict".into(),
            PluginEntryConfig {
                config: json!({"wrong": true}),
                ..PluginEntryConfig::default()
            },
        );

        let registry = PluginRegistry::load(
            vec![Box::new(TestPlugin {
                id: "strict",
                tool: Some("strict-tool"),
                strict: true,
                fail_register: false,
            })],
            &config,
            &[],
        );

        let record = &registry.records()[0];
        assert_eq!(record.status, PluginStatus::Error);
        assert!(record.diagnostics[0].contains("token"));
        assert!(registry.tool("strict-tool").is_none());
        assert!(registry.gateway_method("strict.status").is_none());
    }

    #[test]
    fn register_failure_is_isolated_to_that_plugin() {
        let registry = PluginRegistry::load(
            vec![
                Box::new(TestPlugin {
                    id: "broken",
                    tool: Some("broken-tool"),
                    strict: false,
                    fail_register: true,
                }),
                plugin("healthy", Some("healthy-tool")),
            ],
            &PluginsConfig::default(),
            &[],
        );

        assert!(registry.tool("broken-tool").is_none());
        assert!(registry.tool("healthy-tool").is_some());
        assert_eq!(registry.records()[0].status, PluginStatus::Error);
        assert_eq!(registry.records()[1].status, PluginStatus::Loaded);
    }

    #[test]
    fn tool_collisions_are_rejected_with_diagnostics() {
        let registry = PluginRegistry::load(
            vec![
                plugin("first", Some("shared-tool")),
                plugin("second", Some("shared-tool")),
                plugin("shadow", Some("bash")),
            ],
            &PluginsConfig::default(),
            &["bash".to_string()],
        );

        assert!(registry.tool("shared-tool").is_some());
        let second = &registry.records()[1];
        assert!(second.diagnostics.iter().any(|d| d.contains("collides")));
        let shadow = &registry.records()[2];
        assert!(shadow.diagnostics.iter().any(|d| d.contains("collides")));
        assert!(registry.tool("bash").is_none());
    }
}
