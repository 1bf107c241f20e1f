//! Plugin contract: self-describing bundles registering tools, gateway
//! methods, CLI commands, and services through [`PluginApi`].

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Duck-typed config validator: anything with a `parse` that either
/// normalizes the user config or rejects it.
pub trait ConfigSchema: Send + Sync {
    fn parse(&self, value: &Value) -> Result<Value>;
}

/// A tool contributed by a plugin.
pub struct PluginTool {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool arguments.
    pub parameters: Value,
    pub execute: Arc<dyn ToolExecute>,
}

#[async_trait]
pub trait ToolExecute: Send + Sync {
    async fn execute(&self, args: Value) -> Result<Value>;
}

/// A gateway method exposed to control surfaces.
pub type GatewayMethod = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

/// A long-running service owned by a plugin; started by the gateway and
/// stopped through the cancellation token.
#[async_trait]
pub trait PluginService: Send + Sync {
    fn id(&self) -> &str;
    async fn run(&self, cancel: CancellationToken) -> Result<()>;
}

/// A CLI subcommand contributed by a plugin.
#[async_trait]
pub trait PluginCli: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, args: Vec<String>) -> Result<()>;
}

/// The extension entry point.
pub trait Plugin: Send + Sync {
    fn id(&self) -> &str;

    fn name(&self) -> Option<&str> {
        None
    }

    fn description(&self) -> Option<&str> {
        None
    }

    /// Optional validator for the user-supplied `plugins.entries.<id>.config`.
    fn config_schema(&self) -> Option<&dyn ConfigSchema> {
        None
    }

    /// Contribute registrations. A returned error discards everything this
    /// plugin registered and marks it failed.
    fn register(&self, api: &mut PluginApi) -> Result<()>;
}

/// Collector handed to [`Plugin::register`].
pub struct PluginApi {
    plugin_id: String,
    config: Value,
    pub(crate) tools: Vec<PluginTool>,
    pub(crate) gateway_methods: Vec<(String, GatewayMethod)>,
    pub(crate) services: Vec<Arc<dyn PluginService>>,
    pub(crate) cli_commands: Vec<Arc<dyn PluginCli>>,
}

impl PluginApi {
    pub(crate) fn new(plugin_id: &str, config: Value) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            config,
            tools: Vec::new(),
            gateway_methods: Vec::new(),
            services: Vec::new(),
            cli_commands: Vec::new(),
        }
    }

    /// The plugin's validated config entry.
    pub fn plugin_config(&self) -> &Value {
        &self.config
    }

    pub fn register_tool(&mut self, tool: PluginTool) {
        self.tools.push(tool);
    }

    pub fn register_gateway_method(&mut self, name: impl Into<String>, method: GatewayMethod) {
        self.gateway_methods.push((name.into(), method));
    }

    pub fn register_service(&mut self, service: Arc<dyn PluginService>) {
        self.services.push(service);
    }

    pub fn register_cli(&mut self, command: Arc<dyn PluginCli>) {
        self.cli_commands.push(command);
    }

    /// Plugin-scoped logging handle.
    pub fn log_info(&self, message: &str) {
        tracing::info!(plugin = %self.plugin_id, "{message}");
    }

    pub fn log_warn(&self, message: &str) {
        tracing::warn!(plugin = %self.plugin_id, "{message}");
    }
}
