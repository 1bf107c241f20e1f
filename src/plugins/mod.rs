//! Capability-scoped extension surface.

pub mod registry;
pub mod traits;

pub use registry::{PluginRecord, PluginRegistry, PluginStatus};
pub use traits::{
    ConfigSchema, GatewayMethod, Plugin, PluginApi, PluginCli, PluginService, PluginTool,
    ToolExecute,
};
