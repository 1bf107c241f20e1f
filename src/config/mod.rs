pub mod schema;

pub use schema::{
    AgentConfig, AgentModelConfig, BridgeConfig, Config, CronConfig, DiscoveryConfig,
    HeartbeatConfig, HumanDelayConfig, HumanDelayMode, PluginsConfig, RepliesConfig,
    SessionConfig, SessionScope, SkillEntryConfig, SkillsConfig, ToolFilterConfig,
};
