//! Configuration schema for `clawdbot.json` / `clawd.json`.
//!
//! The file is parsed JSON5-permissively (comments and trailing commas are
//! tolerated). Keys are camelCase on disk. Every section defaults so a
//! missing or empty file yields a fully usable config.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub agent: AgentConfig,
    pub session: SessionConfig,
    pub cron: CronConfig,
    pub skills: SkillsConfig,
    pub plugins: PluginsConfig,
    pub tools: ToolsConfig,
    pub bridge: BridgeConfig,
    pub discovery: DiscoveryConfig,
    pub heartbeat: HeartbeatConfig,
    pub replies: RepliesConfig,
}

impl Config {
    /// Parse a config file. JSON5 syntax is accepted.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: Self = json5::from_str(&raw)
            .with_context(|| format!("Invalid config: {}", path.display()))?;
        Ok(config)
    }

    /// Load the config, or return defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply process-environment overrides on top of the parsed file.
    ///
    /// Recognized: `CLAWDBOT_BRIDGE_HOST`, `CLAWDBOT_BRIDGE_PORT`,
    /// `CLAWDBOT_BRIDGE_ENABLED=0`, `CLAWDBOT_DISABLE_BONJOUR=1`,
    /// `CLAWD_SKIP_CRON=1`.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("CLAWDBOT_BRIDGE_HOST") {
            if !host.trim().is_empty() {
                self.bridge.bind = host.trim().to_string();
            }
        }
        if let Ok(port) = std::env::var("CLAWDBOT_BRIDGE_PORT") {
            if let Ok(port) = port.trim().parse() {
                self.bridge.port = port;
            }
        }
        if std::env::var("CLAWDBOT_BRIDGE_ENABLED").as_deref() == Ok("0") {
            self.bridge.enabled = false;
        }
        if std::env::var("CLAWDBOT_DISABLE_BONJOUR").as_deref() == Ok("1") {
            self.discovery.enabled = false;
        }
        if std::env::var("CLAWD_SKIP_CRON").as_deref() == Ok("1") {
            self.cron.enabled = false;
        }
    }
}

// ── Agent ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    /// Agent workspace path; `~` expands. Defaults to `$HOME/clawd`
    /// (or `$HOME/clawd-<profile>`).
    pub workspace: Option<String>,
    pub model: AgentModelConfig,
    /// Default reasoning effort for turns without a `/think` directive.
    pub thinking: Option<String>,
    pub bash: BashConfig,
    #[serde(rename = "tools")]
    pub tool_filter: ToolFilterConfig,
    /// Short name → `provider/model` alias index; non-empty map doubles as
    /// the fallback allow-list.
    pub models: HashMap<String, ModelAliasConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentModelConfig {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub fallbacks: Vec<String>,
    /// Per-candidate model call timeout, seconds. 0 means unlimited (the
    /// backend's own limits still apply).
    pub timeout_seconds: u64,
}

impl AgentModelConfig {
    /// `provider/model` when both halves are configured.
    pub fn primary_ref(&self) -> Option<String> {
        match (&self.provider, &self.model) {
            (Some(provider), Some(model)) => Some(format!("{provider}/{model}")),
            (None, Some(model)) if model.contains('/') => Some(model.clone()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BashConfig {
    /// Milliseconds before a bash invocation is moved to the background.
    pub background_ms: u64,
    /// Hard timeout for foreground bash, seconds.
    pub timeout_sec: u64,
}

impl Default for BashConfig {
    fn default() -> Self {
        Self {
            background_ms: 10_000,
            timeout_sec: 120,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolFilterConfig {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelAliasConfig {
    pub alias: String,
}

// ── Session ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionScope {
    #[default]
    PerSender,
    Global,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    pub scope: SessionScope,
    /// Override for the main session key.
    pub main_key: Option<String>,
    /// Override for the sessions store path.
    pub store: Option<String>,
    pub idle_minutes: Option<u64>,
}

// ── Cron ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CronConfig {
    pub enabled: bool,
    /// Override for the jobs store path.
    pub store: Option<String>,
    pub max_concurrent_runs: usize,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            store: None,
            max_concurrent_runs: 2,
        }
    }
}

// ── Skills ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SkillsConfig {
    pub entries: HashMap<String, SkillEntryConfig>,
    /// Extra skill directories searched after the bundled set.
    pub extra_dirs: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SkillEntryConfig {
    pub enabled: Option<bool>,
    pub api_key: Option<String>,
    pub env: HashMap<String, String>,
}

// ── Plugins ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PluginsConfig {
    pub load: PluginLoadConfig,
    pub allow: Vec<String>,
    pub deny: Vec<String>,
    pub entries: HashMap<String, PluginEntryConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PluginLoadConfig {
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PluginEntryConfig {
    pub enabled: Option<bool>,
    #[serde(default)]
    pub config: serde_json::Value,
}

// ── Tools (external collaborators) ────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolsConfig {
    pub audio: AudioToolsConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AudioToolsConfig {
    pub transcription: TranscriptionConfig,
}

/// External transcriber command for inbound voice notes. `{{MediaPath}}` in
/// `args` is substituted with the downloaded media path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TranscriptionConfig {
    pub args: Vec<String>,
    pub timeout_seconds: u64,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            args: Vec::new(),
            timeout_seconds: 60,
        }
    }
}

// ── Bridge & discovery ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0".to_string(),
            port: 18_790,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    pub wide_area: WideAreaConfig,
    /// Instance display name; falls back to the hostname.
    pub display_name: Option<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            wide_area: WideAreaConfig::default(),
            display_name: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WideAreaConfig {
    pub enabled: bool,
}

// ── Heartbeat ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    /// Human-friendly cadence: `30m`, `1h`, `60s`.
    pub interval: String,
    pub prompt: Option<String>,
    /// Maximum chars of narration around the ack token that still counts
    /// as a silent heartbeat.
    pub ack_max_chars: usize,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: "30m".to_string(),
            prompt: None,
            ack_max_chars: 30,
        }
    }
}

// ── Replies (dispatcher) ──────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RepliesConfig {
    pub response_prefix: Option<String>,
    pub human_delay: HumanDelayConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HumanDelayMode {
    #[default]
    Off,
    Natural,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HumanDelayConfig {
    pub mode: HumanDelayMode,
    pub min_ms: u64,
    pub max_ms: u64,
}

impl Default for HumanDelayConfig {
    fn default() -> Self {
        Self {
            mode: HumanDelayMode::Off,
            min_ms: 800,
            max_ms: 1600,
        }
    }
}
