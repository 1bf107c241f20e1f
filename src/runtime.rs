//! Runtime context — explicit replacement for module-level singletons.
//!
//! Every subsystem receives a `Runtime` (state directory, config path,
//! profile) instead of consulting globals, so tests can inject a stubbed
//! runtime rooted in a temp directory.

use crate::config::Config;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Resolved process-level context shared by all subsystems.
#[derive(Debug, Clone)]
pub struct Runtime {
    state_dir: PathBuf,
    config_path: PathBuf,
    profile: Option<String>,
}

impl Runtime {
    /// Resolve the runtime from the environment: `CLAWD_STATE_DIR`,
    /// `CLAWD_CONFIG_PATH`, and `CLAWD_PROFILE`, with home-dir defaults.
    pub fn from_env() -> Result<Self> {
        let profile = std::env::var("CLAWD_PROFILE")
            .ok()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());

        let state_dir = match std::env::var("CLAWD_STATE_DIR") {
            Ok(raw) if !raw.trim().is_empty() => crate::util::expand_tilde(raw.trim()),
            _ => {
                let dirs = directories::UserDirs::new()
                    .context("Unable to determine the user home directory")?;
                let name = match &profile {
                    Some(p) => format!(".clawdbot-{p}"),
                    None => ".clawdbot".to_string(),
                };
                dirs.home_dir().join(name)
            }
        };

        let config_path = match std::env::var("CLAWD_CONFIG_PATH") {
            Ok(raw) if !raw.trim().is_empty() => crate::util::expand_tilde(raw.trim()),
            _ => default_config_path(&state_dir),
        };

        Ok(Self {
            state_dir,
            config_path,
            profile,
        })
    }

    /// Build a runtime rooted at an explicit state directory (tests).
    pub fn rooted_at(state_dir: impl Into<PathBuf>) -> Self {
        let state_dir = state_dir.into();
        let config_path = default_config_path(&state_dir);
        Self {
            state_dir,
            config_path,
            profile: None,
        }
    }

    /// Override the config path (CLI `-c`).
    pub fn with_config_path(mut self, path: PathBuf) -> Self {
        self.config_path = path;
        self
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn profile(&self) -> Option<&str> {
        self.profile.as_deref()
    }

    /// Sessions directory for one agent: `<state>/agents/<agentId>/sessions`.
    pub fn sessions_dir(&self, agent_id: &str) -> PathBuf {
        self.state_dir.join("agents").join(agent_id).join("sessions")
    }

    /// Persisted cron jobs file: `<state>/cron/jobs.json`.
    pub fn cron_jobs_path(&self) -> PathBuf {
        self.state_dir.join("cron").join("jobs.json")
    }

    /// Pairing store file: `<state>/pairing.json`.
    pub fn pairing_path(&self) -> PathBuf {
        self.state_dir.join("pairing.json")
    }

    /// Managed skills directory under the state dir.
    pub fn managed_skills_dir(&self) -> PathBuf {
        self.state_dir.join("skills")
    }

    /// Load the config file, or fall back to defaults when it is absent.
    pub fn load_config(&self) -> Result<Arc<Config>> {
        let config = Config::load_or_default(&self.config_path)?;
        Ok(Arc::new(config))
    }
}

fn default_config_path(state_dir: &Path) -> PathBuf {
    let primary = state_dir.join("clawdbot.json");
    if primary.exists() {
        return primary;
    }
    let legacy = state_dir.join("clawd.json");
    if legacy.exists() {
        return legacy;
    }
    primary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rooted_runtime_derives_store_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = Runtime::rooted_at(tmp.path());

        assert_eq!(
            runtime.sessions_dir("main"),
            tmp.path().join("agents").join("main").join("sessions")
        );
        assert_eq!(runtime.cron_jobs_path(), tmp.path().join("cron").join("jobs.json"));
        assert_eq!(runtime.pairing_path(), tmp.path().join("pairing.json"));
    }

    #[test]
    fn config_path_prefers_existing_legacy_name() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("clawd.json"), "{}").unwrap();

        let runtime = Runtime::rooted_at(tmp.path());
        assert_eq!(runtime.config_path(), tmp.path().join("clawd.json"));
    }
}
