//! Skill discovery, filtering, and scoped environment overrides.
//!
//! Skills are filesystem-resident markdown files with YAML frontmatter. The
//! optional `clawd` block carries activation metadata: `always`, `skillKey`,
//! `primaryEnv`, `requires.{bins,env}`, and `os`. Skill bodies are opaque
//! prompt fragments; this module only decides which skills are active and
//! which env bindings they contribute for the invocation window.

use crate::config::{SkillEntryConfig, SkillsConfig};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SkillRequirements {
    pub bins: Vec<String>,
    pub env: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SkillMeta {
    pub always: bool,
    pub skill_key: Option<String>,
    pub primary_env: Option<String>,
    pub requires: SkillRequirements,
    /// Platforms this skill applies to; empty means all.
    pub os: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct SkillFrontmatter {
    name: Option<String>,
    description: Option<String>,
    clawd: Option<SkillMeta>,
}

#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub description: Option<String>,
    pub path: PathBuf,
    pub body: String,
    pub meta: SkillMeta,
}

impl Skill {
    /// Config key for this skill: explicit `skillKey` or the name.
    pub fn config_key(&self) -> &str {
        self.meta.skill_key.as_deref().unwrap_or(&self.name)
    }
}

/// Parse one skill file. Files without frontmatter become body-only skills
/// named after the file stem.
pub fn parse_skill(path: &Path) -> Result<Skill> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read skill: {}", path.display()))?;
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("skill")
        .to_string();
    let fallback_name = if stem.eq_ignore_ascii_case("skill") {
        path.parent()
            .and_then(|p| p.file_name())
            .and_then(|s| s.to_str())
            .unwrap_or(&stem)
            .to_string()
    } else {
        stem
    };

    let (frontmatter, body) = split_frontmatter(&raw)?;
    Ok(Skill {
        name: frontmatter.name.unwrap_or(fallback_name),
        description: frontmatter.description,
        path: path.to_path_buf(),
        body,
        meta: frontmatter.clawd.unwrap_or_default(),
    })
}

fn split_frontmatter(raw: &str) -> Result<(SkillFrontmatter, String)> {
    let trimmed = raw.trim_start();
    if !trimmed.starts_with("---") {
        return Ok((SkillFrontmatter::default(), raw.to_string()));
    }
    let after_first = &trimmed[3..];
    let Some(end) = after_first.find("\n---") else {
        return Ok((SkillFrontmatter::default(), raw.to_string()));
    };
    let yaml = &after_first[..end];
    let body = after_first[end + 4..].trim_start_matches('\n').to_string();
    let frontmatter: SkillFrontmatter =
        serde_yaml::from_str(yaml).context("Invalid skill frontmatter")?;
    Ok((frontmatter, body))
}

/// Discover skills across `dirs` in precedence order: later directories
/// override earlier ones by skill name. Each directory contributes its
/// top-level `*.md` files and `<sub>/SKILL.md` bundles.
pub fn discover_skills(dirs: &[PathBuf]) -> Vec<Skill> {
    let mut by_name: HashMap<String, Skill> = HashMap::new();
    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        let mut paths: Vec<PathBuf> = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                let bundled = path.join("SKILL.md");
                if bundled.is_file() {
                    paths.push(bundled);
                }
            } else if path.extension().and_then(|e| e.to_str()) == Some("md") {
                paths.push(path);
            }
        }
        paths.sort();
        for path in paths {
            match parse_skill(&path) {
                Ok(skill) => {
                    by_name.insert(skill.name.clone(), skill);
                }
                Err(err) => tracing::warn!("Skipping skill {}: {err}", path.display()),
            }
        }
    }
    let mut skills: Vec<Skill> = by_name.into_values().collect();
    skills.sort_by(|a, b| a.name.cmp(&b.name));
    skills
}

/// Keep a skill iff it is not disabled in config, its `os` gate matches the
/// current platform, and (always, or every required binary and env var is
/// present or satisfiable from the skill's config entry).
pub fn filter_skills(
    skills: Vec<Skill>,
    config: &SkillsConfig,
    platform: &str,
    bin_on_path: &dyn Fn(&str) -> bool,
) -> Vec<Skill> {
    skills
        .into_iter()
        .filter(|skill| {
            let entry = config.entries.get(skill.config_key());
            if entry.and_then(|e| e.enabled) == Some(false) {
                return false;
            }
            if !skill.meta.os.is_empty()
                && !skill.meta.os.iter().any(|os| os.eq_ignore_ascii_case(platform))
            {
                return false;
            }
            if skill.meta.always {
                return true;
            }
            let bins_ok = skill.meta.requires.bins.iter().all(|bin| bin_on_path(bin));
            let env_ok = skill
                .meta
                .requires
                .env
                .iter()
                .all(|var| env_satisfiable(skill, entry, var));
            bins_ok && env_ok
        })
        .collect()
}

fn env_satisfiable(skill: &Skill, entry: Option<&SkillEntryConfig>, var: &str) -> bool {
    if std::env::var_os(var).is_some() {
        return true;
    }
    let Some(entry) = entry else { return false };
    if entry.env.contains_key(var) {
        return true;
    }
    entry.api_key.is_some() && skill.meta.primary_env.as_deref() == Some(var)
}

/// Default binary probe: scan `PATH` entries for the file.
pub fn bin_exists_on_path(bin: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(bin).is_file())
}

/// Concatenate active skill bodies into one prompt fragment.
pub fn skills_prompt(skills: &[Skill]) -> Option<String> {
    if skills.is_empty() {
        return None;
    }
    let mut prompt = String::from("# Skills\n");
    for skill in skills {
        prompt.push_str(&format!("\n## {}\n", skill.name));
        if let Some(description) = &skill.description {
            prompt.push_str(description);
            prompt.push('\n');
        }
        prompt.push_str(&skill.body);
        if !skill.body.ends_with('\n') {
            prompt.push('\n');
        }
    }
    Some(prompt)
}

fn env_lock() -> Arc<tokio::sync::Mutex<()>> {
    static LOCK: OnceLock<Arc<tokio::sync::Mutex<()>>> = OnceLock::new();
    LOCK.get_or_init(|| Arc::new(tokio::sync::Mutex::new(()))).clone()
}

/// Scoped environment overrides for the invocation window.
///
/// The process environment is global mutable state, so the guard holds a
/// process-wide async mutex for its lifetime and restores the exact prior
/// state on drop — every exit path included.
pub struct EnvGuard {
    _permit: tokio::sync::OwnedMutexGuard<()>,
    applied: Vec<String>,
}

impl EnvGuard {
    /// Push env bindings contributed by active skills. A variable already
    /// present in the environment is never overwritten. If an `apiKey` is
    /// configured and the skill declares `primaryEnv`, that binding is
    /// pushed too.
    pub async fn apply(skills: &[Skill], config: &SkillsConfig) -> Self {
        let permit = env_lock().lock_owned().await;
        let mut applied = Vec::new();

        for skill in skills {
            let Some(entry) = config.entries.get(skill.config_key()) else {
                continue;
            };
            for (key, value) in &entry.env {
                if std::env::var_os(key).is_none() {
                    std::env::set_var(key, value);
                    applied.push(key.clone());
                }
            }
            if let (Some(api_key), Some(primary_env)) =
                (&entry.api_key, &skill.meta.primary_env)
            {
                if std::env::var_os(primary_env).is_none() {
                    std::env::set_var(primary_env, api_key);
                    applied.push(primary_env.clone());
                }
            }
        }

        Self {
            _permit: permit,
            applied,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for key in self.applied.drain(..) {
            std::env::remove_var(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_skill(dir: &Path, file: &str, content: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(file), content).unwrap();
    }

    #[test]
    fn frontmatter_parses_clawd_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        write_skill(
            tmp.path(),
            "weather.md",
            "---\nname: weather\ndescription: Forecasts\nclawd:\n  skillKey: wx\n  primaryEnv: WEATHER_API_KEY\n  requires:\n    bins: [curl]\n    env: [WEATHER_API_KEY]\n  os: [linux, macos]\n---\nUse curl against the forecast API.\n",
        );

        let skill = parse_skill(&tmp.path().join("weather.md")).unwrap();
        assert_eq!(skill.name, "weather");
        assert_eq!(skill.config_key(), "wx");
        assert_eq!(skill.meta.requires.bins, vec!["curl"]);
        assert!(skill.body.starts_with("Use curl"));
    }

    #[test]
    fn body_only_files_become_skills_named_after_stem() {
        let tmp = tempfile::tempdir().unwrap();
        write_skill(tmp.path(), "notes.md", "Just a prompt fragment.\n");

        let skill = parse_skill(&tmp.path().join("notes.md")).unwrap();
        assert_eq!(skill.name, "notes");
        assert!(!skill.meta.always);
    }

    #[test]
    fn later_directories_override_earlier_by_name() {
        let tmp = tempfile::tempdir().unwrap();
        let bundled = tmp.path().join("bundled");
        let workspace = tmp.path().join("workspace");
        write_skill(&bundled, "echo.md", "---\nname: echo\n---\nbundled body\n");
        write_skill(&workspace, "echo.md", "---\nname: echo\n---\nworkspace body\n");

        let skills = discover_skills(&[bundled, workspace]);
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].body.trim(), "workspace body");
    }

    #[test]
    fn bundle_directories_contribute_skill_md() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("skills");
        write_skill(&dir.join("deploy"), "SKILL.md", "---\nname: deploy\n---\nship it\n");

        let skills = discover_skills(&[dir]);
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].name, "deploy");
    }

    fn skill_with_meta(name: &str, meta: SkillMeta) -> Skill {
        Skill {
            name: name.to_string(),
            description: None,
            path: PathBuf::from(format!("{name}.md")),
            body: String::new(),
            meta,
        }
    }

    #[test]
    fn filter_honors_disabled_os_and_requirements() {
        let mut config = SkillsConfig::default();
        config.entries.insert(
            "off".into(),
            SkillEntryConfig {
                enabled: Some(false),
                ..SkillEntryConfig::default()
            },
        );
        config.entries.insert(
            "keyed".into(),
            SkillEntryConfig {
                api_key: Some("secret".into()),
                ..SkillEntryConfig::default()
            },
        );

        let skills = vec![
            skill_with_meta("off", SkillMeta::default()),
            skill_with_meta(
                "mac-only",
                SkillMeta {
                    os: vec!["macos".into()],
                    ..SkillMeta::default()
                },
            ),
            skill_with_meta(
                "needs-bin",
                SkillMeta {
                    requires: SkillRequirements {
                        bins: vec!["definitely-absent".into()],
                        env: Vec::new(),
                    },
                    ..SkillMeta::default()
                },
            ),
            skill_with_meta(
                "keyed",
                SkillMeta {
                    primary_env: Some("KEYED_API_KEY_FOR_TEST".into()),
                    requires: SkillRequirements {
                        bins: Vec::new(),
                        env: vec!["KEYED_API_KEY_FOR_TEST".into()],
                    },
                    ..SkillMeta::default()
                },
            ),
            skill_with_meta(
                "always-on",
                SkillMeta {
                    always: true,
                    requires: SkillRequirements {
                        bins: vec!["definitely-absent".into()],
                        env: Vec::new(),
                    },
                    ..SkillMeta::default()
                },
            ),
        ];

        let kept = filter_skills(skills, &config, "linux", &|bin| bin == "curl");
        let names: Vec<_> = kept.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["keyed", "always-on"]);
    }

    #[tokio::test]
    async fn env_guard_restores_prior_environment() {
        let var = "CLAWDBOT_ENV_GUARD_TEST_VAR";
        std::env::remove_var(var);

        let mut config = SkillsConfig::default();
        config.entries.insert(
            "wx".into(),
            SkillEntryConfig {
                api_key: Some("secret".into()),
                ..SkillEntryConfig::default()
            },
        );
        let skill = skill_with_meta(
            "wx",
            SkillMeta {
                primary_env: Some(var.to_string()),
                ..SkillMeta::default()
            },
        );

        {
            let _guard = EnvGuard::apply(std::slice::from_ref(&skill), &config).await;
            assert_eq!(std::env::var(var).unwrap(), "secret");
        }
        assert!(std::env::var_os(var).is_none());
    }

    #[tokio::test]
    async fn env_guard_never_overwrites_existing_values() {
        let var = "CLAWDBOT_ENV_GUARD_EXISTING_VAR";
        std::env::set_var(var, "original");

        let mut config = SkillsConfig::default();
        let mut env = HashMap::new();
        env.insert(var.to_string(), "override".to_string());
        config.entries.insert(
            "wx".into(),
            SkillEntryConfig {
                env,
                ..SkillEntryConfig::default()
            },
        );
        let skill = skill_with_meta("wx", SkillMeta::default());

        {
            let _guard = EnvGuard::apply(std::slice::from_ref(&skill), &config).await;
            assert_eq!(std::env::var(var).unwrap(), "original");
        }
        assert_eq!(std::env::var(var).unwrap(), "original");
        std::env::remove_var(var);
    }
}
