//! Agent workspace: bootstrap files and daily memory logs.

use crate::providers::ContextFile;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use std::path::{Path, PathBuf};

/// Files materialized into a fresh workspace, in load order.
const BOOTSTRAP_FILES: [(&str, &str); 6] = [
    (
        "AGENTS.md",
        "# Agent Guidelines\n\nHouse rules for every turn live here.\n",
    ),
    ("IDENTITY.md", "# Identity\n\nWho this assistant is.\n"),
    ("USER.md", "# User\n\nWhat we know about the user.\n"),
    ("SOUL.md", "# Soul\n\nTone and personality notes.\n"),
    ("TOOLS.md", "# Tools\n\nLocal tool notes and conventions.\n"),
    (
        "HEARTBEAT.md",
        "# Periodic Tasks\n\nAdd tasks below (one per line, starting with `- `)\n",
    ),
];

const FIRST_RUN_FILE: (&str, &str) = (
    "BOOTSTRAP.md",
    "# Welcome\n\nThis workspace was just created. Introduce yourself and ask\nthe user what they'd like help with, then delete this file.\n",
);

/// Resolve the workspace path: config override (with `~` expansion) or
/// `$HOME/clawd` (`$HOME/clawd-<profile>` under a profile).
pub fn resolve_workspace(configured: Option<&str>, profile: Option<&str>) -> Result<PathBuf> {
    if let Some(raw) = configured {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            return Ok(crate::util::expand_tilde(trimmed));
        }
    }
    let dirs = directories::UserDirs::new().context("Unable to determine home directory")?;
    let name = match profile {
        Some(p) => format!("clawd-{p}"),
        None => "clawd".to_string(),
    };
    Ok(dirs.home_dir().join(name))
}

/// Ensure the workspace exists and its bootstrap files are materialized,
/// then load their current contents as context files.
///
/// When the workspace is brand new (none of the six bootstrap files existed
/// before), a one-time BOOTSTRAP.md is also written.
pub fn ensure_workspace(dir: &Path) -> Result<Vec<ContextFile>> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create workspace: {}", dir.display()))?;

    let brand_new = BOOTSTRAP_FILES
        .iter()
        .all(|(name, _)| !dir.join(name).exists());

    for (name, default_content) in BOOTSTRAP_FILES {
        let path = dir.join(name);
        if !path.exists() {
            std::fs::write(&path, default_content)
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
    }
    if brand_new {
        let path = dir.join(FIRST_RUN_FILE.0);
        std::fs::write(&path, FIRST_RUN_FILE.1)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        tracing::info!("Workspace bootstrapped at {}", dir.display());
    }

    let mut files = Vec::new();
    for (name, _) in BOOTSTRAP_FILES {
        if let Ok(content) = std::fs::read_to_string(dir.join(name)) {
            files.push(ContextFile {
                name: name.to_string(),
                content,
            });
        }
    }
    if let Ok(content) = std::fs::read_to_string(dir.join(FIRST_RUN_FILE.0)) {
        files.push(ContextFile {
            name: FIRST_RUN_FILE.0.to_string(),
            content,
        });
    }
    Ok(files)
}

/// Load `memory/YYYY-MM-DD.md` for `today` and the day before, combined into
/// one "Daily Memory" context file. Returns None when both are empty.
pub fn load_daily_memory(dir: &Path, today: NaiveDate) -> Option<ContextFile> {
    let memory_dir = dir.join("memory");
    let mut combined = String::new();

    for date in [today.pred_opt().unwrap_or(today), today] {
        let path = memory_dir.join(format!("{}.md", date.format("%Y-%m-%d")));
        if let Ok(content) = std::fs::read_to_string(&path) {
            if !content.trim().is_empty() {
                if !combined.is_empty() {
                    combined.push('\n');
                }
                combined.push_str(&format!("## {}\n{}", date.format("%Y-%m-%d"), content));
            }
        }
    }

    if combined.is_empty() {
        None
    } else {
        Some(ContextFile {
            name: "Daily Memory".to_string(),
            content: combined,
        })
    }
}
