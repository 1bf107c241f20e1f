//! Append-only JSONL transcripts, one file per session id.
//!
//! The first line is a header; every subsequent line is one message. The
//! file sits next to `sessions.json` so a session's metadata and transcript
//! share a directory.

use super::types::TokenTotals;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptHeader {
    pub session_id: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum TranscriptLine {
    User {
        text: String,
        timestamp: String,
    },
    Assistant {
        text: String,
        timestamp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<TokenTotals>,
    },
    Tool {
        name: String,
        timestamp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
    },
}

pub struct Transcript {
    path: PathBuf,
}

impl Transcript {
    /// Open (creating if needed) `<dir>/<sessionId>.jsonl`, writing the
    /// header line on first creation.
    pub fn open(dir: &Path, session_id: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create transcript dir: {}", dir.display()))?;
        let path = dir.join(format!("{session_id}.jsonl"));
        if !path.exists() {
            let header = TranscriptHeader {
                session_id: session_id.to_string(),
                created_at: chrono::Utc::now().to_rfc3339(),
            };
            let mut line = serde_json::to_string(&header)?;
            line.push('\n');
            std::fs::write(&path, line)
                .with_context(|| format!("Failed to create transcript: {}", path.display()))?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, line: &TranscriptLine) -> Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open transcript: {}", self.path.display()))?;
        let mut raw = serde_json::to_string(line)?;
        raw.push('\n');
        file.write_all(raw.as_bytes())
            .with_context(|| format!("Failed to append transcript: {}", self.path.display()))?;
        Ok(())
    }

    pub fn append_user(&self, text: &str) -> Result<()> {
        self.append(&TranscriptLine::User {
            text: text.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        })
    }

    pub fn append_assistant(
        &self,
        text: &str,
        model: Option<&str>,
        usage: Option<TokenTotals>,
    ) -> Result<()> {
        self.append(&TranscriptLine::Assistant {
            text: text.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            model: model.map(str::to_string),
            usage,
        })
    }

    pub fn append_tool(&self, name: &str, result: Option<&str>) -> Result<()> {
        self.append(&TranscriptLine::Tool {
            name: name.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            result: result.map(str::to_string),
        })
    }
}
