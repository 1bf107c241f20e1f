//! Model Backend seam.
//!
//! The LLM provider SDK lives outside this crate. The gateway talks to it
//! through [`ModelBackend`] and owns the part that matters here: resolving
//! the candidate model chain (primary + fallbacks through the alias index)
//! and the fallback discipline with per-attempt records.

pub mod cli_backend;

use crate::agent::events::AgentEvent;
use crate::config::AgentConfig;
use crate::directives::ThinkLevel;
use crate::session::TokenTotals;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Literal default when no primary model is configured.
pub const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4-20250514";

/// A `provider/model` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider: String,
    pub id: String,
}

impl ModelRef {
    /// Parse `provider/model`. The model id may itself contain slashes.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.split_once('/') {
            Some((provider, id)) if !provider.is_empty() && !id.is_empty() => Ok(Self {
                provider: provider.to_string(),
                id: id.to_string(),
            }),
            _ => anyhow::bail!("Invalid model reference (expected provider/model): {raw}"),
        }
    }
}

impl std::fmt::Display for ModelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.id)
    }
}

/// One file of ambient context loaded into the turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextFile {
    pub name: String,
    pub content: String,
}

/// Everything a backend needs for one agent turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub model: ModelRef,
    pub session_id: String,
    pub message: String,
    pub context_files: Vec<ContextFile>,
    pub skills_prompt: Option<String>,
    pub system_prompt_suffix: String,
    pub thinking_level: ThinkLevel,
}

/// Final accumulation of one backend invocation.
#[derive(Debug, Clone, Default)]
pub struct TurnOutcome {
    pub text: String,
    pub usage: Option<TokenTotals>,
}

/// Cooperative-abort marker. Backends wrap this when the cancellation token
/// fires mid-call; it propagates unchanged and never triggers fallback.
#[derive(Debug, thiserror::Error)]
#[error("turn cancelled")]
pub struct Cancelled;

/// True when `err` is (or wraps) a cooperative cancellation.
pub fn is_cancellation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Cancelled>().is_some()
}

/// The Model Backend contract. Streaming events go over the channel in
/// arrival order; the returned outcome carries the final text and usage.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn run_turn(
        &self,
        request: TurnRequest,
        events: mpsc::UnboundedSender<AgentEvent>,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome>;
}

/// One failed candidate in the fallback chain.
#[derive(Debug, Clone)]
pub struct FallbackAttempt {
    pub provider: String,
    pub model: String,
    pub error: String,
}

/// Aggregate raised when every candidate failed. Attempts are kept as
/// records so callers (and tests) can inspect each one.
#[derive(Debug)]
pub struct FallbackError {
    pub attempts: Vec<FallbackAttempt>,
}

impl std::fmt::Display for FallbackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "All model candidates failed:")?;
        for attempt in &self.attempts {
            writeln!(f, "  {}/{}: {}", attempt.provider, attempt.model, attempt.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for FallbackError {}

/// Resolve the candidate chain: primary first, then configured fallbacks
/// through the alias index, deduplicated on `provider/model`.
///
/// When `agent.models` is non-empty it doubles as an allow-list: every
/// fallback must be one of its keys (the primary is exempt).
pub fn resolve_model_chain(
    config: &AgentConfig,
    session_override: Option<&str>,
) -> Result<Vec<ModelRef>> {
    let primary_raw = session_override
        .map(str::to_string)
        .or_else(|| config.model.primary_ref())
        .unwrap_or_else(|| DEFAULT_MODEL.to_string());
    let primary_raw = resolve_alias(config, &primary_raw).unwrap_or(primary_raw);
    let primary = ModelRef::parse(&primary_raw)?;

    let mut chain = vec![primary];
    for fallback in &config.model.fallbacks {
        let resolved = match resolve_alias(config, fallback) {
            Some(aliased) => aliased,
            None if config.models.is_empty() => fallback.clone(),
            None => anyhow::bail!(
                "Fallback '{fallback}' is not a key of agent.models (allow-list is active)"
            ),
        };
        let candidate = ModelRef::parse(&resolved)?;
        if !chain.contains(&candidate) {
            chain.push(candidate);
        }
    }
    Ok(chain)
}

fn resolve_alias(config: &AgentConfig, key: &str) -> Option<String> {
    config
        .models
        .get(key)
        .map(|entry| entry.alias.clone())
        .filter(|alias| !alias.is_empty())
}
