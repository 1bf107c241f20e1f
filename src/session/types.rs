//! Session identity and metadata records.

use crate::directives::{ThinkLevel, VerboseLevel};
use serde::{Deserialize, Serialize};

/// Canonical identity of a conversation: `agent:<agentId>:<scopeKey>`.
///
/// The scope key is the literal `main`, `global`, or `<provider>:<peer>`.
/// Uniqueness of this string is the basis of single-flight.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn main(agent_id: &str) -> Self {
        Self(format!("agent:{agent_id}:main"))
    }

    pub fn global(agent_id: &str) -> Self {
        Self(format!("agent:{agent_id}:global"))
    }

    pub fn direct(agent_id: &str, provider: &str, peer: &str) -> Self {
        Self(format!("agent:{agent_id}:{provider}:{peer}"))
    }

    /// Wrap an already-canonical key (config `session.mainKey` override).
    pub fn raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cumulative token counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenTotals {
    pub input: u64,
    pub output: u64,
    pub total: u64,
}

impl TokenTotals {
    pub fn add(&mut self, other: TokenTotals) {
        self.input += other.input;
        self.output += other.output;
        self.total += other.total;
    }
}

/// Persisted per-conversation metadata. Created on first reference and never
/// deleted by admission logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub updated_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_level: Option<ThinkLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbose_level: Option<VerboseLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_override: Option<String>,
    #[serde(default)]
    pub tokens: TokenTotals,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compaction_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl Session {
    pub fn new(now_ms: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            updated_at: now_ms,
            thinking_level: None,
            verbose_level: None,
            model_override: None,
            tokens: TokenTotals::default(),
            last_provider: None,
            last_model_id: None,
            context_tokens: None,
            compaction_count: None,
            display_name: None,
        }
    }
}

/// Field-wise merge applied by [`SessionStore::update`](super::SessionStore::update).
/// Token counters add; everything else replaces when present.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub thinking_level: Option<ThinkLevel>,
    pub verbose_level: Option<VerboseLevel>,
    pub model_override: Option<Option<String>>,
    pub tokens: Option<TokenTotals>,
    pub last_model: Option<(String, String)>,
    pub context_tokens: Option<u64>,
    pub compaction_count: Option<u64>,
    pub display_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_scopes() {
        assert_eq!(SessionKey::main("main").as_str(), "agent:main:main");
        assert_eq!(SessionKey::global("main").as_str(), "agent:main:global");
        assert_eq!(
            SessionKey::direct("main", "whatsapp", "+15555550123").as_str(),
            "agent:main:whatsapp:+15555550123"
        );
    }

    #[test]
    fn token_totals_accumulate() {
        let mut totals = TokenTotals {
            input: 10,
            output: 5,
            total: 15,
        };
        totals.add(TokenTotals {
            input: 1,
            output: 2,
            total: 3,
        });
        assert_eq!(totals.input, 11);
        assert_eq!(totals.output, 7);
        assert_eq!(totals.total, 18);
    }

    #[test]
    fn session_serializes_camel_case() {
        let session = Session::new(1_000);
        let json = serde_json::to_value(&session).unwrap();
        assert!(json.get("updatedAt").is_some());
        assert!(json.get("tokens").is_some());
        assert!(json.get("modelOverride").is_none());
    }
}
