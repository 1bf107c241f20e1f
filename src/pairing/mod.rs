//! Pairing store: pending pairing codes, the per-provider allow-list, and
//! bridge node tokens. Everything persists to `<state>/pairing.json` with
//! the same atomic-rename discipline as the other stores.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Default pairing code lifetime.
pub const PAIRING_TTL_MS: i64 = 10 * 60 * 1000;

const CODE_LEN: usize = 6;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PairingCode {
    pub code: String,
    pub provider: String,
    pub principal: String,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct PairingFile {
    /// provider → authorized principals.
    allow: HashMap<String, Vec<String>>,
    pending: Vec<PairingCode>,
    /// `nodeId` → bearer token issued to a bridge node.
    bridge_tokens: HashMap<String, String>,
}

pub struct PairingStore {
    path: PathBuf,
    inner: Mutex<PairingFile>,
    ttl_ms: i64,
    clock: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl PairingStore {
    pub fn open(path: &Path) -> Self {
        Self::open_with(
            path,
            PAIRING_TTL_MS,
            Box::new(|| chrono::Utc::now().timestamp_millis()),
        )
    }

    pub fn open_with(path: &Path, ttl_ms: i64, clock: Box<dyn Fn() -> i64 + Send + Sync>) -> Self {
        let inner = match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(file) => file,
                Err(err) => {
                    tracing::warn!("Ignoring corrupt pairing store {}: {err}", path.display());
                    PairingFile::default()
                }
            },
            Err(_) => PairingFile::default(),
        };
        Self {
            path: path.to_path_buf(),
            inner: Mutex::new(inner),
            ttl_ms,
            clock,
        }
    }

    pub fn is_allowed(&self, provider: &str, principal: &str) -> bool {
        self.inner
            .lock()
            .allow
            .get(provider)
            .is_some_and(|list| list.iter().any(|p| p == principal))
    }

    /// Start (or continue) pairing for a principal. An unexpired pending
    /// code for the same `(provider, principal)` is reused so repeated
    /// messages don't churn codes.
    pub fn begin_pairing(&self, provider: &str, principal: &str) -> Result<String> {
        let now = (self.clock)();
        let code = {
            let mut inner = self.inner.lock();
            inner.pending.retain(|p| p.expires_at_ms > now);

            if let Some(existing) = inner
                .pending
                .iter()
                .find(|p| p.provider == provider && p.principal == principal)
            {
                return Ok(existing.code.clone());
            }

            let code = loop {
                let candidate = generate_code();
                if !inner.pending.iter().any(|p| p.code == candidate) {
                    break candidate;
                }
            };
            inner.pending.push(PairingCode {
                code: code.clone(),
                provider: provider.to_string(),
                principal: principal.to_string(),
                created_at_ms: now,
                expires_at_ms: now + self.ttl_ms,
                approved_by: None,
            });
            code
        };
        self.persist()?;
        tracing::info!(provider, principal, "Issued pairing code");
        Ok(code)
    }

    /// Approve a pending code: the principal moves into the allow-list and
    /// the pending entry is removed. Returns the approved principal, or
    /// None when the code is unknown or expired.
    pub fn approve(&self, provider: &str, code: &str) -> Result<Option<String>> {
        let now = (self.clock)();
        let principal = {
            let mut inner = self.inner.lock();
            inner.pending.retain(|p| p.expires_at_ms > now);

            let position = inner
                .pending
                .iter()
                .position(|p| p.provider == provider && p.code == code);
            let Some(position) = position else {
                return Ok(None);
            };
            let entry = inner.pending.remove(position);
            let list = inner.allow.entry(entry.provider.clone()).or_default();
            if !list.contains(&entry.principal) {
                list.push(entry.principal.clone());
            }
            entry.principal
        };
        self.persist()?;
        tracing::info!(provider, principal = %principal, "Pairing approved");
        Ok(Some(principal))
    }

    pub fn pending(&self) -> Vec<PairingCode> {
        let now = (self.clock)();
        self.inner
            .lock()
            .pending
            .iter()
            .filter(|p| p.expires_at_ms > now)
            .cloned()
            .collect()
    }

    /// Stored bearer token for a bridge node.
    pub fn verify_bridge_token(&self, node_id: &str, token: &str) -> bool {
        self.inner
            .lock()
            .bridge_tokens
            .get(node_id)
            .is_some_and(|stored| stored == token)
    }

    /// Issue (or reissue) a bearer token for a bridge node.
    pub fn issue_bridge_token(&self, node_id: &str) -> Result<String> {
        let token = format!("{}{}", generate_code(), generate_code());
        {
            let mut inner = self.inner.lock();
            inner
                .bridge_tokens
                .insert(node_id.to_string(), token.clone());
        }
        self.persist()?;
        Ok(token)
    }

    fn persist(&self) -> Result<()> {
        let payload = {
            let inner = self.inner.lock();
            serde_json::to_string_pretty(&*inner).context("Failed to serialize pairing store")?
        };
        crate::util::write_atomic(&self.path, &payload)
    }
}

/// 32-bit random rendered base36, padded to six characters.
fn generate_code() -> String {
    let value: u32 = rand::rng().random();
    let mut value = value as u64;
    let mut out = ['0'; CODE_LEN];
    for slot in out.iter_mut().rev() {
        let digit = (value % 36) as u32;
        *slot = char::from_digit(digit, 36).expect("digit < 36");
        value /= 36;
    }
    out.iter().collect()
}

/// The exact unauthorized-contact reply.
pub fn pairing_reply(id_line: &str, provider: &str, code: &str) -> String {
    format!(
        "Clawdbot: access not configured.\n\n{id_line}\n\nPairing code: {code}\n\nAsk the bot owner to approve with:\nclawdbot pairing approve {provider} {code}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(tmp: &tempfile::TempDir) -> PairingStore {
        PairingStore::open(&tmp.path().join("pairing.json"))
    }

    #[test]
    fn codes_are_base36_six_chars() {
        for _ in 0..64 {
            let code = generate_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
        }
    }

    #[test]
    fn begin_pairing_is_idempotent_per_principal() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(&tmp);

        let first = store.begin_pairing("whatsapp", "+15555550123").unwrap();
        let second = store.begin_pairing("whatsapp", "+15555550123").unwrap();
        assert_eq!(first, second);
        assert_eq!(store.pending().len(), 1);
    }

    #[test]
    fn approve_moves_principal_into_allow_list() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(&tmp);

        let code = store.begin_pairing("telegram", "42").unwrap();
        assert!(!store.is_allowed("telegram", "42"));

        let principal = store.approve("telegram", &code).unwrap();
        assert_eq!(principal.as_deref(), Some("42"));
        assert!(store.is_allowed("telegram", "42"));
        assert!(store.pending().is_empty());

        // Unknown code is a no-op.
        assert_eq!(store.approve("telegram", "zzzzzz").unwrap(), None);
    }

    #[test]
    fn expired_codes_cannot_be_approved() {
        let tmp = tempfile::tempdir().unwrap();
        let now = std::sync::Arc::new(std::sync::atomic::AtomicI64::new(1_000));
        let handle = now.clone();
        let store = PairingStore::open_with(
            &tmp.path().join("pairing.json"),
            PAIRING_TTL_MS,
            Box::new(move || handle.load(std::sync::atomic::Ordering::SeqCst)),
        );

        let code = store.begin_pairing("signal", "alice").unwrap();
        now.store(1_000 + PAIRING_TTL_MS + 1, std::sync::atomic::Ordering::SeqCst);
        assert_eq!(store.approve("signal", &code).unwrap(), None);
        assert!(!store.is_allowed("signal", "alice"));
    }

    #[test]
    fn allow_list_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("pairing.json");
        {
            let store = PairingStore::open(&path);
            let code = store.begin_pairing("imessage", "bob").unwrap();
            store.approve("imessage", &code).unwrap();
        }
        let store = PairingStore::open(&path);
        assert!(store.is_allowed("imessage", "bob"));
    }

    #[test]
    fn bridge_tokens_verify_only_exact_matches() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(&tmp);

        let token = store.issue_bridge_token("node-1").unwrap();
        assert!(store.verify_bridge_token("node-1", &token));
        assert!(!store.verify_bridge_token("node-1", "wrong"));
        assert!(!store.verify_bridge_token("node-2", &token));
    }

    #[test]
    fn reply_template_is_exact() {
        let reply = pairing_reply("Your whatsapp id: +1555", "whatsapp", "abc123");
        assert_eq!(
            reply,
            "Clawdbot: access not configured.\n\nYour whatsapp id: +1555\n\nPairing code: abc123\n\nAsk the bot owner to approve with:\nclawdbot pairing approve whatsapp abc123"
        );
    }
}
