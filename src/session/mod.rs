//! Session store — maps session keys to session metadata with atomic
//! persistence to `sessions.json`.
//!
//! Single-writer: all mutation goes through the store mutex and is flushed
//! with the tmp+rename+`.bak` discipline. Readers tolerate staleness; a
//! reader concurrent with a persist observes either the old or the new
//! file, never a partial one.

pub mod transcript;
pub mod types;

pub use types::{Session, SessionKey, SessionPatch, TokenTotals};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub struct SessionStore {
    path: PathBuf,
    inner: Mutex<HashMap<String, Session>>,
}

impl SessionStore {
    /// Open the store at `dir/sessions.json`. A missing or unreadable file
    /// starts empty; corruption is logged, not fatal.
    pub fn open(dir: &Path) -> Self {
        let path = dir.join("sessions.json");
        let sessions = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(map) => map,
                Err(err) => {
                    tracing::warn!("Ignoring corrupt session store {}: {err}", path.display());
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self {
            path,
            inner: Mutex::new(sessions),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fetch or create the session for `key`. Concurrent callers observe the
    /// same id: creation happens under the store lock.
    pub fn get_or_create(&self, key: &SessionKey) -> Result<Session> {
        let created;
        let session = {
            let mut inner = self.inner.lock();
            match inner.get(key.as_str()) {
                Some(existing) => {
                    created = false;
                    existing.clone()
                }
                None => {
                    created = true;
                    let session = Session::new(now_ms());
                    inner.insert(key.as_str().to_string(), session.clone());
                    session
                }
            }
        };
        if created {
            self.persist()?;
            tracing::debug!(key = %key, id = %session.id, "Created session");
        }
        Ok(session)
    }

    pub fn get(&self, key: &SessionKey) -> Option<Session> {
        self.inner.lock().get(key.as_str()).cloned()
    }

    /// Merge `patch` into the session for `key`, creating it if needed.
    /// Token counters accumulate; `updated_at` is bumped.
    pub fn update(&self, key: &SessionKey, patch: SessionPatch) -> Result<Session> {
        let session = {
            let mut inner = self.inner.lock();
            let session = inner
                .entry(key.as_str().to_string())
                .or_insert_with(|| Session::new(now_ms()));

            if let Some(level) = patch.thinking_level {
                session.thinking_level = Some(level);
            }
            if let Some(level) = patch.verbose_level {
                session.verbose_level = Some(level);
            }
            if let Some(model_override) = patch.model_override {
                session.model_override = model_override;
            }
            if let Some(tokens) = patch.tokens {
                session.tokens.add(tokens);
            }
            if let Some((provider, model_id)) = patch.last_model {
                session.last_provider = Some(provider);
                session.last_model_id = Some(model_id);
            }
            if let Some(context_tokens) = patch.context_tokens {
                session.context_tokens = Some(context_tokens);
            }
            if let Some(compaction_count) = patch.compaction_count {
                session.compaction_count = Some(compaction_count);
            }
            if let Some(display_name) = patch.display_name {
                session.display_name = Some(display_name);
            }
            session.updated_at = now_ms();
            session.clone()
        };
        self.persist()?;
        Ok(session)
    }

    /// Allocate a fresh id and zero the counters for `key`.
    pub fn reset(&self, key: &SessionKey) -> Result<Session> {
        let session = {
            let mut inner = self.inner.lock();
            let session = Session::new(now_ms());
            inner.insert(key.as_str().to_string(), session.clone());
            session
        };
        self.persist()?;
        tracing::info!(key = %key, id = %session.id, "Session reset");
        Ok(session)
    }

    /// Snapshot of every (key, session) pair, for listings.
    pub fn list(&self) -> Vec<(String, Session)> {
        let inner = self.inner.lock();
        let mut entries: Vec<_> = inner
            .iter()
            .map(|(k, s)| (k.clone(), s.clone()))
            .collect();
        entries.sort_by(|a, b| b.1.updated_at.cmp(&a.1.updated_at));
        entries
    }

    fn persist(&self) -> Result<()> {
        let payload = {
            let inner = self.inner.lock();
            serde_json::to_string_pretty(&*inner).context("Failed to serialize sessions")?
        };
        crate::util::write_atomic(&self.path, &payload)
    }
}

fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}
