//! Persistent jobs file: `{version: 1, jobs: [...]}` with atomic rename and
//! a best-effort `.bak` copy, same discipline as the session store.

use crate::cron::types::{CronJob, CronJobState};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize)]
struct JobsFile {
    version: u32,
    jobs: Vec<CronJob>,
}

pub struct CronStore {
    path: PathBuf,
    jobs: Mutex<Vec<CronJob>>,
}

impl CronStore {
    pub fn open(path: &Path) -> Self {
        let jobs = match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<JobsFile>(&raw) {
                Ok(file) => file.jobs,
                Err(err) => {
                    tracing::warn!("Ignoring corrupt cron store {}: {err}", path.display());
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        Self {
            path: path.to_path_buf(),
            jobs: Mutex::new(jobs),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn insert(&self, job: CronJob) -> Result<()> {
        {
            let mut jobs = self.jobs.lock();
            jobs.push(job);
        }
        self.persist()
    }

    pub fn get(&self, id: &str) -> Option<CronJob> {
        self.jobs.lock().iter().find(|j| j.id == id).cloned()
    }

    pub fn remove(&self, id: &str) -> Result<bool> {
        let removed = {
            let mut jobs = self.jobs.lock();
            let before = jobs.len();
            jobs.retain(|j| j.id != id);
            jobs.len() != before
        };
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Apply `mutate` to the job with `id` under the store lock, then
    /// persist. Returns the mutated job.
    pub fn mutate(&self, id: &str, mutate: impl FnOnce(&mut CronJob)) -> Result<CronJob> {
        let job = {
            let mut jobs = self.jobs.lock();
            let job = jobs
                .iter_mut()
                .find(|j| j.id == id)
                .with_context(|| format!("Unknown cron job: {id}"))?;
            mutate(job);
            job.clone()
        };
        self.persist()?;
        Ok(job)
    }

    /// Set `running_at_ms` if not already set. Returns false when the job is
    /// already running (single-flight) or unknown.
    pub fn try_begin_run(&self, id: &str, now_ms: i64) -> Result<bool> {
        let began = {
            let mut jobs = self.jobs.lock();
            match jobs.iter_mut().find(|j| j.id == id) {
                Some(job) if job.state.running_at_ms.is_none() => {
                    job.state.running_at_ms = Some(now_ms);
                    true
                }
                _ => false,
            }
        };
        if began {
            self.persist()?;
        }
        Ok(began)
    }

    pub fn list(&self, include_disabled: bool) -> Vec<CronJob> {
        self.jobs
            .lock()
            .iter()
            .filter(|j| include_disabled || j.enabled)
            .cloned()
            .collect()
    }

    /// Enabled jobs whose `next_run_at_ms` has passed and which are not
    /// currently running.
    pub fn due_jobs(&self, now_ms: i64) -> Vec<CronJob> {
        self.jobs
            .lock()
            .iter()
            .filter(|j| {
                j.enabled
                    && j.state.running_at_ms.is_none()
                    && j.state.next_run_at_ms.is_some_and(|next| next <= now_ms)
            })
            .cloned()
            .collect()
    }

    /// Earliest upcoming fire across enabled, non-running jobs.
    pub fn earliest_next_run(&self) -> Option<i64> {
        self.jobs
            .lock()
            .iter()
            .filter(|j| j.enabled && j.state.running_at_ms.is_none())
            .filter_map(|j| j.state.next_run_at_ms)
            .min()
    }

    /// Clear stale running markers, e.g. after an unclean shutdown.
    pub fn clear_running_markers(&self) -> Result<()> {
        let any = {
            let mut jobs = self.jobs.lock();
            let mut any = false;
            for job in jobs.iter_mut() {
                if job.state.running_at_ms.is_some() {
                    job.state.running_at_ms = None;
                    any = true;
                }
            }
            any
        };
        if any {
            self.persist()?;
        }
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        let payload = {
            let jobs = self.jobs.lock();
            let file = JobsFile {
                version: 1,
                jobs: jobs.clone(),
            };
            serde_json::to_string_pretty(&file).context("Failed to serialize cron jobs")?
        };
        crate::util::write_atomic(&self.path, &payload)
    }
}

/// Reset transient state when constructing a brand-new job record.
pub fn fresh_state(next_run_at_ms: Option<i64>) -> CronJobState {
    CronJobState {
        next_run_at_ms,
        ..CronJobState::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cron::types::{CronPayload, Schedule, SessionTarget, WakeMode};

    fn job(id: &str, next: Option<i64>) -> CronJob {
        CronJob {
            id: id.to_string(),
            name: format!("job-{id}"),
            description: None,
            enabled: true,
            created_at_ms: 1,
            updated_at_ms: 1,
            schedule: Schedule::Every {
                every_ms: 60_000,
                anchor_ms: None,
            },
            session_target: SessionTarget::Main,
            wake_mode: WakeMode::NextHeartbeat,
            payload: CronPayload::SystemEvent {
                text: "tick".into(),
            },
            isolation: None,
            state: fresh_state(next),
        }
    }

    #[test]
    fn jobs_round_trip_through_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cron").join("jobs.json");
        {
            let store = CronStore::open(&path);
            store.insert(job("a", Some(10))).unwrap();
        }
        let store = CronStore::open(&path);
        assert_eq!(store.list(true).len(), 1);
        assert_eq!(store.get("a").unwrap().state.next_run_at_ms, Some(10));

        let raw = std::fs::read_to_string(&path).unwrap();
        let file: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(file["version"], 1);
    }

    #[test]
    fn try_begin_run_enforces_single_flight() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CronStore::open(&tmp.path().join("jobs.json"));
        store.insert(job("a", Some(10))).unwrap();

        assert!(store.try_begin_run("a", 100).unwrap());
        assert!(!store.try_begin_run("a", 101).unwrap());
        assert!(!store.try_begin_run("missing", 101).unwrap());
    }

    #[test]
    fn due_jobs_skip_disabled_and_running() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CronStore::open(&tmp.path().join("jobs.json"));
        store.insert(job("due", Some(10))).unwrap();
        store.insert(job("future", Some(1_000))).unwrap();
        let mut disabled = job("disabled", Some(10));
        disabled.enabled = false;
        store.insert(disabled).unwrap();
        store.insert(job("running", Some(10))).unwrap();
        store.try_begin_run("running", 50).unwrap();

        let due: Vec<_> = store
            .due_jobs(100)
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(due, vec!["due"]);
        assert_eq!(store.earliest_next_run(), Some(10));
    }

    #[test]
    fn clear_running_markers_resets_after_crash() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CronStore::open(&tmp.path().join("jobs.json"));
        store.insert(job("a", Some(10))).unwrap();
        store.try_begin_run("a", 50).unwrap();

        store.clear_running_markers().unwrap();
        assert!(store.get("a").unwrap().state.running_at_ms.is_none());
        assert!(store.try_begin_run("a", 60).unwrap());
    }
}
