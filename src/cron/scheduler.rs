//! Cron scheduler run loop and mutating API.
//!
//! A single ticker sleeps until the earliest `nextRunAtMs` across enabled
//! jobs. Firing CASes `runningAtMs` (single-flight per job), executes the
//! payload through the [`CronExecutor`] seam, then records the outcome and
//! recomputes the next run. Missed fires coalesce: a job that was due many
//! times while busy fires once.

use crate::cron::schedule::{next_run_at_ms, validate_schedule};
use crate::cron::store::{fresh_state, CronStore};
use crate::cron::types::{
    normalize_job_input, AgentTurnPayload, CronJob, CronJobPatch, CronPayload, CronRunStatus,
    Schedule, SessionTarget, WakeMode,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Idle poll cap when no job has an upcoming fire.
const IDLE_SLEEP_MS: i64 = 60_000;

/// Where fired payloads go. Implemented by the gateway's admission side;
/// tests inject recorders.
#[async_trait]
pub trait CronExecutor: Send + Sync {
    /// Enqueue a system event into the main session.
    async fn enqueue_system_event(&self, text: &str, wake_mode: WakeMode) -> Result<()>;

    /// Enqueue an agent turn for the main session.
    async fn enqueue_main_turn(&self, payload: &AgentTurnPayload, wake_mode: WakeMode)
        -> Result<()>;

    /// Run an agent turn against a fresh isolated session; returns the
    /// response text.
    async fn run_isolated_turn(&self, payload: &AgentTurnPayload) -> Result<String>;

    /// Post an isolated run's summary back to the main session.
    async fn post_to_main(&self, text: &str) -> Result<()>;

    /// Forward a wake request straight to the heartbeat driver.
    async fn wake(&self, mode: WakeMode, text: Option<&str>, reason: Option<&str>) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CronEvent {
    Added { job_id: String },
    Updated { job_id: String },
    Removed { job_id: String },
    Started { job_id: String, run_at_ms: i64 },
    Finished {
        job_id: String,
        status: CronRunStatus,
        duration_ms: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunNowOutcome {
    Started,
    Skipped { reason: String },
}

#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CronStatus {
    pub jobs: usize,
    pub enabled_jobs: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_at_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct CronJobInput {
    name: Option<String>,
    description: Option<String>,
    enabled: bool,
    schedule: Option<Schedule>,
    session_target: SessionTarget,
    wake_mode: WakeMode,
    payload: Option<CronPayload>,
    isolation: Option<crate::cron::types::IsolationConfig>,
}

impl Default for CronJobInput {
    fn default() -> Self {
        Self {
            name: None,
            description: None,
            enabled: true,
            schedule: None,
            session_target: SessionTarget::default(),
            wake_mode: WakeMode::default(),
            payload: None,
            isolation: None,
        }
    }
}

pub struct CronScheduler {
    store: Arc<CronStore>,
    executor: Arc<dyn CronExecutor>,
    events: Option<mpsc::UnboundedSender<CronEvent>>,
    control_tx: mpsc::UnboundedSender<()>,
    control_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    clock: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl CronScheduler {
    pub fn new(store: Arc<CronStore>, executor: Arc<dyn CronExecutor>) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            store,
            executor,
            events: None,
            control_tx,
            control_rx: Mutex::new(Some(control_rx)),
            clock: Box::new(|| chrono::Utc::now().timestamp_millis()),
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<CronEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_clock(mut self, clock: Box<dyn Fn() -> i64 + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<CronStore> {
        &self.store
    }

    // ── Mutating API ──────────────────────────────────────────────

    /// Create a job from raw input (kinds inferred, defaults applied).
    pub fn add(&self, raw: &serde_json::Value) -> Result<CronJob> {
        let normalized = normalize_job_input(raw)?;
        let input: CronJobInput =
            serde_json::from_value(normalized).context("Invalid cron job input")?;
        let schedule = input.schedule.context("Cron job input needs a schedule")?;
        let payload = input.payload.context("Cron job input needs a payload")?;

        let now = (self.clock)();
        validate_schedule(&schedule, now)?;
        let next = next_run_at_ms(&schedule, now)?;

        let job = CronJob {
            id: uuid::Uuid::new_v4().to_string(),
            name: input.name.unwrap_or_else(|| "cron-job".to_string()),
            description: input.description,
            enabled: input.enabled,
            created_at_ms: now,
            updated_at_ms: now,
            schedule,
            session_target: input.session_target,
            wake_mode: input.wake_mode,
            payload,
            isolation: input.isolation,
            state: fresh_state(next),
        };
        self.store.insert(job.clone())?;
        self.emit(CronEvent::Added {
            job_id: job.id.clone(),
        });
        self.nudge();
        tracing::info!(job = %job.id, name = %job.name, "Cron job added");
        Ok(job)
    }

    pub fn update(&self, id: &str, patch: CronJobPatch) -> Result<CronJob> {
        let now = (self.clock)();
        if let Some(schedule) = &patch.schedule {
            validate_schedule(schedule, now)?;
        }
        let schedule_changed = patch.schedule.is_some() || patch.enabled.is_some();

        let job = self.store.mutate(id, |job| {
            if let Some(name) = patch.name {
                job.name = name;
            }
            if let Some(description) = patch.description {
                job.description = Some(description);
            }
            if let Some(enabled) = patch.enabled {
                job.enabled = enabled;
            }
            if let Some(schedule) = patch.schedule {
                job.schedule = schedule;
            }
            if let Some(target) = patch.session_target {
                job.session_target = target;
            }
            if let Some(mode) = patch.wake_mode {
                job.wake_mode = mode;
            }
            if let Some(payload) = patch.payload {
                job.payload = payload;
            }
            if let Some(isolation) = patch.isolation {
                job.isolation = Some(isolation);
            }
            if schedule_changed {
                job.state.next_run_at_ms = next_run_at_ms(&job.schedule, now).ok().flatten();
            }
            job.updated_at_ms = now;
        })?;

        self.emit(CronEvent::Updated {
            job_id: job.id.clone(),
        });
        self.nudge();
        Ok(job)
    }

    pub fn remove(&self, id: &str) -> Result<bool> {
        let removed = self.store.remove(id)?;
        if removed {
            self.emit(CronEvent::Removed {
                job_id: id.to_string(),
            });
            self.nudge();
        }
        Ok(removed)
    }

    pub fn list(&self, include_disabled: bool) -> Vec<CronJob> {
        self.store.list(include_disabled)
    }

    pub fn status(&self) -> CronStatus {
        let jobs = self.store.list(true);
        CronStatus {
            jobs: jobs.len(),
            enabled_jobs: jobs.iter().filter(|j| j.enabled).count(),
            next_run_at_ms: self.store.earliest_next_run(),
        }
    }

    /// Out-of-band fire. Respects per-job single-flight: a job already
    /// running is skipped with reason `already-running`. A disabled job
    /// fires anyway (explicit operator intent) without being re-enabled.
    pub async fn run_now(&self, id: &str) -> Result<RunNowOutcome> {
        let job = self
            .store
            .get(id)
            .with_context(|| format!("Unknown cron job: {id}"))?;
        let now = (self.clock)();
        if !self.store.try_begin_run(id, now)? {
            return Ok(RunNowOutcome::Skipped {
                reason: "already-running".to_string(),
            });
        }
        self.fire(&job, now).await;
        Ok(RunNowOutcome::Started)
    }

    /// Forward a wake request to the heartbeat driver.
    pub async fn wake(&self, mode: WakeMode, text: Option<&str>, reason: Option<&str>) -> Result<()> {
        self.executor.wake(mode, text, reason).await
    }

    // ── Run loop ──────────────────────────────────────────────────

    /// Single-ticker loop. Wakes on the earliest upcoming fire or on any
    /// mutation, executes due jobs one at a time, and exits on cancel.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let mut control_rx = self
            .control_rx
            .lock()
            .take()
            .context("Cron scheduler is already running")?;

        // Markers left behind by an unclean shutdown would wedge jobs.
        self.store.clear_running_markers()?;
        self.seed_missing_next_runs()?;
        tracing::info!(jobs = self.store.list(true).len(), "Cron scheduler started");

        loop {
            let now = (self.clock)();
            let sleep_ms = self
                .store
                .earliest_next_run()
                .map_or(IDLE_SLEEP_MS, |next| (next - now).clamp(0, IDLE_SLEEP_MS));

            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                _ = control_rx.recv() => continue,
                () = tokio::time::sleep(Duration::from_millis(sleep_ms.unsigned_abs())) => {}
            }

            let now = (self.clock)();
            for job in self.store.due_jobs(now) {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                if !self.store.try_begin_run(&job.id, now)? {
                    continue;
                }
                self.fire(&job, now).await;
            }
        }
    }

    async fn fire(&self, job: &CronJob, started_at: i64) {
        self.emit(CronEvent::Started {
            job_id: job.id.clone(),
            run_at_ms: started_at,
        });

        let result = self.execute_payload(job).await;
        let finished_at = (self.clock)();
        let duration_ms = finished_at - started_at;

        let (status, error) = match result {
            Ok(()) => (CronRunStatus::Ok, None),
            Err(err) => {
                tracing::warn!(job = %job.id, "Cron job failed: {err:#}");
                (CronRunStatus::Error, Some(format!("{err:#}")))
            }
        };

        let next = next_run_at_ms(&job.schedule, finished_at).ok().flatten();
        let one_shot_spent = matches!(job.schedule, Schedule::At { .. }) && next.is_none();

        let persisted = self.store.mutate(&job.id, |j| {
            j.state.last_run_at_ms = Some(started_at);
            j.state.last_status = Some(status);
            j.state.last_error = error.clone();
            j.state.last_duration_ms = Some(duration_ms);
            j.state.running_at_ms = None;
            j.state.next_run_at_ms = next;
            if one_shot_spent {
                j.enabled = false;
            }
        });
        if let Err(err) = persisted {
            tracing::warn!(job = %job.id, "Failed to persist cron run result: {err:#}");
        }

        self.emit(CronEvent::Finished {
            job_id: job.id.clone(),
            status,
            duration_ms,
        });
        self.nudge();
    }

    async fn execute_payload(&self, job: &CronJob) -> Result<()> {
        match (&job.session_target, &job.payload) {
            (_, CronPayload::SystemEvent { text }) => {
                self.executor
                    .enqueue_system_event(text, job.wake_mode)
                    .await
            }
            (SessionTarget::Main, CronPayload::AgentTurn(payload)) => {
                self.executor.enqueue_main_turn(payload, job.wake_mode).await
            }
            (SessionTarget::Isolated, CronPayload::AgentTurn(payload)) => {
                let turn = self.executor.run_isolated_turn(payload);
                let response = match payload.timeout_seconds {
                    Some(secs) if secs > 0 => {
                        tokio::time::timeout(Duration::from_secs(secs), turn)
                            .await
                            .map_err(|_| anyhow::anyhow!("isolated run timed out after {secs}s"))??
                    }
                    _ => turn.await?,
                };
                if let Some(prefix) = job
                    .isolation
                    .as_ref()
                    .and_then(|i| i.post_to_main_prefix.as_deref())
                {
                    let summary = format!("{prefix} {}", response.trim());
                    self.executor.post_to_main(&summary).await?;
                }
                Ok(())
            }
        }
    }

    fn seed_missing_next_runs(&self) -> Result<()> {
        let now = (self.clock)();
        for job in self.store.list(true) {
            if job.enabled && job.state.next_run_at_ms.is_none() {
                let next = next_run_at_ms(&job.schedule, now).ok().flatten();
                if next.is_some() {
                    self.store.mutate(&job.id, |j| {
                        j.state.next_run_at_ms = next;
                    })?;
                }
            }
        }
        Ok(())
    }

    fn emit(&self, event: CronEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn nudge(&self) {
        let _ = self.control_tx.send(());
    }
}
