//! Time-based scheduler: persistent `at`/`every`/`cron` jobs firing system
//! events and agent turns into the gateway.

pub mod schedule;
pub mod scheduler;
pub mod store;
pub mod types;

pub use schedule::{next_run_at_ms, normalize_expression, validate_schedule};
pub use scheduler::{CronEvent, CronExecutor, CronScheduler, CronStatus, RunNowOutcome};
pub use store::CronStore;
pub use types::{
    normalize_job_input, AgentTurnPayload, CronJob, CronJobPatch, CronJobState, CronPayload,
    CronRunStatus, IsolationConfig, Schedule, SessionTarget, WakeMode,
};
