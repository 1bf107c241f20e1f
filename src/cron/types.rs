//! Cron job records: schedules, payloads, run state, and input
//! normalization.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// When a job fires.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Schedule {
    #[serde(rename_all = "camelCase")]
    At { at_ms: i64 },
    #[serde(rename_all = "camelCase")]
    Every {
        every_ms: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        anchor_ms: Option<i64>,
    },
    Cron {
        expr: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tz: Option<String>,
    },
}

/// Which session a job's payload lands on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionTarget {
    #[default]
    Main,
    Isolated,
}

impl SessionTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Isolated => "isolated",
        }
    }
}

/// Whether a main-session payload forces an immediate heartbeat or waits
/// for the next tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum WakeMode {
    Now,
    #[default]
    NextHeartbeat,
}

impl WakeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Now => "now",
            Self::NextHeartbeat => "next-heartbeat",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentTurnPayload {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deliver: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_effort_deliver: Option<bool>,
}

/// What a job does when it fires.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind")]
pub enum CronPayload {
    #[serde(rename = "systemEvent")]
    SystemEvent { text: String },
    #[serde(rename = "agentTurn")]
    AgentTurn(AgentTurnPayload),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct IsolationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_to_main_prefix: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CronRunStatus {
    Ok,
    Error,
    Skipped,
}

impl CronRunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Skipped => "skipped",
        }
    }
}

/// Mutable run bookkeeping. `running_at_ms` doubles as the single-flight
/// flag: at most one run per job holds it at any time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct CronJobState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status: Option<CronRunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub enabled: bool,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub schedule: Schedule,
    pub session_target: SessionTarget,
    pub wake_mode: WakeMode,
    pub payload: CronPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation: Option<IsolationConfig>,
    #[serde(default)]
    pub state: CronJobState,
}

/// Field-wise patch for `update`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CronJobPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub enabled: Option<bool>,
    pub schedule: Option<Schedule>,
    pub session_target: Option<SessionTarget>,
    pub wake_mode: Option<WakeMode>,
    pub payload: Option<CronPayload>,
    pub isolation: Option<IsolationConfig>,
}

/// Normalize raw job input: infer omitted `kind` discriminators and apply
/// creation defaults. Idempotent — normalizing a normalized value is a
/// no-op.
///
/// Inference: `atMs` ⇒ `at`, `everyMs` ⇒ `every`, `expr` ⇒ `cron`;
/// `text` ⇒ `systemEvent`, `message` ⇒ `agentTurn`. Defaults:
/// `wakeMode = next-heartbeat`; `sessionTarget = main` for system events,
/// `isolated` for agent turns.
pub fn normalize_job_input(raw: &Value) -> Result<Value> {
    let mut value = raw.clone();
    let obj = value
        .as_object_mut()
        .context("Cron job input must be an object")?;

    if let Some(schedule) = obj.get_mut("schedule").and_then(Value::as_object_mut) {
        if !schedule.contains_key("kind") {
            let kind = if schedule.contains_key("atMs") {
                "at"
            } else if schedule.contains_key("everyMs") {
                "every"
            } else if schedule.contains_key("expr") {
                "cron"
            } else {
                anyhow::bail!("Cron schedule needs one of: atMs, everyMs, expr");
            };
            schedule.insert("kind".into(), Value::String(kind.into()));
        }
    }

    let payload_kind = {
        let payload = obj
            .get_mut("payload")
            .and_then(Value::as_object_mut)
            .context("Cron job input needs a payload object")?;
        if !payload.contains_key("kind") {
            let kind = if payload.contains_key("text") {
                "systemEvent"
            } else if payload.contains_key("message") {
                "agentTurn"
            } else {
                anyhow::bail!("Cron payload needs one of: text, message");
            };
            payload.insert("kind".into(), Value::String(kind.into()));
        }
        payload
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or("systemEvent")
            .to_string()
    };

    if !obj.contains_key("wakeMode") {
        obj.insert("wakeMode".into(), Value::String("next-heartbeat".into()));
    }
    if !obj.contains_key("sessionTarget") {
        let target = if payload_kind == "agentTurn" {
            "isolated"
        } else {
            "main"
        };
        obj.insert("sessionTarget".into(), Value::String(target.into()));
    }

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn schedule_kind_tags_round_trip() {
        let every = Schedule::Every {
            every_ms: 60_000,
            anchor_ms: Some(1_000_000),
        };
        let json = serde_json::to_value(&every).unwrap();
        assert_eq!(json["kind"], "every");
        assert_eq!(json["everyMs"], 60_000);
        assert_eq!(json["anchorMs"], 1_000_000);

        let back: Schedule = serde_json::from_value(json).unwrap();
        assert_eq!(back, every);
    }

    #[test]
    fn payload_kinds_round_trip() {
        let event = CronPayload::SystemEvent {
            text: "backup finished".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "systemEvent");

        let turn = CronPayload::AgentTurn(AgentTurnPayload {
            message: "summarize the inbox".into(),
            timeout_seconds: Some(120),
            ..AgentTurnPayload::default()
        });
        let json = serde_json::to_value(&turn).unwrap();
        assert_eq!(json["kind"], "agentTurn");
        assert_eq!(json["timeoutSeconds"], 120);
        let back: CronPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, turn);
    }

    #[test]
    fn normalize_infers_kinds_and_defaults() {
        let raw = json!({
            "name": "daily",
            "schedule": { "everyMs": 60000 },
            "payload": { "message": "check the feeds" },
        });
        let normalized = normalize_job_input(&raw).unwrap();
        assert_eq!(normalized["schedule"]["kind"], "every");
        assert_eq!(normalized["payload"]["kind"], "agentTurn");
        assert_eq!(normalized["wakeMode"], "next-heartbeat");
        assert_eq!(normalized["sessionTarget"], "isolated");

        let raw = json!({
            "name": "notice",
            "schedule": { "expr": "0 9 * * *" },
            "payload": { "text": "stand-up time" },
        });
        let normalized = normalize_job_input(&raw).unwrap();
        assert_eq!(normalized["schedule"]["kind"], "cron");
        assert_eq!(normalized["payload"]["kind"], "systemEvent");
        assert_eq!(normalized["sessionTarget"], "main");
    }

    #[test]
    fn normalize_is_idempotent() {
        let raw = json!({
            "name": "daily",
            "schedule": { "atMs": 2_000_000 },
            "payload": { "text": "ping" },
        });
        let once = normalize_job_input(&raw).unwrap();
        let twice = normalize_job_input(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn normalize_rejects_unrecognizable_shapes() {
        assert!(normalize_job_input(&json!({"payload": {"text": "x"}, "schedule": {}})).is_err());
        assert!(normalize_job_input(&json!({"schedule": {"atMs": 1}, "payload": {}})).is_err());
        assert!(normalize_job_input(&json!("nope")).is_err());
    }

    #[test]
    fn wake_mode_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_value(WakeMode::NextHeartbeat).unwrap(),
            "next-heartbeat"
        );
        assert_eq!(serde_json::to_value(WakeMode::Now).unwrap(), "now");
    }
}
