//! Next-run computation for `at` / `every` / `cron` schedules.

use crate::cron::types::Schedule;
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use cron::Schedule as CronExpr;
use std::str::FromStr;

/// Compute the next fire time strictly by the schedule's semantics.
///
/// - `at` fires once at `at_ms` if still in the future, else never.
/// - `every` fires at `anchor + k*every` for the smallest `k >= 1` landing
///   at or after `now`; before the anchor the first fire is the anchor
///   itself. A missing anchor means "anchored at now".
/// - `cron` uses a 5-field expression (seconds are prefixed) under the
///   job's IANA timezone, UTC when absent.
///
/// Monotonic: feeding a result back in never yields an earlier time.
pub fn next_run_at_ms(schedule: &Schedule, now_ms: i64) -> Result<Option<i64>> {
    match schedule {
        Schedule::At { at_ms } => Ok((*at_ms > now_ms).then_some(*at_ms)),
        Schedule::Every {
            every_ms,
            anchor_ms,
        } => {
            if *every_ms <= 0 {
                anyhow::bail!("Invalid schedule: everyMs must be > 0");
            }
            let anchor = anchor_ms.unwrap_or(now_ms);
            if now_ms < anchor {
                return Ok(Some(anchor));
            }
            let elapsed = now_ms - anchor;
            let k = (elapsed.div_euclid(*every_ms)
                + i64::from(elapsed.rem_euclid(*every_ms) != 0))
            .max(1);
            Ok(Some(anchor + k * every_ms))
        }
        Schedule::Cron { expr, tz } => {
            let normalized = normalize_expression(expr)?;
            let cron = CronExpr::from_str(&normalized)
                .with_context(|| format!("Invalid cron expression: {expr}"))?;
            let from = Utc
                .timestamp_millis_opt(now_ms)
                .single()
                .context("Timestamp out of range")?;
            let next: Option<DateTime<Utc>> = if let Some(tz_name) = tz {
                let timezone = chrono_tz::Tz::from_str(tz_name)
                    .map_err(|_| anyhow::anyhow!("Invalid IANA timezone: {tz_name}"))?;
                let localized = from.with_timezone(&timezone);
                cron.after(&localized)
                    .next()
                    .map(|dt| dt.with_timezone(&Utc))
            } else {
                cron.after(&from).next()
            };
            Ok(next.map(|dt| dt.timestamp_millis()))
        }
    }
}

/// Accept the standard 5-field crontab syntax by prefixing a seconds field;
/// 6/7-field expressions pass through.
pub fn normalize_expression(expression: &str) -> Result<String> {
    let expression = expression.trim();
    let field_count = expression.split_whitespace().count();

    match field_count {
        5 => Ok(format!("0 {expression}")),
        6 | 7 => Ok(expression.to_string()),
        _ => anyhow::bail!(
            "Invalid cron expression: {expression} (expected 5, 6, or 7 fields, got {field_count})"
        ),
    }
}

/// Validate a schedule at creation time.
pub fn validate_schedule(schedule: &Schedule, now_ms: i64) -> Result<()> {
    match schedule {
        Schedule::At { at_ms } => {
            if *at_ms <= now_ms {
                anyhow::bail!("Invalid schedule: 'at' must be in the future");
            }
            Ok(())
        }
        Schedule::Every { every_ms, .. } => {
            if *every_ms <= 0 {
                anyhow::bail!("Invalid schedule: everyMs must be > 0");
            }
            Ok(())
        }
        Schedule::Cron { .. } => {
            next_run_at_ms(schedule, now_ms)?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_in_the_past_never_fires() {
        let schedule = Schedule::At { at_ms: 1_000 };
        assert_eq!(next_run_at_ms(&schedule, 2_000).unwrap(), None);
        assert_eq!(next_run_at_ms(&schedule, 500).unwrap(), Some(1_000));
    }

    #[test]
    fn every_fires_on_anchor_grid() {
        let schedule = Schedule::Every {
            every_ms: 60_000,
            anchor_ms: Some(1_000_000),
        };
        assert_eq!(next_run_at_ms(&schedule, 1_059_000).unwrap(), Some(1_060_000));
        assert_eq!(next_run_at_ms(&schedule, 1_060_001).unwrap(), Some(1_120_000));
    }

    #[test]
    fn every_before_anchor_fires_at_anchor() {
        let schedule = Schedule::Every {
            every_ms: 60_000,
            anchor_ms: Some(1_000_000),
        };
        assert_eq!(next_run_at_ms(&schedule, 900_000).unwrap(), Some(1_000_000));
    }

    #[test]
    fn every_one_ms_anchored_now_fires_next_ms() {
        let schedule = Schedule::Every {
            every_ms: 1,
            anchor_ms: Some(5_000),
        };
        assert_eq!(next_run_at_ms(&schedule, 5_000).unwrap(), Some(5_001));
    }

    #[test]
    fn every_rejects_non_positive_interval() {
        let schedule = Schedule::Every {
            every_ms: 0,
            anchor_ms: None,
        };
        assert!(next_run_at_ms(&schedule, 0).is_err());
    }

    #[test]
    fn next_run_is_monotonic() {
        let schedules = [
            Schedule::Every {
                every_ms: 60_000,
                anchor_ms: Some(1_000_000),
            },
            Schedule::Cron {
                expr: "*/5 * * * *".into(),
                tz: None,
            },
        ];
        let now = 1_717_000_000_000;
        for schedule in &schedules {
            let first = next_run_at_ms(schedule, now).unwrap().unwrap();
            let second = next_run_at_ms(schedule, first).unwrap().unwrap();
            assert!(second >= first, "schedule {schedule:?} went backwards");
        }
    }

    #[test]
    fn cron_honors_timezone() {
        let schedule = Schedule::Cron {
            expr: "0 9 * * *".into(),
            tz: Some("America/Los_Angeles".into()),
        };
        // 2026-02-16 00:00 UTC; 09:00 in Los Angeles is 17:00 UTC (PST).
        let from = chrono::Utc
            .with_ymd_and_hms(2026, 2, 16, 0, 0, 0)
            .unwrap()
            .timestamp_millis();
        let next = next_run_at_ms(&schedule, from).unwrap().unwrap();
        let expected = chrono::Utc
            .with_ymd_and_hms(2026, 2, 16, 17, 0, 0)
            .unwrap()
            .timestamp_millis();
        assert_eq!(next, expected);
    }

    #[test]
    fn cron_defaults_to_utc() {
        let schedule = Schedule::Cron {
            expr: "30 6 * * *".into(),
            tz: None,
        };
        let from = chrono::Utc
            .with_ymd_and_hms(2026, 3, 1, 5, 0, 0)
            .unwrap()
            .timestamp_millis();
        let next = next_run_at_ms(&schedule, from).unwrap().unwrap();
        let expected = chrono::Utc
            .with_ymd_and_hms(2026, 3, 1, 6, 30, 0)
            .unwrap()
            .timestamp_millis();
        assert_eq!(next, expected);
    }

    #[test]
    fn five_field_expressions_gain_a_seconds_field() {
        assert_eq!(normalize_expression("* * * * *").unwrap(), "0 * * * * *");
        assert_eq!(normalize_expression("0 9 * * 1-5").unwrap(), "0 0 9 * * 1-5");
        assert!(normalize_expression("* *").is_err());
    }

    #[test]
    fn validate_rejects_past_at_and_bad_expressions() {
        assert!(validate_schedule(&Schedule::At { at_ms: 1 }, 100).is_err());
        assert!(validate_schedule(
            &Schedule::Cron {
                expr: "not a cron".into(),
                tz: None
            },
            0
        )
        .is_err());
        assert!(validate_schedule(
            &Schedule::Every {
                every_ms: 1_000,
                anchor_ms: None
            },
            0
        )
        .is_ok());
    }
}
