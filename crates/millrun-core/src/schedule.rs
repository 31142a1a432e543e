//! Producer schedule parsing and next-fire math
//!
//! Two schedule shapes exist: fixed intervals (`"30s"`, `"5m"`, `"2h"`,
//! `"1d"`) and cron expressions. Cron is evaluated in UTC.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Errors from schedule parsing or evaluation
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("invalid interval {0:?}: expected <number><s|m|h|d>")]
    InvalidInterval(String),

    #[error("interval must be positive: {0:?}")]
    ZeroInterval(String),

    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("cron expression {0:?} has no upcoming fire time")]
    NoUpcomingFire(String),
}

/// Parse an interval string like `"30s"`, `"5m"`, `"2h"` or `"1d"`
pub fn parse_interval(s: &str) -> Result<Duration, ScheduleError> {
    let s = s.trim();
    let Some(unit) = s.chars().last() else {
        return Err(ScheduleError::InvalidInterval(s.to_string()));
    };
    let digits = &s[..s.len() - unit.len_utf8()];
    let value: u64 = digits
        .parse()
        .map_err(|_| ScheduleError::InvalidInterval(s.to_string()))?;
    if value == 0 {
        return Err(ScheduleError::ZeroInterval(s.to_string()));
    }
    let secs = match unit {
        's' => value,
        'm' => value * 60,
        'h' => value * 3600,
        'd' => value * 86_400,
        _ => return Err(ScheduleError::InvalidInterval(s.to_string())),
    };
    Ok(Duration::from_secs(secs))
}

/// Normalize a user cron expression for the `cron` crate, which expects a
/// leading seconds field. Five-field expressions get `0` prepended.
fn normalize_cron(expr: &str) -> String {
    let fields = expr.split_whitespace().count();
    if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

/// A producer's schedule: fixed interval or cron
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleSpec {
    /// Fire every fixed duration, measured from the previous fire
    Interval(#[serde(with = "duration_secs")] Duration),

    /// Fire on a cron expression (UTC); five- and six-field forms accepted
    Cron(String),
}

impl ScheduleSpec {
    /// Parse from the `handler_config` schedule shape:
    /// `{"interval": "60s"}` or `{"cron": "*/5 * * * *"}`
    pub fn from_config(
        interval: Option<&str>,
        cron_expr: Option<&str>,
    ) -> Result<Self, ScheduleError> {
        match (interval, cron_expr) {
            (Some(i), None) => Ok(Self::Interval(parse_interval(i)?)),
            (None, Some(c)) => {
                let normalized = normalize_cron(c);
                cron::Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCron {
                    expr: c.to_string(),
                    reason: e.to_string(),
                })?;
                Ok(Self::Cron(c.to_string()))
            }
            (Some(i), Some(_)) => Err(ScheduleError::InvalidInterval(format!(
                "{i}: schedule declares both interval and cron"
            ))),
            (None, None) => Err(ScheduleError::InvalidInterval(
                "schedule declares neither interval nor cron".to_string(),
            )),
        }
    }

    /// The first fire time strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        match self {
            Self::Interval(interval) => {
                let delta = chrono::Duration::from_std(*interval).map_err(|e| {
                    ScheduleError::InvalidInterval(format!("{interval:?}: {e}"))
                })?;
                Ok(after + delta)
            }
            Self::Cron(expr) => {
                let normalized = normalize_cron(expr);
                let schedule =
                    cron::Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCron {
                        expr: expr.clone(),
                        reason: e.to_string(),
                    })?;
                schedule
                    .after(&after)
                    .next()
                    .ok_or_else(|| ScheduleError::NoUpcomingFire(expr.clone()))
            }
        }
    }

    /// The cron expression, when this is a cron schedule
    pub fn cron_expr(&self) -> Option<&str> {
        match self {
            Self::Cron(expr) => Some(expr),
            Self::Interval(_) => None,
        }
    }
}

/// Serde support for Duration as whole seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parse_interval_units() {
        assert_eq!(parse_interval("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_interval("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_interval("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_interval("1d").unwrap(), Duration::from_secs(86_400));
    }

    #[test]
    fn parse_interval_rejects_garbage() {
        assert!(parse_interval("").is_err());
        assert!(parse_interval("60").is_err());
        assert!(parse_interval("s").is_err());
        assert!(parse_interval("-5m").is_err());
        assert!(parse_interval("0s").is_err());
        assert!(parse_interval("5w").is_err());
    }

    #[test]
    fn interval_next_after() {
        let spec = ScheduleSpec::Interval(Duration::from_secs(60));
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(
            spec.next_after(t0).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 1, 0).unwrap()
        );
    }

    #[test]
    fn cron_five_field_is_accepted() {
        let spec = ScheduleSpec::from_config(None, Some("*/15 * * * *")).unwrap();
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 12, 1, 0).unwrap();
        let next = spec.next_after(t0).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 1, 12, 15, 0).unwrap());
    }

    #[test]
    fn cron_six_field_is_accepted() {
        let spec = ScheduleSpec::from_config(None, Some("0 0 9 * * *")).unwrap();
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let next = spec.next_after(t0).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap());
    }

    #[test]
    fn from_config_rejects_both_and_neither() {
        assert!(ScheduleSpec::from_config(Some("60s"), Some("* * * * *")).is_err());
        assert!(ScheduleSpec::from_config(None, None).is_err());
    }

    #[test]
    fn from_config_rejects_bad_cron() {
        assert!(ScheduleSpec::from_config(None, Some("not a cron")).is_err());
    }

    #[test]
    fn spec_serde_round_trip() {
        for spec in [
            ScheduleSpec::Interval(Duration::from_secs(90)),
            ScheduleSpec::Cron("*/5 * * * *".to_string()),
        ] {
            let json = serde_json::to_string(&spec).unwrap();
            let back: ScheduleSpec = serde_json::from_str(&json).unwrap();
            assert_eq!(back, spec);
        }
    }
}
