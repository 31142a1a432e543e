//! The `PrepareResult` contract
//!
//! A consumer's prepare phase returns a value of this exact shape; any
//! other shape is a logic error attributed to the user script. Wake-at
//! requests are clamped on persistence so a buggy script can neither spin
//! the scheduler nor park itself forever.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ClassifiedError;

/// Minimum distance of a persisted wake-at from now, in seconds
pub const WAKE_AT_MIN: i64 = 30;

/// Maximum distance of a persisted wake-at from now, in seconds
pub const WAKE_AT_MAX: i64 = 24 * 60 * 60;

/// A batch of events the consumer wants to hold
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub topic: String,
    pub ids: Vec<String>,
}

/// Display hints for the run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareUi {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Validated output of a consumer's prepare phase
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrepareResult {
    #[serde(default)]
    pub reservations: Vec<Reservation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui: Option<PrepareUi>,

    /// Requested wake time; clamped by the engine on persistence
    #[serde(default, rename = "wakeAt", skip_serializing_if = "Option::is_none")]
    pub wake_at: Option<DateTime<Utc>>,
}

impl PrepareResult {
    /// Parse a sandbox return value, rejecting any off-contract shape as a
    /// logic error
    pub fn parse(value: &serde_json::Value) -> Result<Self, ClassifiedError> {
        if !value.is_object() {
            return Err(ClassifiedError::logic(format!(
                "prepare must return an object, got {value}"
            )));
        }
        let parsed: Self = serde_json::from_value(value.clone())
            .map_err(|e| ClassifiedError::logic(format!("malformed prepare result: {e}")))?;
        for reservation in &parsed.reservations {
            if reservation.topic.is_empty() {
                return Err(ClassifiedError::logic(
                    "prepare reservation names an empty topic",
                ));
            }
            if reservation.ids.is_empty() {
                return Err(ClassifiedError::logic(format!(
                    "prepare reservation for topic {:?} lists no event ids",
                    reservation.topic
                )));
            }
        }
        Ok(parsed)
    }

    /// Whether prepare reserved anything at all
    pub fn has_reservations(&self) -> bool {
        !self.reservations.is_empty()
    }

    pub fn total_reserved(&self) -> usize {
        self.reservations.iter().map(|r| r.ids.len()).sum()
    }
}

/// Clamp a requested wake-at to `[now+30s, now+24h]`
///
/// `None` stays `None` (no wake). A request in the past or below the
/// minimum is lifted to `now+30s`; one beyond the horizon is pulled back
/// to `now+24h`.
pub fn clamp_wake_at(
    requested: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let requested = requested?;
    let min = now + Duration::seconds(WAKE_AT_MIN);
    let max = now + Duration::seconds(WAKE_AT_MAX);
    Some(requested.clamp(min, max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_full_shape() {
        let value = json!({
            "reservations": [{"topic": "email.received", "ids": ["m-1", "m-2"]}],
            "data": {"count": 2},
            "ui": {"title": "two new emails"},
            "wakeAt": "2026-03-01T12:00:00Z"
        });
        let parsed = PrepareResult::parse(&value).unwrap();
        assert_eq!(parsed.total_reserved(), 2);
        assert!(parsed.has_reservations());
        assert!(parsed.wake_at.is_some());
    }

    #[test]
    fn parses_empty_object() {
        let parsed = PrepareResult::parse(&json!({})).unwrap();
        assert!(!parsed.has_reservations());
        assert!(parsed.wake_at.is_none());
    }

    #[test]
    fn rejects_non_object() {
        for bad in [json!(null), json!(42), json!("x"), json!([1, 2])] {
            let err = PrepareResult::parse(&bad).unwrap_err();
            assert_eq!(err.kind, crate::error::ErrorKind::Logic);
        }
    }

    #[test]
    fn rejects_malformed_reservations() {
        let err =
            PrepareResult::parse(&json!({"reservations": [{"topic": "t"}]})).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Logic);

        let err =
            PrepareResult::parse(&json!({"reservations": [{"topic": "t", "ids": []}]}))
                .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Logic);
    }

    #[test]
    fn rejects_bad_wake_at() {
        let err = PrepareResult::parse(&json!({"wakeAt": "yesterday-ish"})).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Logic);
    }

    #[test]
    fn clamp_lifts_near_and_past_requests() {
        let now = Utc::now();
        let clamped = clamp_wake_at(Some(now - Duration::hours(1)), now).unwrap();
        assert_eq!(clamped, now + Duration::seconds(WAKE_AT_MIN));

        let clamped = clamp_wake_at(Some(now + Duration::seconds(5)), now).unwrap();
        assert_eq!(clamped, now + Duration::seconds(WAKE_AT_MIN));
    }

    #[test]
    fn clamp_caps_far_requests() {
        let now = Utc::now();
        let clamped = clamp_wake_at(Some(now + Duration::days(30)), now).unwrap();
        assert_eq!(clamped, now + Duration::seconds(WAKE_AT_MAX));
    }

    #[test]
    fn clamp_passes_reasonable_requests() {
        let now = Utc::now();
        let requested = now + Duration::minutes(10);
        assert_eq!(clamp_wake_at(Some(requested), now), Some(requested));
        assert_eq!(clamp_wake_at(None, now), None);
    }
}
