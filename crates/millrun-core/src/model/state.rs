//! Handler state and producer schedule rows

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schedule::ScheduleSpec;

/// Per-handler durable user state plus the consumer wake-at signal
///
/// Updated only on commit: a failed or paused run never moves state, so
/// user code always sees the state as of the last committed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerState {
    pub workflow_id: Uuid,
    pub handler_name: String,

    /// Opaque user state blob
    pub state: serde_json::Value,

    /// When the consumer asked to be woken; `None` = no wake armed
    pub wake_at: Option<DateTime<Utc>>,

    pub updated_at: DateTime<Utc>,
}

impl HandlerState {
    pub fn new(workflow_id: Uuid, handler_name: impl Into<String>) -> Self {
        Self {
            workflow_id,
            handler_name: handler_name.into(),
            state: serde_json::Value::Null,
            wake_at: None,
            updated_at: Utc::now(),
        }
    }

    pub fn wake_due(&self, now: DateTime<Utc>) -> bool {
        self.wake_at.is_some_and(|at| at <= now)
    }
}

/// When a producer should next run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerSchedule {
    pub workflow_id: Uuid,
    pub producer_name: String,
    pub spec: ScheduleSpec,
    pub next_run_at: DateTime<Utc>,
}

impl ProducerSchedule {
    pub fn new(
        workflow_id: Uuid,
        producer_name: impl Into<String>,
        spec: ScheduleSpec,
        next_run_at: DateTime<Utc>,
    ) -> Self {
        Self {
            workflow_id,
            producer_name: producer_name.into(),
            spec,
            next_run_at,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_run_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::time::Duration as StdDuration;

    #[test]
    fn wake_due_only_at_or_after() {
        let mut st = HandlerState::new(Uuid::now_v7(), "digest");
        let now = Utc::now();
        assert!(!st.wake_due(now));
        st.wake_at = Some(now + Duration::seconds(5));
        assert!(!st.wake_due(now));
        assert!(st.wake_due(now + Duration::seconds(5)));
    }

    #[test]
    fn schedule_due() {
        let now = Utc::now();
        let sched = ProducerSchedule::new(
            Uuid::now_v7(),
            "poll",
            ScheduleSpec::Interval(StdDuration::from_secs(60)),
            now,
        );
        assert!(sched.is_due(now));
        assert!(!sched.is_due(now - Duration::seconds(1)));
    }
}
