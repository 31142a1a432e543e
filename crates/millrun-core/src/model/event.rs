//! Event and input-record ledger entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery status of an event within its topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Published, awaiting a consumer
    Pending,

    /// Held by exactly one active handler run
    Reserved,

    /// Processed to completion by a committed run
    Consumed,

    /// Deliberately dropped during user resolution
    Skipped,
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Reserved => "reserved",
            Self::Consumed => "consumed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "reserved" => Ok(Self::Reserved),
            "consumed" => Ok(Self::Consumed),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown event status: {other}")),
        }
    }
}

/// One message on a workflow-internal topic
///
/// `(workflow_id, topic, message_id)` is unique; publishing the same triple
/// twice is a no-op and the first payload wins. `caused_by` links back to
/// the input records whose arrival ultimately produced this event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub topic: String,

    /// Publisher-chosen idempotency key within the topic
    pub message_id: String,

    pub title: Option<String>,
    pub payload: serde_json::Value,
    pub status: EventStatus,

    /// The handler run currently holding the reservation
    pub reserved_by: Option<Uuid>,

    /// Input-record ids this event is causally downstream of
    pub caused_by: Vec<Uuid>,

    /// Store-assigned publish order within the workflow
    pub seq: i64,

    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn pending(
        workflow_id: Uuid,
        topic: impl Into<String>,
        message_id: impl Into<String>,
        payload: serde_json::Value,
        caused_by: Vec<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id,
            topic: topic.into(),
            message_id: message_id.into(),
            title: None,
            payload,
            status: EventStatus::Pending,
            reserved_by: None,
            caused_by,
            seq: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// An external fact introduced into the system by a producer
///
/// Idempotent per `(workflow_id, source, kind, external_id)`: registering
/// the same external fact twice returns the original record's id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputRecord {
    pub id: Uuid,
    pub workflow_id: Uuid,

    /// Originating connector, e.g. `gmail`
    pub source: String,

    /// Kind of fact within the source, e.g. `message`
    pub kind: String,

    /// The fact's identity in the external system
    pub external_id: String,

    pub title: Option<String>,

    /// Producer run that first registered this input
    pub handler_run_id: Uuid,

    pub created_at: DateTime<Utc>,
}

impl InputRecord {
    pub fn new(
        workflow_id: Uuid,
        source: impl Into<String>,
        kind: impl Into<String>,
        external_id: impl Into<String>,
        handler_run_id: Uuid,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id,
            source: source.into(),
            kind: kind.into(),
            external_id: external_id.into(),
            title: None,
            handler_run_id,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pending_event_defaults() {
        let ev = Event::pending(Uuid::now_v7(), "email.received", "m-1", json!({}), vec![]);
        assert_eq!(ev.status, EventStatus::Pending);
        assert!(ev.reserved_by.is_none());
        assert!(ev.caused_by.is_empty());
    }

    #[test]
    fn event_status_round_trip() {
        for status in [
            EventStatus::Pending,
            EventStatus::Reserved,
            EventStatus::Consumed,
            EventStatus::Skipped,
        ] {
            let parsed: EventStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }
}
