//! Workflow entity

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a workflow
///
/// A workflow is created `draft`, becomes `ready` on its first saved script,
/// `active` while deployed, and `paused`/`error` when it needs user
/// attention. The auto-fix cycle is tracked separately via
/// [`Workflow::maintenance`], not as a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Created, no script saved yet
    Draft,

    /// Has a saved script but is not deployed
    Ready,

    /// Deployed; the scheduler may start sessions
    Active,

    /// Suspended awaiting the user (approval or mutation reconciliation)
    Paused,

    /// Failed in a way that needs user attention; no retries
    Error,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Draft => write!(f, "draft"),
            Self::Ready => write!(f, "ready"),
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "ready" => Ok(Self::Ready),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown workflow status: {other}")),
        }
    }
}

/// A user-defined automation
///
/// The workflow row carries the control fields the engine flips atomically
/// with run transitions: `status`, `maintenance`, `pending_retry_run_id`
/// and the transient-retry backoff. `handler_config` is the serialized
/// [`WorkflowConfig`](crate::config::WorkflowConfig) of the active script
/// and is the engine's single source of truth for topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,

    /// Owning task (external grouping concept, opaque to the engine)
    pub task_id: Uuid,

    /// Script currently deployed, if any
    pub active_script_id: Option<Uuid>,

    /// Serialized `WorkflowConfig` of the active script
    pub handler_config: Option<serde_json::Value>,

    pub status: WorkflowStatus,

    /// True while an auto-fix cycle owns this workflow
    pub maintenance: bool,

    /// Number of auto-fix activations since the last manual one
    pub maintenance_fix_count: i32,

    /// Set when a post-mutation retry must run before any other work
    pub pending_retry_run_id: Option<Uuid>,

    /// Denormalized display cron of the first scheduled producer
    pub cron: Option<String>,

    /// Denormalized earliest producer fire time, for display
    pub next_run_at: Option<DateTime<Utc>>,

    /// Transient-retry backoff: no session starts before this instant
    pub backoff_until: Option<DateTime<Utc>>,

    /// Current backoff width in seconds; 0 = backoff not armed
    pub backoff_secs: i64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    /// Create a fresh draft workflow
    pub fn new(task_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            task_id,
            active_script_id: None,
            handler_config: None,
            status: WorkflowStatus::Draft,
            maintenance: false,
            maintenance_fix_count: 0,
            pending_retry_run_id: None,
            cron: None,
            next_run_at: None,
            backoff_until: None,
            backoff_secs: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the scheduler may start sessions for this workflow
    pub fn is_runnable(&self) -> bool {
        self.status == WorkflowStatus::Active && !self.maintenance
    }

    /// Whether the workflow is inside its transient backoff window
    pub fn in_backoff(&self, now: DateTime<Utc>) -> bool {
        self.backoff_until.is_some_and(|until| until > now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn new_workflow_is_draft() {
        let wf = Workflow::new(Uuid::now_v7());
        assert_eq!(wf.status, WorkflowStatus::Draft);
        assert!(!wf.maintenance);
        assert!(!wf.is_runnable());
    }

    #[test]
    fn maintenance_blocks_runnable() {
        let mut wf = Workflow::new(Uuid::now_v7());
        wf.status = WorkflowStatus::Active;
        assert!(wf.is_runnable());
        wf.maintenance = true;
        assert!(!wf.is_runnable());
    }

    #[test]
    fn backoff_window() {
        let mut wf = Workflow::new(Uuid::now_v7());
        let now = Utc::now();
        assert!(!wf.in_backoff(now));
        wf.backoff_until = Some(now + Duration::seconds(30));
        assert!(wf.in_backoff(now));
        assert!(!wf.in_backoff(now + Duration::seconds(31)));
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            WorkflowStatus::Draft,
            WorkflowStatus::Ready,
            WorkflowStatus::Active,
            WorkflowStatus::Paused,
            WorkflowStatus::Error,
        ] {
            let parsed: WorkflowStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }
}
