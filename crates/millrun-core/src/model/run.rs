//! Sessions (script runs) and handler runs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Session (ScriptRun)
// =============================================================================

/// What caused a session to start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// A producer schedule fired
    Schedule,

    /// The user asked for an immediate run
    Manual,

    /// Pending events or a due wake-at
    Event,

    /// A post-mutation retry of a failed or crashed run
    Retry,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Schedule => write!(f, "schedule"),
            Self::Manual => write!(f, "manual"),
            Self::Event => write!(f, "event"),
            Self::Retry => write!(f, "retry"),
        }
    }
}

impl std::str::FromStr for Trigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "schedule" => Ok(Self::Schedule),
            "manual" => Ok(Self::Manual),
            "event" => Ok(Self::Event),
            "retry" => Ok(Self::Retry),
            other => Err(format!("unknown trigger: {other}")),
        }
    }
}

/// Terminal result of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionResult {
    Completed,
    Failed,
    Suspended,
}

impl std::fmt::Display for SessionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Suspended => write!(f, "suspended"),
        }
    }
}

impl std::str::FromStr for SessionResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "suspended" => Ok(Self::Suspended),
            other => Err(format!("unknown session result: {other}")),
        }
    }
}

/// One invocation of a workflow: the container of all handler runs from a
/// single scheduler trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptRun {
    pub id: Uuid,
    pub script_id: Uuid,
    pub workflow_id: Uuid,
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub result: Option<SessionResult>,
    pub error: Option<String>,
    pub error_kind: Option<crate::error::ErrorKind>,

    /// Summed cost of all handler runs, in milli-cents
    pub cost_milli_cents: i64,

    /// Number of committed handler runs
    pub handler_count: i32,

    /// Session this one retries, if any
    pub retry_of: Option<Uuid>,
}

impl ScriptRun {
    pub fn new(workflow_id: Uuid, script_id: Uuid, trigger: Trigger) -> Self {
        Self {
            id: Uuid::now_v7(),
            script_id,
            workflow_id,
            trigger,
            started_at: Utc::now(),
            ended_at: None,
            result: None,
            error: None,
            error_kind: None,
            cost_milli_cents: 0,
            handler_count: 0,
            retry_of: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.ended_at.is_some()
    }
}

// =============================================================================
// Handler runs
// =============================================================================

/// Producer or consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    Producer,
    Consumer,
}

impl std::fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Producer => write!(f, "producer"),
            Self::Consumer => write!(f, "consumer"),
        }
    }
}

impl std::str::FromStr for HandlerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "producer" => Ok(Self::Producer),
            "consumer" => Ok(Self::Consumer),
            other => Err(format!("unknown handler kind: {other}")),
        }
    }
}

/// Where a handler run is in its lifecycle
///
/// Producers walk `Pending → Executing → Committed`. Consumers walk
/// `Pending → Preparing → Prepared → Mutating → Mutated → Emitting →
/// Committed`. A phase never regresses; a retry is a new run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Pending,
    Executing,
    Preparing,
    Prepared,
    Mutating,
    Mutated,
    Emitting,
    Committed,
}

impl RunPhase {
    /// True once the mutation boundary has been crossed: reserved events
    /// must be retained and any retry resumes at `Emitting`.
    ///
    /// `Mutating` itself sits on the boundary; whether a run in that phase
    /// counts as post-mutation depends on its mutation row's status.
    pub fn is_past_mutation(self) -> bool {
        matches!(self, Self::Mutated | Self::Emitting | Self::Committed)
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Preparing => "preparing",
            Self::Prepared => "prepared",
            Self::Mutating => "mutating",
            Self::Mutated => "mutated",
            Self::Emitting => "emitting",
            Self::Committed => "committed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RunPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "executing" => Ok(Self::Executing),
            "preparing" => Ok(Self::Preparing),
            "prepared" => Ok(Self::Prepared),
            "mutating" => Ok(Self::Mutating),
            "mutated" => Ok(Self::Mutated),
            "emitting" => Ok(Self::Emitting),
            "committed" => Ok(Self::Committed),
            other => Err(format!("unknown run phase: {other}")),
        }
    }
}

/// Outcome dimension of a handler run, orthogonal to [`RunPhase`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Currently owned by the single execution slot of its workflow
    #[serde(rename = "active")]
    Active,

    /// Finished successfully
    #[serde(rename = "committed")]
    Committed,

    /// Waiting out a transient fault; the scheduler retries with backoff
    #[serde(rename = "paused:transient")]
    PausedTransient,

    /// Waiting for the user to fix credentials or grant access
    #[serde(rename = "paused:approval")]
    PausedApproval,

    /// Waiting for a mutation outcome to be resolved
    #[serde(rename = "paused:reconciliation")]
    PausedReconciliation,

    /// User-script bug; the auto-fix path owns the workflow now
    #[serde(rename = "failed:logic")]
    FailedLogic,

    /// Engine bug
    #[serde(rename = "failed:internal")]
    FailedInternal,

    #[serde(rename = "failed:auth")]
    FailedAuth,

    #[serde(rename = "failed:permission")]
    FailedPermission,

    #[serde(rename = "failed:network")]
    FailedNetwork,

    /// The owning process died mid-run; set by recovery
    #[serde(rename = "crashed")]
    Crashed,
}

impl RunStatus {
    /// Terminal: the run will never execute again
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Committed
                | Self::FailedLogic
                | Self::FailedInternal
                | Self::FailedAuth
                | Self::FailedPermission
                | Self::FailedNetwork
                | Self::Crashed
        )
    }

    /// Paused: suspended but resumable (by retry, backoff or resolution)
    pub fn is_paused(self) -> bool {
        matches!(
            self,
            Self::PausedTransient | Self::PausedApproval | Self::PausedReconciliation
        )
    }

    pub fn is_failed(self) -> bool {
        matches!(
            self,
            Self::FailedLogic
                | Self::FailedInternal
                | Self::FailedAuth
                | Self::FailedPermission
                | Self::FailedNetwork
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Committed => "committed",
            Self::PausedTransient => "paused:transient",
            Self::PausedApproval => "paused:approval",
            Self::PausedReconciliation => "paused:reconciliation",
            Self::FailedLogic => "failed:logic",
            Self::FailedInternal => "failed:internal",
            Self::FailedAuth => "failed:auth",
            Self::FailedPermission => "failed:permission",
            Self::FailedNetwork => "failed:network",
            Self::Crashed => "crashed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "committed" => Ok(Self::Committed),
            "paused:transient" => Ok(Self::PausedTransient),
            "paused:approval" => Ok(Self::PausedApproval),
            "paused:reconciliation" => Ok(Self::PausedReconciliation),
            "failed:logic" => Ok(Self::FailedLogic),
            "failed:internal" => Ok(Self::FailedInternal),
            "failed:auth" => Ok(Self::FailedAuth),
            "failed:permission" => Ok(Self::FailedPermission),
            "failed:network" => Ok(Self::FailedNetwork),
            "crashed" => Ok(Self::Crashed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Log severity for captured sandbox output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One captured log line from a sandbox evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub level: LogLevel,
    pub at: DateTime<Utc>,
    pub message: String,
}

impl LogLine {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: LogLevel::Info,
            at: Utc::now(),
            message: message.into(),
        }
    }
}

/// One execution attempt of one producer/consumer within a session
///
/// `retry_of` forms a linked list across crash, transient and fix retries;
/// the mutation row, if any, always lives on the run that entered the
/// mutate phase, so later links in the chain look it up through this field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerRun {
    pub id: Uuid,
    pub script_run_id: Uuid,
    pub workflow_id: Uuid,
    pub kind: HandlerKind,
    pub handler_name: String,
    pub phase: RunPhase,
    pub status: RunStatus,
    pub retry_of: Option<Uuid>,

    /// Parsed-and-validated prepare output, persisted at the `Prepared`
    /// transition and carried forward onto retry runs
    pub prepare_result: Option<serde_json::Value>,

    pub input_state: Option<serde_json::Value>,
    pub output_state: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_kind: Option<crate::error::ErrorKind>,
    pub cost_milli_cents: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub logs: Vec<LogLine>,
}

impl HandlerRun {
    pub fn new(
        script_run_id: Uuid,
        workflow_id: Uuid,
        kind: HandlerKind,
        handler_name: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            script_run_id,
            workflow_id,
            kind,
            handler_name: handler_name.into(),
            phase: RunPhase::Pending,
            status: RunStatus::Active,
            retry_of: None,
            prepare_result: None,
            input_state: None,
            output_state: None,
            error: None,
            error_kind: None,
            cost_milli_cents: 0,
            started_at: Utc::now(),
            ended_at: None,
            logs: Vec::new(),
        }
    }

    /// Still owns the workflow's execution slot
    pub fn is_active(&self) -> bool {
        self.status == RunStatus::Active
    }

    pub fn is_done(&self) -> bool {
        self.status.is_terminal() || self.status.is_paused()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_string_forms() {
        assert_eq!(RunStatus::PausedTransient.to_string(), "paused:transient");
        assert_eq!(RunStatus::FailedLogic.to_string(), "failed:logic");
        let parsed: RunStatus = "paused:reconciliation".parse().unwrap();
        assert_eq!(parsed, RunStatus::PausedReconciliation);
    }

    #[test]
    fn status_serde_matches_display() {
        for status in [
            RunStatus::Active,
            RunStatus::Committed,
            RunStatus::PausedTransient,
            RunStatus::PausedApproval,
            RunStatus::PausedReconciliation,
            RunStatus::FailedLogic,
            RunStatus::FailedInternal,
            RunStatus::FailedAuth,
            RunStatus::FailedPermission,
            RunStatus::FailedNetwork,
            RunStatus::Crashed,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{status}\""));
            let back: RunStatus = serde_json::from_str(&json).unwrap();
            assert_eq!(back, status);
        }
    }

    #[test]
    fn terminal_and_paused_are_disjoint() {
        for status in [
            RunStatus::PausedTransient,
            RunStatus::PausedApproval,
            RunStatus::PausedReconciliation,
        ] {
            assert!(status.is_paused());
            assert!(!status.is_terminal());
        }
        for status in [RunStatus::Committed, RunStatus::Crashed, RunStatus::FailedLogic] {
            assert!(status.is_terminal());
            assert!(!status.is_paused());
        }
        assert!(!RunStatus::Active.is_terminal());
        assert!(!RunStatus::Active.is_paused());
    }

    #[test]
    fn phase_mutation_boundary() {
        assert!(!RunPhase::Preparing.is_past_mutation());
        assert!(!RunPhase::Mutating.is_past_mutation());
        assert!(RunPhase::Mutated.is_past_mutation());
        assert!(RunPhase::Emitting.is_past_mutation());
    }

    #[test]
    fn new_run_is_active_pending() {
        let run = HandlerRun::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            HandlerKind::Consumer,
            "ingest",
        );
        assert_eq!(run.phase, RunPhase::Pending);
        assert!(run.is_active());
        assert!(!run.is_done());
    }
}
