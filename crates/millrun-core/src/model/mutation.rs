//! Mutation entity: the durable record of a side-effecting tool call

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a mutation
///
/// `InFlight` is written durably *before* the external side effect begins,
/// so a crash at any instant leaves evidence that an effect may exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    /// The side effect may be executing right now
    InFlight,

    /// The side effect definitely happened
    Applied,

    /// The side effect definitely did not happen
    Failed,

    /// Outcome unknown; a reconcile probe should be retried
    NeedsReconcile,

    /// Outcome unknown and unknowable without the user's assertion
    Indeterminate,
}

impl MutationStatus {
    /// Whether this status means the external effect may or does exist,
    /// which forces any retry to resume after the mutation boundary
    pub fn effect_possible(self) -> bool {
        matches!(
            self,
            Self::InFlight | Self::Applied | Self::NeedsReconcile | Self::Indeterminate
        )
    }
}

impl std::fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InFlight => "in_flight",
            Self::Applied => "applied",
            Self::Failed => "failed",
            Self::NeedsReconcile => "needs_reconcile",
            Self::Indeterminate => "indeterminate",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for MutationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_flight" => Ok(Self::InFlight),
            "applied" => Ok(Self::Applied),
            "failed" => Ok(Self::Failed),
            "needs_reconcile" => Ok(Self::NeedsReconcile),
            "indeterminate" => Ok(Self::Indeterminate),
            other => Err(format!("unknown mutation status: {other}")),
        }
    }
}

/// Who settled the mutation's final status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedBy {
    /// Normal apply/fail path inside the engine
    Engine,

    /// A reconcile probe against the external system
    Reconcile,

    /// Explicit user assertion (happened / did not happen / skip)
    User,
}

impl std::fmt::Display for ResolvedBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Engine => write!(f, "engine"),
            Self::Reconcile => write!(f, "reconcile"),
            Self::User => write!(f, "user"),
        }
    }
}

impl std::str::FromStr for ResolvedBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "engine" => Ok(Self::Engine),
            "reconcile" => Ok(Self::Reconcile),
            "user" => Ok(Self::User),
            other => Err(format!("unknown resolver: {other}")),
        }
    }
}

/// The durable record of a side-effecting tool call made in a consumer's
/// mutate phase. At most one exists per handler run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mutation {
    pub id: Uuid,
    pub handler_run_id: Uuid,
    pub workflow_id: Uuid,
    pub tool_namespace: String,
    pub tool_method: String,
    pub params: serde_json::Value,

    /// Key a reconcile probe can use to look the effect up externally
    pub idempotency_key: Option<String>,

    pub status: MutationStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub resolved_by: Option<ResolvedBy>,
    pub resolved_at: Option<DateTime<Utc>>,

    /// The user resolved an unknown outcome with "skip": continue the run
    /// as if the mutation were intentionally not made
    pub user_skip: bool,

    pub created_at: DateTime<Utc>,
}

impl Mutation {
    pub fn in_flight(
        handler_run_id: Uuid,
        workflow_id: Uuid,
        tool_namespace: impl Into<String>,
        tool_method: impl Into<String>,
        params: serde_json::Value,
        idempotency_key: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            handler_run_id,
            workflow_id,
            tool_namespace: tool_namespace.into(),
            tool_method: tool_method.into(),
            params,
            idempotency_key,
            status: MutationStatus::InFlight,
            result: None,
            error: None,
            resolved_by: None,
            resolved_at: None,
            user_skip: false,
            created_at: Utc::now(),
        }
    }

    /// The value handed to the consumer's `next` function
    ///
    /// `applied` carries the tool result; a user-skipped mutation reads as
    /// `skipped`; anything else (including no mutation at all, handled by
    /// the caller) reads as `none`.
    pub fn result_for_next(&self) -> serde_json::Value {
        match self.status {
            MutationStatus::Applied => serde_json::json!({
                "status": "applied",
                "result": self.result.clone().unwrap_or(serde_json::Value::Null),
            }),
            MutationStatus::Failed if self.user_skip => {
                serde_json::json!({ "status": "skipped" })
            }
            _ => serde_json::json!({ "status": "none" }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mutation() -> Mutation {
        Mutation::in_flight(
            Uuid::now_v7(),
            Uuid::now_v7(),
            "gmail",
            "send",
            json!({"to": "a@b.c"}),
            Some("msg-1".into()),
        )
    }

    #[test]
    fn starts_in_flight() {
        let m = mutation();
        assert_eq!(m.status, MutationStatus::InFlight);
        assert!(m.status.effect_possible());
    }

    #[test]
    fn effect_possible_boundary() {
        assert!(MutationStatus::Applied.effect_possible());
        assert!(MutationStatus::NeedsReconcile.effect_possible());
        assert!(MutationStatus::Indeterminate.effect_possible());
        assert!(!MutationStatus::Failed.effect_possible());
    }

    #[test]
    fn result_for_next_applied() {
        let mut m = mutation();
        m.status = MutationStatus::Applied;
        m.result = Some(json!({"id": "sent-1"}));
        assert_eq!(
            m.result_for_next(),
            json!({"status": "applied", "result": {"id": "sent-1"}})
        );
    }

    #[test]
    fn result_for_next_skipped() {
        let mut m = mutation();
        m.status = MutationStatus::Failed;
        m.user_skip = true;
        assert_eq!(m.result_for_next(), json!({"status": "skipped"}));
    }

    #[test]
    fn result_for_next_failed_without_skip_is_none() {
        let mut m = mutation();
        m.status = MutationStatus::Failed;
        assert_eq!(m.result_for_next(), json!({"status": "none"}));
    }
}
