//! Connector tool contract and phase tagging
//!
//! Tools are the only way user code touches the outside world. The engine
//! tags every sandbox evaluation with the phase it runs in; the dispatcher
//! consults the tag before letting a call through, so a mutation can only
//! ever happen inside a consumer's mutate phase.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ClassifiedError;

/// Which phase the currently-evaluating user code belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseTag {
    /// Producer handler body
    Producer,

    /// Consumer prepare
    Prepare,

    /// Consumer mutate
    Mutate,

    /// Consumer next
    Next,
}

impl std::fmt::Display for PhaseTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Producer => write!(f, "producer"),
            Self::Prepare => write!(f, "prepare"),
            Self::Mutate => write!(f, "mutate"),
            Self::Next => write!(f, "next"),
        }
    }
}

impl PhaseTag {
    /// Whether event publication is allowed in this phase
    pub fn may_publish(self) -> bool {
        matches!(self, Self::Producer | Self::Next)
    }

    /// Whether mutation tools are allowed in this phase
    pub fn may_mutate(self) -> bool {
        self == Self::Mutate
    }
}

/// A connector tool: one callable method of an external integration
///
/// `read_only` tools pass through the dispatcher in any phase; everything
/// else is a mutation tool and must cooperate with the engine's mutation
/// lifecycle.
#[async_trait]
pub trait Tool: Send + Sync + 'static {
    /// Integration this tool belongs to, e.g. `gmail`
    fn namespace(&self) -> &str;

    /// Method name within the namespace, e.g. `send`
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Read-only tools never change external state
    fn read_only(&self) -> bool;

    /// Derive the idempotency key a reconcile probe can use to find the
    /// effect externally. `None` means the tool offers no such key.
    fn idempotency_key(&self, _params: &serde_json::Value) -> Option<String> {
        None
    }

    /// Perform the call against the external system
    async fn execute(&self, params: serde_json::Value)
        -> Result<serde_json::Value, ClassifiedError>;
}

/// Errors surfaced to the sandbox from a tool call
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ToolCallError {
    /// The mutation was applied; user code past this point is abandoned.
    /// The sandbox must stop evaluating and return with
    /// `aborted_by_mutation = true`.
    #[error("mutation applied; evaluation terminated")]
    MutationTerminated,

    /// A classified failure to report to the user script / engine
    #[error(transparent)]
    Classified(#[from] ClassifiedError),
}

impl ToolCallError {
    pub fn logic(message: impl Into<String>) -> Self {
        Self::Classified(ClassifiedError::logic(message))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Classified(ClassifiedError::internal(message))
    }
}

/// The engine-provided surface the sandbox routes every tool call through
///
/// Implementations enforce phase rules, run the mutation lifecycle for
/// side-effecting tools, and route the built-in `events.publish` /
/// `inputs.register` calls into the ledgers.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    async fn call(
        &self,
        namespace: &str,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, ToolCallError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_permissions() {
        assert!(PhaseTag::Producer.may_publish());
        assert!(PhaseTag::Next.may_publish());
        assert!(!PhaseTag::Prepare.may_publish());
        assert!(!PhaseTag::Mutate.may_publish());

        assert!(PhaseTag::Mutate.may_mutate());
        assert!(!PhaseTag::Producer.may_mutate());
        assert!(!PhaseTag::Prepare.may_mutate());
        assert!(!PhaseTag::Next.may_mutate());
    }
}
