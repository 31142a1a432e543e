//! Sandbox evaluator contract
//!
//! The engine never interprets user code itself. It hands the script, an
//! entry expression and the previous state to an opaque evaluator, and
//! gets back a classified outcome. The evaluator is trusted to persist
//! nothing except through the [`ToolDispatcher`](crate::tool::ToolDispatcher)
//! it is given.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::ClassifiedError;
use crate::model::LogLine;
use crate::tool::{PhaseTag, ToolDispatcher};

/// Default wall-clock bound for one evaluation
pub const DEFAULT_EVAL_TIMEOUT: Duration = Duration::from_secs(300);

/// One request to evaluate user code
pub struct EvalRequest {
    /// Full script source
    pub code: String,

    /// Entry expression, e.g. `workflow.consumers.digest.prepare(__state__)`
    pub entrypoint: String,

    /// Value bound to `__state__` (previous handler state, prepare result,
    /// ... depending on the phase)
    pub state: serde_json::Value,

    /// Second injected argument for `next`, absent elsewhere
    pub extra: Option<serde_json::Value>,

    /// Phase tag the dispatcher enforces tool rules against
    pub phase: PhaseTag,

    pub timeout: Duration,

    /// Flips to `true` when the engine wants the evaluation abandoned
    pub cancel: watch::Receiver<bool>,
}

impl EvalRequest {
    pub fn new(
        code: impl Into<String>,
        entrypoint: impl Into<String>,
        state: serde_json::Value,
        phase: PhaseTag,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            code: code.into(),
            entrypoint: entrypoint.into(),
            state,
            extra: None,
            phase,
            timeout: DEFAULT_EVAL_TIMEOUT,
            cancel,
        }
    }

    pub fn with_extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = Some(extra);
        self
    }
}

/// Result of one evaluation
#[derive(Debug, Clone)]
pub struct EvalOutcome {
    /// Whether the evaluation ran to completion
    pub ok: bool,

    /// Return value of the entry expression when `ok`
    pub result: Option<serde_json::Value>,

    /// Classified failure when not `ok`
    pub error: Option<ClassifiedError>,

    /// The evaluation stopped because a mutation tool applied its effect.
    /// The engine treats this as success when the run's mutation row says
    /// `applied` — user code after a mutation is deliberately abandoned.
    pub aborted_by_mutation: bool,

    /// Metered cost of this evaluation, in milli-cents
    pub cost_milli_cents: i64,

    /// Captured log output, persisted onto the handler run
    pub logs: Vec<LogLine>,
}

impl EvalOutcome {
    pub fn success(result: serde_json::Value) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
            aborted_by_mutation: false,
            cost_milli_cents: 0,
            logs: Vec::new(),
        }
    }

    pub fn failure(error: ClassifiedError) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(error),
            aborted_by_mutation: false,
            cost_milli_cents: 0,
            logs: Vec::new(),
        }
    }

    /// The cooperative mutate-abort outcome
    pub fn mutation_terminated() -> Self {
        Self {
            ok: false,
            result: None,
            error: None,
            aborted_by_mutation: true,
            cost_milli_cents: 0,
            logs: Vec::new(),
        }
    }

    pub fn with_cost(mut self, cost_milli_cents: i64) -> Self {
        self.cost_milli_cents = cost_milli_cents;
        self
    }

    pub fn with_logs(mut self, logs: Vec<LogLine>) -> Self {
        self.logs = logs;
        self
    }
}

/// The opaque user-code evaluator
#[async_trait]
pub trait Evaluator: Send + Sync + 'static {
    async fn eval(&self, req: EvalRequest, tools: Arc<dyn ToolDispatcher>) -> EvalOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outcome_constructors() {
        let ok = EvalOutcome::success(json!({"n": 1})).with_cost(5);
        assert!(ok.ok);
        assert_eq!(ok.cost_milli_cents, 5);
        assert!(!ok.aborted_by_mutation);

        let failed = EvalOutcome::failure(ClassifiedError::network("timeout"));
        assert!(!failed.ok);
        assert_eq!(
            failed.error.as_ref().unwrap().kind,
            crate::error::ErrorKind::Network
        );

        let aborted = EvalOutcome::mutation_terminated();
        assert!(!aborted.ok);
        assert!(aborted.aborted_by_mutation);
        assert!(aborted.error.is_none());
    }
}
