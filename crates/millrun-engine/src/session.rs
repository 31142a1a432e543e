//! Session orchestrator
//!
//! One session = one workflow invocation: producer fan-out (for schedule
//! and manual triggers) followed by a bounded consumer drain loop. The
//! orchestrator only *maps* handler results onto session outcomes — every
//! finalization already happened atomically inside the EMM by the time a
//! result reaches this layer.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use millrun_core::config::WorkflowConfig;
use millrun_core::error::{ClassifiedError, ErrorKind};
use millrun_core::model::{HandlerKind, RunStatus, Trigger, Workflow};
use millrun_store::Store;

use crate::emm::Emm;
use crate::error::EngineError;
use crate::handler::{HandlerMachine, HandlerResult};
use crate::sched::SchedulerState;

/// Default bound on consumer steps per session
pub const DEFAULT_MAX_ITERATIONS: usize = 100;

/// How a session ended, from the scheduler's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Drained all work
    Completed,

    /// A handler failed hard; the workflow needs attention
    Failed,

    /// A logic failure handed the workflow to the auto-fix path
    Maintenance,

    /// A transient fault; the scheduler retries after backoff
    Transient,

    /// Paused awaiting the user (approval or reconciliation)
    Suspended,
}

/// Runs sessions for one workflow at a time
pub struct SessionRunner<S: Store> {
    emm: Arc<Emm<S>>,
    store: Arc<S>,
    machine: Arc<HandlerMachine<S>>,
    sched: Arc<SchedulerState>,
    max_iterations: usize,
}

impl<S: Store> SessionRunner<S> {
    pub fn new(
        emm: Arc<Emm<S>>,
        store: Arc<S>,
        machine: Arc<HandlerMachine<S>>,
        sched: Arc<SchedulerState>,
    ) -> Self {
        Self {
            emm,
            store,
            machine,
            sched,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max.max(1);
        self
    }

    /// Execute one session for `workflow_id` with the given trigger
    #[instrument(skip(self))]
    pub async fn execute_session(
        &self,
        workflow_id: Uuid,
        trigger: Trigger,
    ) -> Result<SessionOutcome, EngineError> {
        let workflow = self.store.get_workflow(workflow_id).await?;
        let script_id = workflow.active_script_id.ok_or_else(|| {
            EngineError::InvariantViolation(format!(
                "workflow {workflow_id} has no active script"
            ))
        })?;

        let session = self
            .emm
            .create_session(workflow_id, script_id, trigger, None)
            .await?;
        info!(session_id = %session.id, %trigger, "session started");

        // Config problems have no handler run to blame; finalize the
        // session directly with the same downstream effects.
        let config = match self.parse_config(&workflow) {
            Ok(config) => config,
            Err(err) => {
                let outcome = outer_outcome(&err);
                self.emm.finalize_session_error(session.id, &err).await?;
                return Ok(outcome);
            }
        };

        if matches!(trigger, Trigger::Schedule | Trigger::Manual) {
            if let Some(outcome) = self
                .run_producers(&workflow, &config, session.id, trigger)
                .await?
            {
                return Ok(outcome);
            }
        }

        self.drain_consumers(&workflow, &config, session.id).await
    }

    /// Resume the drain loop of an existing session (retry path)
    #[instrument(skip(self))]
    pub async fn continue_session(
        &self,
        workflow_id: Uuid,
        session_id: Uuid,
    ) -> Result<SessionOutcome, EngineError> {
        let workflow = self.store.get_workflow(workflow_id).await?;
        let config = match self.parse_config(&workflow) {
            Ok(config) => config,
            Err(err) => {
                let outcome = outer_outcome(&err);
                self.emm.finalize_session_error(session_id, &err).await?;
                return Ok(outcome);
            }
        };
        self.drain_consumers(&workflow, &config, session_id).await
    }

    /// Start a retry session: the first handler run is an EMM-created
    /// retry resuming at emitting; afterwards the normal drain continues.
    #[instrument(skip(self))]
    pub async fn run_retry_session(
        &self,
        workflow_id: Uuid,
    ) -> Result<SessionOutcome, EngineError> {
        let workflow = self.store.get_workflow(workflow_id).await?;
        let pending = workflow.pending_retry_run_id.ok_or_else(|| {
            EngineError::ConflictingRetry(format!(
                "workflow {workflow_id} has no pending retry"
            ))
        })?;
        let script_id = workflow.active_script_id.ok_or_else(|| {
            EngineError::InvariantViolation(format!(
                "workflow {workflow_id} has no active script"
            ))
        })?;

        let failed = self.store.get_handler_run(pending).await?;
        let session = self
            .emm
            .create_session(
                workflow_id,
                script_id,
                Trigger::Retry,
                Some(failed.script_run_id),
            )
            .await?;
        info!(session_id = %session.id, retry_of_run = %pending, "retry session started");

        let retry = match self.emm.create_retry_run(pending, session.id).await {
            Ok(retry) => retry,
            Err(err) => {
                warn!(%pending, error = %err, "retry creation refused");
                let classified = ClassifiedError::internal(err.to_string());
                self.emm
                    .finalize_session_error(session.id, &classified)
                    .await?;
                return Err(err);
            }
        };

        let result = self.machine.execute(retry.id).await?;
        if !result.committed() {
            return Ok(map_result(&result));
        }

        let workflow = self.store.get_workflow(workflow_id).await?;
        let config = match self.parse_config(&workflow) {
            Ok(config) => config,
            Err(err) => {
                let outcome = outer_outcome(&err);
                self.emm.finalize_session_error(session.id, &err).await?;
                return Ok(outcome);
            }
        };
        self.drain_consumers(&workflow, &config, session.id).await
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn parse_config(&self, workflow: &Workflow) -> Result<WorkflowConfig, ClassifiedError> {
        let raw = workflow.handler_config.as_ref().ok_or_else(|| {
            ClassifiedError::internal(format!(
                "workflow {} has no handler config",
                workflow.id
            ))
        })?;
        WorkflowConfig::parse(raw).map_err(Into::into)
    }

    /// Run the due producers. Returns the session outcome when a producer
    /// run ends the session early, `None` when the drain loop should run.
    async fn run_producers(
        &self,
        workflow: &Workflow,
        config: &WorkflowConfig,
        session_id: Uuid,
        trigger: Trigger,
    ) -> Result<Option<SessionOutcome>, EngineError> {
        let names = self.producers_to_run(workflow, config, trigger).await?;
        for name in names {
            let input_state = self
                .store
                .get_handler_state(workflow.id, &name)
                .await?
                .map(|s| s.state);
            let run = self
                .emm
                .create_handler_run(
                    session_id,
                    workflow.id,
                    HandlerKind::Producer,
                    &name,
                    input_state,
                )
                .await?;
            let result = self.machine.execute(run.id).await?;
            if !result.committed() {
                return Ok(Some(map_result(&result)));
            }
        }
        Ok(None)
    }

    /// Which producers this session should run, in config order.
    /// Scheduled sessions run the due producers plus any that queued while
    /// the workflow was busy; manual sessions run all of them. When no
    /// schedule rows exist yet, all producers run (first deployment).
    async fn producers_to_run(
        &self,
        workflow: &Workflow,
        config: &WorkflowConfig,
        trigger: Trigger,
    ) -> Result<Vec<String>, EngineError> {
        if trigger == Trigger::Manual {
            return Ok(config.producers.keys().cloned().collect());
        }

        let schedules = self.store.list_producer_schedules(workflow.id).await?;
        if schedules.is_empty() {
            return Ok(config.producers.keys().cloned().collect());
        }

        let now = Utc::now();
        let queued = self.sched.queued_producers(workflow.id);
        let names = config
            .producers
            .keys()
            .filter(|name| {
                queued.contains(name)
                    || schedules
                        .iter()
                        .any(|s| &s.producer_name == *name && s.is_due(now))
            })
            .cloned()
            .collect();
        Ok(names)
    }

    async fn drain_consumers(
        &self,
        workflow: &Workflow,
        config: &WorkflowConfig,
        session_id: Uuid,
    ) -> Result<SessionOutcome, EngineError> {
        for _ in 0..self.max_iterations {
            let Some(name) = self
                .find_consumer_with_pending_work(workflow.id, config)
                .await?
            else {
                break;
            };

            debug!(consumer = %name, "running consumer");
            let input_state = self
                .store
                .get_handler_state(workflow.id, &name)
                .await?
                .map(|s| s.state);
            let run = self
                .emm
                .create_handler_run(
                    session_id,
                    workflow.id,
                    HandlerKind::Consumer,
                    &name,
                    input_state,
                )
                .await?;
            let result = self.machine.execute(run.id).await?;
            if !result.committed() {
                return Ok(map_result(&result));
            }
        }

        self.emm.finish_session(session_id).await?;
        Ok(SessionOutcome::Completed)
    }

    /// The first consumer, in config order, with a dirty flag or a due
    /// wake-at. Falls back to store queries when the in-memory signals are
    /// not yet initialized for this workflow.
    async fn find_consumer_with_pending_work(
        &self,
        workflow_id: Uuid,
        config: &WorkflowConfig,
    ) -> Result<Option<String>, EngineError> {
        let now = Utc::now();

        if self.sched.is_tracked(workflow_id) {
            for name in config.consumers.keys() {
                if self.sched.consumer_ready(workflow_id, name, now) {
                    return Ok(Some(name.clone()));
                }
            }
            return Ok(None);
        }

        for (name, consumer) in &config.consumers {
            let pending = self
                .store
                .count_pending_events(workflow_id, &consumer.subscribe)
                .await?;
            if pending > 0 {
                return Ok(Some(name.clone()));
            }
            let state = self.store.get_handler_state(workflow_id, name).await?;
            if state.is_some_and(|s| s.wake_due(now)) {
                return Ok(Some(name.clone()));
            }
        }
        Ok(None)
    }
}

/// Handler result → session outcome
fn map_result(result: &HandlerResult) -> SessionOutcome {
    match result.status {
        RunStatus::FailedLogic => SessionOutcome::Maintenance,
        RunStatus::FailedInternal
        | RunStatus::FailedAuth
        | RunStatus::FailedPermission
        | RunStatus::FailedNetwork
        | RunStatus::Crashed => SessionOutcome::Failed,
        RunStatus::PausedTransient => SessionOutcome::Transient,
        RunStatus::PausedApproval | RunStatus::PausedReconciliation => SessionOutcome::Suspended,
        RunStatus::Committed | RunStatus::Active => SessionOutcome::Completed,
    }
}

/// Outcome for a session that failed outside any handler run
fn outer_outcome(err: &ClassifiedError) -> SessionOutcome {
    match err.kind {
        ErrorKind::Logic => SessionOutcome::Maintenance,
        ErrorKind::Network | ErrorKind::RateLimit => SessionOutcome::Transient,
        ErrorKind::Auth | ErrorKind::Permission => SessionOutcome::Suspended,
        _ => SessionOutcome::Failed,
    }
}
