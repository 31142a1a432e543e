//! Handler state machine
//!
//! The driver loop reads the canonical run row, dispatches to the phase
//! handler for `(handler kind, phase)`, and loops. Every phase handler
//! either advances the phase or terminates the run through the EMM; the
//! loop never caches run state between iterations, so a crash between any
//! two checkpoints resumes exactly where the store says.

mod consumer;
mod producer;

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, instrument};
use uuid::Uuid;

use millrun_core::config::WorkflowConfig;
use millrun_core::error::{ClassifiedError, ErrorKind};
use millrun_core::model::{
    HandlerKind, HandlerRun, Mutation, RunPhase, RunStatus, Script, Workflow,
};
use millrun_core::sandbox::Evaluator;
use millrun_store::Store;

use crate::emm::{Emm, RunCosts};
use crate::error::EngineError;
use crate::ledger::Ledger;
use crate::reconcile::ReconciliationRegistry;
use crate::sched::SchedulerState;
use crate::tools::ToolRegistry;

/// Safety bound on driver iterations per run. A healthy run needs at most
/// one iteration per phase; hitting this means a phase handler failed to
/// advance.
const MAX_DRIVER_STEPS: usize = 32;

/// Final summary of a handler run, for the session orchestrator
#[derive(Debug, Clone)]
pub struct HandlerResult {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub error: Option<ClassifiedError>,
}

impl HandlerResult {
    fn from_run(run: &HandlerRun) -> Self {
        let error = run.error.as_ref().map(|message| ClassifiedError {
            kind: run.error_kind.unwrap_or(ErrorKind::Internal),
            message: message.clone(),
            service_id: None,
            account_id: None,
        });
        Self {
            run_id: run.id,
            status: run.status,
            error,
        }
    }

    pub fn committed(&self) -> bool {
        self.status == RunStatus::Committed
    }
}

/// Drives one handler run through its phases
pub struct HandlerMachine<S: Store> {
    pub(crate) emm: Arc<Emm<S>>,
    pub(crate) store: Arc<S>,
    pub(crate) evaluator: Arc<dyn Evaluator>,
    pub(crate) tools: Arc<ToolRegistry>,
    pub(crate) reconcile: Arc<ReconciliationRegistry>,
    pub(crate) sched: Arc<SchedulerState>,
    pub(crate) ledger: Arc<Ledger<S>>,
    pub(crate) cancel: watch::Receiver<bool>,
}

impl<S: Store> HandlerMachine<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        emm: Arc<Emm<S>>,
        store: Arc<S>,
        evaluator: Arc<dyn Evaluator>,
        tools: Arc<ToolRegistry>,
        reconcile: Arc<ReconciliationRegistry>,
        sched: Arc<SchedulerState>,
        ledger: Arc<Ledger<S>>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            emm,
            store,
            evaluator,
            tools,
            reconcile,
            sched,
            ledger,
            cancel,
        }
    }

    /// Run the driver loop until the run is terminal or paused
    #[instrument(skip(self))]
    pub async fn execute(&self, run_id: Uuid) -> Result<HandlerResult, EngineError> {
        for _ in 0..MAX_DRIVER_STEPS {
            let run = self.store.get_handler_run(run_id).await?;
            if run.is_done() {
                return Ok(HandlerResult::from_run(&run));
            }

            let workflow = self.store.get_workflow(run.workflow_id).await?;
            let config = match self.load_config(&workflow) {
                Ok(config) => config,
                Err(err) => {
                    let run = self.close(&run, err).await?;
                    return Ok(HandlerResult::from_run(&run));
                }
            };

            match (run.kind, run.phase) {
                (HandlerKind::Producer, RunPhase::Pending) => {
                    self.emm
                        .update_producer_phase(run.id, RunPhase::Executing)
                        .await?;
                }
                (HandlerKind::Producer, RunPhase::Executing) => {
                    self.run_producer(&run, &workflow, &config).await?;
                }
                (HandlerKind::Consumer, RunPhase::Pending) => {
                    self.emm
                        .update_consumer_phase(run.id, RunPhase::Preparing, Default::default())
                        .await?;
                }
                (HandlerKind::Consumer, RunPhase::Preparing) => {
                    self.run_prepare(&run, &workflow, &config).await?;
                }
                (HandlerKind::Consumer, RunPhase::Prepared) => {
                    self.run_prepared(&run).await?;
                }
                (HandlerKind::Consumer, RunPhase::Mutating) => {
                    self.run_mutating(&run, &workflow, &config).await?;
                }
                (HandlerKind::Consumer, RunPhase::Mutated) => {
                    self.emm
                        .update_consumer_phase(run.id, RunPhase::Emitting, Default::default())
                        .await?;
                }
                (HandlerKind::Consumer, RunPhase::Emitting) => {
                    self.run_emitting(&run, &workflow, &config).await?;
                }
                (kind, phase) => {
                    error!(%run_id, %kind, %phase, "no phase handler");
                    let err = ClassifiedError::internal(format!(
                        "no phase handler for {kind}/{phase}"
                    ));
                    let run = self.close(&run, err).await?;
                    return Ok(HandlerResult::from_run(&run));
                }
            }
        }

        error!(%run_id, "driver loop exceeded {MAX_DRIVER_STEPS} steps");
        Err(EngineError::InvariantViolation(format!(
            "run {run_id} did not settle within {MAX_DRIVER_STEPS} driver steps"
        )))
    }

    /// Close a run with a classified error (EMM translates the status into
    /// event disposition, session finalization and workflow effects)
    pub(crate) async fn close(
        &self,
        run: &HandlerRun,
        err: ClassifiedError,
    ) -> Result<HandlerRun, EngineError> {
        self.close_with_costs(run, err, RunCosts::default()).await
    }

    pub(crate) async fn close_with_costs(
        &self,
        run: &HandlerRun,
        err: ClassifiedError,
        costs: RunCosts,
    ) -> Result<HandlerRun, EngineError> {
        let status = err.run_status();
        self.emm
            .update_handler_run_status(run.id, status, Some(err), costs)
            .await
    }

    pub(crate) fn load_config(
        &self,
        workflow: &Workflow,
    ) -> Result<WorkflowConfig, ClassifiedError> {
        let raw = workflow.handler_config.as_ref().ok_or_else(|| {
            ClassifiedError::internal(format!(
                "workflow {} has no handler config",
                workflow.id
            ))
        })?;
        WorkflowConfig::parse(raw).map_err(Into::into)
    }

    pub(crate) async fn load_script(
        &self,
        workflow: &Workflow,
    ) -> Result<Script, ClassifiedError> {
        let script_id = workflow.active_script_id.ok_or_else(|| {
            ClassifiedError::internal(format!("workflow {} has no active script", workflow.id))
        })?;
        self.store
            .get_script(script_id)
            .await
            .map_err(|e| ClassifiedError::internal(e.to_string()))
    }

    /// The mutation for a run, following the retry chain backwards — the
    /// row always lives on the run that entered the mutate phase.
    pub(crate) async fn find_mutation_in_chain(
        &self,
        run: &HandlerRun,
    ) -> Result<Option<Mutation>, EngineError> {
        let mut current = run.clone();
        loop {
            if let Some(mutation) = self.store.find_mutation_for_run(current.id).await? {
                return Ok(Some(mutation));
            }
            match current.retry_of {
                Some(prev) => current = self.store.get_handler_run(prev).await?,
                None => return Ok(None),
            }
        }
    }
}
