//! Engine facade: wires the store, EMM, handler machine, session runner,
//! scheduler state and registries into one object with the operations the
//! platform layer calls.

use std::sync::Arc;

use tokio::sync::watch;
use uuid::Uuid;

use millrun_core::config::WorkflowConfig;
use millrun_core::model::{EventStatus, Mutation, Script, ScriptKind, Workflow};
use millrun_core::sandbox::Evaluator;
use millrun_store::Store;

use crate::activate::{self, ActivateScript};
use crate::emm::{Emm, MutationResolution};
use crate::error::EngineError;
use crate::handler::HandlerMachine;
use crate::ledger::Ledger;
use crate::reconcile::ReconciliationRegistry;
use crate::recovery::{Recovery, RecoveryReport};
use crate::sched::{Scheduler, SchedulerConfig, SchedulerState};
use crate::session::{SessionOutcome, SessionRunner, DEFAULT_MAX_ITERATIONS};
use crate::tools::ToolRegistry;

/// Engine tuning
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Consumer steps allowed per session
    pub max_iterations: usize,

    /// Auto-fix activations before a logic failure turns the workflow to
    /// `error`
    pub max_auto_fixes: i32,

    pub scheduler: SchedulerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_auto_fixes: crate::emm::DEFAULT_MAX_AUTO_FIXES,
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// The assembled execution engine for one process
pub struct Engine<S: Store> {
    store: Arc<S>,
    emm: Arc<Emm<S>>,
    sched_state: Arc<SchedulerState>,
    tools: Arc<ToolRegistry>,
    reconcile: Arc<ReconciliationRegistry>,
    sessions: Arc<SessionRunner<S>>,
    config: EngineConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<S: Store> Engine<S> {
    pub fn new(store: Arc<S>, evaluator: Arc<dyn Evaluator>) -> Self {
        Self::with_config(store, evaluator, EngineConfig::default())
    }

    pub fn with_config(
        store: Arc<S>,
        evaluator: Arc<dyn Evaluator>,
        config: EngineConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sched_state = Arc::new(SchedulerState::new());
        let emm =
            Arc::new(Emm::new(Arc::clone(&store)).with_max_auto_fixes(config.max_auto_fixes));
        let tools = Arc::new(ToolRegistry::new());
        let reconcile = Arc::new(ReconciliationRegistry::new());
        let ledger = Arc::new(Ledger::new(Arc::clone(&store), Arc::clone(&sched_state)));
        let machine = Arc::new(HandlerMachine::new(
            Arc::clone(&emm),
            Arc::clone(&store),
            evaluator,
            Arc::clone(&tools),
            Arc::clone(&reconcile),
            Arc::clone(&sched_state),
            ledger,
            shutdown_rx.clone(),
        ));
        let sessions = Arc::new(
            SessionRunner::new(
                Arc::clone(&emm),
                Arc::clone(&store),
                machine,
                Arc::clone(&sched_state),
            )
            .with_max_iterations(config.max_iterations),
        );

        Self {
            store,
            emm,
            sched_state,
            tools,
            reconcile,
            sessions,
            config,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn emm(&self) -> &Arc<Emm<S>> {
        &self.emm
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn reconcilers(&self) -> &Arc<ReconciliationRegistry> {
        &self.reconcile
    }

    pub fn scheduler_state(&self) -> &Arc<SchedulerState> {
        &self.sched_state
    }

    pub fn sessions(&self) -> &Arc<SessionRunner<S>> {
        &self.sessions
    }

    /// Startup recovery; run before serving any scheduler traffic
    pub async fn recover(&self) -> Result<RecoveryReport, EngineError> {
        Recovery::new(Arc::clone(&self.store), Arc::clone(&self.sched_state))
            .run()
            .await
    }

    /// Build the scheduler loop (call [`Engine::recover`] first)
    pub fn scheduler(&self) -> Scheduler<S> {
        Scheduler::new(
            Arc::clone(&self.store),
            Arc::clone(&self.emm),
            Arc::clone(&self.sessions),
            Arc::clone(&self.sched_state),
            Arc::clone(&self.reconcile),
            self.config.scheduler.clone(),
            self.shutdown_rx.clone(),
        )
    }

    /// Signal shutdown: cancels in-flight evaluations and stops the
    /// scheduler loop. The next startup recovers via [`Engine::recover`].
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    // =========================================================================
    // Platform operations
    // =========================================================================

    pub async fn create_workflow(&self, task_id: Uuid) -> Result<Workflow, EngineError> {
        self.emm.create_workflow(task_id).await
    }

    /// Validate and save a new script version
    pub async fn save_script(
        &self,
        workflow_id: Uuid,
        code: String,
        config: serde_json::Value,
        kind: ScriptKind,
        summary: Option<String>,
        change_comment: Option<String>,
    ) -> Result<Script, EngineError> {
        WorkflowConfig::parse(&config)
            .map_err(|e| EngineError::InvariantViolation(format!("script config invalid: {e}")))?;
        self.emm
            .save_script(workflow_id, code, config, kind, summary, change_comment)
            .await
    }

    pub async fn activate_script(&self, req: ActivateScript) -> Result<Workflow, EngineError> {
        activate::activate_script(&self.emm, &self.store, &self.sched_state, req).await
    }

    /// Start a manual session immediately, respecting the single-flight
    /// invariant
    pub async fn run_workflow_now(
        &self,
        workflow_id: Uuid,
    ) -> Result<SessionOutcome, EngineError> {
        let workflow = self.store.get_workflow(workflow_id).await?;
        if !workflow.is_runnable() {
            return Err(EngineError::InvariantViolation(format!(
                "workflow {workflow_id} is not active"
            )));
        }
        let active = self.store.list_active_runs(Some(workflow_id)).await?;
        if !active.is_empty() {
            return Err(EngineError::ConflictingRetry(format!(
                "workflow {workflow_id} is mid-session"
            )));
        }
        self.sessions
            .execute_session(workflow_id, millrun_core::model::Trigger::Manual)
            .await
    }

    /// Apply a user assertion to an indeterminate mutation
    pub async fn resolve_mutation(
        &self,
        mutation_id: Uuid,
        resolution: MutationResolution,
        result: Option<serde_json::Value>,
    ) -> Result<Mutation, EngineError> {
        // Capture the holds first: "did not happen" releases them and the
        // subscribers must re-enter prepare.
        let mutation = self.store.get_mutation(mutation_id).await?;
        let held = if resolution == MutationResolution::DidNotHappen {
            self.store
                .list_events(mutation.workflow_id, None, Some(EventStatus::Reserved))
                .await?
                .into_iter()
                .filter(|e| e.reserved_by == Some(mutation.handler_run_id))
                .collect()
        } else {
            Vec::new()
        };

        let resolved = self
            .emm
            .resolve_mutation(mutation_id, resolution, result)
            .await?;

        if !held.is_empty() {
            let workflow = self.store.get_workflow(mutation.workflow_id).await?;
            if let Some(raw) = workflow.handler_config.as_ref() {
                if let Ok(config) = WorkflowConfig::parse(raw) {
                    for event in &held {
                        self.sched_state
                            .on_event_publish(workflow.id, &event.topic, &config);
                    }
                }
            }
        }
        Ok(resolved)
    }
}
