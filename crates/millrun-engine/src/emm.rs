//! Execution Model Manager
//!
//! The EMM is the only component allowed to mutate persistent state for
//! runs, mutations, sessions and workflow control fields. Every published
//! operation is one store transaction spanning every table it touches, so
//! a crash between operations can never leave a half-applied transition.
//!
//! The handler state machine, session orchestrator, scheduler and recovery
//! all call in here; none of them open their own write transactions.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use millrun_core::error::{ClassifiedError, ErrorKind};
use millrun_core::model::{
    HandlerKind, HandlerRun, HandlerState, LogLine, Mutation, MutationStatus, ProducerSchedule,
    ResolvedBy, RunPhase, RunStatus, ScriptRun, SessionResult, Trigger, Workflow, WorkflowStatus,
};
use millrun_core::prepare::Reservation;
use millrun_store::{Store, StoreTx};

use crate::error::EngineError;

/// First transient-retry backoff
pub const BACKOFF_INITIAL_SECS: i64 = 30;

/// Transient-retry backoff cap (15 minutes)
pub const BACKOFF_MAX_SECS: i64 = 900;

/// Auto-fix activations allowed before a logic failure turns the workflow
/// to `error` instead of another maintenance cycle
pub const DEFAULT_MAX_AUTO_FIXES: i32 = 5;

/// Options carried along a consumer phase transition
#[derive(Debug, Default)]
pub struct PhaseOpts {
    /// Events to reserve for this run, atomically with the transition
    pub reservations: Vec<Reservation>,

    /// Prepare output to persist on the run
    pub prepare_result: Option<serde_json::Value>,

    /// `Some(wake)` updates HandlerState.wake_at (already clamped);
    /// `None` leaves it untouched
    pub wake: Option<Option<DateTime<Utc>>>,

    pub cost_delta: i64,
    pub logs: Vec<LogLine>,
}

/// Cost/log accrual attached to a terminal or paused transition
#[derive(Debug, Default)]
pub struct RunCosts {
    pub cost_delta: i64,
    pub logs: Vec<LogLine>,
}

/// Inputs to [`Emm::commit_producer`]
#[derive(Debug, Default)]
pub struct CommitProducer {
    /// New handler state; `None` keeps the previous state
    pub new_state: Option<serde_json::Value>,

    /// Advance the producer schedule to this instant
    pub next_run_at: Option<DateTime<Utc>>,

    pub cost_delta: i64,
    pub logs: Vec<LogLine>,
}

/// Inputs to [`Emm::commit_consumer`]
#[derive(Debug, Default)]
pub struct CommitConsumer {
    /// New handler state; `None` keeps the previous state
    pub new_state: Option<serde_json::Value>,

    pub cost_delta: i64,
    pub logs: Vec<LogLine>,
}

/// Inputs to [`Emm::create_mutation`]
#[derive(Debug)]
pub struct CreateMutation {
    pub tool_namespace: String,
    pub tool_method: String,
    pub params: serde_json::Value,
    pub idempotency_key: Option<String>,
}

/// User assertion about an indeterminate mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationResolution {
    /// The external effect exists: mark applied, resume at the mutation
    /// result
    Happened,

    /// The external effect does not exist: fail the mutation, release the
    /// events and let the consumer re-prepare from scratch
    DidNotHappen,

    /// Unknowable or irrelevant: continue the run as if the mutation were
    /// intentionally not made
    Skip,
}

/// The single atomic gateway for all engine state transitions
pub struct Emm<S: Store> {
    store: Arc<S>,
    max_auto_fixes: i32,
}

impl<S: Store> Emm<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            max_auto_fixes: DEFAULT_MAX_AUTO_FIXES,
        }
    }

    pub fn with_max_auto_fixes(mut self, max: i32) -> Self {
        self.max_auto_fixes = max;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    // =========================================================================
    // Workflows and scripts
    // =========================================================================

    /// Create a fresh draft workflow
    #[instrument(skip(self))]
    pub async fn create_workflow(&self, task_id: Uuid) -> Result<Workflow, EngineError> {
        let workflow = Workflow::new(task_id);
        let mut tx = self.store.begin().await?;
        tx.insert_workflow(&workflow).await?;
        tx.commit().await?;
        info!(workflow_id = %workflow.id, "workflow created");
        Ok(workflow)
    }

    /// Save a new script version. Versioning: the first script is 1.0,
    /// manual saves bump the major version, auto-fix saves bump the minor.
    /// A draft workflow becomes ready on its first save.
    #[instrument(skip(self, code, config), fields(workflow_id = %workflow_id))]
    pub async fn save_script(
        &self,
        workflow_id: Uuid,
        code: String,
        config: serde_json::Value,
        kind: millrun_core::model::ScriptKind,
        summary: Option<String>,
        change_comment: Option<String>,
    ) -> Result<millrun_core::model::Script, EngineError> {
        use millrun_core::model::{Script, ScriptKind};

        let mut tx = self.store.begin().await?;
        let mut workflow = tx.get_workflow(workflow_id).await?;
        let latest = tx.latest_script_version(workflow_id).await?;
        let (major, minor) = match (latest, kind) {
            (None, _) => (1, 0),
            (Some((major, _)), ScriptKind::Manual | ScriptKind::Initial) => (major + 1, 0),
            (Some((major, minor)), ScriptKind::AutoFix) => (major, minor + 1),
        };

        let script = Script {
            id: Uuid::now_v7(),
            workflow_id,
            task_id: workflow.task_id,
            code,
            major_version: major,
            minor_version: minor,
            config,
            summary,
            diagram: None,
            change_comment,
            kind,
            created_at: Utc::now(),
        };
        tx.insert_script(&script).await?;

        if workflow.status == WorkflowStatus::Draft {
            workflow.status = WorkflowStatus::Ready;
            tx.update_workflow(&workflow).await?;
        }
        tx.commit().await?;
        info!(script_id = %script.id, version = ?script.version(), "script saved");
        Ok(script)
    }

    // =========================================================================
    // Sessions and runs
    // =========================================================================

    /// Create a session row for a new workflow invocation
    #[instrument(skip(self))]
    pub async fn create_session(
        &self,
        workflow_id: Uuid,
        script_id: Uuid,
        trigger: Trigger,
        retry_of: Option<Uuid>,
    ) -> Result<ScriptRun, EngineError> {
        let mut tx = self.store.begin().await?;
        // Existence check; also locks the workflow row for the insert.
        tx.get_workflow(workflow_id).await?;
        let mut session = ScriptRun::new(workflow_id, script_id, trigger);
        session.retry_of = retry_of;
        tx.insert_session(&session).await?;
        tx.commit().await?;
        debug!(%workflow_id, session_id = %session.id, %trigger, "created session");
        Ok(session)
    }

    /// Create a handler run in its initial phase
    ///
    /// Enforces the single-flight invariant: at most one active handler
    /// run per workflow.
    #[instrument(skip(self))]
    pub async fn create_handler_run(
        &self,
        session_id: Uuid,
        workflow_id: Uuid,
        kind: HandlerKind,
        handler_name: &str,
        input_state: Option<serde_json::Value>,
    ) -> Result<HandlerRun, EngineError> {
        let active = self.store.list_active_runs(Some(workflow_id)).await?;
        if let Some(existing) = active.first() {
            return Err(EngineError::InvariantViolation(format!(
                "workflow {workflow_id} already has active run {}",
                existing.id
            )));
        }

        let mut tx = self.store.begin().await?;
        let mut run = HandlerRun::new(session_id, workflow_id, kind, handler_name);
        run.input_state = input_state;
        tx.insert_handler_run(&run).await?;
        tx.commit().await?;
        debug!(%workflow_id, run_id = %run.id, %kind, handler_name, "created handler run");
        Ok(run)
    }

    // =========================================================================
    // Phase transitions
    // =========================================================================

    /// Advance a producer run's phase
    #[instrument(skip(self))]
    pub async fn update_producer_phase(
        &self,
        run_id: Uuid,
        new_phase: RunPhase,
    ) -> Result<HandlerRun, EngineError> {
        let mut tx = self.store.begin().await?;
        let mut run = tx.get_handler_run(run_id).await?;
        Self::check_transition(&run, new_phase)?;
        run.phase = new_phase;
        tx.update_handler_run(&run).await?;
        tx.commit().await?;
        Ok(run)
    }

    /// Advance a consumer run's phase, optionally reserving events,
    /// persisting the prepare result and updating the wake-at, all in one
    /// transaction
    #[instrument(skip(self, opts))]
    pub async fn update_consumer_phase(
        &self,
        run_id: Uuid,
        new_phase: RunPhase,
        opts: PhaseOpts,
    ) -> Result<HandlerRun, EngineError> {
        let mut tx = self.store.begin().await?;
        let mut run = tx.get_handler_run(run_id).await?;
        Self::check_transition(&run, new_phase)?;

        run.phase = new_phase;
        if let Some(prepare_result) = opts.prepare_result {
            run.prepare_result = Some(prepare_result);
        }
        run.cost_milli_cents += opts.cost_delta;
        run.logs.extend(opts.logs);
        tx.update_handler_run(&run).await?;

        for reservation in &opts.reservations {
            tx.reserve_events(
                run.workflow_id,
                &reservation.topic,
                &reservation.ids,
                run.id,
            )
            .await?;
        }

        if let Some(wake_at) = opts.wake {
            let mut state = tx
                .get_handler_state(run.workflow_id, &run.handler_name)
                .await?
                .unwrap_or_else(|| HandlerState::new(run.workflow_id, &run.handler_name));
            state.wake_at = wake_at;
            state.updated_at = Utc::now();
            tx.upsert_handler_state(&state).await?;
        }

        tx.commit().await?;
        debug!(%run_id, phase = %new_phase, "consumer phase advanced");
        Ok(run)
    }

    /// Record evaluation cost/logs on a run without moving it (used when a
    /// mutate evaluation is aborted after its mutation already advanced the
    /// phase)
    pub async fn accrue_run_costs(
        &self,
        run_id: Uuid,
        costs: RunCosts,
    ) -> Result<(), EngineError> {
        if costs.cost_delta == 0 && costs.logs.is_empty() {
            return Ok(());
        }
        let mut tx = self.store.begin().await?;
        let mut run = tx.get_handler_run(run_id).await?;
        run.cost_milli_cents += costs.cost_delta;
        run.logs.extend(costs.logs);
        tx.update_handler_run(&run).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Terminal or paused transition, with all its atomic consequences:
    /// event disposition, session finalization and workflow control fields
    #[instrument(skip(self, error, costs))]
    pub async fn update_handler_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error: Option<ClassifiedError>,
        costs: RunCosts,
    ) -> Result<HandlerRun, EngineError> {
        if status == RunStatus::Committed || status == RunStatus::Active {
            return Err(EngineError::InvariantViolation(
                "use the commit operations for success transitions".into(),
            ));
        }

        let mut tx = self.store.begin().await?;
        let mut run = tx.get_handler_run(run_id).await?;
        if run.status.is_terminal() {
            return Err(EngineError::InvariantViolation(format!(
                "run {run_id} is already terminal ({})",
                run.status
            )));
        }

        let now = Utc::now();
        run.status = status;
        run.ended_at = Some(now);
        if let Some(err) = &error {
            run.error = Some(err.message.clone());
            run.error_kind = Some(err.kind);
        }
        run.cost_milli_cents += costs.cost_delta;
        run.logs.extend(costs.logs);
        tx.update_handler_run(&run).await?;

        // Event disposition: pre-mutation failures release their holds;
        // once the mutation boundary is crossed the events stay with the
        // run for the retry to consume.
        let mutation = tx.find_mutation_for_run(run.id).await?;
        let post_mutation = Self::is_post_mutation(&run, mutation.as_ref());
        if !post_mutation {
            let released = tx.release_events_for_run(run.id).await?;
            if released > 0 {
                debug!(%run_id, released, "released reserved events");
            }
        }

        // Session finalization
        let mut session = tx.get_session(run.script_run_id).await?;
        if !session.is_finished() {
            session.ended_at = Some(now);
            session.result = Some(if status.is_paused() {
                SessionResult::Suspended
            } else {
                SessionResult::Failed
            });
            session.error = run.error.clone();
            session.error_kind = run.error_kind;
            session.cost_milli_cents += run.cost_milli_cents;
            tx.update_session(&session).await?;
        }

        // Workflow control fields
        let mut workflow = tx.get_workflow(run.workflow_id).await?;
        self.apply_workflow_effect(&mut workflow, &run, status, mutation.as_ref(), now);
        tx.update_workflow(&workflow).await?;

        tx.commit().await?;
        info!(%run_id, %status, "handler run closed");
        Ok(run)
    }

    /// Commit a producer run: persist state, advance the schedule, count
    /// the handler into its session
    #[instrument(skip(self, commit))]
    pub async fn commit_producer(
        &self,
        run_id: Uuid,
        commit: CommitProducer,
    ) -> Result<HandlerRun, EngineError> {
        let mut tx = self.store.begin().await?;
        let mut run = tx.get_handler_run(run_id).await?;
        if run.kind != HandlerKind::Producer {
            return Err(EngineError::InvariantViolation(format!(
                "run {run_id} is not a producer"
            )));
        }
        Self::check_transition(&run, RunPhase::Committed)?;

        let now = Utc::now();
        run.phase = RunPhase::Committed;
        run.status = RunStatus::Committed;
        run.ended_at = Some(now);
        run.output_state = commit.new_state.clone();
        run.cost_milli_cents += commit.cost_delta;
        run.logs.extend(commit.logs);
        tx.update_handler_run(&run).await?;

        if let Some(new_state) = commit.new_state {
            let mut state = tx
                .get_handler_state(run.workflow_id, &run.handler_name)
                .await?
                .unwrap_or_else(|| HandlerState::new(run.workflow_id, &run.handler_name));
            state.state = new_state;
            state.updated_at = now;
            tx.upsert_handler_state(&state).await?;
        }

        let mut session = tx.get_session(run.script_run_id).await?;
        session.handler_count += 1;
        session.cost_milli_cents += run.cost_milli_cents;
        tx.update_session(&session).await?;

        if let Some(next_run_at) = commit.next_run_at {
            self.advance_schedule(&mut tx, run.workflow_id, &run.handler_name, next_run_at)
                .await?;
        }

        tx.commit().await?;
        debug!(%run_id, "producer committed");
        Ok(run)
    }

    /// Commit a consumer run: consume its reserved events, persist state,
    /// count the handler into its session
    #[instrument(skip(self, commit))]
    pub async fn commit_consumer(
        &self,
        run_id: Uuid,
        commit: CommitConsumer,
    ) -> Result<HandlerRun, EngineError> {
        let mut tx = self.store.begin().await?;
        let mut run = tx.get_handler_run(run_id).await?;
        if run.kind != HandlerKind::Consumer {
            return Err(EngineError::InvariantViolation(format!(
                "run {run_id} is not a consumer"
            )));
        }
        Self::check_transition(&run, RunPhase::Committed)?;

        let now = Utc::now();
        let consumed = tx.consume_events_for_run(run.id).await?;

        run.phase = RunPhase::Committed;
        run.status = RunStatus::Committed;
        run.ended_at = Some(now);
        run.output_state = commit.new_state.clone();
        run.cost_milli_cents += commit.cost_delta;
        run.logs.extend(commit.logs);
        tx.update_handler_run(&run).await?;

        if let Some(new_state) = commit.new_state {
            let mut state = tx
                .get_handler_state(run.workflow_id, &run.handler_name)
                .await?
                .unwrap_or_else(|| HandlerState::new(run.workflow_id, &run.handler_name));
            state.state = new_state;
            state.updated_at = now;
            tx.upsert_handler_state(&state).await?;
        }

        let mut session = tx.get_session(run.script_run_id).await?;
        session.handler_count += 1;
        session.cost_milli_cents += run.cost_milli_cents;
        tx.update_session(&session).await?;

        // A committed consumer clears any armed transient backoff.
        let mut workflow = tx.get_workflow(run.workflow_id).await?;
        if workflow.backoff_secs != 0 || workflow.backoff_until.is_some() {
            workflow.backoff_secs = 0;
            workflow.backoff_until = None;
            tx.update_workflow(&workflow).await?;
        }

        tx.commit().await?;
        debug!(%run_id, consumed, "consumer committed");
        Ok(run)
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Durably record a mutation as in-flight, before the side effect
    /// begins. At most one mutation may exist per consumer run.
    #[instrument(skip(self, create))]
    pub async fn create_mutation(
        &self,
        run_id: Uuid,
        create: CreateMutation,
    ) -> Result<Mutation, EngineError> {
        let mut tx = self.store.begin().await?;
        let run = tx.get_handler_run(run_id).await?;
        if run.phase != RunPhase::Mutating || run.status != RunStatus::Active {
            return Err(EngineError::InvariantViolation(format!(
                "mutation outside the mutate phase (run {run_id} is {}/{})",
                run.phase, run.status
            )));
        }
        if tx.find_mutation_for_run(run_id).await?.is_some() {
            return Err(EngineError::InvariantViolation(format!(
                "run {run_id} already has a mutation"
            )));
        }

        let mutation = Mutation::in_flight(
            run_id,
            run.workflow_id,
            create.tool_namespace,
            create.tool_method,
            create.params,
            create.idempotency_key,
        );
        tx.insert_mutation(&mutation).await?;
        tx.commit().await?;
        info!(%run_id, mutation_id = %mutation.id, "mutation in flight");
        Ok(mutation)
    }

    /// Mark the mutation applied and the owning run's phase `mutated`, in
    /// the same transaction — no observer can see one without the other.
    #[instrument(skip(self, result))]
    pub async fn apply_mutation(
        &self,
        mutation_id: Uuid,
        result: Option<serde_json::Value>,
        resolved_by: ResolvedBy,
    ) -> Result<Mutation, EngineError> {
        let mut tx = self.store.begin().await?;
        let mut mutation = tx.get_mutation(mutation_id).await?;
        if mutation.status == MutationStatus::Failed
            || mutation.status == MutationStatus::Applied
        {
            return Err(EngineError::InvariantViolation(format!(
                "mutation {mutation_id} already settled ({})",
                mutation.status
            )));
        }
        mutation.status = MutationStatus::Applied;
        mutation.result = result;
        mutation.resolved_by = Some(resolved_by);
        mutation.resolved_at = Some(Utc::now());
        tx.update_mutation(&mutation).await?;

        let mut run = tx.get_handler_run(mutation.handler_run_id).await?;
        run.phase = RunPhase::Mutated;
        tx.update_handler_run(&run).await?;

        tx.commit().await?;
        info!(%mutation_id, run_id = %mutation.handler_run_id, "mutation applied");
        Ok(mutation)
    }

    /// Mark the mutation failed and release the run's reserved events
    #[instrument(skip(self))]
    pub async fn fail_mutation(
        &self,
        mutation_id: Uuid,
        error: &str,
        resolved_by: ResolvedBy,
    ) -> Result<Mutation, EngineError> {
        let mut tx = self.store.begin().await?;
        let mut mutation = tx.get_mutation(mutation_id).await?;
        if mutation.status == MutationStatus::Applied {
            return Err(EngineError::InvariantViolation(format!(
                "mutation {mutation_id} already applied"
            )));
        }
        mutation.status = MutationStatus::Failed;
        mutation.error = Some(error.to_string());
        mutation.resolved_by = Some(resolved_by);
        mutation.resolved_at = Some(Utc::now());
        tx.update_mutation(&mutation).await?;
        tx.release_events_for_run(mutation.handler_run_id).await?;
        tx.commit().await?;
        info!(%mutation_id, "mutation failed");
        Ok(mutation)
    }

    /// Move an in-flight mutation to `needs_reconcile` or `indeterminate`.
    /// Indeterminate also pauses the workflow and records the pending
    /// retry, atomically.
    #[instrument(skip(self))]
    pub async fn update_mutation_status(
        &self,
        mutation_id: Uuid,
        status: MutationStatus,
    ) -> Result<Mutation, EngineError> {
        if status != MutationStatus::NeedsReconcile && status != MutationStatus::Indeterminate {
            return Err(EngineError::InvariantViolation(format!(
                "update_mutation_status only handles uncertain outcomes, got {status}"
            )));
        }
        let mut tx = self.store.begin().await?;
        let mut mutation = tx.get_mutation(mutation_id).await?;
        if mutation.status == MutationStatus::Applied
            || mutation.status == MutationStatus::Failed
        {
            return Err(EngineError::InvariantViolation(format!(
                "mutation {mutation_id} already settled ({})",
                mutation.status
            )));
        }
        mutation.status = status;
        tx.update_mutation(&mutation).await?;

        if status == MutationStatus::Indeterminate {
            let mut workflow = tx.get_workflow(mutation.workflow_id).await?;
            workflow.status = WorkflowStatus::Paused;
            workflow.pending_retry_run_id = Some(mutation.handler_run_id);
            tx.update_workflow(&workflow).await?;
        }

        tx.commit().await?;
        warn!(%mutation_id, %status, "mutation outcome uncertain");
        Ok(mutation)
    }

    /// Apply a user assertion to an unresolved mutation
    #[instrument(skip(self, result))]
    pub async fn resolve_mutation(
        &self,
        mutation_id: Uuid,
        resolution: MutationResolution,
        result: Option<serde_json::Value>,
    ) -> Result<Mutation, EngineError> {
        let mut tx = self.store.begin().await?;
        let mut mutation = tx.get_mutation(mutation_id).await?;
        if !matches!(
            mutation.status,
            MutationStatus::NeedsReconcile | MutationStatus::Indeterminate
        ) {
            return Err(EngineError::InvariantViolation(format!(
                "mutation {mutation_id} is not awaiting resolution ({})",
                mutation.status
            )));
        }

        let now = Utc::now();
        let mut run = tx.get_handler_run(mutation.handler_run_id).await?;
        let mut workflow = tx.get_workflow(mutation.workflow_id).await?;

        match resolution {
            MutationResolution::Happened => {
                mutation.status = MutationStatus::Applied;
                mutation.result = result;
                run.phase = RunPhase::Mutated;
                // The retry session will resume the run at emitting.
                workflow.pending_retry_run_id = Some(run.id);
                workflow.status = WorkflowStatus::Active;
            }
            MutationResolution::Skip => {
                mutation.status = MutationStatus::Failed;
                mutation.user_skip = true;
                workflow.pending_retry_run_id = Some(run.id);
                workflow.status = WorkflowStatus::Active;
            }
            MutationResolution::DidNotHappen => {
                mutation.status = MutationStatus::Failed;
                // Nothing external exists: the consumer re-prepares from
                // scratch, so the run closes and its holds are released.
                // No I/O happened here, so this is an internal closure,
                // not a network failure.
                tx.release_events_for_run(run.id).await?;
                run.status = RunStatus::FailedInternal;
                run.error = Some("user asserted the mutation did not happen".into());
                run.error_kind = Some(ErrorKind::Internal);
                run.ended_at = Some(now);
                workflow.pending_retry_run_id = None;
                workflow.status = WorkflowStatus::Active;
            }
        }
        mutation.resolved_by = Some(ResolvedBy::User);
        mutation.resolved_at = Some(now);

        tx.update_mutation(&mutation).await?;
        tx.update_handler_run(&run).await?;
        tx.update_workflow(&workflow).await?;
        tx.commit().await?;
        info!(%mutation_id, ?resolution, "mutation resolved by user");
        Ok(mutation)
    }

    // =========================================================================
    // Retries
    // =========================================================================

    /// Create the retry run for a failed/crashed post-mutation run
    ///
    /// The new run starts at `emitting` with the original's prepare result
    /// and takes over its reserved events; the workflow's pending retry is
    /// cleared in the same transaction.
    #[instrument(skip(self))]
    pub async fn create_retry_run(
        &self,
        failed_run_id: Uuid,
        new_session_id: Uuid,
    ) -> Result<HandlerRun, EngineError> {
        let mut tx = self.store.begin().await?;
        let failed = tx.get_handler_run(failed_run_id).await?;
        if failed.status == RunStatus::Active {
            return Err(EngineError::ConflictingRetry(format!(
                "run {failed_run_id} is still active"
            )));
        }

        let mutation = tx.find_mutation_for_run(failed_run_id).await?;
        let resumable = failed.phase.is_past_mutation()
            || (failed.phase == RunPhase::Mutating
                && mutation.as_ref().is_some_and(|m| {
                    m.status == MutationStatus::Applied
                        || (m.status == MutationStatus::Failed && m.user_skip)
                }));
        if !resumable {
            return Err(EngineError::ConflictingRetry(format!(
                "run {failed_run_id} did not cross the mutation boundary; \
                 a fresh prepare is required instead of a retry"
            )));
        }

        let mut workflow = tx.get_workflow(failed.workflow_id).await?;
        if workflow.pending_retry_run_id != Some(failed_run_id) {
            return Err(EngineError::ConflictingRetry(format!(
                "workflow {} does not have run {failed_run_id} pending retry",
                workflow.id
            )));
        }

        let mut retry = HandlerRun::new(
            new_session_id,
            failed.workflow_id,
            failed.kind,
            failed.handler_name.clone(),
        );
        retry.phase = RunPhase::Emitting;
        retry.retry_of = Some(failed.id);
        retry.prepare_result = failed.prepare_result.clone();
        retry.input_state = failed.input_state.clone();
        tx.insert_handler_run(&retry).await?;

        let transferred = tx.transfer_reservations(failed.id, retry.id).await?;

        workflow.pending_retry_run_id = None;
        tx.update_workflow(&workflow).await?;

        tx.commit().await?;
        info!(
            %failed_run_id, retry_id = %retry.id, transferred,
            "created post-mutation retry run"
        );
        Ok(retry)
    }

    /// Point the workflow's pending retry at a paused run (used after a
    /// background reconcile settles a mutation as applied)
    #[instrument(skip(self))]
    pub async fn schedule_retry(&self, run_id: Uuid) -> Result<(), EngineError> {
        let mut tx = self.store.begin().await?;
        let run = tx.get_handler_run(run_id).await?;
        let mut workflow = tx.get_workflow(run.workflow_id).await?;
        workflow.pending_retry_run_id = Some(run_id);
        tx.update_workflow(&workflow).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Arm (or widen) the workflow's transient backoff without a run
    /// transition — used when a background reconcile probe stays unsettled
    #[instrument(skip(self))]
    pub async fn arm_backoff(&self, workflow_id: Uuid) -> Result<(), EngineError> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let mut workflow = tx.get_workflow(workflow_id).await?;
        let next = if workflow.backoff_secs == 0 {
            BACKOFF_INITIAL_SECS
        } else {
            (workflow.backoff_secs * 2).min(BACKOFF_MAX_SECS)
        };
        workflow.backoff_secs = next;
        workflow.backoff_until = Some(Self::backoff_deadline(now, next));
        tx.update_workflow(&workflow).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Close a paused run without touching workflow status (reconcile
    /// settled the mutation as failed, or equivalent)
    #[instrument(skip(self))]
    pub async fn close_paused_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        kind: ErrorKind,
        error: &str,
    ) -> Result<HandlerRun, EngineError> {
        if !status.is_terminal() || status == RunStatus::Committed {
            return Err(EngineError::InvariantViolation(format!(
                "close_paused_run needs a failure status, got {status}"
            )));
        }
        let mut tx = self.store.begin().await?;
        let mut run = tx.get_handler_run(run_id).await?;
        if !run.status.is_paused() {
            return Err(EngineError::InvariantViolation(format!(
                "run {run_id} is not paused ({})",
                run.status
            )));
        }
        run.status = status;
        run.error = Some(error.to_string());
        run.error_kind = Some(kind);
        run.ended_at = Some(Utc::now());
        tx.update_handler_run(&run).await?;
        tx.release_events_for_run(run.id).await?;

        let mut workflow = tx.get_workflow(run.workflow_id).await?;
        if workflow.pending_retry_run_id == Some(run_id) {
            workflow.pending_retry_run_id = None;
            tx.update_workflow(&workflow).await?;
        }
        tx.commit().await?;
        Ok(run)
    }

    // =========================================================================
    // Session finalization
    // =========================================================================

    /// Success-path finalization of a session
    #[instrument(skip(self))]
    pub async fn finish_session(&self, session_id: Uuid) -> Result<ScriptRun, EngineError> {
        let mut tx = self.store.begin().await?;
        let mut session = tx.get_session(session_id).await?;
        if !session.is_finished() {
            session.ended_at = Some(Utc::now());
            session.result = Some(SessionResult::Completed);
            tx.update_session(&session).await?;

            // A clean finish disarms the transient backoff.
            let mut workflow = tx.get_workflow(session.workflow_id).await?;
            if workflow.backoff_secs != 0 || workflow.backoff_until.is_some() {
                workflow.backoff_secs = 0;
                workflow.backoff_until = None;
                tx.update_workflow(&workflow).await?;
            }
        }
        tx.commit().await?;
        Ok(session)
    }

    /// Finalize a session that failed outside any handler run (config
    /// parse errors, missing active script). Applies the same workflow
    /// effects the equivalent run status would have.
    #[instrument(skip(self, error))]
    pub async fn finalize_session_error(
        &self,
        session_id: Uuid,
        error: &ClassifiedError,
    ) -> Result<ScriptRun, EngineError> {
        let mut tx = self.store.begin().await?;
        let mut session = tx.get_session(session_id).await?;
        let status = error.run_status();
        let now = Utc::now();
        if !session.is_finished() {
            session.ended_at = Some(now);
            session.result = Some(if status.is_paused() {
                SessionResult::Suspended
            } else {
                SessionResult::Failed
            });
            session.error = Some(error.message.clone());
            session.error_kind = Some(error.kind);
            tx.update_session(&session).await?;
        }

        let mut workflow = tx.get_workflow(session.workflow_id).await?;
        self.apply_outer_workflow_effect(&mut workflow, status, now);
        tx.update_workflow(&workflow).await?;

        tx.commit().await?;
        warn!(%session_id, kind = %error.kind, "session failed outside handler execution");
        Ok(session)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Backoff deadline with up to 10% jitter so retries across workflows
    /// do not synchronize
    fn backoff_deadline(now: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
        use rand::Rng;
        let jitter_ms = rand::thread_rng().gen_range(0..=secs * 100);
        now + Duration::seconds(secs) + Duration::milliseconds(jitter_ms)
    }

    fn phase_rank(phase: RunPhase) -> u8 {
        match phase {
            RunPhase::Pending => 0,
            RunPhase::Executing => 1,
            RunPhase::Preparing => 2,
            RunPhase::Prepared => 3,
            RunPhase::Mutating => 4,
            RunPhase::Mutated => 5,
            RunPhase::Emitting => 6,
            RunPhase::Committed => 7,
        }
    }

    /// Phase never regresses, and only active runs move
    fn check_transition(run: &HandlerRun, new_phase: RunPhase) -> Result<(), EngineError> {
        if run.status != RunStatus::Active {
            return Err(EngineError::InvariantViolation(format!(
                "run {} is not active ({})",
                run.id, run.status
            )));
        }
        if Self::phase_rank(new_phase) <= Self::phase_rank(run.phase) {
            return Err(EngineError::InvariantViolation(format!(
                "phase may not regress: {} -> {new_phase}",
                run.phase
            )));
        }
        Ok(())
    }

    /// Whether the run crossed the mutation boundary (events must be
    /// retained and retries resume at emitting)
    fn is_post_mutation(run: &HandlerRun, mutation: Option<&Mutation>) -> bool {
        run.phase.is_past_mutation()
            || (run.phase == RunPhase::Mutating
                && mutation.is_some_and(|m| m.status.effect_possible()))
    }

    fn apply_workflow_effect(
        &self,
        workflow: &mut Workflow,
        run: &HandlerRun,
        status: RunStatus,
        mutation: Option<&Mutation>,
        now: DateTime<Utc>,
    ) {
        match status {
            RunStatus::FailedLogic => {
                if workflow.maintenance_fix_count >= self.max_auto_fixes {
                    warn!(workflow_id = %workflow.id, "auto-fix budget exhausted");
                    workflow.status = WorkflowStatus::Error;
                } else {
                    workflow.maintenance = true;
                }
            }
            RunStatus::FailedInternal
            | RunStatus::FailedAuth
            | RunStatus::FailedPermission
            | RunStatus::FailedNetwork => {
                workflow.status = WorkflowStatus::Error;
            }
            RunStatus::PausedApproval => {
                workflow.status = WorkflowStatus::Paused;
            }
            RunStatus::PausedReconciliation => {
                // Indeterminate pauses the workflow until the user decides;
                // needs_reconcile keeps it active for the background probe.
                if mutation.is_some_and(|m| m.status == MutationStatus::Indeterminate) {
                    workflow.status = WorkflowStatus::Paused;
                    workflow.pending_retry_run_id = Some(run.id);
                }
            }
            RunStatus::PausedTransient => {
                let next = if workflow.backoff_secs == 0 {
                    BACKOFF_INITIAL_SECS
                } else {
                    (workflow.backoff_secs * 2).min(BACKOFF_MAX_SECS)
                };
                workflow.backoff_secs = next;
                workflow.backoff_until = Some(Self::backoff_deadline(now, next));
            }
            RunStatus::Crashed | RunStatus::Committed | RunStatus::Active => {}
        }
    }

    /// Workflow effects for failures with no handler run
    fn apply_outer_workflow_effect(
        &self,
        workflow: &mut Workflow,
        status: RunStatus,
        now: DateTime<Utc>,
    ) {
        match status {
            RunStatus::FailedLogic => {
                if workflow.maintenance_fix_count >= self.max_auto_fixes {
                    workflow.status = WorkflowStatus::Error;
                } else {
                    workflow.maintenance = true;
                }
            }
            RunStatus::PausedTransient => {
                let next = if workflow.backoff_secs == 0 {
                    BACKOFF_INITIAL_SECS
                } else {
                    (workflow.backoff_secs * 2).min(BACKOFF_MAX_SECS)
                };
                workflow.backoff_secs = next;
                workflow.backoff_until = Some(Self::backoff_deadline(now, next));
            }
            RunStatus::PausedApproval => workflow.status = WorkflowStatus::Paused,
            _ => workflow.status = WorkflowStatus::Error,
        }
    }

    async fn advance_schedule(
        &self,
        tx: &mut Box<dyn StoreTx>,
        workflow_id: Uuid,
        producer_name: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let schedules = tx.list_producer_schedules(workflow_id).await?;
        let Some(mut schedule) = schedules
            .into_iter()
            .find(|s| s.producer_name == producer_name)
        else {
            return Ok(());
        };
        // next_run_at is strictly monotone non-decreasing across commits
        schedule.next_run_at = schedule.next_run_at.max(next_run_at);
        tx.upsert_producer_schedule(&schedule).await?;

        // Denormalize the earliest fire time for display.
        let schedules = tx.list_producer_schedules(workflow_id).await?;
        let earliest = schedules.iter().map(|s| s.next_run_at).min();
        let mut workflow = tx.get_workflow(workflow_id).await?;
        workflow.next_run_at = earliest;
        tx.update_workflow(&workflow).await?;
        Ok(())
    }
}

/// Activation inputs, see [`crate::activate`]
#[derive(Debug, Clone)]
pub struct ActivateScriptTx {
    pub workflow_id: Uuid,
    pub script_id: Uuid,
    /// Serialized `WorkflowConfig` read from the script row
    pub handler_config: serde_json::Value,
    /// Validated schedules derived from the config, in config order
    pub schedules: Vec<(String, millrun_core::schedule::ScheduleSpec)>,
    /// Display cron of the first cron-scheduled producer
    pub display_cron: Option<String>,
    pub pending_retry_run_id: Option<Uuid>,
    pub manual: bool,
}

impl<S: Store> Emm<S> {
    /// Atomic half of script activation (see `activate` module for the
    /// validating wrapper): deploys the script, clears maintenance, syncs
    /// producer schedules, denormalizes display fields.
    #[instrument(skip(self, req), fields(workflow_id = %req.workflow_id))]
    pub async fn activate_script(
        &self,
        req: ActivateScriptTx,
    ) -> Result<Workflow, EngineError> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let mut workflow = tx.get_workflow(req.workflow_id).await?;
        let script = tx.get_script(req.script_id).await?;
        if script.workflow_id != workflow.id {
            return Err(EngineError::InvariantViolation(format!(
                "script {} does not belong to workflow {}",
                script.id, workflow.id
            )));
        }

        workflow.active_script_id = Some(script.id);
        workflow.handler_config = Some(req.handler_config);
        workflow.maintenance = false;
        workflow.status = WorkflowStatus::Active;
        workflow.backoff_secs = 0;
        workflow.backoff_until = None;
        if req.manual {
            workflow.maintenance_fix_count = 0;
            // Manual activation also cancels a scheduled retry when the
            // caller passes none.
            workflow.pending_retry_run_id = req.pending_retry_run_id;
        } else {
            if script.kind == millrun_core::model::ScriptKind::AutoFix {
                workflow.maintenance_fix_count += 1;
            }
            if let Some(pending) = req.pending_retry_run_id {
                workflow.pending_retry_run_id = Some(pending);
            }
        }

        // Sync producer schedules: only new or changed producers fire
        // immediately; unchanged ones keep their cadence.
        let existing = tx.list_producer_schedules(workflow.id).await?;
        for (name, spec) in &req.schedules {
            let prior = existing.iter().find(|s| &s.producer_name == name);
            match prior {
                Some(prior) if &prior.spec == spec => {}
                _ => {
                    tx.upsert_producer_schedule(&ProducerSchedule::new(
                        workflow.id,
                        name.clone(),
                        spec.clone(),
                        now,
                    ))
                    .await?;
                }
            }
        }
        for prior in &existing {
            if !req.schedules.iter().any(|(name, _)| name == &prior.producer_name) {
                tx.delete_producer_schedule(workflow.id, &prior.producer_name)
                    .await?;
            }
        }

        let schedules = tx.list_producer_schedules(workflow.id).await?;
        workflow.cron = req.display_cron;
        workflow.next_run_at = schedules.iter().map(|s| s.next_run_at).min();
        tx.update_workflow(&workflow).await?;

        tx.commit().await?;
        info!(script_id = %script.id, "script activated");
        Ok(workflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use millrun_core::model::EventStatus;
    use millrun_core::schedule::ScheduleSpec;
    use millrun_store::MemoryStore;
    use serde_json::json;

    struct Setup {
        store: Arc<MemoryStore>,
        emm: Emm<MemoryStore>,
        workflow_id: Uuid,
        session_id: Uuid,
    }

    async fn setup() -> Setup {
        let store = Arc::new(MemoryStore::new());
        let emm = Emm::new(Arc::clone(&store));
        let workflow = emm.create_workflow(Uuid::now_v7()).await.unwrap();

        // Activate a minimal script so sessions have something to point at.
        let script = emm
            .save_script(
                workflow.id,
                "export default workflow".into(),
                json!({
                    "topics": ["t"],
                    "consumers": {"c": {"subscribe": ["t"]}}
                }),
                millrun_core::model::ScriptKind::Initial,
                None,
                None,
            )
            .await
            .unwrap();
        emm.activate_script(ActivateScriptTx {
            workflow_id: workflow.id,
            script_id: script.id,
            handler_config: script.config.clone(),
            schedules: vec![],
            display_cron: None,
            pending_retry_run_id: None,
            manual: true,
        })
        .await
        .unwrap();

        let session = emm
            .create_session(workflow.id, script.id, Trigger::Event, None)
            .await
            .unwrap();
        Setup {
            store,
            emm,
            workflow_id: workflow.id,
            session_id: session.id,
        }
    }

    async fn consumer_run(setup: &Setup) -> HandlerRun {
        setup
            .emm
            .create_handler_run(
                setup.session_id,
                setup.workflow_id,
                HandlerKind::Consumer,
                "c",
                None,
            )
            .await
            .unwrap()
    }

    async fn insert_pending_event(setup: &Setup, message_id: &str) {
        let mut tx = setup.store.begin().await.unwrap();
        let event = millrun_core::model::Event::pending(
            setup.workflow_id,
            "t",
            message_id,
            json!({}),
            vec![],
        );
        tx.insert_event(&event).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn phase_never_regresses() {
        let setup = setup().await;
        let run = consumer_run(&setup).await;

        setup
            .emm
            .update_consumer_phase(run.id, RunPhase::Preparing, Default::default())
            .await
            .unwrap();
        setup
            .emm
            .update_consumer_phase(run.id, RunPhase::Mutating, Default::default())
            .await
            .unwrap();

        let err = setup
            .emm
            .update_consumer_phase(run.id, RunPhase::Preparing, Default::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn apply_mutation_is_atomic_with_phase() {
        let setup = setup().await;
        let run = consumer_run(&setup).await;
        setup
            .emm
            .update_consumer_phase(run.id, RunPhase::Preparing, Default::default())
            .await
            .unwrap();
        setup
            .emm
            .update_consumer_phase(run.id, RunPhase::Prepared, Default::default())
            .await
            .unwrap();
        setup
            .emm
            .update_consumer_phase(run.id, RunPhase::Mutating, Default::default())
            .await
            .unwrap();
        let mutation = setup
            .emm
            .create_mutation(
                run.id,
                CreateMutation {
                    tool_namespace: "x".into(),
                    tool_method: "y".into(),
                    params: json!({}),
                    idempotency_key: None,
                },
            )
            .await
            .unwrap();

        setup
            .emm
            .apply_mutation(mutation.id, Some(json!({"ok": true})), ResolvedBy::Engine)
            .await
            .unwrap();

        // Same snapshot: status applied and phase mutated.
        let mutation = setup.store.get_mutation(mutation.id).await.unwrap();
        let run = setup.store.get_handler_run(run.id).await.unwrap();
        assert_eq!(mutation.status, MutationStatus::Applied);
        assert_eq!(run.phase, RunPhase::Mutated);

        // Double-apply is refused.
        let err = setup
            .emm
            .apply_mutation(mutation.id, None, ResolvedBy::Engine)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn second_mutation_per_run_is_refused() {
        let setup = setup().await;
        let run = consumer_run(&setup).await;
        for phase in [RunPhase::Preparing, RunPhase::Prepared, RunPhase::Mutating] {
            setup
                .emm
                .update_consumer_phase(run.id, phase, Default::default())
                .await
                .unwrap();
        }
        let create = || CreateMutation {
            tool_namespace: "x".into(),
            tool_method: "y".into(),
            params: json!({}),
            idempotency_key: None,
        };
        setup.emm.create_mutation(run.id, create()).await.unwrap();
        let err = setup.emm.create_mutation(run.id, create()).await.unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn pre_mutation_failure_releases_events() {
        let setup = setup().await;
        insert_pending_event(&setup, "m-1").await;
        let run = consumer_run(&setup).await;
        setup
            .emm
            .update_consumer_phase(run.id, RunPhase::Preparing, Default::default())
            .await
            .unwrap();
        setup
            .emm
            .update_consumer_phase(
                run.id,
                RunPhase::Prepared,
                PhaseOpts {
                    reservations: vec![Reservation {
                        topic: "t".into(),
                        ids: vec!["m-1".into()],
                    }],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        setup
            .emm
            .update_handler_run_status(
                run.id,
                RunStatus::FailedLogic,
                Some(ClassifiedError::logic("bad prepare")),
                Default::default(),
            )
            .await
            .unwrap();

        let events = setup
            .store
            .list_events(setup.workflow_id, None, None)
            .await
            .unwrap();
        assert_eq!(events[0].status, EventStatus::Pending);

        // Logic failure flips maintenance, not error.
        let workflow = setup.store.get_workflow(setup.workflow_id).await.unwrap();
        assert!(workflow.maintenance);
        assert_eq!(workflow.status, WorkflowStatus::Active);

        // The session was finalized as failed.
        let session = setup.store.get_session(setup.session_id).await.unwrap();
        assert_eq!(session.result, Some(SessionResult::Failed));
    }

    #[tokio::test]
    async fn transient_pause_arms_and_doubles_backoff() {
        let setup = setup().await;

        for secs in [30, 60, 120, 240, 480, 900, 900] {
            let run = consumer_run(&setup).await;
            setup
                .emm
                .update_consumer_phase(run.id, RunPhase::Preparing, Default::default())
                .await
                .unwrap();
            setup
                .emm
                .update_handler_run_status(
                    run.id,
                    RunStatus::PausedTransient,
                    Some(ClassifiedError::network("flaky")),
                    Default::default(),
                )
                .await
                .unwrap();
            let workflow = setup.store.get_workflow(setup.workflow_id).await.unwrap();
            assert_eq!(workflow.backoff_secs, secs);
            assert!(workflow.backoff_until.is_some());
        }
    }

    #[tokio::test]
    async fn schedule_advancement_is_monotone() {
        let setup = setup().await;
        let now = Utc::now();

        let mut tx = setup.store.begin().await.unwrap();
        tx.upsert_producer_schedule(&ProducerSchedule::new(
            setup.workflow_id,
            "p",
            ScheduleSpec::Interval(std::time::Duration::from_secs(60)),
            now + Duration::seconds(120),
        ))
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let run = setup
            .emm
            .create_handler_run(
                setup.session_id,
                setup.workflow_id,
                HandlerKind::Producer,
                "p",
                None,
            )
            .await
            .unwrap();
        setup
            .emm
            .update_producer_phase(run.id, RunPhase::Executing)
            .await
            .unwrap();

        // A commit that tries to move next_run_at backwards is clamped to
        // the existing value.
        setup
            .emm
            .commit_producer(
                run.id,
                CommitProducer {
                    new_state: Some(json!({"cursor": 1})),
                    next_run_at: Some(now + Duration::seconds(60)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let schedules = setup
            .store
            .list_producer_schedules(setup.workflow_id)
            .await
            .unwrap();
        assert_eq!(schedules[0].next_run_at, now + Duration::seconds(120));
    }

    #[tokio::test]
    async fn retry_refused_before_mutation_boundary() {
        let setup = setup().await;
        insert_pending_event(&setup, "m-1").await;
        let run = consumer_run(&setup).await;
        setup
            .emm
            .update_consumer_phase(run.id, RunPhase::Preparing, Default::default())
            .await
            .unwrap();
        setup
            .emm
            .update_handler_run_status(
                run.id,
                RunStatus::PausedTransient,
                Some(ClassifiedError::network("flaky")),
                Default::default(),
            )
            .await
            .unwrap();

        let err = setup
            .emm
            .create_retry_run(run.id, setup.session_id)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ConflictingRetry(_)));
    }
}
