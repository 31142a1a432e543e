//! Crash recovery
//!
//! Runs on process start, before the scheduler serves any traffic. The
//! single rule that matters: which side of the mutation boundary did the
//! run die on? Pre-mutation work is abandoned and its event holds are
//! released — the next session simply re-prepares. Post-mutation work is
//! preserved: events stay held, the workflow remembers the pending retry,
//! and only the emitting phase is re-run. A mutation caught in flight is
//! unknowable and escalates to the user.
//!
//! Recovery is idempotent: a second pass over an already-recovered store
//! changes nothing.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};

use millrun_core::config::WorkflowConfig;
use millrun_core::model::{
    MutationStatus, RunPhase, RunStatus, SessionResult, WorkflowStatus,
};
use millrun_store::{Store, StoreTx};

use crate::error::EngineError;
use crate::sched::SchedulerState;

/// What a recovery pass did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Runs marked crashed
    pub crashed_runs: usize,

    /// Runs re-paused for reconciliation
    pub repaused_runs: usize,

    /// In-flight mutations escalated to indeterminate
    pub indeterminate_mutations: usize,

    /// Dangling sessions closed
    pub closed_sessions: usize,

    /// Orphaned reserved events released
    pub released_events: usize,

    /// Workflows currently owned by the auto-fix agent
    pub maintenance_workflows: usize,
}

/// Startup reconciliation of runs, sessions and reservations
///
/// Recovery composes its own transactions: crash states need transitions
/// (active → crashed, mutation → indeterminate) that the live-path EMM
/// operations deliberately refuse.
pub struct Recovery<S: Store> {
    store: Arc<S>,
    sched: Arc<SchedulerState>,
}

impl<S: Store> Recovery<S> {
    pub fn new(store: Arc<S>, sched: Arc<SchedulerState>) -> Self {
        Self { store, sched }
    }

    /// Full startup pass, in order
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<RecoveryReport, EngineError> {
        let mut report = RecoveryReport::default();
        self.recover_crashed_runs(&mut report).await?;
        self.recover_unfinished_sessions(&mut report).await?;
        self.recover_maintenance_mode(&mut report).await?;
        self.release_orphaned_reserved_events(&mut report).await?;
        self.rebuild_scheduler_state().await?;
        info!(?report, "recovery complete");
        Ok(report)
    }

    /// Runs that were active when the process died
    pub async fn recover_crashed_runs(
        &self,
        report: &mut RecoveryReport,
    ) -> Result<(), EngineError> {
        let runs = self.store.list_active_runs(None).await?;
        for stale in runs {
            let workflow = self.store.get_workflow(stale.workflow_id).await?;
            if workflow.status != WorkflowStatus::Active {
                // Paused and errored workflows wait for the user; their
                // runs are settled when the user acts.
                continue;
            }

            let mut tx = self.store.begin().await?;
            let mut run = tx.get_handler_run(stale.id).await?;
            if run.status != RunStatus::Active {
                // Settled since the scan; nothing to do.
                continue;
            }
            let mutation = tx.find_mutation_for_run(run.id).await?;
            let now = Utc::now();
            run.ended_at = Some(now);

            let in_flight =
                mutation.as_ref().is_some_and(|m| m.status == MutationStatus::InFlight);
            let unresolved = mutation.as_ref().map(|m| m.status);

            if run.phase == RunPhase::Mutating && in_flight {
                // The side effect may or may not exist; only the user can
                // say. Events stay held.
                if let Some(mut mutation) = mutation.clone() {
                    mutation.status = MutationStatus::Indeterminate;
                    tx.update_mutation(&mutation).await?;
                }

                run.status = RunStatus::PausedReconciliation;
                run.error = Some("process crashed while a mutation was in flight".into());
                tx.update_handler_run(&run).await?;
                Self::finalize_session(&mut tx, &run, SessionResult::Suspended).await?;

                let mut workflow = tx.get_workflow(run.workflow_id).await?;
                workflow.status = WorkflowStatus::Paused;
                workflow.pending_retry_run_id = Some(run.id);
                tx.update_workflow(&workflow).await?;
                report.indeterminate_mutations += 1;
                report.repaused_runs += 1;
            } else if run.phase == RunPhase::Mutating
                && matches!(
                    unresolved,
                    Some(MutationStatus::NeedsReconcile) | Some(MutationStatus::Indeterminate)
                )
            {
                // The mutation outcome bookkeeping survived the crash; the
                // run just never reached its pause transition. Re-pause it.
                run.status = RunStatus::PausedReconciliation;
                run.error = Some("process crashed awaiting mutation reconciliation".into());
                tx.update_handler_run(&run).await?;
                Self::finalize_session(&mut tx, &run, SessionResult::Suspended).await?;

                if unresolved == Some(MutationStatus::Indeterminate) {
                    let mut workflow = tx.get_workflow(run.workflow_id).await?;
                    workflow.status = WorkflowStatus::Paused;
                    workflow.pending_retry_run_id = Some(run.id);
                    tx.update_workflow(&workflow).await?;
                }
                report.repaused_runs += 1;
            } else if run.phase.is_past_mutation()
                || (run.phase == RunPhase::Mutating
                    && unresolved == Some(MutationStatus::Applied))
            {
                // The effect exists; the retry resumes at emitting with
                // the events still held.
                run.status = RunStatus::Crashed;
                run.error = Some("process crashed after the mutation boundary".into());
                tx.update_handler_run(&run).await?;
                Self::finalize_session(&mut tx, &run, SessionResult::Failed).await?;

                let mut workflow = tx.get_workflow(run.workflow_id).await?;
                workflow.pending_retry_run_id = Some(run.id);
                tx.update_workflow(&workflow).await?;
                report.crashed_runs += 1;
            } else {
                // Pre-mutation: nothing external happened. Release the
                // holds; normal dirty/due signals re-drive the work.
                run.status = RunStatus::Crashed;
                run.error = Some("process crashed before the mutation boundary".into());
                tx.update_handler_run(&run).await?;
                tx.release_events_for_run(run.id).await?;
                Self::finalize_session(&mut tx, &run, SessionResult::Failed).await?;
                report.crashed_runs += 1;
            }

            tx.commit().await?;
            info!(run_id = %run.id, phase = %run.phase, status = %run.status, "recovered run");
        }
        Ok(())
    }

    /// Close sessions with no end timestamp once their workflow has no
    /// active runs left
    pub async fn recover_unfinished_sessions(
        &self,
        report: &mut RecoveryReport,
    ) -> Result<(), EngineError> {
        let sessions = self.store.list_unfinished_sessions().await?;
        for session in sessions {
            let active = self
                .store
                .list_active_runs(Some(session.workflow_id))
                .await?;
            if !active.is_empty() {
                continue;
            }
            let mut tx = self.store.begin().await?;
            let mut session = tx.get_session(session.id).await?;
            if session.is_finished() {
                continue;
            }
            session.ended_at = Some(Utc::now());
            session.result = Some(SessionResult::Failed);
            session.error = Some("session interrupted by process crash".into());
            tx.update_session(&session).await?;
            tx.commit().await?;
            report.closed_sessions += 1;
            info!(session_id = %session.id, "closed dangling session");
        }
        Ok(())
    }

    /// Maintenance workflows are owned by the auto-fix agent; they resume
    /// only through script activation. Nothing to repair here, but the
    /// count is worth surfacing.
    pub async fn recover_maintenance_mode(
        &self,
        report: &mut RecoveryReport,
    ) -> Result<(), EngineError> {
        let workflows = self.store.list_workflows(None).await?;
        report.maintenance_workflows = workflows.iter().filter(|w| w.maintenance).count();
        if report.maintenance_workflows > 0 {
            info!(
                count = report.maintenance_workflows,
                "workflows awaiting auto-fix"
            );
        }
        Ok(())
    }

    /// Invariant sweep: every reserved event must be explainable by a
    /// live, paused or retry-pending owner. Anything else self-heals back
    /// to pending, loudly.
    pub async fn release_orphaned_reserved_events(
        &self,
        report: &mut RecoveryReport,
    ) -> Result<(), EngineError> {
        let reserved = self.store.list_reserved_events().await?;
        for event in reserved {
            let Some(owner_id) = event.reserved_by else {
                // Only appears on hand-edited stores; nothing to key a
                // release on.
                warn!(event_id = %event.id, "reserved event with no owner");
                continue;
            };
            let owner = self.store.get_handler_run(owner_id).await?;
            let workflow = self.store.get_workflow(event.workflow_id).await?;

            let retained_legitimately = owner.status == RunStatus::Active
                || owner.status.is_paused()
                || workflow.pending_retry_run_id == Some(owner.id)
                || (owner.status == RunStatus::FailedLogic && workflow.maintenance);

            if !retained_legitimately {
                warn!(
                    event_id = %event.id, owner = %owner.id, owner_status = %owner.status,
                    "orphaned reserved event; releasing"
                );
                let mut tx = self.store.begin().await?;
                report.released_events += tx.release_events_for_run(owner.id).await? as usize;
                tx.commit().await?;
            }
        }
        Ok(())
    }

    /// Rebuild the in-memory scheduler signals from persisted truth:
    /// every consumer dirty (the next prepare is cheap when idle), wake-ats
    /// reloaded from handler state.
    pub async fn rebuild_scheduler_state(&self) -> Result<(), EngineError> {
        let workflows = self
            .store
            .list_workflows(Some(WorkflowStatus::Active))
            .await?;
        for workflow in workflows {
            let Some(raw) = workflow.handler_config.as_ref() else {
                continue;
            };
            let Ok(config) = WorkflowConfig::parse(raw) else {
                warn!(workflow_id = %workflow.id, "unparseable handler config; skipping signals");
                continue;
            };
            let states = self.store.list_handler_states(workflow.id).await?;
            let wake_ats: HashMap<_, _> = states
                .into_iter()
                .filter_map(|s| s.wake_at.map(|at| (s.handler_name, at)))
                .collect();
            self.sched
                .initialize_for_workflow(workflow.id, &config, &wake_ats);
        }
        Ok(())
    }

    async fn finalize_session(
        tx: &mut Box<dyn StoreTx>,
        run: &millrun_core::model::HandlerRun,
        result: SessionResult,
    ) -> Result<(), EngineError> {
        let mut session = tx.get_session(run.script_run_id).await?;
        if session.is_finished() {
            return Ok(());
        }
        session.ended_at = Some(Utc::now());
        session.result = Some(result);
        session.error = run.error.clone();
        session.cost_milli_cents += run.cost_milli_cents;
        tx.update_session(&session).await?;
        Ok(())
    }

}
