//! Workflow scheduler
//!
//! The single-threaded driver: parallel across workflows, one logical
//! execution slot per workflow. Each tick walks the active workflows and
//! starts at most one session per workflow, in priority order: pending
//! post-mutation retry, due/queued producers, dirty/woken consumers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use millrun_core::error::ErrorKind;
use millrun_core::model::{
    EventStatus, MutationStatus, ResolvedBy, RunStatus, Trigger, Workflow, WorkflowStatus,
};
use millrun_store::Store;

use crate::emm::Emm;
use crate::error::EngineError;
use crate::reconcile::{ReconcileVerdict, ReconciliationRegistry};
use crate::session::{SessionOutcome, SessionRunner};

use super::SchedulerState;

/// Scheduler tuning
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often to scan for runnable workflows
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
        }
    }
}

/// The per-process workflow scheduler
pub struct Scheduler<S: Store> {
    store: Arc<S>,
    emm: Arc<Emm<S>>,
    sessions: Arc<SessionRunner<S>>,
    state: Arc<SchedulerState>,
    reconcile: Arc<ReconciliationRegistry>,
    config: SchedulerConfig,
    shutdown: watch::Receiver<bool>,
}

impl<S: Store> Scheduler<S> {
    pub fn new(
        store: Arc<S>,
        emm: Arc<Emm<S>>,
        sessions: Arc<SessionRunner<S>>,
        state: Arc<SchedulerState>,
        reconcile: Arc<ReconciliationRegistry>,
        config: SchedulerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            emm,
            sessions,
            state,
            reconcile,
            config,
            shutdown,
        }
    }

    /// Tick until shutdown
    pub async fn run(&mut self) {
        info!(tick = ?self.config.tick_interval, "scheduler running");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.tick_interval) => {
                    self.tick().await;
                }
                _ = self.shutdown.changed() => {
                    info!("scheduler shutting down");
                    return;
                }
            }
        }
    }

    /// One scan over the active workflows
    #[instrument(skip(self))]
    pub async fn tick(&self) {
        let workflows = match self.store.list_workflows(Some(WorkflowStatus::Active)).await {
            Ok(workflows) => workflows,
            Err(err) => {
                error!(%err, "tick: listing workflows failed");
                return;
            }
        };

        for workflow in workflows {
            if let Err(err) = self.tick_workflow(&workflow).await {
                error!(workflow_id = %workflow.id, %err, "tick: workflow pass failed");
            }
        }
    }

    async fn tick_workflow(&self, workflow: &Workflow) -> Result<(), EngineError> {
        let now = Utc::now();
        if !workflow.is_runnable() || workflow.in_backoff(now) {
            return Ok(());
        }

        // Single-threaded invariant: never start a session while a handler
        // run is non-terminal and non-paused. Schedules that fire during
        // the busy window are remembered via the queued flag.
        let active = self.store.list_active_runs(Some(workflow.id)).await?;
        if !active.is_empty() {
            let schedules = self.store.list_producer_schedules(workflow.id).await?;
            for schedule in schedules.iter().filter(|s| s.is_due(now)) {
                self.state
                    .set_producer_queued(workflow.id, &schedule.producer_name);
            }
            return Ok(());
        }

        // Background reconcile probes for this workflow's unsettled
        // mutations run before anything else; one may unlock a retry.
        self.retry_reconciliations(workflow).await?;

        let outcome = if self.store.get_workflow(workflow.id).await?.pending_retry_run_id
            .is_some()
        {
            debug!(workflow_id = %workflow.id, "starting retry session");
            self.sessions.run_retry_session(workflow.id).await?
        } else if self.producer_work_due(workflow, now).await? {
            self.sessions
                .execute_session(workflow.id, Trigger::Schedule)
                .await?
        } else if self.state.any_consumer_ready(workflow.id, now) {
            self.sessions
                .execute_session(workflow.id, Trigger::Event)
                .await?
        } else {
            return Ok(());
        };

        debug!(workflow_id = %workflow.id, ?outcome, "session finished");
        if outcome == SessionOutcome::Maintenance {
            info!(workflow_id = %workflow.id, "workflow handed to auto-fix");
        }
        Ok(())
    }

    async fn producer_work_due(
        &self,
        workflow: &Workflow,
        now: chrono::DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        if self.state.any_producer_queued(workflow.id) {
            return Ok(true);
        }
        let schedules = self.store.list_producer_schedules(workflow.id).await?;
        Ok(schedules.iter().any(|s| s.is_due(now)))
    }

    /// Re-probe `needs_reconcile` mutations belonging to this workflow
    async fn retry_reconciliations(&self, workflow: &Workflow) -> Result<(), EngineError> {
        let unsettled = self
            .store
            .list_mutations_with_status(MutationStatus::NeedsReconcile)
            .await?;
        for mutation in unsettled
            .into_iter()
            .filter(|m| m.workflow_id == workflow.id)
        {
            let Some(hook) = self
                .reconcile
                .get(&mutation.tool_namespace, &mutation.tool_method)
            else {
                // The hook disappeared between the pause and now; only the
                // user can settle this.
                self.emm
                    .update_mutation_status(mutation.id, MutationStatus::Indeterminate)
                    .await?;
                continue;
            };

            match hook.reconcile(&mutation).await {
                Ok(ReconcileVerdict::Applied(result)) => {
                    info!(mutation_id = %mutation.id, "background reconcile: applied");
                    self.emm
                        .apply_mutation(mutation.id, result, ResolvedBy::Reconcile)
                        .await?;
                    self.emm.schedule_retry(mutation.handler_run_id).await?;
                }
                Ok(ReconcileVerdict::Failed(reason)) => {
                    info!(mutation_id = %mutation.id, reason, "background reconcile: failed");
                    self.dirty_for_released_events(workflow, mutation.handler_run_id)
                        .await?;
                    // The paused run recorded the error kind that made the
                    // outcome uncertain; close with that kind rather than
                    // assuming the fault was the network's.
                    let paused = self
                        .store
                        .get_handler_run(mutation.handler_run_id)
                        .await?;
                    let kind = match paused.error_kind {
                        Some(kind @ (ErrorKind::Network | ErrorKind::RateLimit)) => kind,
                        _ => ErrorKind::Internal,
                    };
                    let status = match kind {
                        ErrorKind::Network | ErrorKind::RateLimit => RunStatus::FailedNetwork,
                        _ => RunStatus::FailedInternal,
                    };
                    self.emm
                        .fail_mutation(mutation.id, &reason, ResolvedBy::Reconcile)
                        .await?;
                    self.emm
                        .close_paused_run(
                            mutation.handler_run_id,
                            status,
                            kind,
                            &format!("reconcile: mutation did not apply ({reason})"),
                        )
                        .await?;
                }
                Ok(ReconcileVerdict::Retry) => {
                    self.emm.arm_backoff(workflow.id).await?;
                }
                Err(err) => {
                    warn!(mutation_id = %mutation.id, %err, "reconcile probe errored");
                    self.emm
                        .update_mutation_status(mutation.id, MutationStatus::Indeterminate)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Events about to be released back to pending must re-dirty their
    /// subscribers
    async fn dirty_for_released_events(
        &self,
        workflow: &Workflow,
        run_id: Uuid,
    ) -> Result<(), EngineError> {
        let Some(raw) = workflow.handler_config.as_ref() else {
            return Ok(());
        };
        let Ok(config) = millrun_core::config::WorkflowConfig::parse(raw) else {
            return Ok(());
        };
        let reserved = self
            .store
            .list_events(workflow.id, None, Some(EventStatus::Reserved))
            .await?;
        for event in reserved.iter().filter(|e| e.reserved_by == Some(run_id)) {
            self.state
                .on_event_publish(workflow.id, &event.topic, &config);
        }
        Ok(())
    }
}
