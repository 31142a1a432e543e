//! Consumer phase handlers

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument};

use millrun_core::config::WorkflowConfig;
use millrun_core::error::ClassifiedError;
use millrun_core::model::{HandlerRun, MutationStatus, RunPhase, Workflow};
use millrun_core::prepare::{clamp_wake_at, PrepareResult};
use millrun_core::sandbox::EvalRequest;
use millrun_core::tool::PhaseTag;
use millrun_store::Store;

use crate::emm::{CommitConsumer, PhaseOpts, RunCosts};
use crate::error::EngineError;
use crate::tools::{DispatchContext, EngineDispatcher};

use super::HandlerMachine;

impl<S: Store> HandlerMachine<S> {
    fn dispatcher(
        &self,
        run: &HandlerRun,
        workflow: &Workflow,
        config: &WorkflowConfig,
        phase: PhaseTag,
    ) -> Arc<EngineDispatcher<S>> {
        Arc::new(EngineDispatcher::new(
            Arc::clone(&self.emm),
            Arc::clone(&self.ledger),
            Arc::clone(&self.tools),
            Arc::clone(&self.reconcile),
            config.clone(),
            DispatchContext {
                workflow_id: workflow.id,
                run_id: run.id,
                handler_name: run.handler_name.clone(),
                phase,
            },
        ))
    }

    fn stored_prepare_result(&self, run: &HandlerRun) -> Result<PrepareResult, ClassifiedError> {
        let raw = run.prepare_result.clone().ok_or_else(|| {
            ClassifiedError::internal(format!("run {} has no prepare result", run.id))
        })?;
        serde_json::from_value(raw)
            .map_err(|e| ClassifiedError::internal(format!("stored prepare result: {e}")))
    }

    /// Consumer `preparing`: evaluate prepare, validate its shape, then
    /// persist prepare result + reservations + clamped wake-at atomically
    #[instrument(skip(self, workflow, config), fields(run_id = %run.id))]
    pub(crate) async fn run_prepare(
        &self,
        run: &HandlerRun,
        workflow: &Workflow,
        config: &WorkflowConfig,
    ) -> Result<(), EngineError> {
        if !config.consumers.contains_key(&run.handler_name) {
            let err = ClassifiedError::internal(format!(
                "consumer {:?} is not in the active config",
                run.handler_name
            ));
            self.close(run, err).await?;
            return Ok(());
        }

        let script = match self.load_script(workflow).await {
            Ok(script) => script,
            Err(err) => {
                self.close(run, err).await?;
                return Ok(());
            }
        };

        let prev_state = self
            .store
            .get_handler_state(workflow.id, &run.handler_name)
            .await?
            .map(|s| s.state)
            .unwrap_or(serde_json::Value::Null);

        let dispatcher = self.dispatcher(run, workflow, config, PhaseTag::Prepare);
        let entrypoint = format!("workflow.consumers.{}.prepare(__state__)", run.handler_name);
        let req = EvalRequest::new(
            script.code,
            entrypoint,
            prev_state,
            PhaseTag::Prepare,
            self.cancel.clone(),
        );
        let outcome = self.evaluator.eval(req, dispatcher).await;
        let costs = RunCosts {
            cost_delta: outcome.cost_milli_cents,
            logs: outcome.logs.clone(),
        };

        if !outcome.ok {
            let err = outcome.error.unwrap_or_else(|| {
                ClassifiedError::internal("evaluator returned failure without an error")
            });
            self.close_with_costs(run, err, costs).await?;
            return Ok(());
        }

        let raw = outcome.result.unwrap_or(serde_json::Value::Null);
        let prepared = match PrepareResult::parse(&raw) {
            Ok(prepared) => prepared,
            Err(err) => {
                self.close_with_costs(run, err, costs).await?;
                return Ok(());
            }
        };

        let now = Utc::now();
        let wake = clamp_wake_at(prepared.wake_at, now);
        let stored = serde_json::to_value(&prepared)
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))?;

        let transition = self
            .emm
            .update_consumer_phase(
                run.id,
                RunPhase::Prepared,
                PhaseOpts {
                    reservations: prepared.reservations.clone(),
                    prepare_result: Some(stored),
                    wake: Some(wake),
                    cost_delta: costs.cost_delta,
                    logs: costs.logs,
                },
            )
            .await;

        match transition {
            Ok(_) => {
                self.sched.set_wake_at(workflow.id, &run.handler_name, wake);
                Ok(())
            }
            Err(EngineError::Reservation(msg)) => {
                // The script named events that are not pending. That is a
                // script bug, not an engine fault.
                let err = ClassifiedError::logic(format!("prepare reserved unavailable events: {msg}"));
                self.close(run, err).await?;
                Ok(())
            }
            Err(other) => Err(other),
        }
    }

    /// Consumer `prepared`: nothing reserved means nothing to do — commit
    /// and clear the dirty flag. Reservations mean the topic may hold more
    /// work, so dirty stays set and the run moves toward mutate.
    #[instrument(skip(self), fields(run_id = %run.id))]
    pub(crate) async fn run_prepared(&self, run: &HandlerRun) -> Result<(), EngineError> {
        let prepared = match self.stored_prepare_result(run) {
            Ok(prepared) => prepared,
            Err(err) => {
                self.close(run, err).await?;
                return Ok(());
            }
        };

        if prepared.has_reservations() {
            self.emm
                .update_consumer_phase(run.id, RunPhase::Mutating, Default::default())
                .await?;
        } else {
            self.emm
                .commit_consumer(run.id, CommitConsumer::default())
                .await?;
            self.sched
                .on_consumer_commit(run.workflow_id, &run.handler_name, false);
            debug!(run_id = %run.id, "consumer committed with no reservations");
        }
        Ok(())
    }

    /// Consumer `mutating`: run the mutate function. The dispatcher owns
    /// the mutation lifecycle; this handler interprets what is left in the
    /// store afterwards.
    #[instrument(skip(self, workflow, config), fields(run_id = %run.id))]
    pub(crate) async fn run_mutating(
        &self,
        run: &HandlerRun,
        workflow: &Workflow,
        config: &WorkflowConfig,
    ) -> Result<(), EngineError> {
        let Some(consumer) = config.consumers.get(&run.handler_name) else {
            let err = ClassifiedError::internal(format!(
                "consumer {:?} is not in the active config",
                run.handler_name
            ));
            self.close(run, err).await?;
            return Ok(());
        };

        if !consumer.has_mutate {
            self.emm
                .update_consumer_phase(run.id, RunPhase::Mutated, Default::default())
                .await?;
            return Ok(());
        }

        let script = match self.load_script(workflow).await {
            Ok(script) => script,
            Err(err) => {
                self.close(run, err).await?;
                return Ok(());
            }
        };

        let prepare_result = run
            .prepare_result
            .clone()
            .unwrap_or(serde_json::Value::Null);
        let dispatcher = self.dispatcher(run, workflow, config, PhaseTag::Mutate);
        let entrypoint = format!("workflow.consumers.{}.mutate(__state__)", run.handler_name);
        let req = EvalRequest::new(
            script.code,
            entrypoint,
            prepare_result,
            PhaseTag::Mutate,
            self.cancel.clone(),
        );
        let outcome = self.evaluator.eval(req, dispatcher).await;
        let costs = RunCosts {
            cost_delta: outcome.cost_milli_cents,
            logs: outcome.logs,
        };

        if outcome.ok {
            // Mutate returned without applying a mutation (read-only work
            // or no tool call at all).
            self.emm
                .update_consumer_phase(
                    run.id,
                    RunPhase::Mutated,
                    PhaseOpts {
                        cost_delta: costs.cost_delta,
                        logs: costs.logs,
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(());
        }

        if outcome.aborted_by_mutation {
            // apply_mutation already advanced the phase to mutated in the
            // same transaction that settled the mutation; verify and keep
            // the accounting.
            let mutation = self.store.find_mutation_for_run(run.id).await?;
            if mutation.is_some_and(|m| m.status == MutationStatus::Applied) {
                self.emm.accrue_run_costs(run.id, costs).await?;
                return Ok(());
            }
            let err = ClassifiedError::internal(
                "evaluation aborted for a mutation that is not applied",
            );
            self.close_with_costs(run, err, costs).await?;
            return Ok(());
        }

        let err = outcome.error.unwrap_or_else(|| {
            ClassifiedError::internal("evaluator returned failure without an error")
        });

        // The canonical mutation row decides between a plain failure and a
        // reconciliation pause.
        let mutation = self.store.find_mutation_for_run(run.id).await?;
        let unresolved = mutation.as_ref().is_some_and(|m| {
            matches!(
                m.status,
                MutationStatus::NeedsReconcile | MutationStatus::Indeterminate
            )
        });
        if unresolved {
            self.emm
                .update_handler_run_status(
                    run.id,
                    millrun_core::model::RunStatus::PausedReconciliation,
                    Some(err),
                    costs,
                )
                .await?;
        } else {
            self.close_with_costs(run, err, costs).await?;
        }
        Ok(())
    }

    /// Consumer `emitting`: run next (when declared) with the prepare
    /// result and the mutation outcome, then commit — consuming reserved
    /// events and persisting the returned state atomically
    #[instrument(skip(self, workflow, config), fields(run_id = %run.id))]
    pub(crate) async fn run_emitting(
        &self,
        run: &HandlerRun,
        workflow: &Workflow,
        config: &WorkflowConfig,
    ) -> Result<(), EngineError> {
        let Some(consumer) = config.consumers.get(&run.handler_name) else {
            let err = ClassifiedError::internal(format!(
                "consumer {:?} is not in the active config",
                run.handler_name
            ));
            self.close(run, err).await?;
            return Ok(());
        };

        let prepared = match self.stored_prepare_result(run) {
            Ok(prepared) => prepared,
            Err(err) => {
                self.close(run, err).await?;
                return Ok(());
            }
        };
        let had_reservations = prepared.has_reservations();

        if !consumer.has_next {
            self.emm
                .commit_consumer(run.id, CommitConsumer::default())
                .await?;
            self.sched
                .on_consumer_commit(workflow.id, &run.handler_name, had_reservations);
            return Ok(());
        }

        let script = match self.load_script(workflow).await {
            Ok(script) => script,
            Err(err) => {
                self.close(run, err).await?;
                return Ok(());
            }
        };

        let mutation_result = match self.find_mutation_in_chain(run).await? {
            Some(mutation) => mutation.result_for_next(),
            None => serde_json::json!({ "status": "none" }),
        };

        let dispatcher = self.dispatcher(run, workflow, config, PhaseTag::Next);
        let entrypoint = format!(
            "workflow.consumers.{}.next(__state__, __mutation__)",
            run.handler_name
        );
        let req = EvalRequest::new(
            script.code,
            entrypoint,
            run.prepare_result.clone().unwrap_or(serde_json::Value::Null),
            PhaseTag::Next,
            self.cancel.clone(),
        )
        .with_extra(mutation_result);
        let outcome = self.evaluator.eval(req, dispatcher).await;
        let costs = RunCosts {
            cost_delta: outcome.cost_milli_cents,
            logs: outcome.logs,
        };

        if outcome.ok {
            self.emm
                .commit_consumer(
                    run.id,
                    CommitConsumer {
                        new_state: Some(outcome.result.unwrap_or(serde_json::Value::Null)),
                        cost_delta: costs.cost_delta,
                        logs: costs.logs,
                    },
                )
                .await?;
            self.sched
                .on_consumer_commit(workflow.id, &run.handler_name, had_reservations);
        } else {
            let err = outcome.error.unwrap_or_else(|| {
                ClassifiedError::internal("evaluator returned failure without an error")
            });
            self.close_with_costs(run, err, costs).await?;
        }
        Ok(())
    }
}
