//! Producer phase handler

use std::sync::Arc;

use chrono::Utc;
use tracing::{instrument, warn};

use millrun_core::config::WorkflowConfig;
use millrun_core::error::ClassifiedError;
use millrun_core::model::{HandlerRun, Workflow};
use millrun_core::sandbox::EvalRequest;
use millrun_core::tool::PhaseTag;
use millrun_store::Store;

use crate::emm::{CommitProducer, RunCosts};
use crate::error::EngineError;
use crate::tools::{DispatchContext, EngineDispatcher};

use super::HandlerMachine;

impl<S: Store> HandlerMachine<S> {
    /// Producer `executing`: evaluate the handler body, then commit state,
    /// schedule advancement and session accounting in one transaction
    #[instrument(skip(self, workflow, config), fields(run_id = %run.id))]
    pub(crate) async fn run_producer(
        &self,
        run: &HandlerRun,
        workflow: &Workflow,
        config: &WorkflowConfig,
    ) -> Result<(), EngineError> {
        let Some(producer) = config.producers.get(&run.handler_name) else {
            let err = ClassifiedError::internal(format!(
                "producer {:?} is not in the active config",
                run.handler_name
            ));
            self.close(run, err).await?;
            return Ok(());
        };

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

        let dispatcher = Arc::new(EngineDispatcher::new(
            Arc::clone(&self.emm),
            Arc::clone(&self.ledger),
            Arc::clone(&self.tools),
            Arc::clone(&self.reconcile),
            config.clone(),
            DispatchContext {
                workflow_id: workflow.id,
                run_id: run.id,
                handler_name: run.handler_name.clone(),
                phase: PhaseTag::Producer,
            },
        ));

        let entrypoint = format!("workflow.producers.{}.handler(__state__)", run.handler_name);
        let req = EvalRequest::new(
            script.code,
            entrypoint,
            prev_state,
            PhaseTag::Producer,
            self.cancel.clone(),
        );
        let outcome = self.evaluator.eval(req, dispatcher).await;

        if outcome.ok {
            let now = Utc::now();
            let next_run_at = match producer.schedule.next_after(now) {
                Ok(at) => Some(at),
                Err(err) => {
                    warn!(run_id = %run.id, %err, "schedule advance failed");
                    None
                }
            };
            self.emm
                .commit_producer(
                    run.id,
                    CommitProducer {
                        new_state: Some(outcome.result.unwrap_or(serde_json::Value::Null)),
                        next_run_at,
                        cost_delta: outcome.cost_milli_cents,
                        logs: outcome.logs,
                    },
                )
                .await?;
            self.sched.on_producer_commit(workflow.id, &run.handler_name);
        } else {
            let err = outcome.error.unwrap_or_else(|| {
                ClassifiedError::internal("evaluator returned failure without an error")
            });
            self.close_with_costs(
                run,
                err,
                RunCosts {
                    cost_delta: outcome.cost_milli_cents,
                    logs: outcome.logs,
                },
            )
            .await?;
        }
        Ok(())
    }
}
