//! Tool dispatch
//!
//! Every tool call made by user code funnels through one
//! [`EngineDispatcher`] bound to the evaluating run. The dispatcher
//! enforces phase rules, routes the built-in ledger tools, and runs the
//! mutation lifecycle for side-effecting tools: durably `in_flight`
//! before the effect, `applied`/`failed` after, reconcile consultation on
//! uncertainty, and the cooperative mutate-abort once an effect exists.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use millrun_core::config::WorkflowConfig;
use millrun_core::error::{ClassifiedError, ErrorKind};
use millrun_core::model::{MutationStatus, ResolvedBy};
use millrun_core::tool::{PhaseTag, Tool, ToolCallError, ToolDispatcher};
use millrun_store::Store;

use crate::emm::{CreateMutation, Emm};
use crate::error::EngineError;
use crate::ledger::{Ledger, PublishMessage};
use crate::reconcile::{ReconcileVerdict, ReconciliationRegistry};

/// Names of the engine-provided ledger tools
pub mod builtins {
    pub const EVENTS_NS: &str = "events";
    pub const PUBLISH: &str = "publish";
    pub const PEEK: &str = "peek";
    pub const INPUTS_NS: &str = "inputs";
    pub const REGISTER: &str = "register";
}

/// Registry of connector tools keyed by `(namespace, name)`
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<(String, String), Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tool: Arc<dyn Tool>) {
        let key = (tool.namespace().to_string(), tool.name().to_string());
        self.tools.write().insert(key, tool);
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .read()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }
}

/// What the dispatcher needs to know about the evaluating run
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub workflow_id: Uuid,
    pub run_id: Uuid,
    pub handler_name: String,
    pub phase: PhaseTag,
}

/// The per-evaluation tool dispatcher
pub struct EngineDispatcher<S: Store> {
    emm: Arc<Emm<S>>,
    ledger: Arc<Ledger<S>>,
    registry: Arc<ToolRegistry>,
    reconcile: Arc<ReconciliationRegistry>,
    config: WorkflowConfig,
    ctx: DispatchContext,
}

impl<S: Store> EngineDispatcher<S> {
    pub fn new(
        emm: Arc<Emm<S>>,
        ledger: Arc<Ledger<S>>,
        registry: Arc<ToolRegistry>,
        reconcile: Arc<ReconciliationRegistry>,
        config: WorkflowConfig,
        ctx: DispatchContext,
    ) -> Self {
        Self {
            emm,
            ledger,
            registry,
            reconcile,
            config,
            ctx,
        }
    }

    async fn publish(&self, params: serde_json::Value) -> Result<serde_json::Value, ToolCallError> {
        #[derive(Deserialize)]
        struct PublishParams {
            topic: String,
            #[serde(rename = "messageId")]
            message_id: String,
            #[serde(default)]
            title: Option<String>,
            #[serde(default)]
            payload: serde_json::Value,
            #[serde(rename = "inputId", default)]
            input_id: Option<Uuid>,
        }

        if !self.ctx.phase.may_publish() {
            return Err(ToolCallError::logic(format!(
                "events.publish is not available in the {} phase",
                self.ctx.phase
            )));
        }

        let params: PublishParams = serde_json::from_value(params)
            .map_err(|e| ToolCallError::logic(format!("malformed publish params: {e}")))?;
        let msg = PublishMessage {
            topic: params.topic,
            message_id: params.message_id,
            title: params.title,
            payload: params.payload,
        };

        let outcome = match self.ctx.phase {
            PhaseTag::Producer => {
                let input_id = params.input_id.ok_or_else(|| {
                    ToolCallError::logic(
                        "producer publishes must carry the inputId returned by inputs.register",
                    )
                })?;
                self.ledger
                    .publish_from_producer(
                        self.ctx.workflow_id,
                        &self.config,
                        &self.ctx.handler_name,
                        input_id,
                        msg,
                    )
                    .await?
            }
            PhaseTag::Next => {
                if params.input_id.is_some() {
                    return Err(ToolCallError::logic(
                        "next-phase publishes derive causality from reserved events; \
                         inputId is not accepted",
                    ));
                }
                self.ledger
                    .publish_from_next(
                        self.ctx.workflow_id,
                        &self.config,
                        &self.ctx.handler_name,
                        self.ctx.run_id,
                        msg,
                    )
                    .await?
            }
            PhaseTag::Prepare | PhaseTag::Mutate => unreachable!("checked above"),
        };

        Ok(serde_json::json!({
            "published": outcome == crate::ledger::PublishOutcome::Published
        }))
    }

    async fn peek(&self, params: serde_json::Value) -> Result<serde_json::Value, ToolCallError> {
        #[derive(Deserialize)]
        struct PeekParams {
            topic: String,
            #[serde(default = "default_peek_limit")]
            limit: usize,
        }
        fn default_peek_limit() -> usize {
            50
        }

        let params: PeekParams = serde_json::from_value(params)
            .map_err(|e| ToolCallError::logic(format!("malformed peek params: {e}")))?;
        if !self.config.topics.iter().any(|t| t == &params.topic) {
            return Err(ToolCallError::logic(format!(
                "unknown topic {:?}",
                params.topic
            )));
        }

        let events = self
            .ledger
            .pending_events(self.ctx.workflow_id, &params.topic, params.limit)
            .await
            .map_err(engine_to_tool_err)?;
        let out: Vec<serde_json::Value> = events
            .iter()
            .map(|e| {
                serde_json::json!({
                    "messageId": e.message_id,
                    "title": e.title,
                    "payload": e.payload,
                })
            })
            .collect();
        Ok(serde_json::Value::Array(out))
    }

    async fn register_input(
        &self,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, ToolCallError> {
        #[derive(Deserialize)]
        struct RegisterParams {
            source: String,
            #[serde(rename = "type")]
            kind: String,
            id: String,
            #[serde(default)]
            title: Option<String>,
        }

        if self.ctx.phase != PhaseTag::Producer {
            return Err(ToolCallError::logic(
                "inputs.register is only available in the producer phase",
            ));
        }
        let params: RegisterParams = serde_json::from_value(params)
            .map_err(|e| ToolCallError::logic(format!("malformed register params: {e}")))?;

        let input_id = self
            .ledger
            .register_input(
                self.ctx.workflow_id,
                self.ctx.run_id,
                &params.source,
                &params.kind,
                &params.id,
                params.title,
            )
            .await
            .map_err(engine_to_tool_err)?;
        Ok(serde_json::json!({ "inputId": input_id }))
    }

    /// The mutation lifecycle around a side-effecting tool call
    #[instrument(skip(self, tool, params), fields(run_id = %self.ctx.run_id))]
    async fn run_mutation(
        &self,
        tool: Arc<dyn Tool>,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, ToolCallError> {
        if !self.ctx.phase.may_mutate() {
            return Err(ToolCallError::logic(format!(
                "{}.{} mutates external state and may only be called in mutate",
                tool.namespace(),
                tool.name()
            )));
        }

        let idempotency_key = tool.idempotency_key(&params);
        let mutation = self
            .emm
            .create_mutation(
                self.ctx.run_id,
                CreateMutation {
                    tool_namespace: tool.namespace().to_string(),
                    tool_method: tool.name().to_string(),
                    params: params.clone(),
                    idempotency_key,
                },
            )
            .await
            .map_err(|e| match e {
                EngineError::InvariantViolation(msg) => ToolCallError::logic(msg),
                other => ToolCallError::internal(other.to_string()),
            })?;

        match tool.execute(params).await {
            Ok(result) => {
                self.emm
                    .apply_mutation(mutation.id, Some(result), ResolvedBy::Engine)
                    .await
                    .map_err(|e| ToolCallError::internal(e.to_string()))?;
                // Anything the mutate function would do after this point is
                // an uncontrolled side effect; abort the evaluation.
                Err(ToolCallError::MutationTerminated)
            }
            Err(err) if is_definite_failure(err.kind) => {
                self.emm
                    .fail_mutation(mutation.id, &err.message, ResolvedBy::Engine)
                    .await
                    .map_err(|e| ToolCallError::internal(e.to_string()))?;
                Err(ToolCallError::Classified(err))
            }
            Err(err) => {
                // Uncertain: the request may have landed. Ask the tool's
                // reconciler; without one the user has to decide.
                self.settle_uncertain(mutation.id, &err).await?;
                Err(ToolCallError::Classified(err))
            }
        }
    }

    async fn settle_uncertain(
        &self,
        mutation_id: Uuid,
        cause: &ClassifiedError,
    ) -> Result<(), ToolCallError> {
        let mutation = self
            .emm
            .store()
            .get_mutation(mutation_id)
            .await
            .map_err(|e| ToolCallError::internal(e.to_string()))?;

        let Some(hook) = self
            .reconcile
            .get(&mutation.tool_namespace, &mutation.tool_method)
        else {
            warn!(%mutation_id, "no reconciler; mutation indeterminate");
            self.emm
                .update_mutation_status(mutation_id, MutationStatus::Indeterminate)
                .await
                .map_err(|e| ToolCallError::internal(e.to_string()))?;
            return Ok(());
        };

        match hook.reconcile(&mutation).await {
            Ok(ReconcileVerdict::Applied(result)) => {
                self.emm
                    .apply_mutation(mutation_id, result, ResolvedBy::Reconcile)
                    .await
                    .map_err(|e| ToolCallError::internal(e.to_string()))?;
                // Effect exists after all: abort further user code.
                Err(ToolCallError::MutationTerminated)
            }
            Ok(ReconcileVerdict::Failed(reason)) => {
                debug!(%mutation_id, reason, "reconcile: effect does not exist");
                self.emm
                    .fail_mutation(mutation_id, &cause.message, ResolvedBy::Reconcile)
                    .await
                    .map_err(|e| ToolCallError::internal(e.to_string()))?;
                Ok(())
            }
            Ok(ReconcileVerdict::Retry) => {
                self.emm
                    .update_mutation_status(mutation_id, MutationStatus::NeedsReconcile)
                    .await
                    .map_err(|e| ToolCallError::internal(e.to_string()))?;
                Ok(())
            }
            Err(probe_err) => {
                warn!(%mutation_id, error = %probe_err, "reconcile probe failed");
                self.emm
                    .update_mutation_status(mutation_id, MutationStatus::Indeterminate)
                    .await
                    .map_err(|e| ToolCallError::internal(e.to_string()))?;
                Ok(())
            }
        }
    }
}

/// Definite failures: the external system rejected the request before any
/// effect could exist
fn is_definite_failure(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::Logic
            | ErrorKind::Auth
            | ErrorKind::Permission
            | ErrorKind::Balance
            | ErrorKind::ApiKey
    )
}

fn engine_to_tool_err(err: EngineError) -> ToolCallError {
    ToolCallError::internal(err.to_string())
}

#[async_trait]
impl<S: Store> ToolDispatcher for EngineDispatcher<S> {
    async fn call(
        &self,
        namespace: &str,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, ToolCallError> {
        match (namespace, method) {
            (builtins::EVENTS_NS, builtins::PUBLISH) => self.publish(params).await,
            (builtins::EVENTS_NS, builtins::PEEK) => self.peek(params).await,
            (builtins::INPUTS_NS, builtins::REGISTER) => self.register_input(params).await,
            _ => {
                let Some(tool) = self.registry.get(namespace, method) else {
                    return Err(ToolCallError::logic(format!(
                        "unknown tool {namespace}.{method}"
                    )));
                };
                if tool.read_only() {
                    tool.execute(params).await.map_err(ToolCallError::Classified)
                } else {
                    self.run_mutation(tool, params).await
                }
            }
        }
    }
}
