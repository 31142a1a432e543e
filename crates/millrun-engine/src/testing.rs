//! Test fixtures: a scripted evaluator and programmable tools
//!
//! The real sandbox lives outside this crate; tests drive the engine with
//! a `ScriptedEvaluator` that maps entry expressions to programmed
//! behaviors, popped one per evaluation. Tools are `TestTool`s with
//! outcome queues and call counters, which is what the at-most-once
//! properties assert against.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use millrun_core::error::ClassifiedError;
use millrun_core::model::Mutation;
use millrun_core::sandbox::{EvalOutcome, EvalRequest, Evaluator};
use millrun_core::tool::{Tool, ToolCallError, ToolDispatcher};

use crate::reconcile::{ReconcileVerdict, Reconciler};

/// Entry expression the engine uses for a producer handler
pub fn producer_entry(name: &str) -> String {
    format!("workflow.producers.{name}.handler(__state__)")
}

/// Entry expression for a consumer's prepare
pub fn prepare_entry(name: &str) -> String {
    format!("workflow.consumers.{name}.prepare(__state__)")
}

/// Entry expression for a consumer's mutate
pub fn mutate_entry(name: &str) -> String {
    format!("workflow.consumers.{name}.mutate(__state__)")
}

/// Entry expression for a consumer's next
pub fn next_entry(name: &str) -> String {
    format!("workflow.consumers.{name}.next(__state__, __mutation__)")
}

type BehaviorFuture = Pin<Box<dyn Future<Output = EvalOutcome> + Send>>;
type BehaviorFn =
    Arc<dyn Fn(EvalRequest, Arc<dyn ToolDispatcher>) -> BehaviorFuture + Send + Sync>;

#[derive(Default)]
struct EntryBehaviors {
    queue: VecDeque<BehaviorFn>,
    fallback: Option<BehaviorFn>,
}

/// Evaluator that replays programmed behaviors per entry expression
#[derive(Default)]
pub struct ScriptedEvaluator {
    entries: Mutex<HashMap<String, EntryBehaviors>>,
}

impl ScriptedEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a one-shot behavior for an entry expression
    pub fn enqueue<F, Fut>(&self, entrypoint: impl Into<String>, behavior: F)
    where
        F: Fn(EvalRequest, Arc<dyn ToolDispatcher>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = EvalOutcome> + Send + 'static,
    {
        let behavior: BehaviorFn = Arc::new(move |req, tools| Box::pin(behavior(req, tools)));
        self.entries
            .lock()
            .entry(entrypoint.into())
            .or_default()
            .queue
            .push_back(behavior);
    }

    /// Set the behavior used whenever the queue for an entry is empty
    pub fn always<F, Fut>(&self, entrypoint: impl Into<String>, behavior: F)
    where
        F: Fn(EvalRequest, Arc<dyn ToolDispatcher>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = EvalOutcome> + Send + 'static,
    {
        let behavior: BehaviorFn = Arc::new(move |req, tools| Box::pin(behavior(req, tools)));
        self.entries
            .lock()
            .entry(entrypoint.into())
            .or_default()
            .fallback = Some(behavior);
    }

    /// Queue a behavior that simply returns `value`
    pub fn returns(&self, entrypoint: impl Into<String>, value: serde_json::Value) {
        self.enqueue(entrypoint, move |_req, _tools| {
            let value = value.clone();
            async move { EvalOutcome::success(value) }
        });
    }

    /// Set a fallback behavior that always returns `value`
    pub fn always_returns(&self, entrypoint: impl Into<String>, value: serde_json::Value) {
        self.always(entrypoint, move |_req, _tools| {
            let value = value.clone();
            async move { EvalOutcome::success(value) }
        });
    }

    /// Queue a behavior that fails with `error`
    pub fn fails(&self, entrypoint: impl Into<String>, error: ClassifiedError) {
        self.enqueue(entrypoint, move |_req, _tools| {
            let error = error.clone();
            async move { EvalOutcome::failure(error) }
        });
    }

    /// Queue a behavior that calls one tool and translates the dispatcher
    /// outcome the way a real sandbox would — including the cooperative
    /// mutate-abort.
    pub fn calls_tool(
        &self,
        entrypoint: impl Into<String>,
        namespace: &str,
        method: &str,
        params: serde_json::Value,
    ) {
        let namespace = namespace.to_string();
        let method = method.to_string();
        self.enqueue(entrypoint, move |_req, tools| {
            let namespace = namespace.clone();
            let method = method.clone();
            let params = params.clone();
            async move { call_and_translate(&*tools, &namespace, &method, params).await }
        });
    }
}

/// Drive one tool call and fold the result into an [`EvalOutcome`]
pub async fn call_and_translate(
    tools: &dyn ToolDispatcher,
    namespace: &str,
    method: &str,
    params: serde_json::Value,
) -> EvalOutcome {
    match tools.call(namespace, method, params).await {
        Ok(value) => EvalOutcome::success(value),
        Err(ToolCallError::MutationTerminated) => EvalOutcome::mutation_terminated(),
        Err(ToolCallError::Classified(err)) => EvalOutcome::failure(err),
    }
}

#[async_trait]
impl Evaluator for ScriptedEvaluator {
    async fn eval(&self, req: EvalRequest, tools: Arc<dyn ToolDispatcher>) -> EvalOutcome {
        let behavior = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&req.entrypoint) {
                Some(entry) => entry.queue.pop_front().or_else(|| entry.fallback.clone()),
                None => None,
            }
        };
        match behavior {
            Some(behavior) => behavior(req, tools).await,
            None => EvalOutcome::failure(ClassifiedError::internal(format!(
                "no scripted behavior for {:?}",
                req.entrypoint
            ))),
        }
    }
}

/// A connector tool with an outcome queue and an execution counter
pub struct TestTool {
    namespace: String,
    name: String,
    read_only: bool,
    outcomes: Mutex<VecDeque<Result<serde_json::Value, ClassifiedError>>>,
    fallback: Result<serde_json::Value, ClassifiedError>,
    executions: AtomicUsize,
}

impl TestTool {
    pub fn new(namespace: &str, name: &str, read_only: bool) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            read_only,
            outcomes: Mutex::new(VecDeque::new()),
            fallback: Ok(serde_json::json!({"ok": true})),
            executions: AtomicUsize::new(0),
        }
    }

    /// Queue a one-shot outcome
    pub fn push_outcome(&self, outcome: Result<serde_json::Value, ClassifiedError>) {
        self.outcomes.lock().push_back(outcome);
    }

    pub fn with_fallback(
        mut self,
        outcome: Result<serde_json::Value, ClassifiedError>,
    ) -> Self {
        self.fallback = outcome;
        self
    }

    /// How many times `execute` actually ran
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for TestTool {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn idempotency_key(&self, params: &serde_json::Value) -> Option<String> {
        params
            .get("idempotencyKey")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    async fn execute(
        &self,
        _params: serde_json::Value,
    ) -> Result<serde_json::Value, ClassifiedError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        self.outcomes
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// A reconciler with a fixed verdict queue and a probe counter
pub struct TestReconciler {
    verdicts: Mutex<VecDeque<ReconcileVerdict>>,
    fallback: ReconcileVerdict,
    probes: AtomicUsize,
}

impl TestReconciler {
    pub fn new(fallback: ReconcileVerdict) -> Self {
        Self {
            verdicts: Mutex::new(VecDeque::new()),
            fallback,
            probes: AtomicUsize::new(0),
        }
    }

    pub fn push_verdict(&self, verdict: ReconcileVerdict) {
        self.verdicts.lock().push_back(verdict);
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Reconciler for TestReconciler {
    async fn reconcile(
        &self,
        _mutation: &Mutation,
    ) -> Result<ReconcileVerdict, ClassifiedError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .verdicts
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone()))
    }
}
