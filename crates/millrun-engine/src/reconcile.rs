//! Mutation reconciliation registry
//!
//! When a mutation's outcome is uncertain (timeout, 5xx, connection reset
//! while in flight), the engine asks the tool's reconciler — a pure read
//! against the external system keyed on the idempotency key or the call
//! params — whether the effect exists. A tool without a reconciler makes
//! every uncertain outcome indeterminate, i.e. a question for the user.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use millrun_core::error::ClassifiedError;
use millrun_core::model::Mutation;

/// Verdict of a reconcile probe
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileVerdict {
    /// The effect exists externally; carry its result if recoverable
    Applied(Option<serde_json::Value>),

    /// The effect definitely does not exist
    Failed(String),

    /// Could not tell right now; probe again later
    Retry,
}

/// A per-tool reconcile probe
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    async fn reconcile(&self, mutation: &Mutation) -> Result<ReconcileVerdict, ClassifiedError>;
}

/// Registry of reconcilers keyed by `(namespace, method)`
#[derive(Default)]
pub struct ReconciliationRegistry {
    hooks: RwLock<HashMap<(String, String), Arc<dyn Reconciler>>>,
}

impl ReconciliationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        namespace: impl Into<String>,
        method: impl Into<String>,
        reconciler: Arc<dyn Reconciler>,
    ) {
        self.hooks
            .write()
            .insert((namespace.into(), method.into()), reconciler);
    }

    pub fn get(&self, namespace: &str, method: &str) -> Option<Arc<dyn Reconciler>> {
        self.hooks
            .read()
            .get(&(namespace.to_string(), method.to_string()))
            .cloned()
    }
}
