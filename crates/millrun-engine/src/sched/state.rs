//! In-memory scheduler signals
//!
//! Per consumer: `dirty` ("may have work") and a cached `wake_at`. Per
//! producer: `queued` ("schedule fired while the workflow was busy").
//! These are hints layered over the store — losing them costs one idle
//! prepare per consumer, never correctness — so they live behind short
//! critical sections owned by this struct.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::trace;
use uuid::Uuid;

use millrun_core::config::WorkflowConfig;

#[derive(Debug, Default, Clone)]
struct ConsumerSignal {
    dirty: bool,
    wake_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Clone)]
struct ProducerSignal {
    queued: bool,
}

#[derive(Debug, Default)]
struct WorkflowSignals {
    consumers: HashMap<String, ConsumerSignal>,
    producers: HashMap<String, ProducerSignal>,
}

/// The scheduler's in-memory dirty/queued/wake indices
#[derive(Default)]
pub struct SchedulerState {
    inner: RwLock<HashMap<Uuid, WorkflowSignals>>,
}

impl SchedulerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether this workflow has in-memory signals at all (when absent,
    /// callers fall back to store queries)
    pub fn is_tracked(&self, workflow_id: Uuid) -> bool {
        self.inner.read().contains_key(&workflow_id)
    }

    /// Seed signals for a (re)deployed workflow: every consumer dirty —
    /// the next prepare will discover whether there is actually work —
    /// and wake-ats loaded from the given map.
    pub fn initialize_for_workflow(
        &self,
        workflow_id: Uuid,
        config: &WorkflowConfig,
        wake_ats: &HashMap<String, DateTime<Utc>>,
    ) {
        let mut inner = self.inner.write();
        let signals = inner.entry(workflow_id).or_default();
        signals.consumers.clear();
        signals.producers.clear();
        for name in config.consumers.keys() {
            signals.consumers.insert(
                name.clone(),
                ConsumerSignal {
                    dirty: true,
                    wake_at: wake_ats.get(name).copied(),
                },
            );
        }
        for name in config.producers.keys() {
            signals
                .producers
                .insert(name.clone(), ProducerSignal::default());
        }
        trace!(%workflow_id, "scheduler state initialized");
    }

    pub fn remove_workflow(&self, workflow_id: Uuid) {
        self.inner.write().remove(&workflow_id);
    }

    /// An event landed on `topic`: every subscribed consumer may have work
    pub fn on_event_publish(&self, workflow_id: Uuid, topic: &str, config: &WorkflowConfig) {
        let mut inner = self.inner.write();
        let signals = inner.entry(workflow_id).or_default();
        for name in config.consumers_subscribing(topic) {
            signals
                .consumers
                .entry(name.to_string())
                .or_default()
                .dirty = true;
        }
    }

    /// A consumer committed. Clear dirty only when it reserved nothing —
    /// reservations mean the topic may hold more pending events, so the
    /// session loop must re-enter prepare.
    pub fn on_consumer_commit(&self, workflow_id: Uuid, consumer: &str, had_reservations: bool) {
        if had_reservations {
            return;
        }
        let mut inner = self.inner.write();
        if let Some(signals) = inner.get_mut(&workflow_id) {
            if let Some(sig) = signals.consumers.get_mut(consumer) {
                sig.dirty = false;
            }
        }
    }

    pub fn set_wake_at(
        &self,
        workflow_id: Uuid,
        consumer: &str,
        wake_at: Option<DateTime<Utc>>,
    ) {
        let mut inner = self.inner.write();
        let signals = inner.entry(workflow_id).or_default();
        signals
            .consumers
            .entry(consumer.to_string())
            .or_default()
            .wake_at = wake_at;
    }

    /// A producer schedule fired while the workflow was busy
    pub fn set_producer_queued(&self, workflow_id: Uuid, producer: &str) {
        let mut inner = self.inner.write();
        let signals = inner.entry(workflow_id).or_default();
        signals
            .producers
            .entry(producer.to_string())
            .or_default()
            .queued = true;
    }

    pub fn on_producer_commit(&self, workflow_id: Uuid, producer: &str) {
        let mut inner = self.inner.write();
        if let Some(signals) = inner.get_mut(&workflow_id) {
            if let Some(sig) = signals.producers.get_mut(producer) {
                sig.queued = false;
            }
        }
    }

    /// Dirty or wake-due signal for one consumer
    pub fn consumer_ready(&self, workflow_id: Uuid, consumer: &str, now: DateTime<Utc>) -> bool {
        let inner = self.inner.read();
        inner
            .get(&workflow_id)
            .and_then(|s| s.consumers.get(consumer))
            .is_some_and(|sig| sig.dirty || sig.wake_at.is_some_and(|at| at <= now))
    }

    pub fn any_consumer_ready(&self, workflow_id: Uuid, now: DateTime<Utc>) -> bool {
        let inner = self.inner.read();
        inner.get(&workflow_id).is_some_and(|s| {
            s.consumers
                .values()
                .any(|sig| sig.dirty || sig.wake_at.is_some_and(|at| at <= now))
        })
    }

    pub fn any_producer_queued(&self, workflow_id: Uuid) -> bool {
        let inner = self.inner.read();
        inner
            .get(&workflow_id)
            .is_some_and(|s| s.producers.values().any(|sig| sig.queued))
    }

    pub fn queued_producers(&self, workflow_id: Uuid) -> Vec<String> {
        let inner = self.inner.read();
        inner
            .get(&workflow_id)
            .map(|s| {
                s.producers
                    .iter()
                    .filter(|(_, sig)| sig.queued)
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}
