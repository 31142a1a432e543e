//! Event and input ledgers
//!
//! Publication is idempotent on `(workflow, topic, message_id)`; the first
//! payload wins and a duplicate is a no-op. Producer-phase publishes carry
//! the causal edge to the input record registered in the same phase;
//! next-phase publishes inherit the union of the causes of every event the
//! run reserved. The causal chain is read-only from the engine's
//! perspective but queryable for the UI.

use std::sync::Arc;

use tracing::{debug, instrument};
use uuid::Uuid;

use millrun_core::config::WorkflowConfig;
use millrun_core::error::ClassifiedError;
use millrun_core::model::{Event, EventStatus, HandlerKind, InputRecord};
use millrun_store::Store;

use crate::error::EngineError;
use crate::sched::SchedulerState;

/// Outcome of a publish call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    /// The `(workflow, topic, message_id)` triple already existed
    Duplicate,
}

/// One message to publish
#[derive(Debug, Clone)]
pub struct PublishMessage {
    pub topic: String,
    pub message_id: String,
    pub title: Option<String>,
    pub payload: serde_json::Value,
}

/// The pub/sub and input ledgers
pub struct Ledger<S: Store> {
    store: Arc<S>,
    sched: Arc<SchedulerState>,
}

impl<S: Store> Ledger<S> {
    pub fn new(store: Arc<S>, sched: Arc<SchedulerState>) -> Self {
        Self { store, sched }
    }

    /// Publish from a producer handler. The producer must have registered
    /// the causing input in the same phase; `caused_by` is exactly that
    /// input.
    #[instrument(skip(self, config, msg))]
    pub async fn publish_from_producer(
        &self,
        workflow_id: Uuid,
        config: &WorkflowConfig,
        handler_name: &str,
        input_id: Uuid,
        msg: PublishMessage,
    ) -> Result<PublishOutcome, ClassifiedError> {
        self.check_declared(config, HandlerKind::Producer, handler_name, &msg.topic)?;
        self.insert(workflow_id, config, msg, vec![input_id]).await
    }

    /// Publish from a consumer's next phase. `caused_by` is computed as
    /// the union of the causes of every event this run reserved.
    #[instrument(skip(self, config, msg))]
    pub async fn publish_from_next(
        &self,
        workflow_id: Uuid,
        config: &WorkflowConfig,
        handler_name: &str,
        run_id: Uuid,
        msg: PublishMessage,
    ) -> Result<PublishOutcome, ClassifiedError> {
        self.check_declared(config, HandlerKind::Consumer, handler_name, &msg.topic)?;

        let reserved: Vec<Event> = self
            .store
            .list_events(workflow_id, None, Some(EventStatus::Reserved))
            .await
            .map_err(|e| ClassifiedError::internal(e.to_string()))?
            .into_iter()
            .filter(|e| e.reserved_by == Some(run_id))
            .collect();

        let mut caused_by: Vec<Uuid> = Vec::new();
        for event in &reserved {
            for cause in &event.caused_by {
                if !caused_by.contains(cause) {
                    caused_by.push(*cause);
                }
            }
        }

        self.insert(workflow_id, config, msg, caused_by).await
    }

    /// Register an external fact. Idempotent: re-registering returns the
    /// original record's id.
    #[instrument(skip(self))]
    pub async fn register_input(
        &self,
        workflow_id: Uuid,
        run_id: Uuid,
        source: &str,
        kind: &str,
        external_id: &str,
        title: Option<String>,
    ) -> Result<Uuid, EngineError> {
        let mut record = InputRecord::new(workflow_id, source, kind, external_id, run_id);
        record.title = title;

        let mut tx = self.store.begin().await?;
        let id = tx.upsert_input(&record).await?;
        tx.commit().await?;
        debug!(%workflow_id, %id, source, external_id, "input registered");
        Ok(id)
    }

    /// Pending events on a topic, in publish order (prepare-phase peek)
    pub async fn pending_events(
        &self,
        workflow_id: Uuid,
        topic: &str,
        limit: usize,
    ) -> Result<Vec<Event>, EngineError> {
        let mut events = self
            .store
            .list_events(workflow_id, Some(topic), Some(EventStatus::Pending))
            .await?;
        events.truncate(limit);
        Ok(events)
    }

    /// The input records an event is causally downstream of
    pub async fn causal_inputs(&self, event: &Event) -> Result<Vec<InputRecord>, EngineError> {
        let mut inputs = Vec::with_capacity(event.caused_by.len());
        for id in &event.caused_by {
            inputs.push(self.store.get_input(*id).await?);
        }
        Ok(inputs)
    }

    fn check_declared(
        &self,
        config: &WorkflowConfig,
        kind: HandlerKind,
        handler_name: &str,
        topic: &str,
    ) -> Result<(), ClassifiedError> {
        if !config.may_publish(kind, handler_name, topic) {
            return Err(ClassifiedError::logic(format!(
                "{kind} {handler_name:?} may not publish to topic {topic:?}"
            )));
        }
        Ok(())
    }

    async fn insert(
        &self,
        workflow_id: Uuid,
        config: &WorkflowConfig,
        msg: PublishMessage,
        caused_by: Vec<Uuid>,
    ) -> Result<PublishOutcome, ClassifiedError> {
        let mut event = Event::pending(
            workflow_id,
            msg.topic.clone(),
            msg.message_id,
            msg.payload,
            caused_by,
        );
        event.title = msg.title;

        let mut tx = self
            .store
            .begin()
            .await
            .map_err(|e| ClassifiedError::internal(e.to_string()))?;
        let inserted = tx
            .insert_event(&event)
            .await
            .map_err(|e| ClassifiedError::internal(e.to_string()))?;
        tx.commit()
            .await
            .map_err(|e| ClassifiedError::internal(e.to_string()))?;

        if inserted {
            self.sched.on_event_publish(workflow_id, &msg.topic, config);
            debug!(%workflow_id, topic = %msg.topic, "event published");
            Ok(PublishOutcome::Published)
        } else {
            debug!(%workflow_id, topic = %msg.topic, "duplicate publish ignored");
            Ok(PublishOutcome::Duplicate)
        }
    }
}
