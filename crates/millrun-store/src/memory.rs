//! In-memory implementation of the store for testing
//!
//! Transactions take a snapshot of the whole state, apply writes to the
//! snapshot, and publish it on commit while holding the store lock. A
//! dropped transaction therefore leaves no trace, which is what the
//! engine's crash tests rely on.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use millrun_core::model::{
    Event, EventStatus, HandlerRun, HandlerState, InputRecord, Mutation, ProducerSchedule, Script,
    ScriptRun, RunStatus, Workflow, WorkflowStatus,
};

use crate::store::{Store, StoreError, StoreTx};

#[derive(Default, Clone)]
struct MemState {
    workflows: HashMap<Uuid, Workflow>,
    scripts: HashMap<Uuid, Script>,
    sessions: HashMap<Uuid, ScriptRun>,
    runs: HashMap<Uuid, HandlerRun>,
    mutations: HashMap<Uuid, Mutation>,
    events: HashMap<Uuid, Event>,
    /// `(workflow_id, topic, message_id)` → event id
    event_keys: HashMap<(Uuid, String, String), Uuid>,
    inputs: HashMap<Uuid, InputRecord>,
    /// `(workflow_id, source, kind, external_id)` → input id
    input_keys: HashMap<(Uuid, String, String, String), Uuid>,
    schedules: HashMap<(Uuid, String), ProducerSchedule>,
    states: HashMap<(Uuid, String), HandlerState>,
    next_seq: i64,
}

impl MemState {
    fn events_sorted(&self, mut pred: impl FnMut(&Event) -> bool) -> Vec<Event> {
        let mut out: Vec<Event> = self.events.values().filter(|e| pred(e)).cloned().collect();
        out.sort_by_key(|e| e.seq);
        out
    }
}

/// In-memory store
///
/// # Example
///
/// ```
/// use millrun_store::MemoryStore;
///
/// let store = MemoryStore::new();
/// ```
pub struct MemoryStore {
    state: Arc<Mutex<MemState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemState::default())),
        }
    }

    /// Number of events across all workflows (for tests)
    pub async fn event_count(&self) -> usize {
        self.state.lock().await.events.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

struct MemTx {
    guard: OwnedMutexGuard<MemState>,
    work: MemState,
}

#[async_trait]
impl StoreTx for MemTx {
    async fn get_workflow(&mut self, id: Uuid) -> Result<Workflow, StoreError> {
        self.work
            .workflows
            .get(&id)
            .cloned()
            .ok_or(StoreError::WorkflowNotFound(id))
    }

    async fn insert_workflow(&mut self, workflow: &Workflow) -> Result<(), StoreError> {
        self.work.workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn update_workflow(&mut self, workflow: &Workflow) -> Result<(), StoreError> {
        if !self.work.workflows.contains_key(&workflow.id) {
            return Err(StoreError::WorkflowNotFound(workflow.id));
        }
        self.work.workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn get_script(&mut self, id: Uuid) -> Result<Script, StoreError> {
        self.work
            .scripts
            .get(&id)
            .cloned()
            .ok_or(StoreError::ScriptNotFound(id))
    }

    async fn insert_script(&mut self, script: &Script) -> Result<(), StoreError> {
        self.work.scripts.insert(script.id, script.clone());
        Ok(())
    }

    async fn latest_script_version(
        &mut self,
        workflow_id: Uuid,
    ) -> Result<Option<(i32, i32)>, StoreError> {
        Ok(self
            .work
            .scripts
            .values()
            .filter(|s| s.workflow_id == workflow_id)
            .map(|s| s.version())
            .max())
    }

    async fn get_session(&mut self, id: Uuid) -> Result<ScriptRun, StoreError> {
        self.work
            .sessions
            .get(&id)
            .cloned()
            .ok_or(StoreError::SessionNotFound(id))
    }

    async fn insert_session(&mut self, session: &ScriptRun) -> Result<(), StoreError> {
        self.work.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn update_session(&mut self, session: &ScriptRun) -> Result<(), StoreError> {
        if !self.work.sessions.contains_key(&session.id) {
            return Err(StoreError::SessionNotFound(session.id));
        }
        self.work.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get_handler_run(&mut self, id: Uuid) -> Result<HandlerRun, StoreError> {
        self.work
            .runs
            .get(&id)
            .cloned()
            .ok_or(StoreError::RunNotFound(id))
    }

    async fn insert_handler_run(&mut self, run: &HandlerRun) -> Result<(), StoreError> {
        self.work.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn update_handler_run(&mut self, run: &HandlerRun) -> Result<(), StoreError> {
        if !self.work.runs.contains_key(&run.id) {
            return Err(StoreError::RunNotFound(run.id));
        }
        self.work.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_mutation(&mut self, id: Uuid) -> Result<Mutation, StoreError> {
        self.work
            .mutations
            .get(&id)
            .cloned()
            .ok_or(StoreError::MutationNotFound(id))
    }

    async fn find_mutation_for_run(
        &mut self,
        run_id: Uuid,
    ) -> Result<Option<Mutation>, StoreError> {
        Ok(self
            .work
            .mutations
            .values()
            .find(|m| m.handler_run_id == run_id)
            .cloned())
    }

    async fn insert_mutation(&mut self, mutation: &Mutation) -> Result<(), StoreError> {
        self.work.mutations.insert(mutation.id, mutation.clone());
        Ok(())
    }

    async fn update_mutation(&mut self, mutation: &Mutation) -> Result<(), StoreError> {
        if !self.work.mutations.contains_key(&mutation.id) {
            return Err(StoreError::MutationNotFound(mutation.id));
        }
        self.work.mutations.insert(mutation.id, mutation.clone());
        Ok(())
    }

    async fn insert_event(&mut self, event: &Event) -> Result<bool, StoreError> {
        let key = (
            event.workflow_id,
            event.topic.clone(),
            event.message_id.clone(),
        );
        if self.work.event_keys.contains_key(&key) {
            return Ok(false);
        }
        let mut event = event.clone();
        self.work.next_seq += 1;
        event.seq = self.work.next_seq;
        self.work.event_keys.insert(key, event.id);
        self.work.events.insert(event.id, event);
        Ok(true)
    }

    async fn reserve_events(
        &mut self,
        workflow_id: Uuid,
        topic: &str,
        message_ids: &[String],
        run_id: Uuid,
    ) -> Result<usize, StoreError> {
        // Validate the whole batch before touching anything, so a partial
        // batch never survives in the snapshot.
        let mut ids = Vec::with_capacity(message_ids.len());
        for message_id in message_ids {
            let key = (workflow_id, topic.to_string(), message_id.clone());
            let event_id = self.work.event_keys.get(&key).copied().ok_or_else(|| {
                StoreError::EventNotReservable {
                    topic: topic.to_string(),
                    message_id: message_id.clone(),
                }
            })?;
            let event = &self.work.events[&event_id];
            if event.status != EventStatus::Pending {
                return Err(StoreError::EventNotReservable {
                    topic: topic.to_string(),
                    message_id: message_id.clone(),
                });
            }
            ids.push(event_id);
        }
        for event_id in &ids {
            if let Some(event) = self.work.events.get_mut(event_id) {
                event.status = EventStatus::Reserved;
                event.reserved_by = Some(run_id);
            }
        }
        Ok(ids.len())
    }

    async fn release_events_for_run(&mut self, run_id: Uuid) -> Result<u64, StoreError> {
        let mut n = 0;
        for event in self.work.events.values_mut() {
            if event.reserved_by == Some(run_id) && event.status == EventStatus::Reserved {
                event.status = EventStatus::Pending;
                event.reserved_by = None;
                n += 1;
            }
        }
        Ok(n)
    }

    async fn consume_events_for_run(&mut self, run_id: Uuid) -> Result<u64, StoreError> {
        let mut n = 0;
        for event in self.work.events.values_mut() {
            if event.reserved_by == Some(run_id) && event.status == EventStatus::Reserved {
                event.status = EventStatus::Consumed;
                n += 1;
            }
        }
        Ok(n)
    }

    async fn skip_events_for_run(&mut self, run_id: Uuid) -> Result<u64, StoreError> {
        let mut n = 0;
        for event in self.work.events.values_mut() {
            if event.reserved_by == Some(run_id) && event.status == EventStatus::Reserved {
                event.status = EventStatus::Skipped;
                n += 1;
            }
        }
        Ok(n)
    }

    async fn transfer_reservations(
        &mut self,
        from_run: Uuid,
        to_run: Uuid,
    ) -> Result<u64, StoreError> {
        let mut n = 0;
        for event in self.work.events.values_mut() {
            if event.reserved_by == Some(from_run) && event.status == EventStatus::Reserved {
                event.reserved_by = Some(to_run);
                n += 1;
            }
        }
        Ok(n)
    }

    async fn events_reserved_by(&mut self, run_id: Uuid) -> Result<Vec<Event>, StoreError> {
        Ok(self.work.events_sorted(|e| {
            e.reserved_by == Some(run_id) && e.status == EventStatus::Reserved
        }))
    }

    async fn upsert_input(&mut self, input: &InputRecord) -> Result<Uuid, StoreError> {
        let key = (
            input.workflow_id,
            input.source.clone(),
            input.kind.clone(),
            input.external_id.clone(),
        );
        if let Some(existing) = self.work.input_keys.get(&key) {
            return Ok(*existing);
        }
        self.work.input_keys.insert(key, input.id);
        self.work.inputs.insert(input.id, input.clone());
        Ok(input.id)
    }

    async fn list_producer_schedules(
        &mut self,
        workflow_id: Uuid,
    ) -> Result<Vec<ProducerSchedule>, StoreError> {
        let mut out: Vec<_> = self
            .work
            .schedules
            .values()
            .filter(|s| s.workflow_id == workflow_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.producer_name.cmp(&b.producer_name));
        Ok(out)
    }

    async fn upsert_producer_schedule(
        &mut self,
        schedule: &ProducerSchedule,
    ) -> Result<(), StoreError> {
        self.work.schedules.insert(
            (schedule.workflow_id, schedule.producer_name.clone()),
            schedule.clone(),
        );
        Ok(())
    }

    async fn delete_producer_schedule(
        &mut self,
        workflow_id: Uuid,
        producer_name: &str,
    ) -> Result<(), StoreError> {
        self.work
            .schedules
            .remove(&(workflow_id, producer_name.to_string()));
        Ok(())
    }

    async fn get_handler_state(
        &mut self,
        workflow_id: Uuid,
        handler_name: &str,
    ) -> Result<Option<HandlerState>, StoreError> {
        Ok(self
            .work
            .states
            .get(&(workflow_id, handler_name.to_string()))
            .cloned())
    }

    async fn upsert_handler_state(&mut self, state: &HandlerState) -> Result<(), StoreError> {
        self.work.states.insert(
            (state.workflow_id, state.handler_name.clone()),
            state.clone(),
        );
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemTx { mut guard, work } = *self;
        *guard = work;
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(MemTx { guard, work }))
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Workflow, StoreError> {
        self.state
            .lock()
            .await
            .workflows
            .get(&id)
            .cloned()
            .ok_or(StoreError::WorkflowNotFound(id))
    }

    async fn list_workflows(
        &self,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<Workflow>, StoreError> {
        let state = self.state.lock().await;
        let mut out: Vec<_> = state
            .workflows
            .values()
            .filter(|w| status.is_none_or(|s| w.status == s))
            .cloned()
            .collect();
        out.sort_by_key(|w| w.id);
        Ok(out)
    }

    async fn get_script(&self, id: Uuid) -> Result<Script, StoreError> {
        self.state
            .lock()
            .await
            .scripts
            .get(&id)
            .cloned()
            .ok_or(StoreError::ScriptNotFound(id))
    }

    async fn get_session(&self, id: Uuid) -> Result<ScriptRun, StoreError> {
        self.state
            .lock()
            .await
            .sessions
            .get(&id)
            .cloned()
            .ok_or(StoreError::SessionNotFound(id))
    }

    async fn list_unfinished_sessions(&self) -> Result<Vec<ScriptRun>, StoreError> {
        let state = self.state.lock().await;
        let mut out: Vec<_> = state
            .sessions
            .values()
            .filter(|s| s.ended_at.is_none())
            .cloned()
            .collect();
        out.sort_by_key(|s| s.id);
        Ok(out)
    }

    async fn get_handler_run(&self, id: Uuid) -> Result<HandlerRun, StoreError> {
        self.state
            .lock()
            .await
            .runs
            .get(&id)
            .cloned()
            .ok_or(StoreError::RunNotFound(id))
    }

    async fn list_active_runs(
        &self,
        workflow_id: Option<Uuid>,
    ) -> Result<Vec<HandlerRun>, StoreError> {
        let state = self.state.lock().await;
        let mut out: Vec<_> = state
            .runs
            .values()
            .filter(|r| {
                r.status == RunStatus::Active
                    && workflow_id.is_none_or(|wf| r.workflow_id == wf)
            })
            .cloned()
            .collect();
        out.sort_by_key(|r| r.id);
        Ok(out)
    }

    async fn list_runs_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<HandlerRun>, StoreError> {
        let state = self.state.lock().await;
        let mut out: Vec<_> = state
            .runs
            .values()
            .filter(|r| r.script_run_id == session_id)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.id);
        Ok(out)
    }

    async fn get_mutation(&self, id: Uuid) -> Result<Mutation, StoreError> {
        self.state
            .lock()
            .await
            .mutations
            .get(&id)
            .cloned()
            .ok_or(StoreError::MutationNotFound(id))
    }

    async fn find_mutation_for_run(
        &self,
        run_id: Uuid,
    ) -> Result<Option<Mutation>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .mutations
            .values()
            .find(|m| m.handler_run_id == run_id)
            .cloned())
    }

    async fn list_mutations_with_status(
        &self,
        status: millrun_core::model::MutationStatus,
    ) -> Result<Vec<Mutation>, StoreError> {
        let state = self.state.lock().await;
        let mut out: Vec<_> = state
            .mutations
            .values()
            .filter(|m| m.status == status)
            .cloned()
            .collect();
        out.sort_by_key(|m| m.id);
        Ok(out)
    }

    async fn list_events(
        &self,
        workflow_id: Uuid,
        topic: Option<&str>,
        status: Option<EventStatus>,
    ) -> Result<Vec<Event>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.events_sorted(|e| {
            e.workflow_id == workflow_id
                && topic.is_none_or(|t| e.topic == t)
                && status.is_none_or(|s| e.status == s)
        }))
    }

    async fn count_pending_events(
        &self,
        workflow_id: Uuid,
        topics: &[String],
    ) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .values()
            .filter(|e| {
                e.workflow_id == workflow_id
                    && e.status == EventStatus::Pending
                    && topics.contains(&e.topic)
            })
            .count() as u64)
    }

    async fn list_reserved_events(&self) -> Result<Vec<Event>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.events_sorted(|e| e.status == EventStatus::Reserved))
    }

    async fn get_input(&self, id: Uuid) -> Result<InputRecord, StoreError> {
        self.state
            .lock()
            .await
            .inputs
            .get(&id)
            .cloned()
            .ok_or(StoreError::Database(format!("input not found: {id}")))
    }

    async fn list_inputs(&self, workflow_id: Uuid) -> Result<Vec<InputRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut out: Vec<_> = state
            .inputs
            .values()
            .filter(|i| i.workflow_id == workflow_id)
            .cloned()
            .collect();
        out.sort_by_key(|i| i.id);
        Ok(out)
    }

    async fn get_handler_state(
        &self,
        workflow_id: Uuid,
        handler_name: &str,
    ) -> Result<Option<HandlerState>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .states
            .get(&(workflow_id, handler_name.to_string()))
            .cloned())
    }

    async fn list_handler_states(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<HandlerState>, StoreError> {
        let state = self.state.lock().await;
        let mut out: Vec<_> = state
            .states
            .values()
            .filter(|s| s.workflow_id == workflow_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.handler_name.cmp(&b.handler_name));
        Ok(out)
    }

    async fn list_producer_schedules(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<ProducerSchedule>, StoreError> {
        let state = self.state.lock().await;
        let mut out: Vec<_> = state
            .schedules
            .values()
            .filter(|s| s.workflow_id == workflow_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.producer_name.cmp(&b.producer_name));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use millrun_core::model::HandlerKind;
    use serde_json::json;

    fn event(workflow_id: Uuid, topic: &str, message_id: &str) -> Event {
        Event::pending(workflow_id, topic, message_id, json!({}), vec![])
    }

    #[tokio::test]
    async fn dropped_tx_leaves_no_trace() {
        let store = MemoryStore::new();
        let workflow = Workflow::new(Uuid::now_v7());

        let mut tx = store.begin().await.unwrap();
        tx.insert_workflow(&workflow).await.unwrap();
        drop(tx);

        assert!(matches!(
            store.get_workflow(workflow.id).await,
            Err(StoreError::WorkflowNotFound(_))
        ));
    }

    #[tokio::test]
    async fn committed_tx_is_visible() {
        let store = MemoryStore::new();
        let workflow = Workflow::new(Uuid::now_v7());

        let mut tx = store.begin().await.unwrap();
        tx.insert_workflow(&workflow).await.unwrap();
        tx.commit().await.unwrap();

        let loaded = store.get_workflow(workflow.id).await.unwrap();
        assert_eq!(loaded.id, workflow.id);
    }

    #[tokio::test]
    async fn event_insert_is_idempotent_first_payload_wins() {
        let store = MemoryStore::new();
        let workflow_id = Uuid::now_v7();

        let mut tx = store.begin().await.unwrap();
        let first = Event::pending(workflow_id, "t", "m-1", json!({"v": 1}), vec![]);
        let second = Event::pending(workflow_id, "t", "m-1", json!({"v": 2}), vec![]);
        assert!(tx.insert_event(&first).await.unwrap());
        assert!(!tx.insert_event(&second).await.unwrap());
        tx.commit().await.unwrap();

        let events = store.list_events(workflow_id, Some("t"), None).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, json!({"v": 1}));
    }

    #[tokio::test]
    async fn reserve_fails_whole_batch_on_non_pending() {
        let store = MemoryStore::new();
        let workflow_id = Uuid::now_v7();
        let run_a = Uuid::now_v7();
        let run_b = Uuid::now_v7();

        let mut tx = store.begin().await.unwrap();
        tx.insert_event(&event(workflow_id, "t", "m-1")).await.unwrap();
        tx.insert_event(&event(workflow_id, "t", "m-2")).await.unwrap();
        tx.reserve_events(workflow_id, "t", &["m-1".into()], run_a)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        // m-1 is reserved, so reserving [m-1, m-2] must fail entirely
        let mut tx = store.begin().await.unwrap();
        let err = tx
            .reserve_events(workflow_id, "t", &["m-1".into(), "m-2".into()], run_b)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::EventNotReservable { .. }));
        drop(tx);

        // m-2 is untouched
        let events = store
            .list_events(workflow_id, Some("t"), Some(EventStatus::Pending))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message_id, "m-2");
    }

    #[tokio::test]
    async fn release_and_consume_by_run() {
        let store = MemoryStore::new();
        let workflow_id = Uuid::now_v7();
        let run = Uuid::now_v7();

        let mut tx = store.begin().await.unwrap();
        tx.insert_event(&event(workflow_id, "t", "m-1")).await.unwrap();
        tx.insert_event(&event(workflow_id, "t", "m-2")).await.unwrap();
        tx.reserve_events(workflow_id, "t", &["m-1".into(), "m-2".into()], run)
            .await
            .unwrap();
        assert_eq!(tx.release_events_for_run(run).await.unwrap(), 2);
        tx.reserve_events(workflow_id, "t", &["m-1".into()], run)
            .await
            .unwrap();
        assert_eq!(tx.consume_events_for_run(run).await.unwrap(), 1);
        tx.commit().await.unwrap();

        let consumed = store
            .list_events(workflow_id, None, Some(EventStatus::Consumed))
            .await
            .unwrap();
        assert_eq!(consumed.len(), 1);
        let pending = store
            .list_events(workflow_id, None, Some(EventStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn transfer_moves_ownership() {
        let store = MemoryStore::new();
        let workflow_id = Uuid::now_v7();
        let from = Uuid::now_v7();
        let to = Uuid::now_v7();

        let mut tx = store.begin().await.unwrap();
        tx.insert_event(&event(workflow_id, "t", "m-1")).await.unwrap();
        tx.reserve_events(workflow_id, "t", &["m-1".into()], from)
            .await
            .unwrap();
        assert_eq!(tx.transfer_reservations(from, to).await.unwrap(), 1);
        let held = tx.events_reserved_by(to).await.unwrap();
        assert_eq!(held.len(), 1);
        assert!(tx.events_reserved_by(from).await.unwrap().is_empty());
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn input_upsert_returns_stable_id() {
        let store = MemoryStore::new();
        let workflow_id = Uuid::now_v7();
        let run = Uuid::now_v7();

        let mut tx = store.begin().await.unwrap();
        let first = InputRecord::new(workflow_id, "gmail", "message", "ext-1", run);
        let id1 = tx.upsert_input(&first).await.unwrap();
        let again = InputRecord::new(workflow_id, "gmail", "message", "ext-1", run);
        let id2 = tx.upsert_input(&again).await.unwrap();
        assert_eq!(id1, id2);
        tx.commit().await.unwrap();

        assert_eq!(store.list_inputs(workflow_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn events_keep_publish_order() {
        let store = MemoryStore::new();
        let workflow_id = Uuid::now_v7();

        let mut tx = store.begin().await.unwrap();
        for i in 0..5 {
            tx.insert_event(&event(workflow_id, "t", &format!("m-{i}")))
                .await
                .unwrap();
        }
        tx.commit().await.unwrap();

        let events = store.list_events(workflow_id, Some("t"), None).await.unwrap();
        let ids: Vec<_> = events.iter().map(|e| e.message_id.clone()).collect();
        assert_eq!(ids, vec!["m-0", "m-1", "m-2", "m-3", "m-4"]);
    }

    #[tokio::test]
    async fn active_run_listing_filters_by_status() {
        let store = MemoryStore::new();
        let workflow_id = Uuid::now_v7();
        let session_id = Uuid::now_v7();

        let mut tx = store.begin().await.unwrap();
        let active = HandlerRun::new(session_id, workflow_id, HandlerKind::Consumer, "a");
        let mut committed = HandlerRun::new(session_id, workflow_id, HandlerKind::Consumer, "b");
        committed.status = RunStatus::Committed;
        tx.insert_handler_run(&active).await.unwrap();
        tx.insert_handler_run(&committed).await.unwrap();
        tx.commit().await.unwrap();

        let runs = store.list_active_runs(Some(workflow_id)).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].handler_name, "a");
    }
}
