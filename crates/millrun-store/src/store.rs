//! Store trait definitions

use async_trait::async_trait;
use uuid::Uuid;

use millrun_core::model::{
    Event, EventStatus, HandlerRun, HandlerState, InputRecord, Mutation, ProducerSchedule, Script,
    ScriptRun, Workflow, WorkflowStatus,
};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    #[error("script not found: {0}")]
    ScriptNotFound(Uuid),

    #[error("session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("handler run not found: {0}")]
    RunNotFound(Uuid),

    #[error("mutation not found: {0}")]
    MutationNotFound(Uuid),

    /// A batch reservation hit an event that is not `pending`; the whole
    /// transaction fails and the caller must re-peek the topic.
    #[error("event not reservable: {topic}/{message_id}")]
    EventNotReservable { topic: String, message_id: String },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// One atomic unit of work against the store
///
/// All writes of an engine state transition go through a single `StoreTx`.
/// Dropping the transaction without `commit` discards every write.
/// Reads inside the transaction observe its own writes.
#[async_trait]
pub trait StoreTx: Send {
    // =========================================================================
    // Workflows
    // =========================================================================

    async fn get_workflow(&mut self, id: Uuid) -> Result<Workflow, StoreError>;
    async fn insert_workflow(&mut self, workflow: &Workflow) -> Result<(), StoreError>;
    async fn update_workflow(&mut self, workflow: &Workflow) -> Result<(), StoreError>;

    // =========================================================================
    // Scripts
    // =========================================================================

    async fn get_script(&mut self, id: Uuid) -> Result<Script, StoreError>;
    async fn insert_script(&mut self, script: &Script) -> Result<(), StoreError>;

    /// Latest `(major, minor)` saved for a workflow, if any
    async fn latest_script_version(
        &mut self,
        workflow_id: Uuid,
    ) -> Result<Option<(i32, i32)>, StoreError>;

    // =========================================================================
    // Sessions (script runs)
    // =========================================================================

    async fn get_session(&mut self, id: Uuid) -> Result<ScriptRun, StoreError>;
    async fn insert_session(&mut self, session: &ScriptRun) -> Result<(), StoreError>;
    async fn update_session(&mut self, session: &ScriptRun) -> Result<(), StoreError>;

    // =========================================================================
    // Handler runs
    // =========================================================================

    async fn get_handler_run(&mut self, id: Uuid) -> Result<HandlerRun, StoreError>;
    async fn insert_handler_run(&mut self, run: &HandlerRun) -> Result<(), StoreError>;
    async fn update_handler_run(&mut self, run: &HandlerRun) -> Result<(), StoreError>;

    // =========================================================================
    // Mutations
    // =========================================================================

    async fn get_mutation(&mut self, id: Uuid) -> Result<Mutation, StoreError>;

    /// The mutation owned by this exact run, if any (retry chains are the
    /// engine's concern)
    async fn find_mutation_for_run(
        &mut self,
        run_id: Uuid,
    ) -> Result<Option<Mutation>, StoreError>;

    async fn insert_mutation(&mut self, mutation: &Mutation) -> Result<(), StoreError>;
    async fn update_mutation(&mut self, mutation: &Mutation) -> Result<(), StoreError>;

    // =========================================================================
    // Events
    // =========================================================================

    /// Idempotent insert keyed on `(workflow_id, topic, message_id)`.
    /// Returns `false` when the key already exists (first payload wins).
    async fn insert_event(&mut self, event: &Event) -> Result<bool, StoreError>;

    /// Move the named pending events to `reserved`, owned by `run_id`.
    /// Fails the transaction with [`StoreError::EventNotReservable`] if any
    /// named event is missing or not `pending`.
    async fn reserve_events(
        &mut self,
        workflow_id: Uuid,
        topic: &str,
        message_ids: &[String],
        run_id: Uuid,
    ) -> Result<usize, StoreError>;

    /// Reserved → pending for everything held by `run_id`
    async fn release_events_for_run(&mut self, run_id: Uuid) -> Result<u64, StoreError>;

    /// Reserved → consumed for everything held by `run_id`
    async fn consume_events_for_run(&mut self, run_id: Uuid) -> Result<u64, StoreError>;

    /// Reserved → skipped for everything held by `run_id`
    async fn skip_events_for_run(&mut self, run_id: Uuid) -> Result<u64, StoreError>;

    /// Re-home reservations from one run to another (retry creation)
    async fn transfer_reservations(
        &mut self,
        from_run: Uuid,
        to_run: Uuid,
    ) -> Result<u64, StoreError>;

    /// Events currently reserved by `run_id`, in publish order
    async fn events_reserved_by(&mut self, run_id: Uuid) -> Result<Vec<Event>, StoreError>;

    // =========================================================================
    // Input records
    // =========================================================================

    /// Idempotent on `(workflow_id, source, kind, external_id)`; returns
    /// the stable id (existing row's id on duplicate).
    async fn upsert_input(&mut self, input: &InputRecord) -> Result<Uuid, StoreError>;

    // =========================================================================
    // Producer schedules
    // =========================================================================

    async fn list_producer_schedules(
        &mut self,
        workflow_id: Uuid,
    ) -> Result<Vec<ProducerSchedule>, StoreError>;

    async fn upsert_producer_schedule(
        &mut self,
        schedule: &ProducerSchedule,
    ) -> Result<(), StoreError>;

    async fn delete_producer_schedule(
        &mut self,
        workflow_id: Uuid,
        producer_name: &str,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Handler state
    // =========================================================================

    async fn get_handler_state(
        &mut self,
        workflow_id: Uuid,
        handler_name: &str,
    ) -> Result<Option<HandlerState>, StoreError>;

    async fn upsert_handler_state(&mut self, state: &HandlerState) -> Result<(), StoreError>;

    // =========================================================================
    // Commit
    // =========================================================================

    /// Publish all writes atomically. Dropping without commit rolls back.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Transactional store for all engine entities
///
/// The non-transactional methods are read-only conveniences for scans that
/// tolerate a slightly stale view (scheduler ticks, listings). Everything
/// that changes state goes through [`Store::begin`].
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Open a transaction
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;

    // =========================================================================
    // Read-only queries
    // =========================================================================

    async fn get_workflow(&self, id: Uuid) -> Result<Workflow, StoreError>;

    async fn list_workflows(
        &self,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<Workflow>, StoreError>;

    async fn get_script(&self, id: Uuid) -> Result<Script, StoreError>;

    async fn get_session(&self, id: Uuid) -> Result<ScriptRun, StoreError>;

    /// Sessions with no `ended_at`
    async fn list_unfinished_sessions(&self) -> Result<Vec<ScriptRun>, StoreError>;

    async fn get_handler_run(&self, id: Uuid) -> Result<HandlerRun, StoreError>;

    /// Runs with `status = active`, optionally restricted to one workflow
    async fn list_active_runs(
        &self,
        workflow_id: Option<Uuid>,
    ) -> Result<Vec<HandlerRun>, StoreError>;

    async fn list_runs_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<HandlerRun>, StoreError>;

    async fn get_mutation(&self, id: Uuid) -> Result<Mutation, StoreError>;

    async fn find_mutation_for_run(&self, run_id: Uuid)
        -> Result<Option<Mutation>, StoreError>;

    /// Mutations in the given status (background reconcile sweep)
    async fn list_mutations_with_status(
        &self,
        status: millrun_core::model::MutationStatus,
    ) -> Result<Vec<Mutation>, StoreError>;

    /// Events for a workflow in publish order, optionally filtered
    async fn list_events(
        &self,
        workflow_id: Uuid,
        topic: Option<&str>,
        status: Option<EventStatus>,
    ) -> Result<Vec<Event>, StoreError>;

    /// Count of pending events across the given topics
    async fn count_pending_events(
        &self,
        workflow_id: Uuid,
        topics: &[String],
    ) -> Result<u64, StoreError>;

    /// All reserved events across workflows (recovery orphan sweep)
    async fn list_reserved_events(&self) -> Result<Vec<Event>, StoreError>;

    async fn get_input(&self, id: Uuid) -> Result<InputRecord, StoreError>;

    async fn list_inputs(&self, workflow_id: Uuid) -> Result<Vec<InputRecord>, StoreError>;

    async fn get_handler_state(
        &self,
        workflow_id: Uuid,
        handler_name: &str,
    ) -> Result<Option<HandlerState>, StoreError>;

    async fn list_handler_states(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<HandlerState>, StoreError>;

    async fn list_producer_schedules(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<ProducerSchedule>, StoreError>;
}
