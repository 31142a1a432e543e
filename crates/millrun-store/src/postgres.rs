//! PostgreSQL implementation of the store
//!
//! One `sqlx` transaction backs each [`StoreTx`]; unique indexes carry the
//! idempotency contracts (event publication, input registration). Designed
//! so every engine state transition is a single short transaction.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::error;
use uuid::Uuid;

use millrun_core::model::{
    Event, EventStatus, HandlerRun, HandlerState, InputRecord, Mutation, ProducerSchedule, Script,
    ScriptRun, Workflow, WorkflowStatus,
};

use crate::store::{Store, StoreError, StoreTx};

/// Embedded schema migrations
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

/// PostgreSQL store
///
/// # Example
///
/// ```ignore
/// use millrun_store::PostgresStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/millrun").await?;
/// millrun_store::postgres::MIGRATOR.run(&pool).await?;
/// let store = PostgresStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    error!("database error: {e}");
    StoreError::Database(e.to_string())
}

fn enum_col<T>(row: &PgRow, col: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr<Err = String>,
{
    let s: String = row.try_get(col).map_err(db_err)?;
    s.parse::<T>().map_err(StoreError::Serialization)
}

fn opt_enum_col<T>(row: &PgRow, col: &str) -> Result<Option<T>, StoreError>
where
    T: std::str::FromStr<Err = String>,
{
    let s: Option<String> = row.try_get(col).map_err(db_err)?;
    s.map(|s| s.parse::<T>().map_err(StoreError::Serialization))
        .transpose()
}

fn json_col<T: serde::de::DeserializeOwned>(row: &PgRow, col: &str) -> Result<T, StoreError> {
    let value: serde_json::Value = row.try_get(col).map_err(db_err)?;
    serde_json::from_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

// =============================================================================
// Row mapping
// =============================================================================

fn workflow_from_row(row: &PgRow) -> Result<Workflow, StoreError> {
    Ok(Workflow {
        id: row.try_get("id").map_err(db_err)?,
        task_id: row.try_get("task_id").map_err(db_err)?,
        active_script_id: row.try_get("active_script_id").map_err(db_err)?,
        handler_config: row.try_get("handler_config").map_err(db_err)?,
        status: enum_col(row, "status")?,
        maintenance: row.try_get("maintenance").map_err(db_err)?,
        maintenance_fix_count: row.try_get("maintenance_fix_count").map_err(db_err)?,
        pending_retry_run_id: row.try_get("pending_retry_run_id").map_err(db_err)?,
        cron: row.try_get("cron").map_err(db_err)?,
        next_run_at: row.try_get("next_run_at").map_err(db_err)?,
        backoff_until: row.try_get("backoff_until").map_err(db_err)?,
        backoff_secs: row.try_get("backoff_secs").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn script_from_row(row: &PgRow) -> Result<Script, StoreError> {
    Ok(Script {
        id: row.try_get("id").map_err(db_err)?,
        workflow_id: row.try_get("workflow_id").map_err(db_err)?,
        task_id: row.try_get("task_id").map_err(db_err)?,
        code: row.try_get("code").map_err(db_err)?,
        major_version: row.try_get("major_version").map_err(db_err)?,
        minor_version: row.try_get("minor_version").map_err(db_err)?,
        config: row.try_get("config").map_err(db_err)?,
        summary: row.try_get("summary").map_err(db_err)?,
        diagram: row.try_get("diagram").map_err(db_err)?,
        change_comment: row.try_get("change_comment").map_err(db_err)?,
        kind: enum_col(row, "kind")?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn session_from_row(row: &PgRow) -> Result<ScriptRun, StoreError> {
    Ok(ScriptRun {
        id: row.try_get("id").map_err(db_err)?,
        script_id: row.try_get("script_id").map_err(db_err)?,
        workflow_id: row.try_get("workflow_id").map_err(db_err)?,
        trigger: enum_col(row, "trigger_kind")?,
        started_at: row.try_get("started_at").map_err(db_err)?,
        ended_at: row.try_get("ended_at").map_err(db_err)?,
        result: opt_enum_col(row, "result")?,
        error: row.try_get("error").map_err(db_err)?,
        error_kind: opt_enum_col(row, "error_kind")?,
        cost_milli_cents: row.try_get("cost_milli_cents").map_err(db_err)?,
        handler_count: row.try_get("handler_count").map_err(db_err)?,
        retry_of: row.try_get("retry_of").map_err(db_err)?,
    })
}

fn run_from_row(row: &PgRow) -> Result<HandlerRun, StoreError> {
    Ok(HandlerRun {
        id: row.try_get("id").map_err(db_err)?,
        script_run_id: row.try_get("script_run_id").map_err(db_err)?,
        workflow_id: row.try_get("workflow_id").map_err(db_err)?,
        kind: enum_col(row, "kind")?,
        handler_name: row.try_get("handler_name").map_err(db_err)?,
        phase: enum_col(row, "phase")?,
        status: enum_col(row, "status")?,
        retry_of: row.try_get("retry_of").map_err(db_err)?,
        prepare_result: row.try_get("prepare_result").map_err(db_err)?,
        input_state: row.try_get("input_state").map_err(db_err)?,
        output_state: row.try_get("output_state").map_err(db_err)?,
        error: row.try_get("error").map_err(db_err)?,
        error_kind: opt_enum_col(row, "error_kind")?,
        cost_milli_cents: row.try_get("cost_milli_cents").map_err(db_err)?,
        started_at: row.try_get("started_at").map_err(db_err)?,
        ended_at: row.try_get("ended_at").map_err(db_err)?,
        logs: json_col(row, "logs")?,
    })
}

fn mutation_from_row(row: &PgRow) -> Result<Mutation, StoreError> {
    Ok(Mutation {
        id: row.try_get("id").map_err(db_err)?,
        handler_run_id: row.try_get("handler_run_id").map_err(db_err)?,
        workflow_id: row.try_get("workflow_id").map_err(db_err)?,
        tool_namespace: row.try_get("tool_namespace").map_err(db_err)?,
        tool_method: row.try_get("tool_method").map_err(db_err)?,
        params: row.try_get("params").map_err(db_err)?,
        idempotency_key: row.try_get("idempotency_key").map_err(db_err)?,
        status: enum_col(row, "status")?,
        result: row.try_get("result").map_err(db_err)?,
        error: row.try_get("error").map_err(db_err)?,
        resolved_by: opt_enum_col(row, "resolved_by")?,
        resolved_at: row.try_get("resolved_at").map_err(db_err)?,
        user_skip: row.try_get("user_skip").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn event_from_row(row: &PgRow) -> Result<Event, StoreError> {
    Ok(Event {
        id: row.try_get("id").map_err(db_err)?,
        workflow_id: row.try_get("workflow_id").map_err(db_err)?,
        topic: row.try_get("topic").map_err(db_err)?,
        message_id: row.try_get("message_id").map_err(db_err)?,
        title: row.try_get("title").map_err(db_err)?,
        payload: row.try_get("payload").map_err(db_err)?,
        status: enum_col(row, "status")?,
        reserved_by: row.try_get("reserved_by").map_err(db_err)?,
        caused_by: json_col(row, "caused_by")?,
        seq: row.try_get("seq").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn input_from_row(row: &PgRow) -> Result<InputRecord, StoreError> {
    Ok(InputRecord {
        id: row.try_get("id").map_err(db_err)?,
        workflow_id: row.try_get("workflow_id").map_err(db_err)?,
        source: row.try_get("source").map_err(db_err)?,
        kind: row.try_get("kind").map_err(db_err)?,
        external_id: row.try_get("external_id").map_err(db_err)?,
        title: row.try_get("title").map_err(db_err)?,
        handler_run_id: row.try_get("handler_run_id").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn schedule_from_row(row: &PgRow) -> Result<ProducerSchedule, StoreError> {
    Ok(ProducerSchedule {
        workflow_id: row.try_get("workflow_id").map_err(db_err)?,
        producer_name: row.try_get("producer_name").map_err(db_err)?,
        spec: json_col(row, "spec")?,
        next_run_at: row.try_get("next_run_at").map_err(db_err)?,
    })
}

fn state_from_row(row: &PgRow) -> Result<HandlerState, StoreError> {
    Ok(HandlerState {
        workflow_id: row.try_get("workflow_id").map_err(db_err)?,
        handler_name: row.try_get("handler_name").map_err(db_err)?,
        state: row.try_get("state").map_err(db_err)?,
        wake_at: row.try_get("wake_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

// =============================================================================
// Transaction
// =============================================================================

struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgTx {
    async fn get_workflow(&mut self, id: Uuid) -> Result<Workflow, StoreError> {
        let row = sqlx::query("SELECT * FROM workflows WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::WorkflowNotFound(id))?;
        workflow_from_row(&row)
    }

    async fn insert_workflow(&mut self, workflow: &Workflow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflows (
                id, task_id, active_script_id, handler_config, status,
                maintenance, maintenance_fix_count, pending_retry_run_id,
                cron, next_run_at, backoff_until, backoff_secs,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(workflow.id)
        .bind(workflow.task_id)
        .bind(workflow.active_script_id)
        .bind(&workflow.handler_config)
        .bind(workflow.status.to_string())
        .bind(workflow.maintenance)
        .bind(workflow.maintenance_fix_count)
        .bind(workflow.pending_retry_run_id)
        .bind(&workflow.cron)
        .bind(workflow.next_run_at)
        .bind(workflow.backoff_until)
        .bind(workflow.backoff_secs)
        .bind(workflow.created_at)
        .bind(workflow.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_workflow(&mut self, workflow: &Workflow) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflows SET
                active_script_id = $2, handler_config = $3, status = $4,
                maintenance = $5, maintenance_fix_count = $6,
                pending_retry_run_id = $7, cron = $8, next_run_at = $9,
                backoff_until = $10, backoff_secs = $11, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(workflow.id)
        .bind(workflow.active_script_id)
        .bind(&workflow.handler_config)
        .bind(workflow.status.to_string())
        .bind(workflow.maintenance)
        .bind(workflow.maintenance_fix_count)
        .bind(workflow.pending_retry_run_id)
        .bind(&workflow.cron)
        .bind(workflow.next_run_at)
        .bind(workflow.backoff_until)
        .bind(workflow.backoff_secs)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::WorkflowNotFound(workflow.id));
        }
        Ok(())
    }

    async fn get_script(&mut self, id: Uuid) -> Result<Script, StoreError> {
        let row = sqlx::query("SELECT * FROM scripts WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::ScriptNotFound(id))?;
        script_from_row(&row)
    }

    async fn insert_script(&mut self, script: &Script) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO scripts (
                id, workflow_id, task_id, code, major_version, minor_version,
                config, summary, diagram, change_comment, kind, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(script.id)
        .bind(script.workflow_id)
        .bind(script.task_id)
        .bind(&script.code)
        .bind(script.major_version)
        .bind(script.minor_version)
        .bind(&script.config)
        .bind(&script.summary)
        .bind(&script.diagram)
        .bind(&script.change_comment)
        .bind(script.kind.to_string())
        .bind(script.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn latest_script_version(
        &mut self,
        workflow_id: Uuid,
    ) -> Result<Option<(i32, i32)>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT major_version, minor_version FROM scripts
            WHERE workflow_id = $1
            ORDER BY major_version DESC, minor_version DESC
            LIMIT 1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;
        row.map(|row| {
            Ok((
                row.try_get("major_version").map_err(db_err)?,
                row.try_get("minor_version").map_err(db_err)?,
            ))
        })
        .transpose()
    }

    async fn get_session(&mut self, id: Uuid) -> Result<ScriptRun, StoreError> {
        let row = sqlx::query("SELECT * FROM script_runs WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::SessionNotFound(id))?;
        session_from_row(&row)
    }

    async fn insert_session(&mut self, session: &ScriptRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO script_runs (
                id, script_id, workflow_id, trigger_kind, started_at, ended_at,
                result, error, error_kind, cost_milli_cents, handler_count, retry_of
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(session.id)
        .bind(session.script_id)
        .bind(session.workflow_id)
        .bind(session.trigger.to_string())
        .bind(session.started_at)
        .bind(session.ended_at)
        .bind(session.result.map(|r| r.to_string()))
        .bind(&session.error)
        .bind(session.error_kind.map(|k| k.to_string()))
        .bind(session.cost_milli_cents)
        .bind(session.handler_count)
        .bind(session.retry_of)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_session(&mut self, session: &ScriptRun) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE script_runs SET
                ended_at = $2, result = $3, error = $4, error_kind = $5,
                cost_milli_cents = $6, handler_count = $7
            WHERE id = $1
            "#,
        )
        .bind(session.id)
        .bind(session.ended_at)
        .bind(session.result.map(|r| r.to_string()))
        .bind(&session.error)
        .bind(session.error_kind.map(|k| k.to_string()))
        .bind(session.cost_milli_cents)
        .bind(session.handler_count)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::SessionNotFound(session.id));
        }
        Ok(())
    }

    async fn get_handler_run(&mut self, id: Uuid) -> Result<HandlerRun, StoreError> {
        let row = sqlx::query("SELECT * FROM handler_runs WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::RunNotFound(id))?;
        run_from_row(&row)
    }

    async fn insert_handler_run(&mut self, run: &HandlerRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO handler_runs (
                id, script_run_id, workflow_id, kind, handler_name, phase,
                status, retry_of, prepare_result, input_state, output_state,
                error, error_kind, cost_milli_cents, started_at, ended_at, logs
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                    $14, $15, $16, $17)
            "#,
        )
        .bind(run.id)
        .bind(run.script_run_id)
        .bind(run.workflow_id)
        .bind(run.kind.to_string())
        .bind(&run.handler_name)
        .bind(run.phase.to_string())
        .bind(run.status.to_string())
        .bind(run.retry_of)
        .bind(&run.prepare_result)
        .bind(&run.input_state)
        .bind(&run.output_state)
        .bind(&run.error)
        .bind(run.error_kind.map(|k| k.to_string()))
        .bind(run.cost_milli_cents)
        .bind(run.started_at)
        .bind(run.ended_at)
        .bind(to_json(&run.logs)?)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_handler_run(&mut self, run: &HandlerRun) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE handler_runs SET
                phase = $2, status = $3, prepare_result = $4, input_state = $5,
                output_state = $6, error = $7, error_kind = $8,
                cost_milli_cents = $9, ended_at = $10, logs = $11
            WHERE id = $1
            "#,
        )
        .bind(run.id)
        .bind(run.phase.to_string())
        .bind(run.status.to_string())
        .bind(&run.prepare_result)
        .bind(&run.input_state)
        .bind(&run.output_state)
        .bind(&run.error)
        .bind(run.error_kind.map(|k| k.to_string()))
        .bind(run.cost_milli_cents)
        .bind(run.ended_at)
        .bind(to_json(&run.logs)?)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::RunNotFound(run.id));
        }
        Ok(())
    }

    async fn get_mutation(&mut self, id: Uuid) -> Result<Mutation, StoreError> {
        let row = sqlx::query("SELECT * FROM mutations WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::MutationNotFound(id))?;
        mutation_from_row(&row)
    }

    async fn find_mutation_for_run(
        &mut self,
        run_id: Uuid,
    ) -> Result<Option<Mutation>, StoreError> {
        let row = sqlx::query("SELECT * FROM mutations WHERE handler_run_id = $1")
            .bind(run_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err)?;
        row.as_ref().map(mutation_from_row).transpose()
    }

    async fn insert_mutation(&mut self, mutation: &Mutation) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO mutations (
                id, handler_run_id, workflow_id, tool_namespace, tool_method,
                params, idempotency_key, status, result, error,
                resolved_by, resolved_at, user_skip, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(mutation.id)
        .bind(mutation.handler_run_id)
        .bind(mutation.workflow_id)
        .bind(&mutation.tool_namespace)
        .bind(&mutation.tool_method)
        .bind(&mutation.params)
        .bind(&mutation.idempotency_key)
        .bind(mutation.status.to_string())
        .bind(&mutation.result)
        .bind(&mutation.error)
        .bind(mutation.resolved_by.map(|r| r.to_string()))
        .bind(mutation.resolved_at)
        .bind(mutation.user_skip)
        .bind(mutation.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_mutation(&mut self, mutation: &Mutation) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE mutations SET
                status = $2, result = $3, error = $4, resolved_by = $5,
                resolved_at = $6, user_skip = $7
            WHERE id = $1
            "#,
        )
        .bind(mutation.id)
        .bind(mutation.status.to_string())
        .bind(&mutation.result)
        .bind(&mutation.error)
        .bind(mutation.resolved_by.map(|r| r.to_string()))
        .bind(mutation.resolved_at)
        .bind(mutation.user_skip)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::MutationNotFound(mutation.id));
        }
        Ok(())
    }

    async fn insert_event(&mut self, event: &Event) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO events (
                id, workflow_id, topic, message_id, title, payload, status,
                reserved_by, caused_by, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (workflow_id, topic, message_id) DO NOTHING
            "#,
        )
        .bind(event.id)
        .bind(event.workflow_id)
        .bind(&event.topic)
        .bind(&event.message_id)
        .bind(&event.title)
        .bind(&event.payload)
        .bind(event.status.to_string())
        .bind(event.reserved_by)
        .bind(to_json(&event.caused_by)?)
        .bind(event.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn reserve_events(
        &mut self,
        workflow_id: Uuid,
        topic: &str,
        message_ids: &[String],
        run_id: Uuid,
    ) -> Result<usize, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE events SET status = 'reserved', reserved_by = $4
            WHERE workflow_id = $1 AND topic = $2
              AND message_id = ANY($3) AND status = 'pending'
            "#,
        )
        .bind(workflow_id)
        .bind(topic)
        .bind(message_ids)
        .bind(run_id)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;

        let reserved = result.rows_affected() as usize;
        if reserved != message_ids.len() {
            // At least one named event is missing or not pending; fail the
            // whole transaction so no partial batch survives.
            return Err(StoreError::EventNotReservable {
                topic: topic.to_string(),
                message_id: message_ids.join(","),
            });
        }
        Ok(reserved)
    }

    async fn release_events_for_run(&mut self, run_id: Uuid) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE events SET status = 'pending', reserved_by = NULL
            WHERE reserved_by = $1 AND status = 'reserved'
            "#,
        )
        .bind(run_id)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn consume_events_for_run(&mut self, run_id: Uuid) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE events SET status = 'consumed'
            WHERE reserved_by = $1 AND status = 'reserved'
            "#,
        )
        .bind(run_id)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn skip_events_for_run(&mut self, run_id: Uuid) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE events SET status = 'skipped'
            WHERE reserved_by = $1 AND status = 'reserved'
            "#,
        )
        .bind(run_id)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn transfer_reservations(
        &mut self,
        from_run: Uuid,
        to_run: Uuid,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE events SET reserved_by = $2
            WHERE reserved_by = $1 AND status = 'reserved'
            "#,
        )
        .bind(from_run)
        .bind(to_run)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn events_reserved_by(&mut self, run_id: Uuid) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM events
            WHERE reserved_by = $1 AND status = 'reserved'
            ORDER BY seq
            "#,
        )
        .bind(run_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;
        rows.iter().map(event_from_row).collect()
    }

    async fn upsert_input(&mut self, input: &InputRecord) -> Result<Uuid, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO input_records (
                id, workflow_id, source, kind, external_id, title,
                handler_run_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (workflow_id, source, kind, external_id) DO NOTHING
            "#,
        )
        .bind(input.id)
        .bind(input.workflow_id)
        .bind(&input.source)
        .bind(&input.kind)
        .bind(&input.external_id)
        .bind(&input.title)
        .bind(input.handler_run_id)
        .bind(input.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 1 {
            return Ok(input.id);
        }
        let row = sqlx::query(
            r#"
            SELECT id FROM input_records
            WHERE workflow_id = $1 AND source = $2 AND kind = $3 AND external_id = $4
            "#,
        )
        .bind(input.workflow_id)
        .bind(&input.source)
        .bind(&input.kind)
        .bind(&input.external_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)?;
        row.try_get("id").map_err(db_err)
    }

    async fn list_producer_schedules(
        &mut self,
        workflow_id: Uuid,
    ) -> Result<Vec<ProducerSchedule>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM producer_schedules WHERE workflow_id = $1 ORDER BY producer_name",
        )
        .bind(workflow_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;
        rows.iter().map(schedule_from_row).collect()
    }

    async fn upsert_producer_schedule(
        &mut self,
        schedule: &ProducerSchedule,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO producer_schedules (workflow_id, producer_name, spec, next_run_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (workflow_id, producer_name)
            DO UPDATE SET spec = EXCLUDED.spec, next_run_at = EXCLUDED.next_run_at
            "#,
        )
        .bind(schedule.workflow_id)
        .bind(&schedule.producer_name)
        .bind(to_json(&schedule.spec)?)
        .bind(schedule.next_run_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn delete_producer_schedule(
        &mut self,
        workflow_id: Uuid,
        producer_name: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "DELETE FROM producer_schedules WHERE workflow_id = $1 AND producer_name = $2",
        )
        .bind(workflow_id)
        .bind(producer_name)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_handler_state(
        &mut self,
        workflow_id: Uuid,
        handler_name: &str,
    ) -> Result<Option<HandlerState>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM handler_states WHERE workflow_id = $1 AND handler_name = $2",
        )
        .bind(workflow_id)
        .bind(handler_name)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;
        row.as_ref().map(state_from_row).transpose()
    }

    async fn upsert_handler_state(&mut self, state: &HandlerState) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO handler_states (workflow_id, handler_name, state, wake_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (workflow_id, handler_name)
            DO UPDATE SET state = EXCLUDED.state, wake_at = EXCLUDED.wake_at,
                          updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(state.workflow_id)
        .bind(&state.handler_name)
        .bind(&state.state)
        .bind(state.wake_at)
        .bind(state.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(db_err)
    }
}

// =============================================================================
// Store
// =============================================================================

#[async_trait]
impl Store for PostgresStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let tx = self.pool.begin().await.map_err(db_err)?;
        Ok(Box::new(PgTx { tx }))
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Workflow, StoreError> {
        let row = sqlx::query("SELECT * FROM workflows WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::WorkflowNotFound(id))?;
        workflow_from_row(&row)
    }

    async fn list_workflows(
        &self,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<Workflow>, StoreError> {
        let rows = match status {
            Some(status) => {
                sqlx::query("SELECT * FROM workflows WHERE status = $1 ORDER BY id")
                    .bind(status.to_string())
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM workflows ORDER BY id")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(db_err)?;
        rows.iter().map(workflow_from_row).collect()
    }

    async fn get_script(&self, id: Uuid) -> Result<Script, StoreError> {
        let row = sqlx::query("SELECT * FROM scripts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::ScriptNotFound(id))?;
        script_from_row(&row)
    }

    async fn get_session(&self, id: Uuid) -> Result<ScriptRun, StoreError> {
        let row = sqlx::query("SELECT * FROM script_runs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::SessionNotFound(id))?;
        session_from_row(&row)
    }

    async fn list_unfinished_sessions(&self) -> Result<Vec<ScriptRun>, StoreError> {
        let rows = sqlx::query("SELECT * FROM script_runs WHERE ended_at IS NULL ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(session_from_row).collect()
    }

    async fn get_handler_run(&self, id: Uuid) -> Result<HandlerRun, StoreError> {
        let row = sqlx::query("SELECT * FROM handler_runs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::RunNotFound(id))?;
        run_from_row(&row)
    }

    async fn list_active_runs(
        &self,
        workflow_id: Option<Uuid>,
    ) -> Result<Vec<HandlerRun>, StoreError> {
        let rows = match workflow_id {
            Some(workflow_id) => {
                sqlx::query(
                    r#"
                    SELECT * FROM handler_runs
                    WHERE status = 'active' AND workflow_id = $1
                    ORDER BY id
                    "#,
                )
                .bind(workflow_id)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM handler_runs WHERE status = 'active' ORDER BY id")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(db_err)?;
        rows.iter().map(run_from_row).collect()
    }

    async fn list_runs_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<HandlerRun>, StoreError> {
        let rows = sqlx::query("SELECT * FROM handler_runs WHERE script_run_id = $1 ORDER BY id")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(run_from_row).collect()
    }

    async fn get_mutation(&self, id: Uuid) -> Result<Mutation, StoreError> {
        let row = sqlx::query("SELECT * FROM mutations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::MutationNotFound(id))?;
        mutation_from_row(&row)
    }

    async fn find_mutation_for_run(
        &self,
        run_id: Uuid,
    ) -> Result<Option<Mutation>, StoreError> {
        let row = sqlx::query("SELECT * FROM mutations WHERE handler_run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(mutation_from_row).transpose()
    }

    async fn list_mutations_with_status(
        &self,
        status: millrun_core::model::MutationStatus,
    ) -> Result<Vec<Mutation>, StoreError> {
        let rows = sqlx::query("SELECT * FROM mutations WHERE status = $1 ORDER BY id")
            .bind(status.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(mutation_from_row).collect()
    }

    async fn list_events(
        &self,
        workflow_id: Uuid,
        topic: Option<&str>,
        status: Option<EventStatus>,
    ) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM events
            WHERE workflow_id = $1
              AND ($2::TEXT IS NULL OR topic = $2)
              AND ($3::TEXT IS NULL OR status = $3)
            ORDER BY seq
            "#,
        )
        .bind(workflow_id)
        .bind(topic)
        .bind(status.map(|s| s.to_string()))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(event_from_row).collect()
    }

    async fn count_pending_events(
        &self,
        workflow_id: Uuid,
        topics: &[String],
    ) -> Result<u64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM events
            WHERE workflow_id = $1 AND status = 'pending' AND topic = ANY($2)
            "#,
        )
        .bind(workflow_id)
        .bind(topics)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        let n: i64 = row.try_get("n").map_err(db_err)?;
        Ok(n as u64)
    }

    async fn list_reserved_events(&self) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query("SELECT * FROM events WHERE status = 'reserved' ORDER BY seq")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(event_from_row).collect()
    }

    async fn get_input(&self, id: Uuid) -> Result<InputRecord, StoreError> {
        let row = sqlx::query("SELECT * FROM input_records WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StoreError::Database(format!("input not found: {id}")))?;
        input_from_row(&row)
    }

    async fn list_inputs(&self, workflow_id: Uuid) -> Result<Vec<InputRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM input_records WHERE workflow_id = $1 ORDER BY id")
            .bind(workflow_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(input_from_row).collect()
    }

    async fn get_handler_state(
        &self,
        workflow_id: Uuid,
        handler_name: &str,
    ) -> Result<Option<HandlerState>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM handler_states WHERE workflow_id = $1 AND handler_name = $2",
        )
        .bind(workflow_id)
        .bind(handler_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(state_from_row).transpose()
    }

    async fn list_handler_states(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<HandlerState>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM handler_states WHERE workflow_id = $1 ORDER BY handler_name",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(state_from_row).collect()
    }

    async fn list_producer_schedules(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<ProducerSchedule>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM producer_schedules WHERE workflow_id = $1 ORDER BY producer_name",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(schedule_from_row).collect()
    }
}
