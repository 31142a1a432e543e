//! Script activation
//!
//! The external contract every deployment path goes through: manual UI
//! activation, the auto-fix agent after saving a new minor version, and
//! first-save promotion of a draft workflow. The handler config is always
//! read from the script row — the script is the single source of truth
//! for topology; callers never pass a config of their own.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::instrument;
use uuid::Uuid;

use millrun_core::config::WorkflowConfig;
use millrun_core::model::Workflow;
use millrun_store::Store;

use crate::emm::{ActivateScriptTx, Emm};
use crate::error::EngineError;
use crate::sched::SchedulerState;

/// Activation request
#[derive(Debug, Clone)]
pub struct ActivateScript {
    pub workflow_id: Uuid,
    pub script_id: Uuid,

    /// Schedule a post-mutation retry as part of activation (the auto-fix
    /// path resumes the failed consumer at emitting). On manual
    /// activation, `None` also cancels a previously scheduled retry.
    pub pending_retry_run_id: Option<Uuid>,

    /// Manual activations reset the auto-fix counter
    pub manual: bool,
}

impl ActivateScript {
    pub fn manual(workflow_id: Uuid, script_id: Uuid) -> Self {
        Self {
            workflow_id,
            script_id,
            pending_retry_run_id: None,
            manual: true,
        }
    }

    pub fn auto_fix(workflow_id: Uuid, script_id: Uuid, pending_retry_run_id: Option<Uuid>) -> Self {
        Self {
            workflow_id,
            script_id,
            pending_retry_run_id,
            manual: false,
        }
    }
}

/// Validate the script's config, run the atomic activation, and reseed the
/// in-memory scheduler signals
#[instrument(skip(emm, store, sched), fields(workflow_id = %req.workflow_id))]
pub async fn activate_script<S: Store>(
    emm: &Emm<S>,
    store: &Arc<S>,
    sched: &SchedulerState,
    req: ActivateScript,
) -> Result<Workflow, EngineError> {
    let script = store.get_script(req.script_id).await?;
    let config = WorkflowConfig::parse(&script.config)
        .map_err(|e| EngineError::InvariantViolation(format!("script config invalid: {e}")))?;

    let schedules = config
        .producers
        .iter()
        .map(|(name, p)| (name.clone(), p.schedule.clone()))
        .collect();
    let display_cron = config
        .producers
        .values()
        .find_map(|p| p.schedule.cron_expr().map(str::to_string));

    let workflow = emm
        .activate_script(ActivateScriptTx {
            workflow_id: req.workflow_id,
            script_id: req.script_id,
            handler_config: config.to_json(),
            schedules,
            display_cron,
            pending_retry_run_id: req.pending_retry_run_id,
            manual: req.manual,
        })
        .await?;

    // A freshly deployed workflow must re-enter prepare everywhere: all
    // consumers start dirty, wake-ats reload from persisted handler state.
    let states = store.list_handler_states(workflow.id).await?;
    let wake_ats: HashMap<_, _> = states
        .into_iter()
        .filter_map(|s| s.wake_at.map(|at| (s.handler_name, at)))
        .collect();
    sched.initialize_for_workflow(workflow.id, &config, &wake_ats);

    Ok(workflow)
}
