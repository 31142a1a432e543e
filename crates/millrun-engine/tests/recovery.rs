//! Crash recovery scenarios
//!
//! Each test manufactures the exact store state a crash would leave
//! behind (the EMM checkpoints are the crash points), then runs recovery
//! and asserts the mutation-boundary rule.

mod common;

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use common::{fixture, mutating_config, reserve_all_pending};
use millrun_core::error::ErrorKind;
use millrun_core::model::{
    EventStatus, HandlerKind, MutationStatus, RunPhase, RunStatus, SessionResult, Trigger,
    WorkflowStatus,
};
use millrun_core::prepare::Reservation;
use millrun_core::sandbox::EvalOutcome;
use millrun_engine::emm::{CreateMutation, PhaseOpts};
use millrun_engine::recovery::RecoveryReport;
use millrun_engine::testing::{
    call_and_translate, mutate_entry, next_entry, producer_entry, TestReconciler, TestTool,
};
use millrun_engine::{MutationResolution, ReconcileVerdict, SessionOutcome};
use millrun_store::Store;

/// Drive a consumer run up to the given phase with one reserved event,
/// using only EMM checkpoints — i.e. exactly what would be durable if the
/// process died right after the last call.
async fn run_up_to(
    fx: &common::Fixture,
    phase: RunPhase,
) -> (uuid::Uuid, uuid::Uuid, Option<uuid::Uuid>) {
    let mut tx = fx.store.begin().await.unwrap();
    let event = millrun_core::model::Event::pending(
        fx.workflow.id,
        "email.received",
        "m-1",
        json!({"id": "m-1"}),
        vec![],
    );
    tx.insert_event(&event).await.unwrap();
    tx.commit().await.unwrap();

    let emm = fx.engine.emm();
    let session = emm
        .create_session(fx.workflow.id, fx.script_id, Trigger::Event, None)
        .await
        .unwrap();
    let run = emm
        .create_handler_run(
            session.id,
            fx.workflow.id,
            HandlerKind::Consumer,
            "responder",
            None,
        )
        .await
        .unwrap();

    emm.update_consumer_phase(run.id, RunPhase::Preparing, Default::default())
        .await
        .unwrap();
    if phase == RunPhase::Preparing {
        return (session.id, run.id, None);
    }

    let prepare_result = json!({
        "reservations": [{"topic": "email.received", "ids": ["m-1"]}]
    });
    emm.update_consumer_phase(
        run.id,
        RunPhase::Prepared,
        PhaseOpts {
            reservations: vec![Reservation {
                topic: "email.received".into(),
                ids: vec!["m-1".into()],
            }],
            prepare_result: Some(prepare_result),
            wake: Some(None),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    if phase == RunPhase::Prepared {
        return (session.id, run.id, None);
    }

    emm.update_consumer_phase(run.id, RunPhase::Mutating, Default::default())
        .await
        .unwrap();
    let mutation = emm
        .create_mutation(
            run.id,
            CreateMutation {
                tool_namespace: "gmail".into(),
                tool_method: "send".into(),
                params: json!({"to": "a@b.c"}),
                idempotency_key: Some("m-1".into()),
            },
        )
        .await
        .unwrap();
    if phase == RunPhase::Mutating {
        return (session.id, run.id, Some(mutation.id));
    }

    emm.apply_mutation(
        mutation.id,
        Some(json!({"sent": true})),
        millrun_core::model::ResolvedBy::Engine,
    )
    .await
    .unwrap();
    // apply_mutation leaves the run at mutated; step to emitting.
    if phase == RunPhase::Emitting {
        emm.update_consumer_phase(run.id, RunPhase::Emitting, Default::default())
            .await
            .unwrap();
    }
    (session.id, run.id, Some(mutation.id))
}

/// Scenario C: killed between mutation in-flight and apply. The outcome
/// is unknowable: escalate to the user, pause the workflow, hold the
/// events. "Happened" resumes through a retry at emitting.
#[test_log::test(tokio::test)]
async fn in_flight_mutation_crash_escalates_to_user() {
    let fx = fixture(mutating_config()).await;
    let (session_id, run_id, mutation_id) = run_up_to(&fx, RunPhase::Mutating).await;
    let mutation_id = mutation_id.unwrap();

    let report = fx.engine.recover().await.unwrap();
    assert_eq!(report.indeterminate_mutations, 1);
    assert_eq!(report.repaused_runs, 1);
    assert_eq!(report.crashed_runs, 0);

    let mutation = fx.store.get_mutation(mutation_id).await.unwrap();
    assert_eq!(mutation.status, MutationStatus::Indeterminate);
    let run = fx.store.get_handler_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::PausedReconciliation);
    let workflow = fx.store.get_workflow(fx.workflow.id).await.unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Paused);
    assert_eq!(workflow.pending_retry_run_id, Some(run_id));
    let session = fx.store.get_session(session_id).await.unwrap();
    assert_eq!(session.result, Some(SessionResult::Suspended));

    // Events are not released.
    let events = fx.store.list_events(fx.workflow.id, None, None).await.unwrap();
    assert_eq!(events[0].status, EventStatus::Reserved);

    // Recovery is idempotent.
    let again = fx.engine.recover().await.unwrap();
    assert_eq!(again, RecoveryReport::default());

    // The user asserts the effect happened.
    fx.engine
        .resolve_mutation(
            mutation_id,
            MutationResolution::Happened,
            Some(json!({"sent": true})),
        )
        .await
        .unwrap();
    let workflow = fx.store.get_workflow(fx.workflow.id).await.unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Active);
    assert_eq!(workflow.pending_retry_run_id, Some(run_id));
    let run = fx.store.get_handler_run(run_id).await.unwrap();
    assert_eq!(run.phase, RunPhase::Mutated);

    // The retry session resumes at emitting and next sees the applied
    // result.
    let seen = Arc::new(Mutex::new(None));
    let captured = Arc::clone(&seen);
    fx.evaluator.enqueue(next_entry("responder"), move |req, _tools| {
        let captured = Arc::clone(&captured);
        async move {
            *captured.lock() = req.extra.clone();
            EvalOutcome::success(json!({"handled": true}))
        }
    });
    reserve_all_pending(&fx.evaluator, "responder", "email.received");

    let outcome = fx
        .engine
        .sessions()
        .run_retry_session(fx.workflow.id)
        .await
        .unwrap();
    assert_eq!(outcome, SessionOutcome::Completed);
    assert_eq!(
        seen.lock().clone(),
        Some(json!({"status": "applied", "result": {"sent": true}}))
    );

    let events = fx.store.list_events(fx.workflow.id, None, None).await.unwrap();
    assert_eq!(events[0].status, EventStatus::Consumed);
    let workflow = fx.store.get_workflow(fx.workflow.id).await.unwrap();
    assert!(workflow.pending_retry_run_id.is_none());
}

/// Pre-mutation crash: nothing external happened, so the run is crashed,
/// the holds are released and no retry is pinned — normal dirty signals
/// re-drive the work.
#[test_log::test(tokio::test)]
async fn pre_mutation_crash_releases_holds() {
    let fx = fixture(mutating_config()).await;
    let (session_id, run_id, _) = run_up_to(&fx, RunPhase::Prepared).await;

    let report = fx.engine.recover().await.unwrap();
    assert_eq!(report.crashed_runs, 1);
    assert_eq!(report.indeterminate_mutations, 0);

    let run = fx.store.get_handler_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Crashed);
    let events = fx.store.list_events(fx.workflow.id, None, None).await.unwrap();
    assert_eq!(events[0].status, EventStatus::Pending);
    let session = fx.store.get_session(session_id).await.unwrap();
    assert_eq!(session.result, Some(SessionResult::Failed));
    let workflow = fx.store.get_workflow(fx.workflow.id).await.unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Active);
    assert!(workflow.pending_retry_run_id.is_none());

    let again = fx.engine.recover().await.unwrap();
    assert_eq!(again, RecoveryReport::default());
}

/// Post-mutation crash: the effect exists. Events stay held, the retry is
/// pinned, and the retry session resumes at emitting without re-running
/// mutate.
#[test_log::test(tokio::test)]
async fn post_mutation_crash_resumes_at_emitting() {
    let fx = fixture(mutating_config()).await;
    let (_session_id, run_id, mutation_id) = run_up_to(&fx, RunPhase::Emitting).await;

    let report = fx.engine.recover().await.unwrap();
    assert_eq!(report.crashed_runs, 1);

    let run = fx.store.get_handler_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Crashed);
    let workflow = fx.store.get_workflow(fx.workflow.id).await.unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Active);
    assert_eq!(workflow.pending_retry_run_id, Some(run_id));
    let events = fx.store.list_events(fx.workflow.id, None, None).await.unwrap();
    assert_eq!(events[0].status, EventStatus::Reserved);

    fx.evaluator
        .always_returns(next_entry("responder"), json!({"handled": true}));
    reserve_all_pending(&fx.evaluator, "responder", "email.received");

    let outcome = fx
        .engine
        .sessions()
        .run_retry_session(fx.workflow.id)
        .await
        .unwrap();
    assert_eq!(outcome, SessionOutcome::Completed);

    // The original mutation never re-executed: still exactly one applied
    // row, and the retry run consumed the transferred reservation.
    let applied = fx
        .store
        .list_mutations_with_status(MutationStatus::Applied)
        .await
        .unwrap();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].id, mutation_id.unwrap());
    let events = fx.store.list_events(fx.workflow.id, None, None).await.unwrap();
    assert_eq!(events[0].status, EventStatus::Consumed);

    let retry = fx
        .store
        .get_handler_run(events[0].reserved_by.unwrap())
        .await
        .unwrap();
    assert_eq!(retry.retry_of, Some(run_id));
    assert_eq!(retry.status, RunStatus::Committed);
}

/// A session with no end timestamp and no live runs is closed as failed.
#[test_log::test(tokio::test)]
async fn dangling_session_is_closed() {
    let fx = fixture(mutating_config()).await;
    let session = fx
        .engine
        .emm()
        .create_session(fx.workflow.id, fx.script_id, Trigger::Schedule, None)
        .await
        .unwrap();

    let report = fx.engine.recover().await.unwrap();
    assert_eq!(report.closed_sessions, 1);
    let session = fx.store.get_session(session.id).await.unwrap();
    assert_eq!(session.result, Some(SessionResult::Failed));
}

/// Reserved events whose owner is terminal with no retry pinned are
/// orphans; recovery self-heals them back to pending.
#[test_log::test(tokio::test)]
async fn orphaned_reservation_is_released() {
    let fx = fixture(mutating_config()).await;

    // Manufacture the damage directly: a committed run still owning a
    // reservation.
    let session = fx
        .engine
        .emm()
        .create_session(fx.workflow.id, fx.script_id, Trigger::Event, None)
        .await
        .unwrap();
    let mut tx = fx.store.begin().await.unwrap();
    let mut run = millrun_core::model::HandlerRun::new(
        session.id,
        fx.workflow.id,
        HandlerKind::Consumer,
        "responder",
    );
    run.status = RunStatus::Committed;
    run.phase = RunPhase::Committed;
    tx.insert_handler_run(&run).await.unwrap();
    let event = millrun_core::model::Event::pending(
        fx.workflow.id,
        "email.received",
        "m-1",
        json!({}),
        vec![],
    );
    tx.insert_event(&event).await.unwrap();
    tx.reserve_events(fx.workflow.id, "email.received", &["m-1".into()], run.id)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let report = fx.engine.recover().await.unwrap();
    assert_eq!(report.released_events, 1);
    let events = fx.store.list_events(fx.workflow.id, None, None).await.unwrap();
    assert_eq!(events[0].status, EventStatus::Pending);
}

/// Background reconcile: a needs_reconcile mutation is re-probed on the
/// scheduler tick; an applied verdict pins the retry and the same tick
/// drives it to completion.
#[test_log::test(tokio::test)]
async fn background_reconcile_applies_and_retries() {
    let fx = fixture(mutating_config()).await;
    let (_session_id, run_id, mutation_id) = run_up_to(&fx, RunPhase::Mutating).await;
    let mutation_id = mutation_id.unwrap();

    // The crash-free shape of an uncertain outcome: mutation marked
    // needs_reconcile, run paused for reconciliation.
    fx.engine
        .emm()
        .update_mutation_status(mutation_id, MutationStatus::NeedsReconcile)
        .await
        .unwrap();
    fx.engine
        .emm()
        .update_handler_run_status(
            run_id,
            RunStatus::PausedReconciliation,
            Some(millrun_core::error::ClassifiedError::network("timeout")),
            Default::default(),
        )
        .await
        .unwrap();

    // needs_reconcile keeps the workflow active for the background probe.
    let workflow = fx.store.get_workflow(fx.workflow.id).await.unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Active);
    assert!(workflow.pending_retry_run_id.is_none());

    let reconciler = Arc::new(TestReconciler::new(ReconcileVerdict::Applied(Some(
        json!({"sent": true}),
    ))));
    fx.engine
        .reconcilers()
        .register("gmail", "send", reconciler.clone());

    fx.evaluator
        .always_returns(next_entry("responder"), json!({"handled": true}));
    reserve_all_pending(&fx.evaluator, "responder", "email.received");

    fx.engine.scheduler().tick().await;

    assert_eq!(reconciler.probes(), 1);
    let mutation = fx.store.get_mutation(mutation_id).await.unwrap();
    assert_eq!(mutation.status, MutationStatus::Applied);
    let events = fx.store.list_events(fx.workflow.id, None, None).await.unwrap();
    assert_eq!(events[0].status, EventStatus::Consumed);
    let workflow = fx.store.get_workflow(fx.workflow.id).await.unwrap();
    assert!(workflow.pending_retry_run_id.is_none());
}

/// Background reconcile that settles as failed: the mutation fails, the
/// holds go back to pending, and the paused run closes carrying the
/// error kind it paused with — not a made-up one. The same tick then
/// re-runs the consumer from a fresh prepare and succeeds.
#[test_log::test(tokio::test)]
async fn background_reconcile_failure_closes_run_with_its_kind() {
    let fx = fixture(mutating_config()).await;
    let (_session_id, run_id, mutation_id) = run_up_to(&fx, RunPhase::Mutating).await;
    let mutation_id = mutation_id.unwrap();

    fx.engine
        .emm()
        .update_mutation_status(mutation_id, MutationStatus::NeedsReconcile)
        .await
        .unwrap();
    fx.engine
        .emm()
        .update_handler_run_status(
            run_id,
            RunStatus::PausedReconciliation,
            Some(millrun_core::error::ClassifiedError::network("timeout")),
            Default::default(),
        )
        .await
        .unwrap();

    let reconciler = Arc::new(TestReconciler::new(ReconcileVerdict::Failed(
        "message was never sent".into(),
    )));
    fx.engine
        .reconcilers()
        .register("gmail", "send", reconciler.clone());

    // The retry after a failed reconcile is a fresh prepare; the tick's
    // schedule session also runs the producer, so script the whole loop.
    let send_tool = Arc::new(
        TestTool::new("gmail", "send", false).with_fallback(Ok(json!({"sent": true}))),
    );
    fx.engine.tools().register(send_tool.clone());
    fx.evaluator
        .always_returns(producer_entry("emailPoll"), json!({}));
    reserve_all_pending(&fx.evaluator, "responder", "email.received");
    fx.evaluator
        .always(mutate_entry("responder"), |_req, tools| async move {
            call_and_translate(&*tools, "gmail", "send", json!({"to": "a@b.c"})).await
        });
    fx.evaluator
        .always_returns(next_entry("responder"), json!({"handled": true}));

    fx.engine.scheduler().tick().await;

    assert_eq!(reconciler.probes(), 1);

    // The old run closed with the network kind it paused under.
    let old_run = fx.store.get_handler_run(run_id).await.unwrap();
    assert_eq!(old_run.status, RunStatus::FailedNetwork);
    assert_eq!(old_run.error_kind, Some(ErrorKind::Network));
    let old_mutation = fx.store.get_mutation(mutation_id).await.unwrap();
    assert_eq!(old_mutation.status, MutationStatus::Failed);

    // The fresh run applied a new mutation and consumed the event.
    let applied = fx
        .store
        .list_mutations_with_status(MutationStatus::Applied)
        .await
        .unwrap();
    assert_eq!(applied.len(), 1);
    assert_eq!(send_tool.executions(), 1);
    let events = fx.store.list_events(fx.workflow.id, None, None).await.unwrap();
    assert_eq!(events[0].status, EventStatus::Consumed);
    let workflow = fx.store.get_workflow(fx.workflow.id).await.unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Active);
    assert!(workflow.pending_retry_run_id.is_none());
}

/// "Did not happen": the mutation fails, the holds are released, and the
/// run closes as an internal failure — no network I/O occurred in the
/// assertion itself. The workflow is runnable again with nothing pinned.
#[test_log::test(tokio::test)]
async fn did_not_happen_resolution_closes_run_and_releases() {
    let fx = fixture(mutating_config()).await;
    let (_session_id, run_id, mutation_id) = run_up_to(&fx, RunPhase::Mutating).await;
    let mutation_id = mutation_id.unwrap();

    // Crash with the mutation in flight, then recover: indeterminate,
    // workflow paused on the user.
    fx.engine.recover().await.unwrap();

    fx.engine
        .resolve_mutation(mutation_id, MutationResolution::DidNotHappen, None)
        .await
        .unwrap();

    let mutation = fx.store.get_mutation(mutation_id).await.unwrap();
    assert_eq!(mutation.status, MutationStatus::Failed);
    assert!(!mutation.user_skip);

    let run = fx.store.get_handler_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::FailedInternal);
    assert_eq!(run.error_kind, Some(ErrorKind::Internal));

    // Holds released; the consumer re-prepares from scratch on the next
    // session.
    let events = fx.store.list_events(fx.workflow.id, None, None).await.unwrap();
    assert_eq!(events[0].status, EventStatus::Pending);
    let workflow = fx.store.get_workflow(fx.workflow.id).await.unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Active);
    assert!(workflow.pending_retry_run_id.is_none());
}

/// "Skip": the run continues as if the mutation were deliberately not
/// made. The retry resumes at emitting, next sees skipped, and the held
/// events are consumed on commit.
#[test_log::test(tokio::test)]
async fn skip_resolution_commits_with_skipped() {
    let fx = fixture(mutating_config()).await;
    let (_session_id, run_id, mutation_id) = run_up_to(&fx, RunPhase::Mutating).await;
    let mutation_id = mutation_id.unwrap();

    fx.engine.recover().await.unwrap();

    fx.engine
        .resolve_mutation(mutation_id, MutationResolution::Skip, None)
        .await
        .unwrap();

    let mutation = fx.store.get_mutation(mutation_id).await.unwrap();
    assert_eq!(mutation.status, MutationStatus::Failed);
    assert!(mutation.user_skip);
    let workflow = fx.store.get_workflow(fx.workflow.id).await.unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Active);
    assert_eq!(workflow.pending_retry_run_id, Some(run_id));

    // Events stay held for the retry to consume.
    let events = fx.store.list_events(fx.workflow.id, None, None).await.unwrap();
    assert_eq!(events[0].status, EventStatus::Reserved);

    let seen = Arc::new(Mutex::new(None));
    let captured = Arc::clone(&seen);
    fx.evaluator.enqueue(next_entry("responder"), move |req, _tools| {
        let captured = Arc::clone(&captured);
        async move {
            *captured.lock() = req.extra.clone();
            EvalOutcome::success(json!({"handled": true}))
        }
    });
    reserve_all_pending(&fx.evaluator, "responder", "email.received");

    let outcome = fx
        .engine
        .sessions()
        .run_retry_session(fx.workflow.id)
        .await
        .unwrap();
    assert_eq!(outcome, SessionOutcome::Completed);
    assert_eq!(seen.lock().clone(), Some(json!({"status": "skipped"})));

    let events = fx.store.list_events(fx.workflow.id, None, None).await.unwrap();
    assert_eq!(events[0].status, EventStatus::Consumed);
    let workflow = fx.store.get_workflow(fx.workflow.id).await.unwrap();
    assert!(workflow.pending_retry_run_id.is_none());
}
