//! End-to-end scenarios over the in-memory store

mod common;

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use common::{fixture, fixture_with, mutating_config, poll_and_log_config, reserve_all_pending};
use millrun_core::error::ClassifiedError;
use millrun_core::model::{
    EventStatus, HandlerKind, MutationStatus, RunStatus, SessionResult, Trigger, WorkflowStatus,
};
use millrun_core::sandbox::EvalOutcome;
use millrun_engine::testing::{
    call_and_translate, mutate_entry, next_entry, prepare_entry, producer_entry, TestReconciler,
    TestTool,
};
use millrun_engine::{EngineConfig, ReconcileVerdict, SessionOutcome};
use millrun_store::Store;

/// Scenario A: schedule session runs the producer, then drains the
/// consumer until the topic is empty.
#[tokio::test]
async fn producer_consumer_happy_path() {
    let fx = fixture(poll_and_log_config()).await;

    // Producer publishes two events from two registered inputs.
    fx.evaluator
        .enqueue(producer_entry("emailPoll"), |_req, tools| async move {
            for id in ["m-1", "m-2"] {
                let registered = tools
                    .call(
                        "inputs",
                        "register",
                        json!({"source": "gmail", "type": "message", "id": id}),
                    )
                    .await
                    .expect("register");
                tools
                    .call(
                        "events",
                        "publish",
                        json!({
                            "topic": "email.received",
                            "messageId": id,
                            "payload": {"id": id},
                            "inputId": registered["inputId"],
                        }),
                    )
                    .await
                    .expect("publish");
            }
            EvalOutcome::success(json!({"cursor": "m-2"}))
        });
    reserve_all_pending(&fx.evaluator, "log", "email.received");

    let outcome = fx
        .engine
        .sessions()
        .execute_session(fx.workflow.id, Trigger::Schedule)
        .await
        .unwrap();
    assert_eq!(outcome, SessionOutcome::Completed);

    // One completed session.
    let sessions = fx.store.list_unfinished_sessions().await.unwrap();
    assert!(sessions.is_empty());

    // One producer run and two consumer runs (the second finds nothing and
    // clears the dirty flag), all committed.
    let events = fx.store.list_events(fx.workflow.id, None, None).await.unwrap();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.status == EventStatus::Consumed));

    let runs = fx.store.list_active_runs(None).await.unwrap();
    assert!(runs.is_empty());

    let all_sessions = {
        // the only session is the one the events' runs belong to
        let run = fx
            .store
            .get_handler_run(events[0].reserved_by.unwrap())
            .await
            .unwrap();
        fx.store.list_runs_for_session(run.script_run_id).await.unwrap()
    };
    let producers: Vec<_> = all_sessions
        .iter()
        .filter(|r| r.kind == HandlerKind::Producer)
        .collect();
    let consumers: Vec<_> = all_sessions
        .iter()
        .filter(|r| r.kind == HandlerKind::Consumer)
        .collect();
    assert_eq!(producers.len(), 1);
    assert_eq!(consumers.len(), 2);
    assert!(all_sessions.iter().all(|r| r.status == RunStatus::Committed));

    let session = fx
        .store
        .get_session(all_sessions[0].script_run_id)
        .await
        .unwrap();
    assert_eq!(session.result, Some(SessionResult::Completed));
    assert_eq!(session.handler_count, 3);

    // Causal edges: each event traces to exactly one registered input.
    for event in &events {
        assert_eq!(event.caused_by.len(), 1);
        let input = fx.store.get_input(event.caused_by[0]).await.unwrap();
        assert_eq!(input.external_id, event.message_id);
    }

    // Nothing left to do.
    assert!(!fx
        .engine
        .scheduler_state()
        .any_consumer_ready(fx.workflow.id, chrono::Utc::now()));
}

/// Scenario B: mutate applies through the tool, next receives the applied
/// result, and the published follow-up event inherits causality.
#[tokio::test]
async fn mutation_success_with_next() {
    let fx = fixture(mutating_config()).await;

    let send_tool = Arc::new(
        TestTool::new("gmail", "send", false)
            .with_fallback(Ok(json!({"sent": true, "threadId": "t-9"}))),
    );
    fx.engine.tools().register(send_tool.clone());

    common::publish_one(&fx.evaluator, "emailPoll", "m-1");
    reserve_all_pending(&fx.evaluator, "responder", "email.received");
    fx.evaluator
        .enqueue(mutate_entry("responder"), |_req, tools| async move {
            call_and_translate(&*tools, "gmail", "send", json!({"to": "a@b.c"})).await
        });

    let seen_mutation = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&seen_mutation);
    fx.evaluator
        .enqueue(next_entry("responder"), move |req, tools| {
            let seen = Arc::clone(&seen);
            async move {
                *seen.lock() = req.extra.clone();
                tools
                    .call(
                        "events",
                        "publish",
                        json!({
                            "topic": "email.handled",
                            "messageId": "handled-1",
                            "payload": {"ok": true},
                        }),
                    )
                    .await
                    .expect("publish from next");
                EvalOutcome::success(json!({"replied": 1}))
            }
        });

    let outcome = fx
        .engine
        .sessions()
        .execute_session(fx.workflow.id, Trigger::Schedule)
        .await
        .unwrap();
    assert_eq!(outcome, SessionOutcome::Completed);

    // The mutation row is applied and the tool ran exactly once.
    let applied = fx
        .store
        .list_mutations_with_status(MutationStatus::Applied)
        .await
        .unwrap();
    assert_eq!(applied.len(), 1);
    assert_eq!(send_tool.executions(), 1);

    // next saw the applied result.
    assert_eq!(
        seen_mutation.lock().clone(),
        Some(json!({"status": "applied", "result": {"sent": true, "threadId": "t-9"}}))
    );

    // The follow-up event inherits the reserved event's causes.
    let handled = fx
        .store
        .list_events(fx.workflow.id, Some("email.handled"), None)
        .await
        .unwrap();
    assert_eq!(handled.len(), 1);
    let source = fx
        .store
        .list_events(fx.workflow.id, Some("email.received"), None)
        .await
        .unwrap();
    assert_eq!(handled[0].caused_by, source[0].caused_by);
    assert_eq!(source[0].status, EventStatus::Consumed);
}

/// Scenario D: a network fault in the mutation tool call itself, with a
/// reconciler that says the effect does not exist: mutation failed, events
/// released, run paused transient, backoff armed — then a fresh session
/// retries from prepare and succeeds.
#[tokio::test]
async fn transient_mutation_failure_retries_fresh() {
    let fx = fixture(mutating_config()).await;

    let send_tool = Arc::new(TestTool::new("gmail", "send", false));
    send_tool.push_outcome(Err(ClassifiedError::network("connection reset")));
    fx.engine.tools().register(send_tool.clone());
    fx.engine.reconcilers().register(
        "gmail",
        "send",
        Arc::new(TestReconciler::new(ReconcileVerdict::Failed(
            "no such message on the server".into(),
        ))),
    );

    common::publish_one(&fx.evaluator, "emailPoll", "m-1");
    reserve_all_pending(&fx.evaluator, "responder", "email.received");
    fx.evaluator
        .always(mutate_entry("responder"), |_req, tools| async move {
            call_and_translate(&*tools, "gmail", "send", json!({"to": "a@b.c"})).await
        });
    fx.evaluator
        .always_returns(next_entry("responder"), json!({"replied": true}));

    let outcome = fx
        .engine
        .sessions()
        .execute_session(fx.workflow.id, Trigger::Schedule)
        .await
        .unwrap();
    assert_eq!(outcome, SessionOutcome::Transient);

    // Mutation failed; the event went back to pending; backoff is armed.
    let failed = fx
        .store
        .list_mutations_with_status(MutationStatus::Failed)
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    let events = fx
        .store
        .list_events(fx.workflow.id, Some("email.received"), None)
        .await
        .unwrap();
    assert_eq!(events[0].status, EventStatus::Pending);

    let workflow = fx.store.get_workflow(fx.workflow.id).await.unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Active);
    assert!(workflow.pending_retry_run_id.is_none());
    assert_eq!(workflow.backoff_secs, 30);
    assert!(workflow.backoff_until.is_some());

    // The retry is a fresh prepare, not a resume: second session re-runs
    // the whole consumer and the tool call succeeds this time.
    let outcome = fx
        .engine
        .sessions()
        .execute_session(fx.workflow.id, Trigger::Event)
        .await
        .unwrap();
    assert_eq!(outcome, SessionOutcome::Completed);
    assert_eq!(send_tool.executions(), 2);

    let applied = fx
        .store
        .list_mutations_with_status(MutationStatus::Applied)
        .await
        .unwrap();
    assert_eq!(applied.len(), 1);
    let events = fx
        .store
        .list_events(fx.workflow.id, Some("email.received"), None)
        .await
        .unwrap();
    assert_eq!(events[0].status, EventStatus::Consumed);

    // A committed consumer disarms the backoff.
    let workflow = fx.store.get_workflow(fx.workflow.id).await.unwrap();
    assert_eq!(workflow.backoff_secs, 0);
    assert!(workflow.backoff_until.is_none());
}

/// Scenario E: publishing to an undeclared topic is a logic error; the
/// workflow enters maintenance for the auto-fix agent.
#[tokio::test]
async fn undeclared_topic_publish_enters_maintenance() {
    let fx = fixture(mutating_config()).await;

    common::publish_one(&fx.evaluator, "emailPoll", "m-1");
    reserve_all_pending(&fx.evaluator, "responder", "email.received");
    fx.evaluator
        .returns(mutate_entry("responder"), json!({"skipped": true}));
    fx.evaluator
        .enqueue(next_entry("responder"), |_req, tools| async move {
            call_and_translate(
                &*tools,
                "events",
                "publish",
                json!({
                    "topic": "not.declared",
                    "messageId": "x",
                    "payload": {},
                }),
            )
            .await
        });

    let outcome = fx
        .engine
        .sessions()
        .execute_session(fx.workflow.id, Trigger::Schedule)
        .await
        .unwrap();
    assert_eq!(outcome, SessionOutcome::Maintenance);

    let workflow = fx.store.get_workflow(fx.workflow.id).await.unwrap();
    assert!(workflow.maintenance);
    // Maintenance does not put the workflow into error.
    assert_eq!(workflow.status, WorkflowStatus::Active);

    // The failing run is post-mutation-boundary (emitting), so its
    // reserved events are retained for the fix retry.
    let events = fx
        .store
        .list_events(fx.workflow.id, Some("email.received"), None)
        .await
        .unwrap();
    assert_eq!(events[0].status, EventStatus::Reserved);
}

/// Scenario F: a second publish with the same message id is a no-op and
/// the consumer sees the event exactly once.
#[tokio::test]
async fn idempotent_event_publish() {
    let fx = fixture(poll_and_log_config()).await;

    common::publish_one(&fx.evaluator, "emailPoll", "m-1");
    common::publish_one(&fx.evaluator, "emailPoll", "m-1");
    reserve_all_pending(&fx.evaluator, "log", "email.received");

    let outcome = fx
        .engine
        .sessions()
        .execute_session(fx.workflow.id, Trigger::Schedule)
        .await
        .unwrap();
    assert_eq!(outcome, SessionOutcome::Completed);

    // Producer schedule advanced; run the producer again manually.
    let outcome = fx.engine.run_workflow_now(fx.workflow.id).await.unwrap();
    assert_eq!(outcome, SessionOutcome::Completed);

    let events = fx.store.list_events(fx.workflow.id, None, None).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, EventStatus::Consumed);
}

/// Property 10: a session executes at most `max_iterations` consumer
/// steps, then finishes cleanly with work left over.
#[tokio::test]
async fn session_budget_bounds_consumer_steps() {
    let config = json!({
        "topics": ["queue"],
        "consumers": {
            "worker": { "subscribe": ["queue"], "hasMutate": false, "hasNext": false }
        }
    });
    let fx = fixture_with(
        config,
        EngineConfig {
            max_iterations: 3,
            ..Default::default()
        },
    )
    .await;

    // Five pending events, inserted straight into the ledger.
    {
        let mut tx = fx.store.begin().await.unwrap();
        for i in 0..5 {
            let event = millrun_core::model::Event::pending(
                fx.workflow.id,
                "queue",
                format!("q-{i}"),
                json!({}),
                vec![],
            );
            tx.insert_event(&event).await.unwrap();
        }
        tx.commit().await.unwrap();
    }

    // Prepare reserves exactly one event per run.
    fx.evaluator
        .always(prepare_entry("worker"), |_req, tools| async move {
            let pending = tools
                .call("events", "peek", json!({"topic": "queue", "limit": 1}))
                .await
                .expect("peek");
            let ids: Vec<String> = pending
                .as_array()
                .unwrap()
                .iter()
                .map(|e| e["messageId"].as_str().unwrap().to_string())
                .collect();
            if ids.is_empty() {
                EvalOutcome::success(json!({}))
            } else {
                EvalOutcome::success(json!({"reservations": [{"topic": "queue", "ids": ids}]}))
            }
        });

    let outcome = fx
        .engine
        .sessions()
        .execute_session(fx.workflow.id, Trigger::Event)
        .await
        .unwrap();
    assert_eq!(outcome, SessionOutcome::Completed);

    let consumed = fx
        .store
        .list_events(fx.workflow.id, None, Some(EventStatus::Consumed))
        .await
        .unwrap();
    let pending = fx
        .store
        .list_events(fx.workflow.id, None, Some(EventStatus::Pending))
        .await
        .unwrap();
    assert_eq!(consumed.len(), 3);
    assert_eq!(pending.len(), 2);
}

/// Property 1: at most one active handler run per workflow.
#[tokio::test]
async fn single_flight_per_workflow() {
    let fx = fixture(poll_and_log_config()).await;

    let session = fx
        .engine
        .emm()
        .create_session(fx.workflow.id, fx.script_id, Trigger::Manual, None)
        .await
        .unwrap();
    let _first = fx
        .engine
        .emm()
        .create_handler_run(
            session.id,
            fx.workflow.id,
            HandlerKind::Producer,
            "emailPoll",
            None,
        )
        .await
        .unwrap();

    let second = fx
        .engine
        .emm()
        .create_handler_run(
            session.id,
            fx.workflow.id,
            HandlerKind::Consumer,
            "log",
            None,
        )
        .await;
    assert!(matches!(
        second,
        Err(millrun_engine::EngineError::InvariantViolation(_))
    ));

    // And the manual entry point refuses while a run is active.
    let refused = fx.engine.run_workflow_now(fx.workflow.id).await;
    assert!(matches!(
        refused,
        Err(millrun_engine::EngineError::ConflictingRetry(_))
    ));
}

/// The auto-fix budget: after `max_auto_fixes` fix activations, another
/// logic failure turns the workflow to error instead of maintenance.
#[tokio::test]
async fn auto_fix_budget_exhaustion() {
    let config = json!({
        "topics": ["queue"],
        "consumers": {
            "worker": { "subscribe": ["queue"], "hasMutate": false, "hasNext": false }
        }
    });
    let fx = fixture_with(
        config,
        EngineConfig {
            max_auto_fixes: 1,
            ..Default::default()
        },
    )
    .await;

    fx.evaluator.always(prepare_entry("worker"), |_req, _tools| async move {
        EvalOutcome::failure(ClassifiedError::logic("boom"))
    });

    let outcome = fx
        .engine
        .sessions()
        .execute_session(fx.workflow.id, Trigger::Event)
        .await
        .unwrap();
    assert_eq!(outcome, SessionOutcome::Maintenance);
    let workflow = fx.store.get_workflow(fx.workflow.id).await.unwrap();
    assert!(workflow.maintenance);

    // The auto-fix agent saves and activates a minor version; the counter
    // goes to 1 (== max).
    let fix = fx
        .engine
        .save_script(
            fx.workflow.id,
            "export default workflow /* fixed */".into(),
            fx.store.get_script(fx.script_id).await.unwrap().config,
            millrun_core::model::ScriptKind::AutoFix,
            None,
            Some("auto-fix".into()),
        )
        .await
        .unwrap();
    assert_eq!(fix.version(), (1, 1));
    let workflow = fx
        .engine
        .activate_script(millrun_engine::ActivateScript::auto_fix(
            fx.workflow.id,
            fix.id,
            None,
        ))
        .await
        .unwrap();
    assert_eq!(workflow.maintenance_fix_count, 1);
    assert!(!workflow.maintenance);

    // The fix still fails with a logic error: budget exhausted, workflow
    // goes to error.
    let outcome = fx
        .engine
        .sessions()
        .execute_session(fx.workflow.id, Trigger::Event)
        .await
        .unwrap();
    assert_eq!(outcome, SessionOutcome::Maintenance);
    let workflow = fx.store.get_workflow(fx.workflow.id).await.unwrap();
    assert!(!workflow.maintenance);
    assert_eq!(workflow.status, WorkflowStatus::Error);
}
