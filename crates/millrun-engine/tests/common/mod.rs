//! Shared fixture for engine scenario tests
#![allow(dead_code)]

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use millrun_core::model::{ScriptKind, Workflow};
use millrun_engine::testing::ScriptedEvaluator;
use millrun_engine::{ActivateScript, Engine, EngineConfig};
use millrun_store::MemoryStore;

pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub engine: Engine<MemoryStore>,
    pub evaluator: Arc<ScriptedEvaluator>,
    pub workflow: Workflow,
    pub script_id: Uuid,
}

/// Build an engine over a fresh in-memory store, save the given config as
/// the first script version, and activate it.
pub async fn fixture(config: serde_json::Value) -> Fixture {
    fixture_with(config, EngineConfig::default()).await
}

pub async fn fixture_with(config: serde_json::Value, engine_config: EngineConfig) -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let evaluator = Arc::new(ScriptedEvaluator::new());
    let engine = Engine::with_config(
        Arc::clone(&store),
        evaluator.clone() as Arc<dyn millrun_core::sandbox::Evaluator>,
        engine_config,
    );

    let workflow = engine.create_workflow(Uuid::now_v7()).await.unwrap();
    let script = engine
        .save_script(
            workflow.id,
            "export default workflow".into(),
            config,
            ScriptKind::Initial,
            Some("test workflow".into()),
            None,
        )
        .await
        .unwrap();
    let workflow = engine
        .activate_script(ActivateScript::manual(workflow.id, script.id))
        .await
        .unwrap();

    Fixture {
        store,
        engine,
        evaluator,
        workflow,
        script_id: script.id,
    }
}

/// A producer polling email plus a pure logging consumer
pub fn poll_and_log_config() -> serde_json::Value {
    json!({
        "topics": ["email.received"],
        "producers": {
            "emailPoll": {
                "schedule": { "interval": "60s" },
                "publishes": ["email.received"]
            }
        },
        "consumers": {
            "log": {
                "subscribe": ["email.received"],
                "hasMutate": false,
                "hasNext": false
            }
        }
    })
}

/// A mutating consumer with a next phase
pub fn mutating_config() -> serde_json::Value {
    json!({
        "topics": ["email.received", "email.handled"],
        "producers": {
            "emailPoll": {
                "schedule": { "interval": "60s" },
                "publishes": ["email.received"]
            }
        },
        "consumers": {
            "responder": {
                "subscribe": ["email.received"],
                "publishes": ["email.handled"],
                "hasMutate": true,
                "hasNext": true
            }
        }
    })
}

/// Producer behavior: register one input and publish one event with the
/// given message id
pub fn publish_one(evaluator: &ScriptedEvaluator, producer: &str, message_id: &str) {
    let message_id = message_id.to_string();
    evaluator.enqueue(
        millrun_engine::testing::producer_entry(producer),
        move |_req, tools| {
            let message_id = message_id.clone();
            async move {
                let registered = tools
                    .call(
                        "inputs",
                        "register",
                        json!({"source": "gmail", "type": "message", "id": message_id}),
                    )
                    .await
                    .expect("register input");
                let input_id = registered["inputId"].clone();
                tools
                    .call(
                        "events",
                        "publish",
                        json!({
                            "topic": "email.received",
                            "messageId": message_id,
                            "payload": {"id": message_id},
                            "inputId": input_id,
                        }),
                    )
                    .await
                    .expect("publish");
                millrun_core::sandbox::EvalOutcome::success(json!({"cursor": message_id}))
            }
        },
    );
}

/// Prepare behavior that peeks the topic and reserves everything pending
pub fn reserve_all_pending(evaluator: &ScriptedEvaluator, consumer: &str, topic: &str) {
    let topic = topic.to_string();
    evaluator.always(
        millrun_engine::testing::prepare_entry(consumer),
        move |_req, tools| {
            let topic = topic.clone();
            async move {
                let pending = tools
                    .call("events", "peek", json!({"topic": topic}))
                    .await
                    .expect("peek");
                let ids: Vec<String> = pending
                    .as_array()
                    .unwrap()
                    .iter()
                    .map(|e| e["messageId"].as_str().unwrap().to_string())
                    .collect();
                if ids.is_empty() {
                    millrun_core::sandbox::EvalOutcome::success(json!({}))
                } else {
                    millrun_core::sandbox::EvalOutcome::success(json!({
                        "reservations": [{"topic": topic, "ids": ids}]
                    }))
                }
            }
        },
    );
}
