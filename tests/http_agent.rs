//! Task dispatch over the default HTTP connector against a local agent.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use common::{deliver, output, test_config};
use flowrunner::agent::{AgentInfo, TaskOutcome};
use flowrunner::workflow::ParameterBinding;
use flowrunner::{Engine, InstanceStatus, StepDefinition, WorkflowDefinition};

type Received = Arc<Mutex<Vec<Value>>>;

async fn start_task(State(received): State<Received>, Json(body): Json<Value>) -> Json<Value> {
    received.lock().push(body);
    Json(json!({ "taskId": "t-1" }))
}

/// Serves `/ping` and `/tasks` on an ephemeral port.
async fn spawn_agent() -> (String, Received) {
    let received = Received::default();
    let app = Router::new()
        .route("/ping", post(|| async { "pong" }))
        .route("/tasks", post(start_task))
        .with_state(received.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (address, received)
}

#[tokio::test]
async fn test_task_dispatched_over_http() {
    let (address, received) = spawn_agent().await;
    let engine = Engine::new(test_config()).unwrap();
    engine
        .register_agent(AgentInfo::new("mailer", address).with_task("email.send"))
        .await
        .unwrap();
    assert!(engine.ping_agent("mailer"));

    engine
        .register_definition(
            WorkflowDefinition::from_steps(
                "welcome",
                vec![StepDefinition::task("send", "email.send")
                    .with_parameter("to", ParameterBinding::workflow_input("email"))],
            )
            .with_output("messageId", ParameterBinding::task_output("send", "messageId")),
        )
        .await
        .unwrap();

    let mut input = HashMap::new();
    input.insert("email".to_string(), json!("ada@example.com"));
    let id = engine.start_workflow("welcome", input).await.unwrap();

    deliver(&engine, "t-1", TaskOutcome::completed(output(&[("messageId", json!("m-42"))]))).await;
    let instance = engine
        .wait_for_completion(&id, Some(Duration::from_secs(10)))
        .await
        .unwrap();

    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(instance.output.unwrap()["messageId"], json!("m-42"));

    let received = received.lock();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0]["taskType"], json!("email.send"));
    assert_eq!(received[0]["input"]["to"], json!("ada@example.com"));
}

#[tokio::test]
async fn test_unreachable_agent_is_not_registered() {
    // Bind and release a port so nothing listens on it
    let address = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    };

    let engine = Engine::new(test_config()).unwrap();
    let result = engine
        .register_agent(AgentInfo::new("ghost", address).with_task("email.send"))
        .await;

    assert!(result.is_err());
    assert!(!engine.ping_agent("ghost"));
    assert!(engine.agents().get_agent_for_task_type("email.send").is_none());
}
