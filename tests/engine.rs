//! End-to-end workflow runs through the engine with in-memory
//! repositories and a mock agent.

mod common;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;

use common::{deliver, drain, engine_with_agent, output, step_event_index, test_config};
use flowrunner::agent::TaskOutcome;
use flowrunner::execution::{StepExecution, StepResult, StepTypeExecutor};
use flowrunner::monitoring::EngineEvent;
use flowrunner::workflow::{ParameterBinding, ParameterDefinition, TerminateOutcome};
use flowrunner::{
    Engine, EngineConfig, EngineError, InstanceStatus, StepDefinition, StepType, WorkflowDefinition,
};

const LIMIT: Option<Duration> = Some(Duration::from_secs(10));

fn constant(duration: &str) -> ParameterBinding {
    ParameterBinding::constant(duration)
}

#[tokio::test]
async fn test_single_wait_step_completes() {
    let (engine, _) = engine_with_agent(test_config()).await;
    engine
        .register_definition(WorkflowDefinition::from_steps(
            "nap",
            vec![StepDefinition::wait("pause", constant("1s"))],
        ))
        .await
        .unwrap();

    let mut events = engine.subscribe();
    let started = Instant::now();
    let id = engine.start_workflow("nap", HashMap::new()).await.unwrap();
    let instance = engine.wait_for_completion(&id, LIMIT).await.unwrap();

    assert_eq!(instance.status, InstanceStatus::Completed);
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(instance.started_at.unwrap() < instance.completed_at.unwrap());

    let statuses: Vec<InstanceStatus> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            EngineEvent::WorkflowStatusChanged {
                workflow_instance_id,
                status,
                ..
            } if workflow_instance_id == id => Some(status),
            _ => None,
        })
        .collect();
    assert_eq!(statuses, vec![InstanceStatus::Running, InstanceStatus::Completed]);
}

#[tokio::test]
async fn test_unregistered_task_type_fails_workflow() {
    let (engine, agent) = engine_with_agent(test_config()).await;
    engine
        .register_definition(WorkflowDefinition::from_steps(
            "ship",
            vec![StepDefinition::task("ship", "shipping.book")],
        ))
        .await
        .unwrap();

    let id = engine.start_workflow("ship", HashMap::new()).await.unwrap();
    let instance = engine.wait_for_completion(&id, LIMIT).await.unwrap();

    assert_eq!(instance.status, InstanceStatus::Failed);
    let message = instance.error_message.unwrap();
    assert!(message.contains("shipping.book"), "{}", message);

    let steps = engine.list_step_instances(&id).await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].status, InstanceStatus::Failed);
    assert!(steps[0].output.is_none());
    assert!(agent.started.lock().is_empty());
}

fn fan_in() -> WorkflowDefinition {
    WorkflowDefinition::from_steps(
        "fan_in",
        vec![
            StepDefinition::fork("split", "merge", ["short", "long"]),
            StepDefinition::wait("short", constant("50ms")).then("merge"),
            StepDefinition::wait("long", constant("200ms")).then("merge"),
            StepDefinition::join("merge", ["short", "long"]).then("charge"),
            StepDefinition::task("charge", "payments.charge")
                .with_parameter("order", ParameterBinding::workflow_input("orderId"))
                .with_parameter("waited", ParameterBinding::task_output("long", "duration")),
        ],
    )
    .with_output("receipt", ParameterBinding::task_output("charge", "receipt"))
}

#[tokio::test]
async fn test_join_runs_only_after_both_branches() {
    let (engine, agent) = engine_with_agent(test_config()).await;
    engine.register_definition(fan_in()).await.unwrap();

    let mut events = engine.subscribe();
    let mut input = HashMap::new();
    input.insert("orderId".to_string(), json!("A-17"));
    let id = engine.start_workflow("fan_in", input).await.unwrap();

    deliver(&engine, "task-0", TaskOutcome::completed(output(&[("receipt", json!("r-1"))]))).await;
    let instance = engine.wait_for_completion(&id, LIMIT).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(instance.output.unwrap()["receipt"], json!("r-1"));

    let events = drain(&mut events);
    let merge_running = step_event_index(&events, "merge", InstanceStatus::Running).unwrap();
    for branch in ["short", "long"] {
        let completed = step_event_index(&events, branch, InstanceStatus::Completed).unwrap();
        assert!(completed < merge_running, "{} completed after the join started", branch);
    }

    let steps = engine.list_step_instances(&id).await.unwrap();
    let merges: Vec<_> = steps.iter().filter(|s| s.step_id == "merge").collect();
    assert_eq!(merges.len(), 1, "join must be scheduled once");
    let long = steps.iter().find(|s| s.step_id == "long").unwrap();
    assert!(merges[0].started_at.unwrap() >= long.completed_at.unwrap());

    let started = agent.started.lock();
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].0, "payments.charge");
    assert_eq!(started[0].1["order"], json!("A-17"));
    assert_eq!(started[0].1["waited"], json!("200ms"));
}

#[tokio::test]
async fn test_join_does_not_hold_worker_slots() {
    // One slot: a join parked on a slot would starve both branches
    let config = EngineConfig {
        max_parallel_steps: 1,
        ..test_config()
    };
    let (engine, _) = engine_with_agent(config).await;
    let definition = WorkflowDefinition::from_steps(
        "narrow",
        vec![
            StepDefinition::fork("split", "merge", ["a", "b"]),
            StepDefinition::wait("a", constant("10ms")).then("merge"),
            StepDefinition::wait("b", constant("10ms")).then("merge"),
            StepDefinition::join("merge", ["a", "b"]),
        ],
    );
    engine.register_definition(definition).await.unwrap();

    let instance = engine.run_workflow("narrow", HashMap::new()).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
}

#[tokio::test]
async fn test_failing_branch_cancels_siblings() {
    let (engine, _) = engine_with_agent(test_config()).await;
    let definition = WorkflowDefinition::from_steps(
        "doomed",
        vec![
            StepDefinition::fork("split", "merge", ["slow", "broken"]),
            StepDefinition::wait("slow", constant("1h")).then("merge"),
            StepDefinition::wait("broken", constant("whenever")).then("merge"),
            StepDefinition::join("merge", ["slow", "broken"]),
        ],
    );
    engine.register_definition(definition).await.unwrap();

    let started = Instant::now();
    let id = engine.start_workflow("doomed", HashMap::new()).await.unwrap();
    let instance = engine.wait_for_completion(&id, LIMIT).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    assert_eq!(instance.status, InstanceStatus::Failed);
    assert!(instance.error_message.unwrap().contains("broken"));

    // Siblings notice the abort shortly after the workflow is finalized
    tokio::time::sleep(Duration::from_millis(100)).await;
    let steps = engine.list_step_instances(&id).await.unwrap();
    let status_of = |step_id: &str| steps.iter().find(|s| s.step_id == step_id).unwrap().status;
    assert_eq!(status_of("broken"), InstanceStatus::Failed);
    assert_eq!(status_of("slow"), InstanceStatus::Cancelled);
    assert_eq!(status_of("merge"), InstanceStatus::Cancelled);
}

#[tokio::test]
async fn test_remote_failure_fails_workflow() {
    let (engine, _) = engine_with_agent(test_config()).await;
    engine
        .register_definition(WorkflowDefinition::from_steps(
            "charge",
            vec![StepDefinition::task("charge", "payments.charge")],
        ))
        .await
        .unwrap();

    let id = engine.start_workflow("charge", HashMap::new()).await.unwrap();
    deliver(&engine, "task-0", TaskOutcome::failed("card declined")).await;

    let instance = engine.wait_for_completion(&id, LIMIT).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert!(instance.error_message.unwrap().contains("card declined"));
}

#[tokio::test]
async fn test_task_progress_is_recorded() {
    let (engine, _) = engine_with_agent(test_config()).await;
    engine
        .register_definition(WorkflowDefinition::from_steps(
            "charge",
            vec![StepDefinition::task("charge", "payments.charge")],
        ))
        .await
        .unwrap();
    let id = engine.start_workflow("charge", HashMap::new()).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while engine.notify_task_progress("task-0", 0.4).await.is_err() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    let steps = engine.list_step_instances(&id).await.unwrap();
    assert!((steps[0].progress - 0.4).abs() < f32::EPSILON);
    assert_eq!(steps[0].status, InstanceStatus::Running);

    deliver(&engine, "task-0", TaskOutcome::completed(HashMap::new())).await;
    let instance = engine.wait_for_completion(&id, LIMIT).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
    let steps = engine.list_step_instances(&id).await.unwrap();
    assert_eq!(steps[0].progress, 1.0);
}

#[tokio::test]
async fn test_task_timeout() {
    let config = EngineConfig {
        task_timeout: Some(Duration::from_millis(50)),
        ..test_config()
    };
    let (engine, _) = engine_with_agent(config).await;
    engine
        .register_definition(WorkflowDefinition::from_steps(
            "charge",
            vec![StepDefinition::task("charge", "payments.charge")],
        ))
        .await
        .unwrap();

    let instance = engine.run_workflow("charge", HashMap::new()).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert!(instance.error_message.unwrap().contains("task-0"));
}

fn routing() -> WorkflowDefinition {
    WorkflowDefinition::from_steps(
        "routing",
        vec![
            StepDefinition::decision("route", [("amount > 100", "reject"), ("amount > 0", "approve")])
                .with_parameter("amount", ParameterBinding::workflow_input("amount")),
            StepDefinition::terminate(
                "reject",
                TerminateOutcome::Failed,
                Some("manual review required".to_string()),
            ),
            StepDefinition::wait("approve", constant("1ms")),
        ],
    )
}

#[tokio::test]
async fn test_decision_routes_to_matching_case() {
    let (engine, _) = engine_with_agent(test_config()).await;
    engine.register_definition(routing()).await.unwrap();

    let mut input = HashMap::new();
    input.insert("amount".to_string(), json!(5));
    let approved = engine.run_workflow("routing", input).await.unwrap();
    assert_eq!(approved.status, InstanceStatus::Completed);
    let steps: Vec<String> = engine
        .list_step_instances(&approved.id)
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.step_id)
        .collect();
    assert_eq!(steps, vec!["route", "approve"]);

    let mut input = HashMap::new();
    input.insert("amount".to_string(), json!(500));
    let rejected = engine.run_workflow("routing", input).await.unwrap();
    assert_eq!(rejected.status, InstanceStatus::Failed);
    assert_eq!(rejected.error_message.as_deref(), Some("manual review required"));

    let mut input = HashMap::new();
    input.insert("amount".to_string(), json!(-1));
    let unmatched = engine.run_workflow("routing", input).await.unwrap();
    assert_eq!(unmatched.status, InstanceStatus::Failed);
    assert!(unmatched.error_message.unwrap().contains("no case"));
}

#[tokio::test]
async fn test_terminate_completes_and_abandons_siblings() {
    let (engine, _) = engine_with_agent(test_config()).await;
    let definition = WorkflowDefinition::from_steps(
        "early_exit",
        vec![
            StepDefinition::fork("split", "merge", ["done", "slow"]),
            StepDefinition::terminate("done", TerminateOutcome::Completed, None),
            StepDefinition::wait("slow", constant("1h")).then("merge"),
            StepDefinition::join("merge", ["slow"]),
        ],
    );
    engine.register_definition(definition).await.unwrap();

    let instance = tokio::time::timeout(
        Duration::from_secs(5),
        engine.run_workflow("early_exit", HashMap::new()),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let steps = engine.list_step_instances(&instance.id).await.unwrap();
    let slow = steps.iter().find(|s| s.step_id == "slow").unwrap();
    assert_eq!(slow.status, InstanceStatus::Cancelled);
}

#[tokio::test]
async fn test_sub_workflow_runs_as_child() {
    let (engine, _) = engine_with_agent(test_config()).await;

    let child = WorkflowDefinition::from_steps(
        "child",
        vec![StepDefinition::wait("nap", ParameterBinding::workflow_input("delay"))],
    )
    .with_input(
        "delay",
        ParameterDefinition {
            required: true,
            ..ParameterDefinition::default()
        },
    )
    .with_output("slept", ParameterBinding::task_output("nap", "duration"));
    engine.register_definition(child).await.unwrap();

    let parent = WorkflowDefinition::from_steps(
        "parent",
        vec![
            StepDefinition::sub_workflow("nested", "child")
                .with_parameter("delay", ParameterBinding::constant("20ms"))
                .then("after"),
            StepDefinition::wait("after", ParameterBinding::task_output("nested", "slept")),
        ],
    )
    .with_output("slept", ParameterBinding::task_output("nested", "slept"));
    engine.register_definition(parent).await.unwrap();

    let mut events = engine.subscribe();
    let instance = engine.run_workflow("parent", HashMap::new()).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(instance.output.unwrap()["slept"], json!("20ms"));

    let child_id = drain(&mut events)
        .into_iter()
        .find_map(|event| match event {
            EngineEvent::WorkflowCreated {
                workflow_instance_id,
                parent_workflow_instance_id: Some(parent),
                ..
            } if parent == instance.id => Some(workflow_instance_id),
            _ => None,
        })
        .unwrap();
    let child = engine.get_workflow_instance(&child_id).await.unwrap();
    assert_eq!(child.status, InstanceStatus::Completed);
    assert_eq!(child.definition_id, "child");
    assert_eq!(child.input["delay"], json!("20ms"));
}

#[tokio::test]
async fn test_failed_sub_workflow_fails_parent() {
    let (engine, _) = engine_with_agent(test_config()).await;
    engine
        .register_definition(WorkflowDefinition::from_steps(
            "child",
            vec![StepDefinition::wait("nap", constant("never"))],
        ))
        .await
        .unwrap();
    engine
        .register_definition(WorkflowDefinition::from_steps(
            "parent",
            vec![StepDefinition::sub_workflow("nested", "child")],
        ))
        .await
        .unwrap();

    let instance = engine.run_workflow("parent", HashMap::new()).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert!(instance.error_message.unwrap().contains("nested"));
}

#[tokio::test]
async fn test_full_workflow_queue_rejects_start() {
    let config = EngineConfig {
        workflow_queue_size: 1,
        max_parallel_workflows: 1,
        ..test_config()
    };
    let engine = Engine::new(config).unwrap();
    engine
        .register_definition(WorkflowDefinition::from_steps(
            "long",
            vec![StepDefinition::wait("pause", constant("1h"))],
        ))
        .await
        .unwrap();

    // First runs, second is claimed and waits for a slot, third sits in
    // the queue
    for _ in 0..3 {
        engine.start_workflow("long", HashMap::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let mut events = engine.subscribe();
    let err = engine.start_workflow("long", HashMap::new()).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::QueueFull {
            queue: "workflow",
            capacity: 1
        }
    ));
    // Nothing was created for the rejected start
    assert!(drain(&mut events).is_empty());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_out_of_range_wait_fails_workflow() {
    let (engine, _) = engine_with_agent(test_config()).await;
    let huge = format!("{}ns{}ns", u128::MAX, u128::MAX);
    engine
        .register_definition(WorkflowDefinition::from_steps(
            "forever",
            vec![StepDefinition::wait("pause", constant(&huge))],
        ))
        .await
        .unwrap();

    let id = engine.start_workflow("forever", HashMap::new()).await.unwrap();
    let instance = engine.wait_for_completion(&id, LIMIT).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert!(instance.error_message.unwrap().contains("out of range"));

    let steps = engine.list_step_instances(&id).await.unwrap();
    assert_eq!(steps[0].status, InstanceStatus::Failed);
}

struct PanickingWait;

#[async_trait]
impl StepTypeExecutor for PanickingWait {
    fn step_type(&self) -> StepType {
        StepType::Wait
    }

    async fn execute(&self, _execution: &StepExecution) -> flowrunner::Result<StepResult> {
        panic!("timer wheel exploded");
    }
}

#[tokio::test]
async fn test_panicking_executor_fails_workflow() {
    let engine = Engine::builder()
        .with_config(test_config())
        .with_step_executor(std::sync::Arc::new(PanickingWait))
        .build()
        .unwrap();
    engine
        .register_definition(WorkflowDefinition::from_steps(
            "nap",
            vec![StepDefinition::wait("pause", constant("1ms"))],
        ))
        .await
        .unwrap();

    let id = engine.start_workflow("nap", HashMap::new()).await.unwrap();
    let instance = engine.wait_for_completion(&id, LIMIT).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Failed);
    let message = instance.error_message.unwrap();
    assert!(message.contains("panicked"), "{}", message);
    assert!(message.contains("timer wheel exploded"), "{}", message);

    let steps = engine.list_step_instances(&id).await.unwrap();
    assert_eq!(steps[0].status, InstanceStatus::Failed);
}

#[tokio::test]
async fn test_full_step_queue_fails_workflow() {
    let config = EngineConfig {
        step_queue_size: 1,
        ..test_config()
    };
    let (engine, _) = engine_with_agent(config).await;
    let branches = ["a", "b", "c", "d"];
    let mut steps = vec![StepDefinition::fork("split", "merge", branches)];
    steps.extend(
        branches
            .iter()
            .map(|id| StepDefinition::wait(*id, constant("10ms")).then("merge")),
    );
    steps.push(StepDefinition::join("merge", branches));
    engine
        .register_definition(WorkflowDefinition::from_steps("wide", steps))
        .await
        .unwrap();

    let id = engine.start_workflow("wide", HashMap::new()).await.unwrap();
    let instance = engine.wait_for_completion(&id, LIMIT).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Failed);
    let message = instance.error_message.unwrap();
    assert!(message.contains("step queue is full"), "{}", message);

    // Steps already queued notice the abort shortly after
    tokio::time::sleep(Duration::from_millis(200)).await;
    let steps = engine.list_step_instances(&id).await.unwrap();
    assert!(steps.iter().any(|s| s.status == InstanceStatus::Failed));
    for step in &steps {
        assert!(step.status.is_terminal(), "{} is {}", step.step_id, step.status);
    }
    let split = steps.iter().find(|s| s.step_id == "split").unwrap();
    assert_eq!(split.status, InstanceStatus::Completed);
}
