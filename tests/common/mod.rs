//! Shared fixtures for the end-to-end tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast::{self, error::TryRecvError};

use flowrunner::agent::{AgentConnector, AgentInfo, ConnectorFactory, TaskOutcome};
use flowrunner::monitoring::EngineEvent;
use flowrunner::{Engine, EngineConfig, InstanceStatus, Result};

/// In-process agent handing out ids `task-0`, `task-1`, ...
#[derive(Default)]
pub struct MockAgent {
    next_id: AtomicUsize,
    pub started: Mutex<Vec<(String, HashMap<String, Value>)>>,
}

#[async_trait]
impl AgentConnector for MockAgent {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn start_task(&self, task_type: &str, input: &HashMap<String, Value>) -> Result<String> {
        self.started.lock().push((task_type.to_string(), input.clone()));
        Ok(format!("task-{}", self.next_id.fetch_add(1, Ordering::SeqCst)))
    }
}

pub struct MockFactory(pub Arc<MockAgent>);

impl ConnectorFactory for MockFactory {
    fn connect(&self, _info: &AgentInfo) -> Result<Arc<dyn AgentConnector>> {
        let connector: Arc<dyn AgentConnector> = self.0.clone();
        Ok(connector)
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        max_parallel_steps: 4,
        max_parallel_workflows: 2,
        task_timeout: Some(Duration::from_secs(5)),
        join_timeout: Some(Duration::from_secs(5)),
        ..EngineConfig::default()
    }
}

/// Engine with a mock agent registered for `payments.charge`.
pub async fn engine_with_agent(config: EngineConfig) -> (Engine, Arc<MockAgent>) {
    let agent = Arc::new(MockAgent::default());
    let engine = Engine::builder()
        .with_config(config)
        .with_connector_factory(Arc::new(MockFactory(agent.clone())))
        .build()
        .unwrap();

    engine
        .register_agent(AgentInfo::new("billing", "localhost:7000").with_task("payments.charge"))
        .await
        .unwrap();
    (engine, agent)
}

/// Delivers `outcome` once a step is waiting for (or dispatching) `task_id`.
pub async fn deliver(engine: &Engine, task_id: &str, outcome: TaskOutcome) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !engine.notify_task_status(task_id, outcome.clone()) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("no step waited for the remote task");
}

/// Events received so far.
pub fn drain(receiver: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    loop {
        match receiver.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}

/// Position of the first status change of `step_id` to `status`.
pub fn step_event_index(events: &[EngineEvent], step_id: &str, status: InstanceStatus) -> Option<usize> {
    events.iter().position(|event| {
        matches!(
            event,
            EngineEvent::StepStatusChanged { step_id: id, status: s, .. } if id == step_id && *s == status
        )
    })
}

pub fn output(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}
