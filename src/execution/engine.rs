//! Workflow Engine
//!
//! The facade embedders talk to. It wires the repositories, the agent
//! registry and both worker pools together, and exposes:
//! - starting workflows and waiting for them
//! - agent registration and liveness
//! - inbound task status and progress notifications
//! - cooperative shutdown

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::condition::ConditionEvaluator;
use super::context::EngineContext;
use super::queue::BoundedQueue;
use super::step::{StepExecutorRegistry, StepTypeExecutor};
use super::step_executor::StepExecutor;
use super::workflow_executor::{ensure_runnable, WorkflowExecutor, WorkflowJob};
use crate::agent::{AgentInfo, AgentRegistry, ConnectorFactory, HttpConnectorFactory, RemoteTaskTable, TaskOutcome};
use crate::config::{EngineConfig, DEFAULT_WAIT_TIMEOUT};
use crate::error::{EngineError, Result};
use crate::monitoring::{EngineEvent, EventHub};
use crate::persistence::{
    DefinitionRepository, InMemoryDefinitionRepository, InMemoryStepInstanceRepository,
    InMemoryWorkflowInstanceRepository, StepInstanceRepository, WorkflowInstanceRepository,
};
use crate::workflow::{
    validate_definition, StepInstance, StepInstanceUpdate, WorkflowDefinition, WorkflowInstance,
};

/// Workflow execution engine.
///
/// Must be built inside a Tokio runtime; building starts both dispatch
/// loops.
///
/// # Example
///
/// ```rust,no_run
/// use std::collections::HashMap;
/// use flowrunner::{load_definition, Engine};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let engine = Engine::builder().build()?;
///     let definition = load_definition("order.yaml")?;
///     let id = definition.id.clone();
///     engine.register_definition(definition).await?;
///
///     let instance_id = engine.start_workflow(&id, HashMap::new()).await?;
///     let instance = engine.wait_for_completion(&instance_id, None).await?;
///     println!("{}", instance.status);
///
///     engine.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct Engine {
    ctx: Arc<EngineContext>,
    workflow_queue: BoundedQueue<WorkflowJob>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Collaborators of an [`Engine`]. Anything not supplied defaults to the
/// in-memory repositories and the HTTP connector.
pub struct EngineBuilder {
    config: EngineConfig,
    definitions: Option<Arc<dyn DefinitionRepository>>,
    workflows: Option<Arc<dyn WorkflowInstanceRepository>>,
    steps: Option<Arc<dyn StepInstanceRepository>>,
    connector_factory: Option<Arc<dyn ConnectorFactory>>,
    executors: StepExecutorRegistry,
    events: Option<EventHub>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            definitions: None,
            workflows: None,
            steps: None,
            connector_factory: None,
            executors: StepExecutorRegistry::with_defaults(),
            events: None,
        }
    }
}

impl EngineBuilder {
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_definitions(mut self, repository: Arc<dyn DefinitionRepository>) -> Self {
        self.definitions = Some(repository);
        self
    }

    pub fn with_instance_repositories(
        mut self,
        workflows: Arc<dyn WorkflowInstanceRepository>,
        steps: Arc<dyn StepInstanceRepository>,
    ) -> Self {
        self.workflows = Some(workflows);
        self.steps = Some(steps);
        self
    }

    pub fn with_connector_factory(mut self, factory: Arc<dyn ConnectorFactory>) -> Self {
        self.connector_factory = Some(factory);
        self
    }

    /// Replaces the condition evaluator of Decision steps.
    pub fn with_condition_evaluator(mut self, evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        self.executors.register(Arc::new(super::executors::DecisionExecutor::new(evaluator)));
        self
    }

    /// Registers a custom executor, replacing the built-in one for its
    /// step type.
    pub fn with_step_executor(mut self, executor: Arc<dyn StepTypeExecutor>) -> Self {
        self.executors.register(executor);
        self
    }

    pub fn with_event_hub(mut self, events: EventHub) -> Self {
        self.events = Some(events);
        self
    }

    /// Builds the engine and starts its dispatch loops.
    pub fn build(self) -> Result<Engine> {
        self.config.validate().map_err(EngineError::Definition)?;

        let (workflow_queue, workflow_jobs) =
            BoundedQueue::new("workflow", self.config.workflow_queue_size);
        let (step_queue, step_jobs) = BoundedQueue::new("step", self.config.step_queue_size);

        let factory = self
            .connector_factory
            .unwrap_or_else(|| Arc::new(HttpConnectorFactory::default()));
        let parked_ttl = self.config.task_timeout.unwrap_or(DEFAULT_WAIT_TIMEOUT);

        let ctx = Arc::new(EngineContext {
            config: self.config,
            definitions: self
                .definitions
                .unwrap_or_else(|| Arc::new(InMemoryDefinitionRepository::new())),
            workflows: self
                .workflows
                .unwrap_or_else(|| Arc::new(InMemoryWorkflowInstanceRepository::new())),
            steps: self
                .steps
                .unwrap_or_else(|| Arc::new(InMemoryStepInstanceRepository::new())),
            agents: Arc::new(AgentRegistry::new(factory)),
            remote_tasks: Arc::new(RemoteTaskTable::new(parked_ttl)),
            events: self.events.unwrap_or_default(),
            step_queue,
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let step_executor = Arc::new(StepExecutor::new(Arc::clone(&ctx), Arc::new(self.executors)));
        let workflow_executor = Arc::new(WorkflowExecutor::new(Arc::clone(&ctx)));

        let workers = vec![
            tokio::spawn(step_executor.run(step_jobs, shutdown_rx.clone())),
            tokio::spawn(workflow_executor.run(workflow_jobs, shutdown_rx)),
        ];

        info!(
            "Engine started (workflows: {}, steps: {}, queues: {}/{})",
            ctx.config.max_parallel_workflows,
            ctx.config.max_parallel_steps,
            ctx.config.workflow_queue_size,
            ctx.config.step_queue_size
        );

        Ok(Engine {
            ctx,
            workflow_queue,
            shutdown,
            workers: Mutex::new(workers),
        })
    }
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Builds an engine with in-memory repositories.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::builder().with_config(config).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.ctx.agents
    }

    pub fn events(&self) -> &EventHub {
        &self.ctx.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.ctx.events.subscribe()
    }

    pub fn definitions(&self) -> &Arc<dyn DefinitionRepository> {
        &self.ctx.definitions
    }

    /// Validates and stores a definition.
    pub async fn register_definition(&self, definition: WorkflowDefinition) -> Result<()> {
        validate_definition(&definition)?;
        info!("Registered workflow definition '{}' v{}", definition.id, definition.version);
        self.ctx.definitions.save(definition).await
    }

    /// Creates a Pending instance of `definition_id` and queues it.
    ///
    /// Declared defaults are applied to `input`. Nothing is created when
    /// the input is invalid or the workflow queue is full.
    pub async fn start_workflow(&self, definition_id: &str, input: HashMap<String, Value>) -> Result<String> {
        if self.is_shut_down() {
            return Err(EngineError::ShutDown);
        }

        let definition = self.ctx.definitions.get_by_id(definition_id).await?;
        ensure_runnable(&definition)?;
        let input = definition.prepare_input(&input)?;

        let slot = self.workflow_queue.reserve().map_err(|e| {
            warn!("Rejected start of '{}': {}", definition_id, e);
            e
        })?;

        let instance = WorkflowInstance::new(&definition, input.clone());
        let instance_id = instance.id.clone();
        self.ctx.create_workflow(instance).await?;

        slot.send(WorkflowJob {
            workflow_instance_id: instance_id.clone(),
            definition_id: definition.id.clone(),
            input,
        });
        info!("Queued workflow {} ({})", instance_id, definition.id);
        Ok(instance_id)
    }

    /// Waits until the instance reaches a terminal status.
    pub async fn wait_for_completion(&self, instance_id: &str, timeout: Option<Duration>) -> Result<WorkflowInstance> {
        let wait = self.wait_terminal(instance_id);
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                EngineError::Timeout(format!("workflow {} did not finish within {:?}", instance_id, limit))
            })?,
            None => wait.await,
        }
    }

    async fn wait_terminal(&self, instance_id: &str) -> Result<WorkflowInstance> {
        // Subscribe before reading so no transition is missed in between
        let mut events = self.ctx.events.subscribe();

        loop {
            let instance = self.ctx.workflows.get_by_id(instance_id).await?;
            if instance.status.is_terminal() {
                return Ok(instance);
            }

            loop {
                match events.recv().await {
                    Ok(EngineEvent::WorkflowStatusChanged {
                        workflow_instance_id,
                        status,
                        ..
                    }) if workflow_instance_id == instance_id && status.is_terminal() => break,
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Waiter for {} skipped {} events", instance_id, skipped);
                        break;
                    }
                    Err(RecvError::Closed) => return Err(EngineError::ShutDown),
                }
            }
        }
    }

    /// Starts a workflow and waits for it to finish.
    pub async fn run_workflow(&self, definition_id: &str, input: HashMap<String, Value>) -> Result<WorkflowInstance> {
        let instance_id = self.start_workflow(definition_id, input).await?;
        self.wait_for_completion(&instance_id, None).await
    }

    pub async fn get_workflow_instance(&self, instance_id: &str) -> Result<WorkflowInstance> {
        self.ctx.workflows.get_by_id(instance_id).await
    }

    /// Step instances of a workflow instance in creation order.
    pub async fn list_step_instances(&self, instance_id: &str) -> Result<Vec<StepInstance>> {
        self.ctx.steps.list_by_workflow(instance_id).await
    }

    pub async fn register_agent(&self, info: AgentInfo) -> Result<()> {
        self.ctx.agents.register_agent(info).await
    }

    pub fn unregister_agent(&self, name: &str) -> bool {
        self.ctx.agents.unregister_agent(name)
    }

    /// Heartbeat from an agent; true if it is still registered.
    pub fn ping_agent(&self, name: &str) -> bool {
        let known = self.ctx.agents.is_registered(name);
        if !known {
            debug!("Ping from unknown agent '{}'", name);
        }
        known
    }

    /// Routes a remote task's final status to the step waiting for it.
    /// Returns false when no step is waiting for `task_id`.
    pub fn notify_task_status(&self, task_id: &str, outcome: TaskOutcome) -> bool {
        info!("Remote task {} reported {:?}", task_id, outcome.status);
        self.ctx.remote_tasks.complete(task_id, outcome)
    }

    /// Records progress of a remote task on its step instance.
    pub async fn notify_task_progress(&self, task_id: &str, progress: f32) -> Result<()> {
        let step_instance_id = self
            .ctx
            .remote_tasks
            .step_instance_for(task_id)
            .ok_or_else(|| EngineError::NotFound(format!("remote task {}", task_id)))?;

        self.ctx
            .update_step(&step_instance_id, StepInstanceUpdate::progress(progress))
            .await?;
        Ok(())
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Stops both dispatch loops and waits for them to exit. Jobs already
    /// running are left to finish.
    pub async fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        info!("Shutting down engine");

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("Dispatch loop ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}
