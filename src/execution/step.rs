//! Step Type Executors
//!
//! One [`StepTypeExecutor`] per step type, looked up by the step workers
//! in a [`StepExecutorRegistry`]. A worker drives every step through the
//! same phases:
//!
//! 1. [`StepTypeExecutor::await_ready`] while the step is still Pending,
//!    without holding a worker slot (Join steps park here)
//! 2. the step input is resolved and the step is marked Running
//! 3. [`StepTypeExecutor::execute`] produces the output and successors

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use serde_json::Value;

use super::condition::{ComparisonEvaluator, ConditionEvaluator};
use super::context::EngineContext;
use super::executors::{
    DecisionExecutor, ForkExecutor, JoinExecutor, SubWorkflowExecutor, TaskExecutor,
    TerminateExecutor, WaitExecutor,
};
use super::run::{RunOutcome, WorkflowRun};
use crate::error::Result;
use crate::workflow::{params, ParameterBinding, StepDefinition, StepType};

/// A step instance about to run, with everything its executor may need.
pub struct StepExecution {
    pub ctx: Arc<EngineContext>,
    pub run: Arc<WorkflowRun>,
    pub step: StepDefinition,
    pub step_instance_id: String,
    /// Resolved step parameters; empty until the step is ready
    pub input: HashMap<String, Value>,
}

impl StepExecution {
    /// Resolves a binding against the current run state.
    pub fn resolve(&self, binding: &ParameterBinding) -> Value {
        params::resolve(binding, &self.run.input, &self.run.step_outputs())
    }

    /// Resolves every declared parameter of the step.
    pub fn resolve_parameters(&self) -> HashMap<String, Value> {
        params::resolve_all(&self.step.parameters, &self.run.input, &self.run.step_outputs())
    }
}

/// What a completed step hands back to the worker.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StepResult {
    pub output: HashMap<String, Value>,
    /// Steps to enqueue next, in order
    pub next_step_ids: Vec<String>,
    /// Ends the whole run instead of enqueueing successors
    pub termination: Option<RunOutcome>,
}

impl StepResult {
    /// Continues with `next`, or ends this path when there is none.
    pub fn then(next: Option<&String>) -> Self {
        Self {
            next_step_ids: next.cloned().into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn with_output(mut self, output: HashMap<String, Value>) -> Self {
        self.output = output;
        self
    }

    pub fn with_value(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.output.insert(key.to_string(), value.into());
        self
    }
}

#[async_trait]
pub trait StepTypeExecutor: Send + Sync {
    fn step_type(&self) -> StepType;

    /// Waits until the step may start. Called before the step is marked
    /// Running.
    async fn await_ready(&self, _execution: &StepExecution) -> Result<()> {
        Ok(())
    }

    /// Whether the step occupies a worker slot while it executes. Steps
    /// that only wait on other steps must not, or a full pool deadlocks.
    fn holds_slot(&self) -> bool {
        true
    }

    async fn execute(&self, execution: &StepExecution) -> Result<StepResult>;
}

/// Step type to executor lookup.
#[derive(Default, Clone)]
pub struct StepExecutorRegistry {
    executors: HashMap<StepType, Arc<dyn StepTypeExecutor>>,
}

impl StepExecutorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in executor for every step type.
    pub fn with_defaults() -> Self {
        Self::with_evaluator(Arc::new(ComparisonEvaluator::new()))
    }

    /// Built-in executors, with Decision steps using `evaluator`.
    pub fn with_evaluator(evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TaskExecutor));
        registry.register(Arc::new(WaitExecutor));
        registry.register(Arc::new(ForkExecutor));
        registry.register(Arc::new(JoinExecutor));
        registry.register(Arc::new(DecisionExecutor::new(evaluator)));
        registry.register(Arc::new(SubWorkflowExecutor));
        registry.register(Arc::new(TerminateExecutor));
        registry
    }

    /// Registers `executor` for its step type, replacing any previous one.
    pub fn register(&mut self, executor: Arc<dyn StepTypeExecutor>) {
        let step_type = executor.step_type();
        debug!("Registering executor for {} steps", step_type.as_str());
        self.executors.insert(step_type, executor);
    }

    pub fn get(&self, step_type: StepType) -> Option<Arc<dyn StepTypeExecutor>> {
        self.executors.get(&step_type).cloned()
    }

    pub fn supports(&self, step_type: StepType) -> bool {
        self.executors.contains_key(&step_type)
    }
}
