//! Built-in Step Executors
//!
//! - [`TaskExecutor`]: dispatches to a remote agent and waits for its
//!   completion notification
//! - [`WaitExecutor`]: sleeps for a resolved duration
//! - [`ForkExecutor`]: arms the join and starts every branch
//! - [`JoinExecutor`]: waits until all incoming steps completed
//! - [`DecisionExecutor`]: routes to the first matching case
//! - [`SubWorkflowExecutor`]: runs another definition as a child instance
//! - [`TerminateExecutor`]: ends the run early

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use serde_json::{json, Value};

use super::condition::ConditionEvaluator;
use super::run::RunOutcome;
use super::step::{StepExecution, StepResult, StepTypeExecutor};
use super::workflow_executor;
use crate::error::{EngineError, Result};
use crate::workflow::duration::parse_duration;
use crate::workflow::params::value_as_text;
use crate::workflow::{ParentLink, StepType, TerminateOutcome};

fn aborted(execution: &StepExecution, waiting_for: &str) -> EngineError {
    EngineError::Cancelled(format!(
        "workflow {} ended while step '{}' was waiting for {}",
        execution.run.instance_id, execution.step.id, waiting_for
    ))
}

pub struct TaskExecutor;

#[async_trait]
impl StepTypeExecutor for TaskExecutor {
    fn step_type(&self) -> StepType {
        StepType::Task
    }

    async fn execute(&self, execution: &StepExecution) -> Result<StepResult> {
        let config = execution.step.task_config()?;
        let ctx = &execution.ctx;

        let agent = ctx
            .agents
            .get_agent_for_task_type(&config.task_type)
            .ok_or_else(|| EngineError::AgentNotFound(config.task_type.clone()))?;

        // Hold the dispatch guard until the waiter exists, so a
        // notification racing the start-task response is parked, not lost.
        let pending = {
            let _dispatching = ctx.remote_tasks.begin_dispatch();
            let task_id = ctx
                .agents
                .dispatch(&agent, &config.task_type, &execution.input)
                .await?;
            ctx.remote_tasks.register(&task_id, &execution.step_instance_id)
        };
        let task_id = pending.task_id().to_string();

        let outcome = tokio::select! {
            outcome = pending.wait(ctx.config.task_timeout) => outcome?,
            _ = execution.run.aborted() => {
                return Err(aborted(execution, &format!("remote task {}", task_id)));
            }
        };

        let output = outcome.into_result(&task_id)?;
        Ok(StepResult::then(config.next_step_id.as_ref()).with_output(output))
    }
}

pub struct WaitExecutor;

#[async_trait]
impl StepTypeExecutor for WaitExecutor {
    fn step_type(&self) -> StepType {
        StepType::Wait
    }

    async fn execute(&self, execution: &StepExecution) -> Result<StepResult> {
        let config = execution.step.wait_config()?;
        let step_id = &execution.step.id;

        let text = value_as_text(&execution.resolve(&config.duration)).ok_or_else(|| {
            EngineError::Parse(format!("wait duration of step '{}' resolved to null", step_id))
        })?;
        let duration = parse_duration(&text)
            .map_err(|e| EngineError::Parse(format!("step '{}': {}", step_id, e)))?;

        debug!("Step '{}' waiting {:?}", step_id, duration);
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = execution.run.aborted() => return Err(aborted(execution, "its timer")),
        }

        Ok(StepResult::then(config.next_step_id.as_ref()).with_value("duration", text))
    }
}

pub struct ForkExecutor;

#[async_trait]
impl StepTypeExecutor for ForkExecutor {
    fn step_type(&self) -> StepType {
        StepType::Fork
    }

    async fn execute(&self, execution: &StepExecution) -> Result<StepResult> {
        let config = execution.step.fork_config()?;

        // Arm the barrier before any branch can complete
        execution.run.barrier(&config.join_step_id)?;

        let mut next_step_ids = vec![config.join_step_id.clone()];
        next_step_ids.extend(config.branches.iter().map(|b| b.next_step_id.clone()));

        let branches: Vec<Value> = config
            .branches
            .iter()
            .map(|b| json!({ "name": b.name, "nextStepId": b.next_step_id }))
            .collect();

        Ok(StepResult {
            next_step_ids,
            ..StepResult::default()
        }
        .with_value("branches", branches))
    }
}

pub struct JoinExecutor;

#[async_trait]
impl StepTypeExecutor for JoinExecutor {
    fn step_type(&self) -> StepType {
        StepType::Join
    }

    async fn await_ready(&self, execution: &StepExecution) -> Result<()> {
        let barrier = execution.run.barrier(&execution.step.id)?;
        if barrier.is_released() {
            return Ok(());
        }

        debug!(
            "Join '{}' waiting for [{}]",
            execution.step.id,
            barrier.outstanding().join(", ")
        );
        tokio::select! {
            released = barrier.wait(execution.ctx.config.join_timeout) => released,
            _ = execution.run.aborted() => Err(aborted(execution, "its incoming steps")),
        }
    }

    async fn execute(&self, execution: &StepExecution) -> Result<StepResult> {
        let config = execution.step.join_config()?;
        Ok(StepResult::then(config.next_step_id.as_ref())
            .with_value("joined", config.incoming_step_ids.clone()))
    }
}

pub struct DecisionExecutor {
    evaluator: Arc<dyn ConditionEvaluator>,
}

impl DecisionExecutor {
    pub fn new(evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        Self { evaluator }
    }
}

#[async_trait]
impl StepTypeExecutor for DecisionExecutor {
    fn step_type(&self) -> StepType {
        StepType::Decision
    }

    /// Conditions see the workflow input overlaid with the step's own
    /// resolved parameters.
    async fn execute(&self, execution: &StepExecution) -> Result<StepResult> {
        let config = execution.step.decision_config()?;

        let mut scope = execution.run.input.clone();
        scope.extend(execution.input.iter().map(|(k, v)| (k.clone(), v.clone())));

        for (index, case) in config.cases.iter().enumerate() {
            if self.evaluator.evaluate(&case.condition, &scope)? {
                let label = case.name.clone().unwrap_or_else(|| index.to_string());
                info!(
                    "Decision '{}' took case '{}' to '{}'",
                    execution.step.id, label, case.next_step_id
                );
                return Ok(StepResult::then(Some(&case.next_step_id))
                    .with_value("case", label)
                    .with_value("nextStepId", case.next_step_id.clone()));
            }
        }

        Err(EngineError::Definition(format!(
            "no case of decision '{}' matched",
            execution.step.id
        )))
    }
}

pub struct SubWorkflowExecutor;

#[async_trait]
impl StepTypeExecutor for SubWorkflowExecutor {
    fn step_type(&self) -> StepType {
        StepType::SubWorkflow
    }

    /// The child's own steps need the slots.
    fn holds_slot(&self) -> bool {
        false
    }

    async fn execute(&self, execution: &StepExecution) -> Result<StepResult> {
        let config = execution.step.sub_workflow_config()?;
        let definition = execution.ctx.definitions.get_by_id(&config.definition_id).await?;

        let parent = ParentLink {
            workflow_instance_id: execution.run.instance_id.clone(),
            step_instance_id: execution.step_instance_id.clone(),
        };
        let output = workflow_executor::run_sub_workflow(
            &execution.ctx,
            definition,
            execution.input.clone(),
            parent,
            &execution.run,
        )
        .await?;

        Ok(StepResult::then(config.next_step_id.as_ref()).with_output(output))
    }
}

pub struct TerminateExecutor;

#[async_trait]
impl StepTypeExecutor for TerminateExecutor {
    fn step_type(&self) -> StepType {
        StepType::Terminate
    }

    async fn execute(&self, execution: &StepExecution) -> Result<StepResult> {
        let config = execution.step.terminate_config()?;
        let reason = config
            .reason
            .clone()
            .unwrap_or_else(|| format!("terminated by step '{}'", execution.step.id));

        let termination = match config.outcome {
            TerminateOutcome::Completed => RunOutcome::Completed,
            TerminateOutcome::Failed => RunOutcome::Failed(reason.clone()),
        };

        Ok(StepResult {
            termination: Some(termination),
            ..StepResult::default()
        }
        .with_value("reason", reason))
    }
}
