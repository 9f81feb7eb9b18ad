//! Workflow Worker Pool
//!
//! Consumes the workflow queue. Each job drives one instance: it marks it
//! Running, schedules the first step and then waits on the run's
//! completion signal before writing the final status. A semaphore bounds
//! how many instances run at once.
//!
//! Child instances of SubWorkflow steps go through the same driver but
//! run inline in the parent's step task, outside this pool.

use std::collections::HashMap;
use std::sync::Arc;

use log::{error, info, warn};
use serde_json::Value;
use tokio::sync::{mpsc, watch, Semaphore};

use super::context::EngineContext;
use super::run::{RunOutcome, WorkflowRun};
use crate::error::{EngineError, Result};
use crate::workflow::{
    params, ParentLink, WorkflowDefinition, WorkflowInstance, WorkflowInstanceUpdate,
};

/// One workflow instance waiting to run.
#[derive(Debug, Clone)]
pub struct WorkflowJob {
    pub workflow_instance_id: String,
    pub definition_id: String,
    /// Input with defaults already applied
    pub input: HashMap<String, Value>,
}

/// Final state of a driven instance.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub output: HashMap<String, Value>,
}

pub struct WorkflowExecutor {
    ctx: Arc<EngineContext>,
    slots: Arc<Semaphore>,
}

impl WorkflowExecutor {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        let slots = Arc::new(Semaphore::new(ctx.config.max_parallel_workflows.max(1)));
        Self { ctx, slots }
    }

    /// Dispatch loop. Returns when `shutdown` flips or the queue closes.
    pub async fn run(self: Arc<Self>, mut jobs: mpsc::Receiver<WorkflowJob>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Workflow executor started ({} slots)",
            self.ctx.config.max_parallel_workflows
        );

        loop {
            let job = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                job = jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            // Wait for a free slot before claiming more work
            let permit = tokio::select! {
                permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => {
                    warn!("Shutting down with workflow {} still queued", job.workflow_instance_id);
                    break;
                }
            };

            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(async move {
                let _permit = permit;
                execute_job(&ctx, job).await;
            });
        }

        info!("Workflow executor stopped");
    }
}

async fn execute_job(ctx: &Arc<EngineContext>, job: WorkflowJob) {
    let definition = match ctx.definitions.get_by_id(&job.definition_id).await {
        Ok(definition) => definition,
        Err(e) => {
            error!("Workflow {}: {}", job.workflow_instance_id, e);
            if let Err(update_err) = ctx
                .update_workflow(&job.workflow_instance_id, WorkflowInstanceUpdate::failed(e.to_string()))
                .await
            {
                error!("Could not fail workflow {}: {}", job.workflow_instance_id, update_err);
            }
            return;
        }
    };

    drive(ctx, &job.workflow_instance_id, Arc::new(definition), job.input, None).await;
}

/// Runs one instance to its end and records the final status.
///
/// With a `parent` run, the instance is cancelled as soon as the parent
/// ends.
pub(crate) async fn drive(
    ctx: &Arc<EngineContext>,
    instance_id: &str,
    definition: Arc<WorkflowDefinition>,
    input: HashMap<String, Value>,
    parent: Option<&WorkflowRun>,
) -> RunReport {
    if let Err(e) = ctx.update_workflow(instance_id, WorkflowInstanceUpdate::running()).await {
        error!("Could not start workflow {}: {}", instance_id, e);
        return RunReport {
            outcome: RunOutcome::Failed(e.to_string()),
            output: HashMap::new(),
        };
    }
    info!("Workflow {} ({}) running", instance_id, definition.id);

    let (run, mut outcome) = WorkflowRun::new(instance_id, Arc::clone(&definition), input);

    match definition.first_step() {
        Some(first) => {
            if let Err(e) = ctx.schedule_step(&run, &first.id).await {
                run.fail(format!("could not start first step '{}': {}", first.id, e));
            }
        }
        None => {
            run.fail(format!("workflow definition '{}' has no steps", definition.id));
        }
    }

    let received = match parent {
        Some(parent) => tokio::select! {
            received = &mut outcome => received,
            _ = parent.aborted() => {
                run.finish(RunOutcome::Cancelled(format!(
                    "parent workflow {} ended",
                    parent.instance_id
                )));
                outcome.await
            }
        },
        None => outcome.await,
    };
    let outcome = received
        .unwrap_or_else(|_| RunOutcome::Failed("run ended without reporting an outcome".to_string()));

    let output = if outcome.is_completed() {
        resolve_output(&definition, &run)
    } else {
        HashMap::new()
    };

    let update = match &outcome {
        RunOutcome::Completed => WorkflowInstanceUpdate::completed(output.clone()),
        RunOutcome::Failed(message) => WorkflowInstanceUpdate::failed(message),
        RunOutcome::Cancelled(message) => WorkflowInstanceUpdate::cancelled(message),
    };
    match ctx.update_workflow(instance_id, update).await {
        Ok(instance) => info!("Workflow {} {}", instance_id, instance.status),
        Err(e) => error!("Could not finalize workflow {}: {}", instance_id, e),
    }

    RunReport { outcome, output }
}

/// Resolves the declared output bindings over the final step outputs.
/// Outputs without a binding are null.
fn resolve_output(definition: &WorkflowDefinition, run: &WorkflowRun) -> HashMap<String, Value> {
    let outputs = run.step_outputs();
    definition
        .output_parameters
        .iter()
        .map(|(name, parameter)| {
            let value = parameter
                .value
                .as_ref()
                .map(|binding| params::resolve(binding, &run.input, &outputs))
                .unwrap_or(Value::Null);
            (name.clone(), value)
        })
        .collect()
}

/// Refuses definitions that may not be started.
pub(crate) fn ensure_runnable(definition: &WorkflowDefinition) -> Result<()> {
    if !definition.is_enabled {
        return Err(EngineError::Definition(format!(
            "workflow definition '{}' is disabled",
            definition.id
        )));
    }
    if definition.is_empty() {
        return Err(EngineError::Definition(format!(
            "workflow definition '{}' has no steps",
            definition.id
        )));
    }
    Ok(())
}

/// Creates and drives a child instance for a SubWorkflow step and returns
/// the child's output.
pub(crate) async fn run_sub_workflow(
    ctx: &Arc<EngineContext>,
    definition: WorkflowDefinition,
    input: HashMap<String, Value>,
    parent: ParentLink,
    parent_run: &WorkflowRun,
) -> Result<HashMap<String, Value>> {
    ensure_runnable(&definition)?;
    let input = definition.prepare_input(&input)?;

    let instance = WorkflowInstance::new(&definition, input.clone()).with_parent(parent);
    let instance_id = instance.id.clone();
    ctx.create_workflow(instance).await?;
    info!(
        "Workflow {} started child {} ({})",
        parent_run.instance_id, instance_id, definition.id
    );

    let report = drive(ctx, &instance_id, Arc::new(definition), input, Some(parent_run)).await;
    match report.outcome {
        RunOutcome::Completed => Ok(report.output),
        RunOutcome::Failed(message) => Err(EngineError::SubWorkflowFailed {
            instance_id,
            message,
        }),
        RunOutcome::Cancelled(message) => Err(EngineError::Cancelled(message)),
    }
}
