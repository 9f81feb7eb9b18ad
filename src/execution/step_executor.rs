//! Step Worker Pool
//!
//! Consumes the step queue. Each dequeued job runs in its own task; a
//! semaphore bounds how many of them execute at once. Steps whose
//! executor waits on other steps (Join, SubWorkflow) do that waiting
//! without a slot.

use std::any::Any;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch, Semaphore};

use super::context::EngineContext;
use super::run::WorkflowRun;
use super::step::{StepExecution, StepExecutorRegistry, StepResult};
use crate::error::{EngineError, Result};
use crate::workflow::StepInstanceUpdate;

/// One step instance waiting to run.
pub struct StepJob {
    pub run: Arc<WorkflowRun>,
    pub step_id: String,
    pub step_instance_id: String,
}

pub struct StepExecutor {
    ctx: Arc<EngineContext>,
    registry: Arc<StepExecutorRegistry>,
    slots: Arc<Semaphore>,
}

impl StepExecutor {
    pub fn new(ctx: Arc<EngineContext>, registry: Arc<StepExecutorRegistry>) -> Self {
        let slots = Arc::new(Semaphore::new(ctx.config.max_parallel_steps.max(1)));
        Self {
            ctx,
            registry,
            slots,
        }
    }

    /// Dispatch loop. Returns when `shutdown` flips or the queue closes.
    pub async fn run(self: Arc<Self>, mut jobs: mpsc::Receiver<StepJob>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Step executor started ({} slots)",
            self.ctx.config.max_parallel_steps
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                job = jobs.recv() => match job {
                    Some(job) => {
                        tokio::spawn(Arc::clone(&self).process(job));
                    }
                    None => break,
                },
            }
        }

        info!("Step executor stopped");
    }

    /// Runs the job in its own task so a panicking executor still ends as
    /// a step failure and releases the run's in-flight count.
    async fn process(self: Arc<Self>, job: StepJob) {
        let job = Arc::new(job);
        let worker = {
            let executor = Arc::clone(&self);
            let job = Arc::clone(&job);
            tokio::spawn(async move { executor.drive(&job).await })
        };

        let result = match worker.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(EngineError::Panicked(panic_message(e.into_panic()))),
            Err(_) => Err(EngineError::Cancelled(format!(
                "step '{}' was dropped by the runtime",
                job.step_id
            ))),
        };

        if let Err(e) = result {
            self.record_failure(&job, e).await;
        }
        job.run.finish_step();
    }

    async fn drive(&self, job: &StepJob) -> Result<()> {
        let run = &job.run;
        if run.is_aborted() {
            return Err(EngineError::Cancelled(format!(
                "workflow {} finished before step '{}' started",
                run.instance_id, job.step_id
            )));
        }

        let step = run.definition.get_step(&job.step_id).cloned().ok_or_else(|| {
            EngineError::Definition(format!("step '{}' disappeared from its definition", job.step_id))
        })?;
        let executor = self
            .registry
            .get(step.step_type)
            .ok_or_else(|| EngineError::UnsupportedStepType(step.step_type.to_string()))?;

        let mut execution = StepExecution {
            ctx: Arc::clone(&self.ctx),
            run: Arc::clone(run),
            step,
            step_instance_id: job.step_instance_id.clone(),
            input: Default::default(),
        };

        executor.await_ready(&execution).await?;

        let _slot = if executor.holds_slot() {
            let permit = Arc::clone(&self.slots)
                .acquire_owned()
                .await
                .map_err(|_| EngineError::ShutDown)?;
            Some(permit)
        } else {
            None
        };

        if run.is_aborted() {
            return Err(EngineError::Cancelled(format!(
                "workflow {} finished while step '{}' waited for a slot",
                run.instance_id, job.step_id
            )));
        }

        execution.input = execution.resolve_parameters();
        self.ctx
            .update_step(
                &job.step_instance_id,
                StepInstanceUpdate::running().with_input(execution.input.clone()),
            )
            .await?;
        debug!("Running step '{}' of workflow {}", job.step_id, run.instance_id);

        let result = executor.execute(&execution).await?;
        self.complete(job, result).await
    }

    async fn complete(&self, job: &StepJob, result: StepResult) -> Result<()> {
        let run = &job.run;
        self.ctx
            .update_step(&job.step_instance_id, StepInstanceUpdate::completed(result.output.clone()))
            .await?;
        info!("Step '{}' of workflow {} completed", job.step_id, run.instance_id);

        run.record_completion(&job.step_id, result.output);

        if let Some(outcome) = result.termination {
            run.finish(outcome);
            return Ok(());
        }

        for next in &result.next_step_ids {
            // A failed enqueue has already failed the run
            if let Err(e) = self.ctx.schedule_step(run, next).await {
                error!("Workflow {}: could not schedule '{}': {}", run.instance_id, next, e);
                if !run.is_aborted() {
                    run.fail(format!("could not schedule step '{}': {}", next, e));
                }
                break;
            }
        }
        Ok(())
    }

    /// Marks the step Failed, or Cancelled when the run ended under it,
    /// and fails the run on a real failure.
    async fn record_failure(&self, job: &StepJob, err: EngineError) {
        let run = &job.run;
        let message = err.to_string();
        let cancelled = err.is_cancellation() && run.is_aborted();

        let update = if cancelled {
            debug!("Step '{}' of workflow {} cancelled: {}", job.step_id, run.instance_id, message);
            StepInstanceUpdate::cancelled(&message)
        } else {
            error!("Step '{}' of workflow {} failed: {}", job.step_id, run.instance_id, message);
            StepInstanceUpdate::failed(&message)
        };

        if let Err(e) = self.ctx.update_step(&job.step_instance_id, update).await {
            warn!("Could not record outcome of step instance {}: {}", job.step_instance_id, e);
        }

        if !cancelled {
            run.fail(format!("step '{}' failed: {}", job.step_id, message));
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
