//! Engine Context
//!
//! The collaborators every executor needs: configuration, repositories,
//! the agent registry, the remote task table, the event hub and the step
//! queue. Also owns the two write paths that must stay paired with an
//! event: instance updates and step scheduling.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};

use super::queue::BoundedQueue;
use super::run::WorkflowRun;
use super::step_executor::StepJob;
use crate::agent::{AgentRegistry, RemoteTaskTable};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::monitoring::{EngineEvent, EventHub};
use crate::persistence::{DefinitionRepository, StepInstanceRepository, WorkflowInstanceRepository};
use crate::workflow::{
    StepInstance, StepInstanceUpdate, StepType, WorkflowInstance, WorkflowInstanceUpdate,
};

pub struct EngineContext {
    pub config: EngineConfig,
    pub definitions: Arc<dyn DefinitionRepository>,
    pub workflows: Arc<dyn WorkflowInstanceRepository>,
    pub steps: Arc<dyn StepInstanceRepository>,
    pub agents: Arc<AgentRegistry>,
    pub remote_tasks: Arc<RemoteTaskTable>,
    pub events: EventHub,
    pub(crate) step_queue: BoundedQueue<StepJob>,
}

impl EngineContext {
    /// Persists a new workflow instance and announces it.
    pub async fn create_workflow(&self, instance: WorkflowInstance) -> Result<()> {
        let event = EngineEvent::workflow_created(&instance);
        self.workflows.create(instance).await?;
        self.events.publish(event);
        Ok(())
    }

    pub async fn update_workflow(&self, id: &str, update: WorkflowInstanceUpdate) -> Result<WorkflowInstance> {
        let instance = self.workflows.update(id, update).await?;
        self.events.publish(EngineEvent::workflow_status(&instance));
        Ok(instance)
    }

    pub async fn update_step(&self, id: &str, update: StepInstanceUpdate) -> Result<StepInstance> {
        let instance = self.steps.update(id, update).await?;
        self.events.publish(EngineEvent::step_status(&instance));
        Ok(instance)
    }

    /// Creates a Pending step instance for `step_id` and enqueues it.
    ///
    /// A Join reached from several places is only scheduled by the first.
    /// Nothing is scheduled once the run has an outcome. If the step queue
    /// is full the new instance is marked Failed and the run fails with
    /// the returned error.
    pub async fn schedule_step(&self, run: &Arc<WorkflowRun>, step_id: &str) -> Result<()> {
        let step = run.definition.get_step(step_id).ok_or_else(|| {
            EngineError::Definition(format!(
                "step '{}' does not exist in workflow '{}'",
                step_id, run.definition.id
            ))
        })?;

        if run.is_aborted() {
            debug!("Not scheduling '{}': workflow {} already finished", step_id, run.instance_id);
            return Ok(());
        }
        if step.step_type == StepType::Join && !run.claim_join(step_id)? {
            debug!("Join '{}' of workflow {} is already scheduled", step_id, run.instance_id);
            return Ok(());
        }

        let instance = StepInstance::new(&run.instance_id, step, HashMap::new());
        let step_instance_id = instance.id.clone();
        let event = EngineEvent::step_status(&instance);
        self.steps.create(instance).await?;
        self.events.publish(event);

        run.begin_step();
        let job = StepJob {
            run: Arc::clone(run),
            step_id: step_id.to_string(),
            step_instance_id: step_instance_id.clone(),
        };

        if let Err(e) = self.step_queue.enqueue(job) {
            let message = format!("could not enqueue step '{}': {}", step_id, e);
            warn!("Workflow {}: {}", run.instance_id, message);
            if let Err(update_err) = self
                .update_step(&step_instance_id, StepInstanceUpdate::failed(&message))
                .await
            {
                warn!("Could not mark step instance {} failed: {}", step_instance_id, update_err);
            }
            // Fail before releasing the count so an empty run is not taken
            // as completed.
            run.fail(message);
            run.finish_step();
            return Err(e);
        }

        debug!("Scheduled step '{}' ({}) of workflow {}", step_id, step_instance_id, run.instance_id);
        Ok(())
    }
}
