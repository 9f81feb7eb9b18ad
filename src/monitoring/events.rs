//! Engine Events
//!
//! Best-effort publication of instance lifecycle changes. Execution never
//! depends on anyone listening.

use chrono::{DateTime, Utc};
use log::trace;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::workflow::{InstanceStatus, StepInstance, WorkflowInstance};

/// Default number of events buffered per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineEvent {
    #[serde(rename_all = "camelCase")]
    WorkflowCreated {
        workflow_instance_id: String,
        definition_id: String,
        parent_workflow_instance_id: Option<String>,
        at: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    WorkflowStatusChanged {
        workflow_instance_id: String,
        status: InstanceStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    StepStatusChanged {
        workflow_instance_id: String,
        step_instance_id: String,
        step_id: String,
        status: InstanceStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    },
}

impl EngineEvent {
    pub fn workflow_created(instance: &WorkflowInstance) -> Self {
        EngineEvent::WorkflowCreated {
            workflow_instance_id: instance.id.clone(),
            definition_id: instance.definition_id.clone(),
            parent_workflow_instance_id: instance
                .parent
                .as_ref()
                .map(|p| p.workflow_instance_id.clone()),
            at: instance.created_at,
        }
    }

    pub fn workflow_status(instance: &WorkflowInstance) -> Self {
        EngineEvent::WorkflowStatusChanged {
            workflow_instance_id: instance.id.clone(),
            status: instance.status,
            error: instance.error_message.clone(),
            at: Utc::now(),
        }
    }

    pub fn step_status(instance: &StepInstance) -> Self {
        EngineEvent::StepStatusChanged {
            workflow_instance_id: instance.workflow_instance_id.clone(),
            step_instance_id: instance.id.clone(),
            step_id: instance.step_id.clone(),
            status: instance.status,
            error: instance.error_message.clone(),
            at: Utc::now(),
        }
    }

    pub fn workflow_instance_id(&self) -> &str {
        match self {
            EngineEvent::WorkflowCreated { workflow_instance_id, .. }
            | EngineEvent::WorkflowStatusChanged { workflow_instance_id, .. }
            | EngineEvent::StepStatusChanged { workflow_instance_id, .. } => workflow_instance_id,
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            EngineEvent::WorkflowCreated { at, .. }
            | EngineEvent::WorkflowStatusChanged { at, .. }
            | EngineEvent::StepStatusChanged { at, .. } => *at,
        }
    }
}

/// Publish/subscribe hub for [`EngineEvent`]s.
#[derive(Debug, Clone)]
pub struct EventHub {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Publishes to current subscribers; an event nobody listens to is
    /// simply discarded.
    pub fn publish(&self, event: EngineEvent) {
        trace!("Publishing {:?}", event);
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
