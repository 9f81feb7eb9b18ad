//! Workflow and Step Instances
//!
//! Runtime records created for every started workflow and every scheduled
//! step, plus the partial updates the executors issue against them.
//! Status transitions are monotonic: nothing leaves a terminal state.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::model::{StepDefinition, StepType, WorkflowDefinition};
use crate::error::{EngineError, Result};

/// Lifecycle status shared by workflow and step instances.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::Cancelled
        )
    }

    /// Whether `next` is a legal successor of this status.
    pub fn can_transition_to(&self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        match (self, next) {
            (Pending, Running) | (Pending, Failed) | (Pending, Cancelled) => true,
            (Running, Completed) | (Running, Failed) | (Running, Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Pending => "PENDING",
            InstanceStatus::Running => "RUNNING",
            InstanceStatus::Completed => "COMPLETED",
            InstanceStatus::Failed => "FAILED",
            InstanceStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn check_transition(from: InstanceStatus, to: InstanceStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Links a child workflow instance to the step that started it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParentLink {
    pub workflow_instance_id: String,
    pub step_instance_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInstance {
    pub id: String,
    pub definition_id: String,
    pub definition_version: String,
    pub status: InstanceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentLink>,
    #[serde(default)]
    pub input: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<HashMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    /// Creates a Pending instance of `definition`.
    pub fn new(definition: &WorkflowDefinition, input: HashMap<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            definition_id: definition.id.clone(),
            definition_version: definition.version.clone(),
            status: InstanceStatus::Pending,
            parent: None,
            input,
            output: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_parent(mut self, parent: ParentLink) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Applies a partial update, refusing illegal status transitions.
    pub fn apply(&mut self, update: &WorkflowInstanceUpdate) -> Result<()> {
        if let Some(status) = update.status {
            check_transition(self.status, status)?;
            self.status = status;
        }
        if let Some(output) = &update.output {
            self.output = Some(output.clone());
        }
        if let Some(message) = &update.error_message {
            self.error_message = Some(message.clone());
        }
        if update.started_at.is_some() {
            self.started_at = update.started_at;
        }
        if update.completed_at.is_some() {
            self.completed_at = update.completed_at;
        }
        Ok(())
    }
}

/// Partial update of a workflow instance; `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkflowInstanceUpdate {
    pub status: Option<InstanceStatus>,
    pub output: Option<HashMap<String, Value>>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowInstanceUpdate {
    pub fn running() -> Self {
        Self {
            status: Some(InstanceStatus::Running),
            started_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn completed(output: HashMap<String, Value>) -> Self {
        Self {
            status: Some(InstanceStatus::Completed),
            output: Some(output),
            completed_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(InstanceStatus::Failed),
            error_message: Some(message.into()),
            completed_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            status: Some(InstanceStatus::Cancelled),
            error_message: Some(message.into()),
            completed_at: Some(Utc::now()),
            ..Self::default()
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepInstance {
    pub id: String,
    pub workflow_instance_id: String,
    /// Id of the step definition this instance runs
    pub step_id: String,
    pub step_type: StepType,
    pub status: InstanceStatus,
    #[serde(default)]
    pub input: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<HashMap<String, Value>>,
    #[serde(default)]
    pub progress: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepInstance {
    /// Creates a Pending instance of `step` with its resolved input.
    pub fn new(workflow_instance_id: &str, step: &StepDefinition, input: HashMap<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workflow_instance_id: workflow_instance_id.to_string(),
            step_id: step.id.clone(),
            step_type: step.step_type,
            status: InstanceStatus::Pending,
            input,
            output: None,
            progress: 0.0,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Applies a partial update, refusing illegal status transitions.
    pub fn apply(&mut self, update: &StepInstanceUpdate) -> Result<()> {
        if let Some(status) = update.status {
            check_transition(self.status, status)?;
            self.status = status;
        }
        if let Some(input) = &update.input {
            self.input = input.clone();
        }
        if let Some(output) = &update.output {
            self.output = Some(output.clone());
        }
        if let Some(progress) = update.progress {
            self.progress = progress.clamp(0.0, 1.0);
        }
        if let Some(message) = &update.error_message {
            self.error_message = Some(message.clone());
        }
        if update.started_at.is_some() {
            self.started_at = update.started_at;
        }
        if update.completed_at.is_some() {
            self.completed_at = update.completed_at;
        }
        Ok(())
    }
}

/// Partial update of a step instance; `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepInstanceUpdate {
    pub status: Option<InstanceStatus>,
    /// Input resolved when the step starts running
    pub input: Option<HashMap<String, Value>>,
    pub output: Option<HashMap<String, Value>>,
    pub progress: Option<f32>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepInstanceUpdate {
    pub fn running() -> Self {
        Self {
            status: Some(InstanceStatus::Running),
            started_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn with_input(mut self, input: HashMap<String, Value>) -> Self {
        self.input = Some(input);
        self
    }

    pub fn completed(output: HashMap<String, Value>) -> Self {
        Self {
            status: Some(InstanceStatus::Completed),
            output: Some(output),
            progress: Some(1.0),
            completed_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(InstanceStatus::Failed),
            error_message: Some(message.into()),
            completed_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            status: Some(InstanceStatus::Cancelled),
            error_message: Some(message.into()),
            completed_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn progress(progress: f32) -> Self {
        Self {
            progress: Some(progress),
            ..Self::default()
        }
    }
}
