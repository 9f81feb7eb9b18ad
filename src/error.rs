//! Engine Errors
//!
//! A single error type shared by the registry, the executors and the
//! repositories. Every step failure ends up as the `Display` text of one
//! of these variants on the failed step and workflow instance.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{queue} queue is full, exceeded capacity of {capacity}")]
    QueueFull { queue: &'static str, capacity: usize },

    #[error("Definition error: {0}")]
    Definition(String),

    #[error("Validation failed:\n{0}")]
    Validation(String),

    #[error("No executor registered for step type '{0}'")]
    UnsupportedStepType(String),

    #[error("No registered agent found for task type '{0}'")]
    AgentNotFound(String),

    #[error("Could not find a connector for agent '{0}'")]
    ConnectorUnavailable(String),

    #[error("Failed to dispatch task to agent: {0}")]
    Dispatch(String),

    #[error("Remote task {task_id} failed: {message}")]
    RemoteTaskFailed { task_id: String, message: String },

    #[error("Sub-workflow {instance_id} did not complete: {message}")]
    SubWorkflowFailed { instance_id: String, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state transition: from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Invalid workflow input: {0}")]
    InvalidInput(String),

    #[error("Step execution panicked: {0}")]
    Panicked(String),

        #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Engine is shut down")]
    ShutDown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl EngineError {
    /// True for errors caused by the run being aborted rather than by the
    /// step itself.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, EngineError::Cancelled(_) | EngineError::ShutDown)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        EngineError::Dispatch(err.to_string())
    }
}
