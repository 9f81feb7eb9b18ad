//! Persistence Module
//!
//! Repository seams the engine reads definitions from and writes instance
//! state to. The engine only issues partial updates and never reads back
//! state it did not just write.
//!
//! # Components
//!
//! - [`memory`]: in-process repositories
//! - [`snapshot`]: JSON run snapshots on disk

pub mod memory;
pub mod snapshot;

use async_trait::async_trait;

use crate::error::Result;
use crate::workflow::{
    StepInstance, StepInstanceUpdate, WorkflowDefinition, WorkflowInstance, WorkflowInstanceUpdate,
};

pub use memory::{
    InMemoryDefinitionRepository, InMemoryStepInstanceRepository,
    InMemoryWorkflowInstanceRepository,
};
pub use snapshot::RunSnapshot;

/// Read access to workflow definitions.
#[async_trait]
pub trait DefinitionRepository: Send + Sync {
    /// Fails with `NotFound` for unknown ids.
    async fn get_by_id(&self, id: &str) -> Result<WorkflowDefinition>;

    async fn save(&self, definition: WorkflowDefinition) -> Result<()>;

    async fn list(&self) -> Result<Vec<WorkflowDefinition>>;
}

#[async_trait]
pub trait WorkflowInstanceRepository: Send + Sync {
    async fn create(&self, instance: WorkflowInstance) -> Result<()>;

    /// Applies a partial update and returns the updated record.
    async fn update(&self, id: &str, update: WorkflowInstanceUpdate) -> Result<WorkflowInstance>;

    async fn get_by_id(&self, id: &str) -> Result<WorkflowInstance>;

    async fn list(&self) -> Result<Vec<WorkflowInstance>>;
}

#[async_trait]
pub trait StepInstanceRepository: Send + Sync {
    async fn create(&self, instance: StepInstance) -> Result<()>;

    /// Applies a partial update and returns the updated record.
    async fn update(&self, id: &str, update: StepInstanceUpdate) -> Result<StepInstance>;

    async fn get_by_id(&self, id: &str) -> Result<StepInstance>;

    /// Step instances of one workflow instance in creation order.
    async fn list_by_workflow(&self, workflow_instance_id: &str) -> Result<Vec<StepInstance>>;
}
