//! In-Memory Repositories
//!
//! `parking_lot`-guarded maps implementing the repository traits. Used by
//! the CLI and the tests; nothing survives a restart.

use std::collections::HashMap;

use async_trait::async_trait;
use log::debug;
use parking_lot::RwLock;

use super::{DefinitionRepository, StepInstanceRepository, WorkflowInstanceRepository};
use crate::error::{EngineError, Result};
use crate::workflow::{
    StepInstance, StepInstanceUpdate, WorkflowDefinition, WorkflowInstance, WorkflowInstanceUpdate,
};

#[derive(Default)]
pub struct InMemoryDefinitionRepository {
    definitions: RwLock<HashMap<String, WorkflowDefinition>>,
}

impl InMemoryDefinitionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a repository holding `definitions`.
    pub fn with_definitions(definitions: impl IntoIterator<Item = WorkflowDefinition>) -> Self {
        let repository = Self::new();
        {
            let mut map = repository.definitions.write();
            for definition in definitions {
                map.insert(definition.id.clone(), definition);
            }
        }
        repository
    }
}

#[async_trait]
impl DefinitionRepository for InMemoryDefinitionRepository {
    async fn get_by_id(&self, id: &str) -> Result<WorkflowDefinition> {
        self.definitions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("workflow definition '{}'", id)))
    }

    async fn save(&self, definition: WorkflowDefinition) -> Result<()> {
        debug!("Storing definition '{}' v{}", definition.id, definition.version);
        self.definitions.write().insert(definition.id.clone(), definition);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<WorkflowDefinition>> {
        let mut definitions: Vec<WorkflowDefinition> =
            self.definitions.read().values().cloned().collect();
        definitions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(definitions)
    }
}

#[derive(Default)]
pub struct InMemoryWorkflowInstanceRepository {
    instances: RwLock<HashMap<String, WorkflowInstance>>,
}

impl InMemoryWorkflowInstanceRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowInstanceRepository for InMemoryWorkflowInstanceRepository {
    async fn create(&self, instance: WorkflowInstance) -> Result<()> {
        self.instances.write().insert(instance.id.clone(), instance);
        Ok(())
    }

    async fn update(&self, id: &str, update: WorkflowInstanceUpdate) -> Result<WorkflowInstance> {
        let mut instances = self.instances.write();
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("workflow instance '{}'", id)))?;
        instance.apply(&update)?;
        Ok(instance.clone())
    }

    async fn get_by_id(&self, id: &str) -> Result<WorkflowInstance> {
        self.instances
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("workflow instance '{}'", id)))
    }

    async fn list(&self) -> Result<Vec<WorkflowInstance>> {
        let mut instances: Vec<WorkflowInstance> = self.instances.read().values().cloned().collect();
        instances.sort_by_key(|i| i.created_at);
        Ok(instances)
    }
}

#[derive(Default)]
pub struct InMemoryStepInstanceRepository {
    instances: RwLock<HashMap<String, StepInstance>>,
}

impl InMemoryStepInstanceRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StepInstanceRepository for InMemoryStepInstanceRepository {
    async fn create(&self, instance: StepInstance) -> Result<()> {
        self.instances.write().insert(instance.id.clone(), instance);
        Ok(())
    }

    async fn update(&self, id: &str, update: StepInstanceUpdate) -> Result<StepInstance> {
        let mut instances = self.instances.write();
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("step instance '{}'", id)))?;
        instance.apply(&update)?;
        Ok(instance.clone())
    }

    async fn get_by_id(&self, id: &str) -> Result<StepInstance> {
        self.instances
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("step instance '{}'", id)))
    }

    async fn list_by_workflow(&self, workflow_instance_id: &str) -> Result<Vec<StepInstance>> {
        let mut steps: Vec<StepInstance> = self
            .instances
            .read()
            .values()
            .filter(|s| s.workflow_instance_id == workflow_instance_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.created_at);
        Ok(steps)
    }
}
