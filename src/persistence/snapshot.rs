//! Run Snapshots
//!
//! Captures a finished (or running) workflow instance together with its
//! step instances and writes it as pretty JSON, so a run can be inspected
//! after the process exits.
//!
//! Snapshots are saved to `.flowrunner/{instance_id}.json` by default.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};

use super::{StepInstanceRepository, WorkflowInstanceRepository};
use crate::error::Result;
use crate::workflow::{InstanceStatus, StepInstance, WorkflowInstance};

/// Default directory for snapshots, relative to the working directory.
pub const SNAPSHOT_DIR: &str = ".flowrunner";

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub workflow: WorkflowInstance,

    /// Step instances in creation order
    pub steps: Vec<StepInstance>,

    /// When the snapshot was taken
    pub captured_at: DateTime<Utc>,
}

impl RunSnapshot {
    /// Reads the current state of `workflow_instance_id` from the
    /// repositories.
    pub async fn capture(
        workflows: &dyn WorkflowInstanceRepository,
        steps: &dyn StepInstanceRepository,
        workflow_instance_id: &str,
    ) -> Result<Self> {
        Ok(Self {
            workflow: workflows.get_by_id(workflow_instance_id).await?,
            steps: steps.list_by_workflow(workflow_instance_id).await?,
            captured_at: Utc::now(),
        })
    }

    /// Writes the snapshot into `dir` and returns the file path.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let path = Self::path_for(dir, &self.workflow.id);
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json)?;

        info!("Saved run snapshot to {}", path.display());
        Ok(path)
    }

    /// Loads a snapshot file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let snapshot: RunSnapshot = serde_json::from_str(&content)?;

        info!(
            "Loaded run snapshot of {} ({}, {} steps)",
            snapshot.workflow.id,
            snapshot.workflow.status,
            snapshot.steps.len()
        );
        Ok(snapshot)
    }

    /// Snapshot file path for an instance id within `dir`.
    pub fn path_for(dir: impl AsRef<Path>, workflow_instance_id: &str) -> PathBuf {
        dir.as_ref().join(format!("{}.json", workflow_instance_id))
    }

    /// Step ids that reached the given status.
    pub fn steps_with_status(&self, status: InstanceStatus) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.status == status)
            .map(|s| s.step_id.as_str())
            .collect()
    }

    /// First error message recorded on a failed step, if any.
    pub fn first_step_error(&self) -> Option<&str> {
        self.steps
            .iter()
            .filter(|s| s.status == InstanceStatus::Failed)
            .find_map(|s| s.error_message.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{InMemoryStepInstanceRepository, InMemoryWorkflowInstanceRepository};
    use crate::workflow::{
        StepDefinition, StepInstanceUpdate, WorkflowDefinition, WorkflowInstanceUpdate,
    };
    use std::collections::HashMap;
    use tempfile::tempdir;

    async fn captured() -> RunSnapshot {
        let definition = WorkflowDefinition::from_steps(
            "wf",
            vec![StepDefinition::task("charge", "payments.charge")],
        );
        let workflows = InMemoryWorkflowInstanceRepository::new();
        let steps = InMemoryStepInstanceRepository::new();

        let instance = WorkflowInstance::new(&definition, HashMap::new());
        let id = instance.id.clone();
        workflows.create(instance).await.unwrap();
        workflows.update(&id, WorkflowInstanceUpdate::running()).await.unwrap();

        let step = StepInstance::new(&id, &definition.steps[0], HashMap::new());
        let step_id = step.id.clone();
        steps.create(step).await.unwrap();
        steps.update(&step_id, StepInstanceUpdate::running()).await.unwrap();
        steps
            .update(&step_id, StepInstanceUpdate::failed("agent unreachable"))
            .await
            .unwrap();
        workflows
            .update(&id, WorkflowInstanceUpdate::failed("agent unreachable"))
            .await
            .unwrap();

        RunSnapshot::capture(&workflows, &steps, &id).await.unwrap()
    }

    #[tokio::test]
    async fn test_capture() {
        let snapshot = captured().await;
        assert_eq!(snapshot.workflow.status, InstanceStatus::Failed);
        assert_eq!(snapshot.steps_with_status(InstanceStatus::Failed), vec!["charge"]);
        assert_eq!(snapshot.first_step_error(), Some("agent unreachable"));
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_dir = tempdir().unwrap();
        let snapshot = captured().await;

        let path = snapshot.save(temp_dir.path()).unwrap();
        assert_eq!(path, RunSnapshot::path_for(temp_dir.path(), &snapshot.workflow.id));
        assert!(path.exists());

        let loaded = RunSnapshot::load(&path).unwrap();
        assert_eq!(loaded.workflow, snapshot.workflow);
        assert_eq!(loaded.steps, snapshot.steps);
    }

    #[test]
    fn test_load_missing_file() {
        assert!(RunSnapshot::load("/nonexistent/snapshot.json").is_err());
    }

    #[tokio::test]
    async fn test_capture_unknown_instance() {
        let workflows = InMemoryWorkflowInstanceRepository::new();
        let steps = InMemoryStepInstanceRepository::new();
        assert!(RunSnapshot::capture(&workflows, &steps, "ghost").await.is_err());
    }

    #[test]
    fn test_path_for() {
        let path = RunSnapshot::path_for(SNAPSHOT_DIR, "abc");
        assert_eq!(path, PathBuf::from(".flowrunner/abc.json"));
    }
}
