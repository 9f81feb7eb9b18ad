//! Workflow Definition Model
//!
//! Core data structures describing a workflow as a directed graph of typed
//! steps. Definitions are read-only to the engine.
//!
//! # Example YAML Format
//!
//! ```yaml
//! id: order-pipeline
//! name: Order pipeline
//! version: 1.0.0
//! inputParameters:
//!   orderId: { type: string, required: true }
//! steps:
//!   - id: split
//!     type: fork
//!     fork:
//!       joinStepId: merge
//!       branches:
//!         - nextStepId: reserve
//!         - nextStepId: cool_down
//!
//!   - id: reserve
//!     type: task
//!     parameters:
//!       order: { type: workflowInput, key: orderId }
//!     task:
//!       taskType: inventory.reserve
//!
//!   - id: cool_down
//!     type: wait
//!     wait:
//!       duration: { type: constant, value: 5s }
//!
//!   - id: merge
//!     type: join
//!     join:
//!       incomingStepIds: [reserve, cool_down]
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};

/// The kind of work a step performs. Selects the step type executor.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Task,
    Wait,
    Fork,
    Join,
    Decision,
    SubWorkflow,
    Terminate,
}

impl StepType {
    pub const ALL: [StepType; 7] = [
        StepType::Task,
        StepType::Wait,
        StepType::Fork,
        StepType::Join,
        StepType::Decision,
        StepType::SubWorkflow,
        StepType::Terminate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Task => "task",
            StepType::Wait => "wait",
            StepType::Fork => "fork",
            StepType::Join => "join",
            StepType::Decision => "decision",
            StepType::SubWorkflow => "subworkflow",
            StepType::Terminate => "terminate",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a step parameter gets its value from.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ParameterBinding {
    /// A literal value
    Constant { value: Value },

    /// A key of the workflow instance input
    WorkflowInput { key: String },

    /// An output key of a previously completed step
    #[serde(rename_all = "camelCase")]
    TaskOutput { step_id: String, output_key: String },
}

impl ParameterBinding {
    pub fn constant(value: impl Into<Value>) -> Self {
        ParameterBinding::Constant { value: value.into() }
    }

    pub fn workflow_input(key: impl Into<String>) -> Self {
        ParameterBinding::WorkflowInput { key: key.into() }
    }

    pub fn task_output(step_id: impl Into<String>, output_key: impl Into<String>) -> Self {
        ParameterBinding::TaskOutput {
            step_id: step_id.into(),
            output_key: output_key.into(),
        }
    }
}

/// Dispatches the step to the agent that supports `task_type`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskConfig {
    pub task_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step_id: Option<String>,
}

/// Sleeps for a parameter-resolved duration such as `"1s"` or `"2m30s"`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WaitConfig {
    pub duration: ParameterBinding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ForkBranch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub next_step_id: String,
}

/// Fans out to every branch head and schedules the join alongside them.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ForkConfig {
    pub join_step_id: String,
    #[serde(default)]
    pub branches: Vec<ForkBranch>,
}

/// Waits until every incoming step has completed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JoinConfig {
    #[serde(default)]
    pub incoming_step_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DecisionCase {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub condition: String,
    pub next_step_id: String,
}

/// Follows the first case whose condition holds.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DecisionConfig {
    #[serde(default)]
    pub cases: Vec<DecisionCase>,
}

/// Runs another workflow definition as a child instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubWorkflowConfig {
    pub definition_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TerminateOutcome {
    #[default]
    Completed,
    Failed,
}

/// Ends the whole run immediately.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TerminateConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub outcome: TerminateOutcome,
}

/// A single node of the workflow graph.
///
/// Exactly one of the config fields must be present and it must match
/// `step_type`; the validator enforces this.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    /// Unique identifier within the definition
    pub id: String,

    #[serde(rename = "type")]
    pub step_type: StepType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Named bindings resolved into the step's input
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub parameters: HashMap<String, ParameterBinding>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<WaitConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fork: Option<ForkConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join: Option<JoinConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<DecisionConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_workflow: Option<SubWorkflowConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminate: Option<TerminateConfig>,
}

impl StepDefinition {
    fn bare(id: impl Into<String>, step_type: StepType) -> Self {
        Self {
            id: id.into().trim().to_string(),
            step_type,
            name: None,
            description: None,
            parameters: HashMap::new(),
            task: None,
            wait: None,
            fork: None,
            join: None,
            decision: None,
            sub_workflow: None,
            terminate: None,
        }
    }

    /// Creates a Task step dispatched to agents supporting `task_type`.
    ///
    /// # Example
    ///
    /// ```
    /// use flowrunner::workflow::{ParameterBinding, StepDefinition};
    ///
    /// let step = StepDefinition::task("charge", "payments.charge")
    ///     .with_parameter("amount", ParameterBinding::workflow_input("total"))
    ///     .then("notify");
    /// ```
    pub fn task(id: impl Into<String>, task_type: impl Into<String>) -> Self {
        let mut step = Self::bare(id, StepType::Task);
        step.task = Some(TaskConfig {
            task_type: task_type.into(),
            next_step_id: None,
        });
        step
    }

    /// Creates a Wait step sleeping for the resolved `duration`.
    pub fn wait(id: impl Into<String>, duration: ParameterBinding) -> Self {
        let mut step = Self::bare(id, StepType::Wait);
        step.wait = Some(WaitConfig {
            duration,
            next_step_id: None,
        });
        step
    }

    /// Creates a Fork step with one branch per entry of `branch_heads`.
    pub fn fork<I, S>(id: impl Into<String>, join_step_id: impl Into<String>, branch_heads: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut step = Self::bare(id, StepType::Fork);
        step.fork = Some(ForkConfig {
            join_step_id: join_step_id.into(),
            branches: branch_heads
                .into_iter()
                .map(|head| ForkBranch {
                    name: None,
                    next_step_id: head.into(),
                })
                .collect(),
        });
        step
    }

    /// Creates a Join step waiting for every id in `incoming`.
    pub fn join<I, S>(id: impl Into<String>, incoming: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut step = Self::bare(id, StepType::Join);
        step.join = Some(JoinConfig {
            incoming_step_ids: incoming.into_iter().map(Into::into).collect(),
            next_step_id: None,
        });
        step
    }

    /// Creates a Decision step from `(condition, next step id)` pairs.
    pub fn decision<I, C, N>(id: impl Into<String>, cases: I) -> Self
    where
        I: IntoIterator<Item = (C, N)>,
        C: Into<String>,
        N: Into<String>,
    {
        let mut step = Self::bare(id, StepType::Decision);
        step.decision = Some(DecisionConfig {
            cases: cases
                .into_iter()
                .map(|(condition, next)| DecisionCase {
                    name: None,
                    condition: condition.into(),
                    next_step_id: next.into(),
                })
                .collect(),
        });
        step
    }

    /// Creates a SubWorkflow step running `definition_id` as a child.
    pub fn sub_workflow(id: impl Into<String>, definition_id: impl Into<String>) -> Self {
        let mut step = Self::bare(id, StepType::SubWorkflow);
        step.sub_workflow = Some(SubWorkflowConfig {
            definition_id: definition_id.into(),
            next_step_id: None,
        });
        step
    }

    /// Creates a Terminate step.
    pub fn terminate(id: impl Into<String>, outcome: TerminateOutcome, reason: Option<String>) -> Self {
        let mut step = Self::bare(id, StepType::Terminate);
        step.terminate = Some(TerminateConfig { reason, outcome });
        step
    }

    /// Sets the single next step for step types that have one.
    ///
    /// Fork, Decision and Terminate steps route through their own config
    /// and are left unchanged.
    pub fn then(mut self, next_step_id: impl Into<String>) -> Self {
        let next = Some(next_step_id.into());
        if let Some(config) = self.task.as_mut() {
            config.next_step_id = next;
        } else if let Some(config) = self.wait.as_mut() {
            config.next_step_id = next;
        } else if let Some(config) = self.join.as_mut() {
            config.next_step_id = next;
        } else if let Some(config) = self.sub_workflow.as_mut() {
            config.next_step_id = next;
        }
        self
    }

    /// Adds a named parameter binding.
    pub fn with_parameter(mut self, name: impl Into<String>, binding: ParameterBinding) -> Self {
        self.parameters.insert(name.into(), binding);
        self
    }

    /// Sets the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Returns the step types whose config objects are present.
    pub fn present_configs(&self) -> Vec<StepType> {
        let mut present = Vec::new();
        if self.task.is_some() {
            present.push(StepType::Task);
        }
        if self.wait.is_some() {
            present.push(StepType::Wait);
        }
        if self.fork.is_some() {
            present.push(StepType::Fork);
        }
        if self.join.is_some() {
            present.push(StepType::Join);
        }
        if self.decision.is_some() {
            present.push(StepType::Decision);
        }
        if self.sub_workflow.is_some() {
            present.push(StepType::SubWorkflow);
        }
        if self.terminate.is_some() {
            present.push(StepType::Terminate);
        }
        present
    }

    /// Every step id this step can route to, in declaration order.
    pub fn successor_ids(&self) -> Vec<&str> {
        let mut ids = Vec::new();
        match self.step_type {
            StepType::Task => ids.extend(self.task.as_ref().and_then(|c| c.next_step_id.as_deref())),
            StepType::Wait => ids.extend(self.wait.as_ref().and_then(|c| c.next_step_id.as_deref())),
            StepType::Join => ids.extend(self.join.as_ref().and_then(|c| c.next_step_id.as_deref())),
            StepType::SubWorkflow => {
                ids.extend(self.sub_workflow.as_ref().and_then(|c| c.next_step_id.as_deref()))
            }
            StepType::Fork => {
                if let Some(config) = &self.fork {
                    ids.push(config.join_step_id.as_str());
                    ids.extend(config.branches.iter().map(|b| b.next_step_id.as_str()));
                }
            }
            StepType::Decision => {
                if let Some(config) = &self.decision {
                    ids.extend(config.cases.iter().map(|c| c.next_step_id.as_str()));
                }
            }
            StepType::Terminate => {}
        }
        ids
    }

    fn missing_config(&self) -> EngineError {
        EngineError::Definition(format!(
            "step '{}' of type {} has no {} config",
            self.id, self.step_type, self.step_type
        ))
    }

    pub fn task_config(&self) -> Result<&TaskConfig> {
        self.task.as_ref().ok_or_else(|| self.missing_config())
    }

    pub fn wait_config(&self) -> Result<&WaitConfig> {
        self.wait.as_ref().ok_or_else(|| self.missing_config())
    }

    pub fn fork_config(&self) -> Result<&ForkConfig> {
        self.fork.as_ref().ok_or_else(|| self.missing_config())
    }

    pub fn join_config(&self) -> Result<&JoinConfig> {
        self.join.as_ref().ok_or_else(|| self.missing_config())
    }

    pub fn decision_config(&self) -> Result<&DecisionConfig> {
        self.decision.as_ref().ok_or_else(|| self.missing_config())
    }

    pub fn sub_workflow_config(&self) -> Result<&SubWorkflowConfig> {
        self.sub_workflow.as_ref().ok_or_else(|| self.missing_config())
    }

    pub fn terminate_config(&self) -> Result<&TerminateConfig> {
        self.terminate.as_ref().ok_or_else(|| self.missing_config())
    }
}

/// Declared workflow input or output parameter.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ParameterDefinition {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub param_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Input only: the start request must supply this key
    #[serde(default)]
    pub required: bool,

    /// Input only: used when the start request omits this key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    /// Output only: where the workflow output value comes from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<ParameterBinding>,
}

/// A complete workflow definition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub is_draft: bool,

    #[serde(default = "default_enabled")]
    pub is_enabled: bool,

    /// Entry step; defaults to the first declared step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_step: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_parameters: BTreeMap<String, ParameterDefinition>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output_parameters: BTreeMap<String, ParameterDefinition>,

    /// Steps in declaration order
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_enabled() -> bool {
    true
}

impl WorkflowDefinition {
    /// Creates an empty, enabled definition.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: default_version(),
            description: None,
            is_draft: false,
            is_enabled: true,
            start_step: None,
            input_parameters: BTreeMap::new(),
            output_parameters: BTreeMap::new(),
            steps: Vec::new(),
        }
    }

    /// Creates a definition from a list of steps.
    pub fn from_steps(id: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        let id = id.into();
        let mut definition = Self::new(id.clone(), id);
        definition.steps = steps;
        definition
    }

    /// Adds a step to the definition.
    pub fn add_step(&mut self, step: StepDefinition) -> Result<()> {
        if self.steps.iter().any(|s| s.id == step.id) {
            return Err(EngineError::Definition(format!("step '{}' already exists", step.id)));
        }
        self.steps.push(step);
        Ok(())
    }

    /// Declares an input parameter.
    pub fn with_input(mut self, name: impl Into<String>, parameter: ParameterDefinition) -> Self {
        self.input_parameters.insert(name.into(), parameter);
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, binding: ParameterBinding) -> Self {
        self.output_parameters.insert(
            name.into(),
            ParameterDefinition {
                value: Some(binding),
                ..ParameterDefinition::default()
            },
        );
        self
    }

    /// Gets a step by ID.
    pub fn get_step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Gets a mutable reference to a step by ID.
    pub fn get_step_mut(&mut self, id: &str) -> Option<&mut StepDefinition> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// Returns the step the workflow starts with.
    pub fn first_step(&self) -> Option<&StepDefinition> {
        match &self.start_step {
            Some(id) => self.get_step(id),
            None => self.steps.first(),
        }
    }

    /// Returns the steps that route nowhere (exit points).
    pub fn leaf_steps(&self) -> Vec<&StepDefinition> {
        self.steps.iter().filter(|s| s.successor_ids().is_empty()).collect()
    }

    /// Returns the number of steps in the definition.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the definition has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Applies declared defaults to a start request's input and checks
    /// that every required key is present.
    pub fn prepare_input(&self, input: &HashMap<String, Value>) -> Result<HashMap<String, Value>> {
        let mut prepared = input.clone();
        let mut missing = Vec::new();

        for (name, parameter) in &self.input_parameters {
            if prepared.contains_key(name) {
                continue;
            }
            match &parameter.default {
                Some(default) => {
                    prepared.insert(name.clone(), default.clone());
                }
                None if parameter.required => missing.push(name.as_str()),
                None => {}
            }
        }

        if missing.is_empty() {
            Ok(prepared)
        } else {
            Err(EngineError::InvalidInput(format!(
                "missing required input parameter(s): {}",
                missing.join(", ")
            )))
        }
    }
}
