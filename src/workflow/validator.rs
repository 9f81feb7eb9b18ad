//! Definition Validation
//!
//! Structural checks run before a definition is accepted:
//! - Step id presence and uniqueness
//! - Config presence matching the step type
//! - Reference integrity for every routed step id and task output binding
//! - Per-type sanity (fork joins, join sets, decision cases, task types)

use std::collections::{HashSet, VecDeque};

use log::{debug, info, warn};

use super::model::{ParameterBinding, StepDefinition, StepType, WorkflowDefinition};
use crate::error::{EngineError, Result};

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyWorkflow,
    EmptyStepId,
    DuplicateStepId(String),
    UnknownStartStep(String),
    MissingConfig { step: String, step_type: StepType },
    ForeignConfig { step: String, config: StepType },
    InvalidReference { step: String, reference: String },
    ForkTargetNotJoin { step: String, target: String },
    EmptyForkBranches(String),
    EmptyJoinIncoming(String),
    EmptyDecisionCases(String),
    EmptyCondition(String),
    EmptyTaskType(String),
    EmptySubWorkflowDefinition(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyWorkflow => write!(f, "Workflow has no steps"),
            Self::EmptyStepId => write!(f, "Step has empty or whitespace-only ID"),
            Self::DuplicateStepId(id) => write!(f, "Duplicate step ID: '{}'", id),
            Self::UnknownStartStep(id) => write!(f, "Start step '{}' does not exist", id),
            Self::MissingConfig { step, step_type } => {
                write!(f, "Step '{}' of type {} has no {} config", step, step_type, step_type)
            }
            Self::ForeignConfig { step, config } => {
                write!(f, "Step '{}' carries a {} config that does not match its type", step, config)
            }
            Self::InvalidReference { step, reference } => {
                write!(f, "Step '{}' references unknown step '{}'", step, reference)
            }
            Self::ForkTargetNotJoin { step, target } => {
                write!(f, "Fork '{}' names '{}' as its join, but it is not a join step", step, target)
            }
            Self::EmptyForkBranches(step) => write!(f, "Fork '{}' has no branches", step),
            Self::EmptyJoinIncoming(step) => write!(f, "Join '{}' has no incoming steps", step),
            Self::EmptyDecisionCases(step) => write!(f, "Decision '{}' has no cases", step),
            Self::EmptyCondition(step) => write!(f, "Decision '{}' has a case with an empty condition", step),
            Self::EmptyTaskType(step) => write!(f, "Step '{}' has no task type specified", step),
            Self::EmptySubWorkflowDefinition(step) => {
                write!(f, "Step '{}' has no sub-workflow definition id", step)
            }
        }
    }
}

/// Checks that exactly the config matching the step type is present.
fn validate_config_shape(step: &StepDefinition) -> Vec<ValidationError> {
    let present = step.present_configs();
    let mut errors = Vec::new();

    if !present.contains(&step.step_type) {
        errors.push(ValidationError::MissingConfig {
            step: step.id.clone(),
            step_type: step.step_type,
        });
    }
    for config in present.into_iter().filter(|c| *c != step.step_type) {
        errors.push(ValidationError::ForeignConfig {
            step: step.id.clone(),
            config,
        });
    }

    errors
}

/// Validates the type-specific fields of a single step.
fn validate_step(step: &StepDefinition, definition: &WorkflowDefinition) -> Vec<ValidationError> {
    let mut errors = validate_config_shape(step);
    if !errors.is_empty() {
        return errors;
    }

    match step.step_type {
        StepType::Task => {
            if let Some(config) = &step.task {
                if config.task_type.trim().is_empty() {
                    errors.push(ValidationError::EmptyTaskType(step.id.clone()));
                }
            }
        }
        StepType::Fork => {
            if let Some(config) = &step.fork {
                if config.branches.is_empty() {
                    errors.push(ValidationError::EmptyForkBranches(step.id.clone()));
                }
                if let Some(target) = definition.get_step(&config.join_step_id) {
                    if target.step_type != StepType::Join {
                        errors.push(ValidationError::ForkTargetNotJoin {
                            step: step.id.clone(),
                            target: target.id.clone(),
                        });
                    }
                }
            }
        }
        StepType::Join => {
            if let Some(config) = &step.join {
                if config.incoming_step_ids.is_empty() {
                    errors.push(ValidationError::EmptyJoinIncoming(step.id.clone()));
                }
            }
        }
        StepType::Decision => {
            if let Some(config) = &step.decision {
                if config.cases.is_empty() {
                    errors.push(ValidationError::EmptyDecisionCases(step.id.clone()));
                }
                if config.cases.iter().any(|c| c.condition.trim().is_empty()) {
                    errors.push(ValidationError::EmptyCondition(step.id.clone()));
                }
            }
        }
        StepType::SubWorkflow => {
            if let Some(config) = &step.sub_workflow {
                if config.definition_id.trim().is_empty() {
                    errors.push(ValidationError::EmptySubWorkflowDefinition(step.id.clone()));
                }
            }
        }
        StepType::Wait | StepType::Terminate => {}
    }

    errors
}

/// Every step id a step mentions: routing targets, join inputs and
/// task output bindings.
fn referenced_ids(step: &StepDefinition) -> Vec<&str> {
    let mut ids = step.successor_ids();
    if let Some(config) = &step.join {
        ids.extend(config.incoming_step_ids.iter().map(String::as_str));
    }
    ids.extend(step.parameters.values().filter_map(|binding| match binding {
        ParameterBinding::TaskOutput { step_id, .. } => Some(step_id.as_str()),
        _ => None,
    }));
    ids
}

/// Collects every problem with a definition without stopping at the first.
pub fn collect_errors(definition: &WorkflowDefinition) -> Vec<ValidationError> {
    if definition.steps.is_empty() {
        return vec![ValidationError::EmptyWorkflow];
    }

    let mut errors = Vec::new();
    let mut seen_ids: HashSet<&str> = HashSet::new();
    for step in &definition.steps {
        if step.id.trim().is_empty() {
            errors.push(ValidationError::EmptyStepId);
        } else if !seen_ids.insert(step.id.as_str()) {
            errors.push(ValidationError::DuplicateStepId(step.id.clone()));
        }
    }

    if let Some(start) = &definition.start_step {
        if !seen_ids.contains(start.as_str()) {
            errors.push(ValidationError::UnknownStartStep(start.clone()));
        }
    }

    for step in &definition.steps {
        errors.extend(validate_step(step, definition));

        for reference in referenced_ids(step) {
            if !seen_ids.contains(reference) {
                errors.push(ValidationError::InvalidReference {
                    step: step.id.clone(),
                    reference: reference.to_string(),
                });
            }
        }
    }

    for (name, parameter) in &definition.output_parameters {
        if let Some(ParameterBinding::TaskOutput { step_id, .. }) = &parameter.value {
            if !seen_ids.contains(step_id.as_str()) {
                errors.push(ValidationError::InvalidReference {
                    step: format!("output:{}", name),
                    reference: step_id.clone(),
                });
            }
        }
    }

    errors
}

/// Validates the entire definition.
///
/// All problems found are reported together in a single
/// [`EngineError::Validation`], one per line.
pub fn validate_definition(definition: &WorkflowDefinition) -> Result<()> {
    info!(
        "Validating workflow '{}' with {} steps",
        definition.id,
        definition.steps.len()
    );

    let errors = collect_errors(definition);
    if !errors.is_empty() {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        return Err(EngineError::Validation(messages.join("\n")));
    }

    for id in unreachable_steps(definition) {
        warn!("Step '{}' is not reachable from the first step", id);
    }

    info!("Workflow '{}' validated", definition.id);
    Ok(())
}

/// Returns the ids of steps no route from the first step can reach.
fn unreachable_steps(definition: &WorkflowDefinition) -> Vec<String> {
    let Some(first) = definition.first_step() else {
        return Vec::new();
    };

    let mut visited: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::from([first.id.as_str()]);

    while let Some(current) = queue.pop_front() {
        if !visited.insert(current) {
            continue;
        }
        if let Some(step) = definition.get_step(current) {
            queue.extend(step.successor_ids());
        }
    }

    let unreachable: Vec<String> = definition
        .steps
        .iter()
        .filter(|s| !visited.contains(s.id.as_str()))
        .map(|s| s.id.clone())
        .collect();

    debug!("Reachable steps: {}, unreachable: {:?}", visited.len(), unreachable);
    unreachable
}
