//! Definition Parser
//!
//! Loads workflow definitions from YAML or JSON files. JSON is accepted
//! through the YAML parser, so either format works regardless of the file
//! extension.

use std::fs;
use std::path::Path;

use log::{debug, info};
use uuid::Uuid;

use super::model::WorkflowDefinition;
use super::validator::validate_definition;
use crate::error::{EngineError, Result};

/// Parses and validates a definition from its textual form.
///
/// A definition without an id is given a fresh one.
pub fn parse_definition(content: &str) -> Result<WorkflowDefinition> {
    let mut definition: WorkflowDefinition = serde_yaml::from_str(content).map_err(|e| {
        EngineError::Definition(format!(
            "Failed to parse workflow definition: {}. Check the file format.",
            e
        ))
    })?;

    if definition.id.trim().is_empty() {
        definition.id = Uuid::new_v4().to_string();
        debug!("Assigned id {} to anonymous definition", definition.id);
    }
    if definition.name.is_empty() {
        definition.name = definition.id.clone();
    }

    info!(
        "Parsed definition '{}' v{}: {} steps, {} inputs, {} outputs",
        definition.id,
        definition.version,
        definition.steps.len(),
        definition.input_parameters.len(),
        definition.output_parameters.len()
    );

    validate_definition(&definition)?;
    Ok(definition)
}

/// Loads a workflow definition from a file.
///
/// # Example
///
/// ```rust,no_run
/// use flowrunner::workflow::load_definition;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let definition = load_definition("order-pipeline.yaml")?;
///     println!("Loaded {} steps", definition.len());
///     Ok(())
/// }
/// ```
pub fn load_definition(path: impl AsRef<Path>) -> Result<WorkflowDefinition> {
    let path = path.as_ref();
    info!("Loading workflow definition from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|e| {
        EngineError::Definition(format!(
            "Failed to read workflow file '{}': {}. Check that the file exists and is readable.",
            path.display(),
            e
        ))
    })?;

    debug!("Definition content loaded ({} bytes)", content.len());
    parse_definition(&content)
}

/// Saves a definition, as JSON when the path ends in `.json` and as YAML
/// otherwise.
pub fn save_definition(definition: &WorkflowDefinition, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));

    let content = if is_json {
        serde_json::to_string_pretty(definition)?
    } else {
        serde_yaml::to_string(definition)?
    };
    fs::write(path, content)?;
    info!("Workflow definition saved to: {}", path.display());
    Ok(())
}
