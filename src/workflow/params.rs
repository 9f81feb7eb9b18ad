//! Parameter Resolution
//!
//! Computes a step's concrete input from its declared bindings, the
//! workflow instance input and the outputs of steps completed so far.
//! Resolution is pure: nothing is looked up outside the given maps and
//! unresolvable references yield `null` rather than an error.

use std::collections::HashMap;

use serde_json::Value;

use super::model::ParameterBinding;

/// Outputs recorded so far, keyed by step definition id.
pub type StepOutputs = HashMap<String, HashMap<String, Value>>;

/// Resolves a single binding.
///
/// A `TaskOutput` binding referring to a step that has not produced
/// output yet resolves to `null`; ordering is the caller's concern.
pub fn resolve(
    binding: &ParameterBinding,
    workflow_input: &HashMap<String, Value>,
    step_outputs: &StepOutputs,
) -> Value {
    match binding {
        ParameterBinding::Constant { value } => value.clone(),
        ParameterBinding::WorkflowInput { key } => {
            workflow_input.get(key).cloned().unwrap_or(Value::Null)
        }
        ParameterBinding::TaskOutput { step_id, output_key } => step_outputs
            .get(step_id)
            .and_then(|output| output.get(output_key))
            .cloned()
            .unwrap_or(Value::Null),
    }
}

/// Resolves every binding of a step into its input map.
pub fn resolve_all(
    bindings: &HashMap<String, ParameterBinding>,
    workflow_input: &HashMap<String, Value>,
    step_outputs: &StepOutputs,
) -> HashMap<String, Value> {
    bindings
        .iter()
        .map(|(name, binding)| (name.clone(), resolve(binding, workflow_input, step_outputs)))
        .collect()
}

/// Renders a resolved value as text, unquoting plain strings.
pub fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
