//! Workflow Definition Module
//!
//! Data structures and utilities for defining, loading and validating
//! workflow definitions, resolving step parameters, and tracking the
//! instances created when a definition runs.
//!
//! # Structure
//!
//! - [`model`]: Definition data structures (WorkflowDefinition, StepDefinition)
//! - [`parser`]: YAML/JSON loading
//! - [`validator`]: Structural validation rules
//! - [`params`]: Parameter binding resolution
//! - [`instance`]: Workflow and step instance records
//! - [`duration`]: Duration string parsing

pub mod duration;
pub mod instance;
pub mod model;
pub mod params;
pub mod parser;
pub mod validator;

pub use instance::{
    InstanceStatus, ParentLink, StepInstance, StepInstanceUpdate, WorkflowInstance,
    WorkflowInstanceUpdate,
};
pub use model::{
    DecisionCase, ForkBranch, ParameterBinding, ParameterDefinition, StepDefinition, StepType,
    TerminateOutcome, WorkflowDefinition,
};
pub use params::{resolve, resolve_all, StepOutputs};
pub use parser::{load_definition, parse_definition, save_definition};
pub use validator::{validate_definition, ValidationError};
