//! FlowRunner - Workflow Orchestration Engine
//!
//! Runs declarative workflow definitions (directed graphs of typed steps)
//! on bounded worker pools, handing Task steps to remote agents and
//! synchronising parallel branches through fork/join barriers.
//!
//! # Architecture
//!
//! - [`workflow`]: Definition model, YAML/JSON loading, validation and
//!   parameter resolution
//! - [`execution`]: Engine facade, worker pools and step type executors
//! - [`agent`]: Agent registry, connectors and pending remote tasks
//! - [`persistence`]: Repository traits, in-memory repositories and run
//!   snapshots
//! - [`monitoring`]: Lifecycle events and execution timeline
//!
//! # Example
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use flowrunner::{load_definition, Engine, EngineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load a workflow from YAML
//!     let definition = load_definition("order.yaml")?;
//!     let id = definition.id.clone();
//!
//!     // Create execution engine
//!     let engine = Engine::new(EngineConfig::default())?;
//!     engine.register_definition(definition).await?;
//!
//!     // Execute the workflow
//!     let instance = engine.run_workflow(&id, HashMap::new()).await?;
//!     println!("{}: {}", instance.id, instance.status);
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod persistence;
pub mod workflow;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use execution::{Engine, EngineBuilder};
pub use workflow::model::{StepDefinition, StepType, WorkflowDefinition};
pub use workflow::parser::load_definition;
pub use workflow::{InstanceStatus, StepInstance, WorkflowInstance};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "FlowRunner";
