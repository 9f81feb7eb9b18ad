//! Workflow Execution Module
//!
//! Runs workflow instances on two bounded worker pools fed by
//! non-blocking queues, and drives each step through its type executor.
//!
//! # Architecture
//!
//! - [`engine`]: facade wiring repositories, agents and both pools
//! - [`workflow_executor`]: workflow pool, one job per instance
//! - [`step_executor`]: step pool, one job per step instance
//! - [`step`]: step type executor trait and registry
//! - [`executors`]: built-in executors for every step type
//! - [`run`]: per-instance run state and join barriers
//! - [`condition`]: Decision condition evaluation
//! - [`queue`]: fixed-capacity job queues

pub mod condition;
pub mod context;
pub mod engine;
pub mod executors;
pub mod queue;
pub mod run;
pub mod step;
pub mod step_executor;
pub mod workflow_executor;

pub use condition::{ComparisonEvaluator, ConditionEvaluator};
pub use context::EngineContext;
pub use engine::{Engine, EngineBuilder};
pub use queue::BoundedQueue;
pub use run::{JoinBarrier, RunOutcome, WorkflowRun};
pub use step::{StepExecution, StepExecutorRegistry, StepResult, StepTypeExecutor};
pub use workflow_executor::RunReport;
