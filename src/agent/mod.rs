//! Remote Agent Module
//!
//! Everything needed to hand Task steps to external worker processes.
//!
//! # Components
//!
//! - [`registry`]: registered agents and the task type index
//! - [`connector`]: transports used to reach an agent
//! - [`tasks`]: pending remote tasks awaiting a status notification

pub mod connector;
pub mod registry;
pub mod tasks;

pub use connector::{
    AgentConnector, AgentInfo, AgentProtocol, ConnectorFactory, HttpConnector,
    HttpConnectorFactory, TaskDefinition,
};
pub use registry::{AgentHandle, AgentRegistry};
pub use tasks::{RemoteTaskStatus, RemoteTaskTable, TaskOutcome};
