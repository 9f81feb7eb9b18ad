//! Monitoring Module
//!
//! Publication of instance lifecycle events and the execution timeline
//! built from them.
//!
//! # Components
//!
//! - [`EventHub`]: broadcast of workflow and step status changes
//! - [`ExecutionTimeline`]: step start/end timing for Gantt charts

pub mod events;
pub mod timeline;

pub use events::{EngineEvent, EventHub};
pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
