//! Execution Timeline
//!
//! Builds step start/end times from engine events for execution reports
//! and Gantt charts.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::warn;
use tokio::sync::broadcast::{self, error::TryRecvError};

use super::events::EngineEvent;
use crate::workflow::InstanceStatus;

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EventType {
    /// Step started executing
    Started,
    /// Step completed successfully
    Completed,
    /// Step failed
    Failed,
    /// Step was abandoned because its run was aborted
    Cancelled,
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    /// Step definition id
    pub step_id: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
}

/// Tracks the execution timeline of one workflow instance.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    workflow_instance_id: Option<String>,
    events: Vec<TimelineEvent>,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    final_status: Option<InstanceStatus>,
}

impl ExecutionTimeline {
    /// Creates a timeline starting now that records every workflow.
    pub fn new() -> Self {
        Self {
            workflow_instance_id: None,
            events: Vec::new(),
            start_time: Utc::now(),
            end_time: None,
            final_status: None,
        }
    }

    /// Creates a timeline that only records events of one instance.
    pub fn for_instance(workflow_instance_id: impl Into<String>) -> Self {
        Self {
            workflow_instance_id: Some(workflow_instance_id.into()),
            ..Self::new()
        }
    }

    /// Records an event for a step.
    pub fn add_event(&mut self, step_id: impl Into<String>, event_type: EventType, timestamp: DateTime<Utc>) {
        self.events.push(TimelineEvent {
            step_id: step_id.into(),
            event_type,
            timestamp,
        });
    }

    /// Applies one engine event.
    pub fn record(&mut self, event: &EngineEvent) {
        if let Some(id) = &self.workflow_instance_id {
            if event.workflow_instance_id() != id {
                return;
            }
        }

        match event {
            EngineEvent::StepStatusChanged { step_id, status, at, .. } => {
                let event_type = match status {
                    InstanceStatus::Running => EventType::Started,
                    InstanceStatus::Completed => EventType::Completed,
                    InstanceStatus::Failed => EventType::Failed,
                    InstanceStatus::Cancelled => EventType::Cancelled,
                    InstanceStatus::Pending => return,
                };
                self.add_event(step_id.clone(), event_type, *at);
            }
            EngineEvent::WorkflowStatusChanged { status, at, .. } => {
                if *status == InstanceStatus::Running {
                    self.start_time = *at;
                } else if status.is_terminal() {
                    self.end_time = Some(*at);
                    self.final_status = Some(*status);
                }
            }
            EngineEvent::WorkflowCreated { .. } => {}
        }
    }

    /// Records every event already waiting on `receiver` without blocking.
    /// Returns how many events were read.
    pub fn record_available(&mut self, receiver: &mut broadcast::Receiver<EngineEvent>) -> usize {
        let mut read = 0;
        loop {
            match receiver.try_recv() {
                Ok(event) => {
                    self.record(&event);
                    read += 1;
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("Timeline missed {} events", skipped);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        read
    }

    /// Returns all recorded events.
    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    pub fn final_status(&self) -> Option<InstanceStatus> {
        self.final_status
    }

    /// Total time between the workflow start and its end (or now).
    pub fn elapsed_ms(&self) -> i64 {
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - self.start_time).num_milliseconds().max(0)
    }

    fn offset_ms(&self, at: DateTime<Utc>) -> i64 {
        (at - self.start_time).num_milliseconds().max(0)
    }

    /// Per step: (start offset, end offset, last event type).
    fn spans(&self) -> HashMap<String, (i64, i64, EventType)> {
        let mut spans: HashMap<String, (i64, i64, EventType)> = HashMap::new();

        for event in &self.events {
            let offset = self.offset_ms(event.timestamp);
            match event.event_type {
                EventType::Started => {
                    spans.insert(event.step_id.clone(), (offset, offset, EventType::Started));
                }
                finished => {
                    let span = spans
                        .entry(event.step_id.clone())
                        .or_insert((offset, offset, finished));
                    span.1 = offset;
                    span.2 = finished;
                }
            }
        }

        spans
    }

    /// Generates an ASCII Gantt chart.
    ///
    /// Each step is shown as a bar indicating when it ran relative to the
    /// total execution time. Failed steps are drawn with `x`, cancelled
    /// ones with `-`.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = self.elapsed_ms();
        if total_time == 0 || self.events.is_empty() {
            return output;
        }

        // Scale to 50 characters width
        let scale = 50.0 / total_time as f64;

        let mut sorted_steps: Vec<_> = self.spans().into_iter().collect();
        sorted_steps.sort_by_key(|(id, (start, _, _))| (*start, id.clone()));

        for (step_id, (start, end, last)) in sorted_steps {
            let start_pos = (start as f64 * scale) as usize;
            let width = (((end - start) as f64) * scale).max(1.0) as usize;
            let mark = match last {
                EventType::Failed => "x",
                EventType::Cancelled => "-",
                _ => "#",
            };

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&mark.repeat(width));

            output.push_str(&format!(
                "{:12} |{:50}| ({} ms)\n",
                truncate(&step_id, 12),
                bar,
                end - start
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }

    /// Returns finished step durations in milliseconds.
    pub fn get_durations(&self) -> HashMap<String, i64> {
        self.spans()
            .into_iter()
            .filter(|(_, (_, _, last))| *last != EventType::Started)
            .map(|(id, (start, end, _))| (id, end - start))
            .collect()
    }

    /// One-line count of finished steps per outcome.
    pub fn summary(&self) -> String {
        let spans = self.spans();
        let count = |kind: EventType| spans.values().filter(|(_, _, last)| *last == kind).count();

        format!(
            "Steps: {} completed, {} failed, {} cancelled, {} unfinished",
            count(EventType::Completed),
            count(EventType::Failed),
            count(EventType::Cancelled),
            count(EventType::Started)
        )
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or truncates a string to a fixed width.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
