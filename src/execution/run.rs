//! Workflow Run State
//!
//! Everything the step workers of one workflow instance share while it
//! executes:
//!
//! - outputs of completed steps, for parameter resolution
//! - one [`JoinBarrier`] per Join step that has been reached
//! - the count of step jobs still in flight; the run completes when it
//!   drops to zero
//! - a take-once outcome signal and an abort flag for fail-fast

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{oneshot, watch};

use crate::error::{EngineError, Result};
use crate::workflow::{StepOutputs, WorkflowDefinition};

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    Failed(String),
    Cancelled(String),
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed)
    }
}

/// Barrier of a single Join step.
///
/// Counts distinct incoming steps that have completed. Arrivals are
/// idempotent and steps outside the incoming set are ignored.
pub struct JoinBarrier {
    step_id: String,
    expected: HashSet<String>,
    arrived: Mutex<HashSet<String>>,
    remaining: watch::Sender<usize>,
    scheduled: AtomicBool,
}

impl JoinBarrier {
    fn new(step_id: &str, expected: HashSet<String>) -> Self {
        let (remaining, _) = watch::channel(expected.len());
        Self {
            step_id: step_id.to_string(),
            expected,
            arrived: Mutex::new(HashSet::new()),
            remaining,
            scheduled: AtomicBool::new(false),
        }
    }

    /// Records that `step_id` completed. Returns true if this arrival
    /// counted.
    pub fn arrive(&self, step_id: &str) -> bool {
        if !self.expected.contains(step_id) {
            return false;
        }

        let mut arrived = self.arrived.lock();
        if !arrived.insert(step_id.to_string()) {
            debug!("Join '{}' already saw '{}'", self.step_id, step_id);
            return false;
        }

        let remaining = self.expected.len() - arrived.len();
        self.remaining.send_replace(remaining);
        if remaining == 0 {
            debug!("Join '{}' released", self.step_id);
        }
        true
    }

    pub fn is_released(&self) -> bool {
        *self.remaining.borrow() == 0
    }

    /// Incoming steps not yet completed, sorted.
    pub fn outstanding(&self) -> Vec<String> {
        let arrived = self.arrived.lock();
        let mut outstanding: Vec<String> = self
            .expected
            .iter()
            .filter(|id| !arrived.contains(*id))
            .cloned()
            .collect();
        outstanding.sort();
        outstanding
    }

    /// Waits until every incoming step has completed.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        let mut receiver = self.remaining.subscribe();

        let released = match timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, receiver.wait_for(|remaining| *remaining == 0)).await {
                    Ok(result) => result.is_ok(),
                    Err(_) => {
                        return Err(EngineError::Timeout(format!(
                            "join '{}' still waiting for [{}] after {:?}",
                            self.step_id,
                            self.outstanding().join(", "),
                            limit
                        )))
                    }
                }
            }
            None => receiver.wait_for(|remaining| *remaining == 0).await.is_ok(),
        };

        if released {
            Ok(())
        } else {
            Err(EngineError::Cancelled(format!("join '{}' was discarded", self.step_id)))
        }
    }

    /// Claims the right to schedule this Join. Only the first caller gets
    /// true.
    fn claim(&self) -> bool {
        !self.scheduled.swap(true, Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Joins {
    completed: HashSet<String>,
    barriers: HashMap<String, Arc<JoinBarrier>>,
}

pub struct WorkflowRun {
    pub instance_id: String,
    pub definition: Arc<WorkflowDefinition>,
    pub input: HashMap<String, Value>,
    outputs: RwLock<StepOutputs>,
    joins: Mutex<Joins>,
    in_flight: AtomicUsize,
    outcome: Mutex<Option<oneshot::Sender<RunOutcome>>>,
    aborted: watch::Sender<bool>,
}

impl WorkflowRun {
    /// Creates the run state and the receiver its outcome is delivered on.
    pub fn new(
        instance_id: impl Into<String>,
        definition: Arc<WorkflowDefinition>,
        input: HashMap<String, Value>,
    ) -> (Arc<Self>, oneshot::Receiver<RunOutcome>) {
        let (sender, receiver) = oneshot::channel();
        let (aborted, _) = watch::channel(false);

        let run = Arc::new(Self {
            instance_id: instance_id.into(),
            definition,
            input,
            outputs: RwLock::new(StepOutputs::new()),
            joins: Mutex::new(Joins::default()),
            in_flight: AtomicUsize::new(0),
            outcome: Mutex::new(Some(sender)),
            aborted,
        });
        (run, receiver)
    }

    /// Copy of the outputs recorded so far.
    pub fn step_outputs(&self) -> StepOutputs {
        self.outputs.read().clone()
    }

    /// Stores a completed step's output and feeds every barrier waiting
    /// on it. Must happen before the step's successors are enqueued.
    pub fn record_completion(&self, step_id: &str, output: HashMap<String, Value>) {
        self.outputs.write().insert(step_id.to_string(), output);

        let mut joins = self.joins.lock();
        joins.completed.insert(step_id.to_string());
        for barrier in joins.barriers.values() {
            barrier.arrive(step_id);
        }
    }

    /// Returns the barrier of a Join step, arming it on first use. A new
    /// barrier already counts incoming steps that completed before it.
    pub fn barrier(&self, join_step_id: &str) -> Result<Arc<JoinBarrier>> {
        let mut joins = self.joins.lock();
        if let Some(barrier) = joins.barriers.get(join_step_id) {
            return Ok(Arc::clone(barrier));
        }

        let step = self.definition.get_step(join_step_id).ok_or_else(|| {
            EngineError::Definition(format!("join step '{}' does not exist", join_step_id))
        })?;
        let expected: HashSet<String> = step.join_config()?.incoming_step_ids.iter().cloned().collect();

        let barrier = Arc::new(JoinBarrier::new(join_step_id, expected));
        for step_id in &joins.completed {
            barrier.arrive(step_id);
        }
        debug!(
            "Armed join '{}' of workflow {} waiting for [{}]",
            join_step_id,
            self.instance_id,
            barrier.outstanding().join(", ")
        );

        joins.barriers.insert(join_step_id.to_string(), Arc::clone(&barrier));
        Ok(barrier)
    }

    /// True exactly once per Join step: the caller that should enqueue it.
    pub fn claim_join(&self, join_step_id: &str) -> Result<bool> {
        Ok(self.barrier(join_step_id)?.claim())
    }

    /// Counts a step job about to be enqueued.
    pub fn begin_step(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    /// Counts a step job as done. The last one completes the run.
    pub fn finish_step(&self) {
        let previous = self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 {
            self.finish(RunOutcome::Completed);
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Ends the run with a failure.
    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.finish(RunOutcome::Failed(message.into()))
    }

    /// Delivers the outcome and raises the abort flag. Only the first call
    /// has any effect.
    pub fn finish(&self, outcome: RunOutcome) -> bool {
        let Some(sender) = self.outcome.lock().take() else {
            return false;
        };

        info!("Workflow {} finished: {:?}", self.instance_id, outcome);
        self.aborted.send_replace(true);
        let _ = sender.send(outcome);
        true
    }

    /// True once the run has an outcome; remaining steps must not run.
    pub fn is_aborted(&self) -> bool {
        *self.aborted.borrow()
    }

    /// Resolves once the run has an outcome.
    pub async fn aborted(&self) {
        let mut receiver = self.aborted.subscribe();
        let _ = receiver.wait_for(|aborted| *aborted).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{ParameterBinding, StepDefinition};
    use serde_json::json;

    fn fan_in() -> Arc<WorkflowDefinition> {
        Arc::new(WorkflowDefinition::from_steps(
            "fan_in",
            vec![
                StepDefinition::fork("split", "merge", ["left", "right"]),
                StepDefinition::wait("left", ParameterBinding::constant("1ms")).then("merge"),
                StepDefinition::wait("right", ParameterBinding::constant("1ms")).then("merge"),
                StepDefinition::join("merge", ["left", "right"]),
            ],
        ))
    }

    fn output(value: i64) -> HashMap<String, Value> {
        let mut map = HashMap::new();
        map.insert("value".to_string(), json!(value));
        map
    }

    #[tokio::test]
    async fn test_barrier_releases_after_all_incoming() {
        let (run, _outcome) = WorkflowRun::new("wf-1", fan_in(), HashMap::new());
        let barrier = run.barrier("merge").unwrap();
        assert_eq!(barrier.outstanding(), vec!["left", "right"]);

        run.record_completion("left", output(1));
        assert!(!barrier.is_released());
        assert_eq!(barrier.outstanding(), vec!["right"]);

        run.record_completion("right", output(2));
        assert!(barrier.is_released());
        barrier.wait(Some(Duration::from_millis(10))).await.unwrap();
        assert_eq!(run.step_outputs()["right"]["value"], json!(2));
    }

    #[tokio::test]
    async fn test_duplicate_arrivals_are_idempotent() {
        let (run, _outcome) = WorkflowRun::new("wf-1", fan_in(), HashMap::new());
        let barrier = run.barrier("merge").unwrap();

        assert!(barrier.arrive("left"));
        assert!(!barrier.arrive("left"));
        assert!(!barrier.arrive("split"));
        assert!(!barrier.is_released());

        let err = barrier.wait(Some(Duration::from_millis(20))).await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));
        assert!(err.to_string().contains("right"));
    }

    #[test]
    fn test_barrier_armed_late_counts_earlier_completions() {
        let (run, _outcome) = WorkflowRun::new("wf-1", fan_in(), HashMap::new());
        run.record_completion("left", output(1));
        run.record_completion("right", output(2));

        assert!(run.barrier("merge").unwrap().is_released());
    }

    #[test]
    fn test_join_is_claimed_once() {
        let (run, _outcome) = WorkflowRun::new("wf-1", fan_in(), HashMap::new());
        assert!(run.claim_join("merge").unwrap());
        assert!(!run.claim_join("merge").unwrap());
        assert!(run.claim_join("left").is_err());
        assert!(run.barrier("ghost").is_err());
    }

    #[tokio::test]
    async fn test_last_step_completes_run() {
        let (run, outcome) = WorkflowRun::new("wf-1", fan_in(), HashMap::new());
        run.begin_step();
        run.begin_step();
        run.finish_step();
        assert!(!run.is_aborted());
        run.finish_step();

        assert_eq!(outcome.await.unwrap(), RunOutcome::Completed);
        assert!(run.is_aborted());
    }

    #[tokio::test]
    async fn test_first_outcome_wins() {
        let (run, outcome) = WorkflowRun::new("wf-1", fan_in(), HashMap::new());
        run.begin_step();

        assert!(run.fail("left exploded"));
        assert!(!run.fail("right exploded"));
        run.finish_step();

        assert_eq!(outcome.await.unwrap(), RunOutcome::Failed("left exploded".to_string()));
    }

    #[tokio::test]
    async fn test_aborted_wakes_waiters() {
        let (run, _outcome) = WorkflowRun::new("wf-1", fan_in(), HashMap::new());
        let waiter = {
            let run = Arc::clone(&run);
            tokio::spawn(async move { run.aborted().await })
        };

        run.finish(RunOutcome::Cancelled("stopped".to_string()));
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
