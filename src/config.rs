//! Engine Configuration
//!
//! Queue capacities, pool sizes and wait timeouts for the executors.
//! Values start from [`EngineConfig::default`], can be overlaid from
//! `FLOWRUNNER_*` environment variables, and finally by CLI flags.

use std::env;
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::workflow::duration::{self, parse_duration};

/// Default capacity of both job queues.
pub const DEFAULT_QUEUE_SIZE: usize = 100;

/// Default number of workflows executing at once.
pub const DEFAULT_MAX_PARALLEL_WORKFLOWS: usize = 2;

/// Default upper bound on how long a step waits for a remote agent or a
/// join barrier.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Capacity of the workflow job queue
    pub workflow_queue_size: usize,

    /// Capacity of the step job queue
    pub step_queue_size: usize,

    /// Maximum workflows executing at once
    pub max_parallel_workflows: usize,

    /// Maximum steps holding a worker slot at once
    pub max_parallel_steps: usize,

    /// How long a Task step waits for its remote completion notification
    #[serde(with = "duration::serde_opt")]
    pub task_timeout: Option<Duration>,

    /// How long a Join step waits for its incoming steps. Required.
    #[serde(with = "duration::serde_opt")]
    pub join_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workflow_queue_size: DEFAULT_QUEUE_SIZE,
            step_queue_size: DEFAULT_QUEUE_SIZE,
            max_parallel_workflows: DEFAULT_MAX_PARALLEL_WORKFLOWS,
            max_parallel_steps: num_cpus::get().max(2),
            task_timeout: Some(DEFAULT_WAIT_TIMEOUT),
            join_timeout: Some(DEFAULT_WAIT_TIMEOUT),
        }
    }
}

impl EngineConfig {
    /// Builds a configuration from the defaults overlaid with environment
    /// variables. Malformed values are ignored with a warning.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `FLOWRUNNER_WORKFLOW_QUEUE_SIZE` | `workflow_queue_size` |
    /// | `FLOWRUNNER_STEP_QUEUE_SIZE` | `step_queue_size` |
    /// | `FLOWRUNNER_MAX_PARALLEL_WORKFLOWS` | `max_parallel_workflows` |
    /// | `FLOWRUNNER_MAX_PARALLEL_STEPS` | `max_parallel_steps` |
    /// | `FLOWRUNNER_TASK_TIMEOUT` | `task_timeout` (`"none"` disables) |
    /// | `FLOWRUNNER_JOIN_TIMEOUT` | `join_timeout` (cannot be disabled) |
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| env::var(key).ok());
        config
    }

    /// Overlays values obtained from `lookup` on this configuration.
    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let sizes: [(&str, &mut usize); 4] = [
            ("FLOWRUNNER_WORKFLOW_QUEUE_SIZE", &mut self.workflow_queue_size),
            ("FLOWRUNNER_STEP_QUEUE_SIZE", &mut self.step_queue_size),
            ("FLOWRUNNER_MAX_PARALLEL_WORKFLOWS", &mut self.max_parallel_workflows),
            ("FLOWRUNNER_MAX_PARALLEL_STEPS", &mut self.max_parallel_steps),
        ];
        for (key, slot) in sizes {
            if let Some(raw) = lookup(key) {
                match raw.trim().parse::<usize>() {
                    Ok(value) if value > 0 => *slot = value,
                    _ => warn!("Ignoring {}={:?}: expected a positive integer", key, raw),
                }
            }
        }

        let timeouts: [(&str, &mut Option<Duration>, bool); 2] = [
            ("FLOWRUNNER_TASK_TIMEOUT", &mut self.task_timeout, true),
            ("FLOWRUNNER_JOIN_TIMEOUT", &mut self.join_timeout, false),
        ];
        for (key, slot, may_disable) in timeouts {
            if let Some(raw) = lookup(key) {
                if raw.trim().eq_ignore_ascii_case("none") {
                    if may_disable {
                        *slot = None;
                    } else {
                        warn!("Ignoring {}={:?}: this timeout cannot be disabled", key, raw);
                    }
                    continue;
                }
                match parse_duration(&raw) {
                    Ok(value) => *slot = Some(value),
                    Err(e) => warn!("Ignoring {}={:?}: {}", key, raw, e),
                }
            }
        }
    }

    /// Checks that every capacity is usable and that joins are bounded.
    pub fn validate(&self) -> Result<(), String> {
        if self.join_timeout.is_none() {
            return Err("join_timeout must be set".to_string());
        }

        let fields = [
            ("workflow_queue_size", self.workflow_queue_size),
            ("step_queue_size", self.step_queue_size),
            ("max_parallel_workflows", self.max_parallel_workflows),
            ("max_parallel_steps", self.max_parallel_steps),
        ];
        let zero: Vec<&str> = fields
            .iter()
            .filter(|(_, value)| *value == 0)
            .map(|(name, _)| *name)
            .collect();

        if zero.is_empty() {
            Ok(())
        } else {
            Err(format!("configuration values must be positive: {}", zero.join(", ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.workflow_queue_size, 100);
        assert_eq!(config.step_queue_size, 100);
        assert_eq!(config.max_parallel_workflows, 2);
        assert!(config.max_parallel_steps >= 2);
        assert_eq!(config.task_timeout, Some(DEFAULT_WAIT_TIMEOUT));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overlay() {
        let vars: HashMap<&str, &str> = [
            ("FLOWRUNNER_STEP_QUEUE_SIZE", "8"),
            ("FLOWRUNNER_MAX_PARALLEL_STEPS", "3"),
            ("FLOWRUNNER_TASK_TIMEOUT", "30s"),
            ("FLOWRUNNER_JOIN_TIMEOUT", "45s"),
        ]
        .into_iter()
        .collect();

        let mut config = EngineConfig::default();
        config.apply_env(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.step_queue_size, 8);
        assert_eq!(config.max_parallel_steps, 3);
        assert_eq!(config.task_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.join_timeout, Some(Duration::from_secs(45)));
        assert_eq!(config.workflow_queue_size, DEFAULT_QUEUE_SIZE);
    }

    #[test]
    fn test_join_timeout_cannot_be_disabled() {
        let mut config = EngineConfig::default();
        config.apply_env(|key| match key {
            "FLOWRUNNER_TASK_TIMEOUT" | "FLOWRUNNER_JOIN_TIMEOUT" => Some("none".to_string()),
            _ => None,
        });

        assert_eq!(config.task_timeout, None);
        assert_eq!(config.join_timeout, Some(DEFAULT_WAIT_TIMEOUT));
        assert!(config.validate().is_ok());

        config.join_timeout = None;
        assert!(config.validate().unwrap_err().contains("join_timeout"));
    }

    #[test]
    fn test_env_overlay_ignores_garbage() {
        let mut config = EngineConfig::default();
        config.apply_env(|key| match key {
            "FLOWRUNNER_WORKFLOW_QUEUE_SIZE" => Some("zero".to_string()),
            "FLOWRUNNER_MAX_PARALLEL_WORKFLOWS" => Some("0".to_string()),
            "FLOWRUNNER_TASK_TIMEOUT" => Some("soon".to_string()),
            _ => None,
        });

        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_validate_rejects_zero() {
        let config = EngineConfig {
            step_queue_size: 0,
            ..EngineConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.contains("step_queue_size"));
    }

    #[test]
    fn test_serde_durations() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"maxParallelSteps": 4, "taskTimeout": "90s", "joinTimeout": null}"#)
                .unwrap();
        assert_eq!(config.max_parallel_steps, 4);
        assert_eq!(config.task_timeout, Some(Duration::from_secs(90)));
        assert_eq!(config.join_timeout, None);
        assert!(config.validate().is_err());

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["taskTimeout"], "90s");
    }
}
