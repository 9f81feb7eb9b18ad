//! Agent Connectors
//!
//! The transport used to reach a registered agent. Agents describe
//! themselves with [`AgentInfo`]; a [`ConnectorFactory`] turns that
//! description into an [`AgentConnector`] the registry keeps for dispatch.
//!
//! The shipped [`HttpConnector`] speaks JSON over HTTP:
//!
//! | Call | Request | Response |
//! |------|---------|----------|
//! | ping | `POST {address}/ping` | any 2xx |
//! | start task | `POST {address}/tasks` `{"taskType", "input"}` | `{"taskId"}` |

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};

/// Default timeout for a single request to an agent.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Wire protocol an agent is reached with.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentProtocol {
    #[default]
    Http,
}

impl fmt::Display for AgentProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentProtocol::Http => f.write_str("http"),
        }
    }
}

/// A task type an agent can execute.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Free-form schema of the task input
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_parameters: Option<Value>,
    /// Free-form schema of the task output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_parameters: Option<Value>,
}

impl TaskDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: None,
            input_parameters: None,
            output_parameters: None,
        }
    }
}

/// What an agent sends when it registers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
    /// Base address, e.g. `http://10.0.0.4:7070`
    pub address: String,
    #[serde(default)]
    pub protocol: AgentProtocol,
    #[serde(default)]
    pub supported_tasks: Vec<TaskDefinition>,
}

impl AgentInfo {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: "1.0.0".to_string(),
            address: address.into(),
            protocol: AgentProtocol::Http,
            supported_tasks: Vec::new(),
        }
    }

    /// Declares support for a task type.
    pub fn with_task(mut self, task_type: impl Into<String>) -> Self {
        self.supported_tasks.push(TaskDefinition::new(task_type));
        self
    }
}

/// A live link to one agent.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    /// Liveness probe
    async fn ping(&self) -> Result<()>;

    /// Asks the agent to start a task and returns the agent's task id.
    async fn start_task(&self, task_type: &str, input: &HashMap<String, Value>) -> Result<String>;
}

/// Builds connectors from registration info.
pub trait ConnectorFactory: Send + Sync {
    fn connect(&self, info: &AgentInfo) -> Result<Arc<dyn AgentConnector>>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartTaskRequest<'a> {
    task_type: &'a str,
    input: &'a HashMap<String, Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartTaskResponse {
    task_id: String,
}

/// JSON-over-HTTP connector.
pub struct HttpConnector {
    client: reqwest::Client,
    base_url: String,
}

impl HttpConnector {
    pub fn new(address: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::ConnectorUnavailable(format!("{}: {}", address, e)))?;

        Ok(Self {
            client,
            base_url: normalise_address(address)?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Adds a scheme when missing and strips trailing slashes.
fn normalise_address(address: &str) -> Result<String> {
    let trimmed = address.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(EngineError::ConnectorUnavailable("empty agent address".to_string()));
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("http://{}", trimmed))
    }
}

#[async_trait]
impl AgentConnector for HttpConnector {
    async fn ping(&self) -> Result<()> {
        let url = format!("{}/ping", self.base_url);
        debug!("Pinging agent at {}", url);

        self.client
            .post(&url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| EngineError::ConnectorUnavailable(format!("ping {} failed: {}", url, e)))?;
        Ok(())
    }

    async fn start_task(&self, task_type: &str, input: &HashMap<String, Value>) -> Result<String> {
        let url = format!("{}/tasks", self.base_url);
        debug!("Starting task '{}' at {}", task_type, url);

        let response: StartTaskResponse = self
            .client
            .post(&url)
            .json(&StartTaskRequest { task_type, input })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if response.task_id.trim().is_empty() {
            return Err(EngineError::Dispatch(format!(
                "agent at {} returned an empty task id for '{}'",
                self.base_url, task_type
            )));
        }
        Ok(response.task_id)
    }
}

/// Builds [`HttpConnector`]s for every registration.
#[derive(Debug, Clone)]
pub struct HttpConnectorFactory {
    timeout: Duration,
}

impl HttpConnectorFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for HttpConnectorFactory {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl ConnectorFactory for HttpConnectorFactory {
    fn connect(&self, info: &AgentInfo) -> Result<Arc<dyn AgentConnector>> {
        match info.protocol {
            AgentProtocol::Http => {
                let connector: Arc<dyn AgentConnector> =
                    Arc::new(HttpConnector::new(&info.address, self.timeout)?);
                Ok(connector)
            }
        }
    }
}
