//! Agent Registry
//!
//! Tracks registered agents, the connector used to reach each of them and
//! an index from task type id to the agent that serves it. Agents live in
//! process memory only and must re-register after a restart.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde_json::Value;

use super::connector::{AgentConnector, AgentInfo, ConnectorFactory, TaskDefinition};
use crate::error::{EngineError, Result};

/// A registered agent together with its connector.
#[derive(Clone)]
pub struct AgentHandle {
    pub info: AgentInfo,
    pub registered_at: DateTime<Utc>,
    connector: Arc<dyn AgentConnector>,
}

impl AgentHandle {
    pub fn connector(&self) -> &Arc<dyn AgentConnector> {
        &self.connector
    }
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("info", &self.info)
            .field("registered_at", &self.registered_at)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct RegistryState {
    agents: HashMap<String, AgentHandle>,
    /// task type id -> agent name
    task_index: HashMap<String, String>,
}

/// Shared registry of remote agents.
pub struct AgentRegistry {
    factory: Arc<dyn ConnectorFactory>,
    state: RwLock<RegistryState>,
}

impl AgentRegistry {
    pub fn new(factory: Arc<dyn ConnectorFactory>) -> Self {
        Self {
            factory,
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Connects to the agent, probes it and, only if the probe succeeds,
    /// stores it and indexes its task types.
    ///
    /// Re-registering under the same name replaces the previous entry. A
    /// task type already served by another agent moves to this one.
    pub async fn register_agent(&self, info: AgentInfo) -> Result<()> {
        let connector = self.factory.connect(&info).map_err(|e| {
            warn!("Failed to register agent {}: {}", info.name, e);
            e
        })?;

        if let Err(e) = connector.ping().await {
            warn!("Agent {} at {} failed its liveness probe: {}", info.name, info.address, e);
            return Err(e);
        }

        let name = info.name.clone();
        let mut state = self.state.write();
        state.task_index.retain(|_, owner| owner != &name);

        for task in &info.supported_tasks {
            if let Some(previous) = state.task_index.insert(task.id.clone(), name.clone()) {
                warn!(
                    "Task type '{}' moved from agent {} to agent {}",
                    task.id, previous, name
                );
            }
        }

        info!(
            "Registered agent {} v{} at {} using protocol {} ({} task types)",
            name,
            info.version,
            info.address,
            info.protocol,
            info.supported_tasks.len()
        );

        state.agents.insert(
            name,
            AgentHandle {
                info,
                registered_at: Utc::now(),
                connector,
            },
        );
        Ok(())
    }

    /// Removes an agent and every task type index entry pointing at it.
    /// Returns false when no agent had that name.
    pub fn unregister_agent(&self, name: &str) -> bool {
        let mut state = self.state.write();
        let removed = state.agents.remove(name).is_some();
        state.task_index.retain(|_, owner| owner != name);

        if removed {
            info!("Unregistered agent {}", name);
        } else {
            debug!("Ignoring unregister of unknown agent {}", name);
        }
        removed
    }

    /// Finds the agent currently serving `task_type`.
    pub fn get_agent_for_task_type(&self, task_type: &str) -> Option<AgentHandle> {
        let state = self.state.read();
        state
            .task_index
            .get(task_type)
            .and_then(|name| state.agents.get(name))
            .cloned()
    }

    pub fn get_agent(&self, name: &str) -> Option<AgentInfo> {
        self.state.read().agents.get(name).map(|handle| handle.info.clone())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.state.read().agents.contains_key(name)
    }

    /// All registered agents, sorted by name.
    pub fn list_agents(&self) -> Vec<AgentInfo> {
        let mut agents: Vec<AgentInfo> = self
            .state
            .read()
            .agents
            .values()
            .map(|handle| handle.info.clone())
            .collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        agents
    }

    /// Task definitions of every indexed task type, sorted by id.
    pub fn list_task_definitions(&self) -> Vec<TaskDefinition> {
        let state = self.state.read();
        let mut definitions: Vec<TaskDefinition> = state
            .task_index
            .keys()
            .filter_map(|task_type| Self::lookup_definition(&state, task_type))
            .collect();
        definitions.sort_by(|a, b| a.id.cmp(&b.id));
        definitions
    }

    pub fn get_task_definition(&self, task_type: &str) -> Option<TaskDefinition> {
        Self::lookup_definition(&self.state.read(), task_type)
    }

    fn lookup_definition(state: &RegistryState, task_type: &str) -> Option<TaskDefinition> {
        let owner = state.task_index.get(task_type)?;
        state
            .agents
            .get(owner)?
            .info
            .supported_tasks
            .iter()
            .find(|task| task.id == task_type)
            .cloned()
    }

    /// Sends a start-task call to `agent` and returns the remote task id.
    pub async fn dispatch(
        &self,
        agent: &AgentHandle,
        task_type: &str,
        input: &HashMap<String, Value>,
    ) -> Result<String> {
        let task_id = agent
            .connector
            .start_task(task_type, input)
            .await
            .map_err(|e| match e {
                EngineError::Dispatch(_) | EngineError::ConnectorUnavailable(_) => e,
                other => EngineError::Dispatch(other.to_string()),
            })?;

        info!(
            "Dispatched task '{}' to agent {} as remote task {}",
            task_type, agent.info.name, task_id
        );
        Ok(task_id)
    }

    pub fn len(&self) -> usize {
        self.state.read().agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Connector that records started tasks and hands out sequential ids.
    #[derive(Default)]
    pub struct RecordingConnector {
        pub alive: bool,
        pub started: Mutex<Vec<(String, HashMap<String, Value>)>>,
        next_id: AtomicUsize,
    }

    impl RecordingConnector {
        pub fn alive() -> Self {
            Self {
                alive: true,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl AgentConnector for RecordingConnector {
        async fn ping(&self) -> Result<()> {
            if self.alive {
                Ok(())
            } else {
                Err(EngineError::ConnectorUnavailable("agent is down".to_string()))
            }
        }

        async fn start_task(&self, task_type: &str, input: &HashMap<String, Value>) -> Result<String> {
            self.started.lock().push((task_type.to_string(), input.clone()));
            let n = self.next_id.fetch_add(1, Ordering::SeqCst);
            Ok(format!("remote-{}", n))
        }
    }

    /// Factory handing out one shared connector per agent name.
    #[derive(Default)]
    pub struct StaticFactory {
        pub connectors: Mutex<HashMap<String, Arc<RecordingConnector>>>,
    }

    impl StaticFactory {
        pub fn with(name: &str, connector: RecordingConnector) -> Self {
            let factory = Self::default();
            factory.connectors.lock().insert(name.to_string(), Arc::new(connector));
            factory
        }
    }

    impl ConnectorFactory for StaticFactory {
        fn connect(&self, info: &AgentInfo) -> Result<Arc<dyn AgentConnector>> {
            let connector: Arc<dyn AgentConnector> = self
                .connectors
                .lock()
                .entry(info.name.clone())
                .or_insert_with(|| Arc::new(RecordingConnector::alive()))
                .clone();
            Ok(connector)
        }
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = AgentRegistry::new(Arc::new(StaticFactory::default()));
        let info = AgentInfo::new("billing", "localhost:9000")
            .with_task("payments.charge")
            .with_task("payments.refund");

        registry.register_agent(info).await.unwrap();

        assert!(registry.is_registered("billing"));
        assert_eq!(
            registry.get_agent_for_task_type("payments.refund").unwrap().info.name,
            "billing"
        );
        assert!(registry.get_agent_for_task_type("mail.send").is_none());
        assert_eq!(registry.list_task_definitions().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_probe_registers_nothing() {
        let factory = StaticFactory::with("flaky", RecordingConnector::default());
        let registry = AgentRegistry::new(Arc::new(factory));

        let err = registry
            .register_agent(AgentInfo::new("flaky", "localhost:1").with_task("x"))
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::ConnectorUnavailable(_)));
        assert!(registry.is_empty());
        assert!(registry.get_agent_for_task_type("x").is_none());
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let registry = AgentRegistry::new(Arc::new(StaticFactory::default()));
        registry
            .register_agent(AgentInfo::new("first", "a:1").with_task("shared").with_task("only.first"))
            .await
            .unwrap();
        registry
            .register_agent(AgentInfo::new("second", "b:1").with_task("shared"))
            .await
            .unwrap();

        assert_eq!(registry.get_agent_for_task_type("shared").unwrap().info.name, "second");
        assert_eq!(registry.get_agent_for_task_type("only.first").unwrap().info.name, "first");
    }

    #[tokio::test]
    async fn test_reregistration_replaces_task_types() {
        let registry = AgentRegistry::new(Arc::new(StaticFactory::default()));
        registry
            .register_agent(AgentInfo::new("svc", "a:1").with_task("old"))
            .await
            .unwrap();
        registry
            .register_agent(AgentInfo::new("svc", "a:1").with_task("new"))
            .await
            .unwrap();

        assert!(registry.get_agent_for_task_type("old").is_none());
        assert!(registry.get_agent_for_task_type("new").is_some());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_unregister_removes_index() {
        let registry = AgentRegistry::new(Arc::new(StaticFactory::default()));
        registry
            .register_agent(AgentInfo::new("svc", "a:1").with_task("t"))
            .await
            .unwrap();

        assert!(registry.unregister_agent("svc"));
        assert!(!registry.unregister_agent("svc"));
        assert!(registry.get_agent_for_task_type("t").is_none());
        assert!(registry.get_task_definition("t").is_none());
    }

    #[tokio::test]
    async fn test_dispatch_uses_connector() {
        let connector = RecordingConnector::alive();
        let factory = Arc::new(StaticFactory::with("svc", connector));
        let registry = AgentRegistry::new(factory.clone());
        registry
            .register_agent(AgentInfo::new("svc", "a:1").with_task("t"))
            .await
            .unwrap();

        let agent = registry.get_agent_for_task_type("t").unwrap();
        let mut input = HashMap::new();
        input.insert("k".to_string(), Value::from(1));
        let task_id = registry.dispatch(&agent, "t", &input).await.unwrap();

        assert_eq!(task_id, "remote-0");
        let recorded = factory.connectors.lock()["svc"].started.lock().clone();
        assert_eq!(recorded, vec![("t".to_string(), input)]);
    }
}
