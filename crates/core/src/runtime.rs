//! # Runtime
//!
//! Application wiring: one store, one bus and one agent registry sharing
//! them. Callers hold a [`Hive`] and pass it (or its parts) to their agents.

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::bus::{BusError, EventBus};
use crate::config::HiveConfig;
use crate::machine::{
    agent_lifecycle_table, AgentState, MachineError, MachineRegistry, MachineTemplate,
    StateMachine,
};
use crate::store::Store;

pub struct Hive {
    config: HiveConfig,
    store: Store,
    bus: EventBus,
    agents: MachineRegistry<AgentState>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Hive {
    /// Open the store, build the bus (replaying unprocessed messages) and
    /// prepare the agent registry. Does not start any background task.
    pub fn open(config: HiveConfig) -> Result<Self, BusError> {
        let store = Store::open(&config.store);
        let bus = EventBus::new(config.bus.clone(), Some(store.clone()))?;

        let template = MachineTemplate::new(AgentState::Idle, agent_lifecycle_table())
            .with_config(config.machines.clone())
            .with_store(store.clone())
            .with_bus(bus.clone());

        tracing::info!(
            backend = store.backend_name(),
            durable = store.is_durable(),
            "Hive runtime opened"
        );

        Ok(Self {
            agents: MachineRegistry::new(template),
            config,
            store,
            bus,
            sweeper: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &HiveConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn agents(&self) -> &MachineRegistry<AgentState> {
        &self.agents
    }

    /// Lifecycle machine for `name`, created on first use
    pub fn agent(&self, name: &str) -> Result<StateMachine<AgentState>, MachineError> {
        self.agents.get_or_create(name)
    }

    /// Start the drain loop and, if configured, the expiry sweeper.
    /// Must be called inside a Tokio runtime.
    pub fn start(&self) {
        self.bus.start();

        let mut sweeper = self.sweeper.lock();
        if sweeper.is_none() {
            if let Some(interval) = self.config.store.sweep_interval() {
                *sweeper = Some(self.store.spawn_sweeper(interval));
            }
        }
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        self.bus.shutdown();
        self.agents.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{HistoryFilter, MessageType};
    use crate::machine::TransitionOptions;
    use std::time::Duration;

    #[tokio::test]
    async fn test_agents_announce_on_shared_bus() {
        let hive = Hive::open(HiveConfig::in_memory()).unwrap();
        hive.start();

        let agent = hive.agent("architect").unwrap();
        assert!(agent
            .transition(AgentState::Initializing, TransitionOptions::reason("boot"))
            .is_success());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let changes = hive
            .bus()
            .get_history(&HistoryFilter::kind(MessageType::StateChanged));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].payload["to"], serde_json::json!("initializing"));

        hive.shutdown();
        assert!(hive.bus().is_shut_down());
        assert!(hive.agents().is_empty());
    }

    #[test]
    fn test_agent_state_outlives_registry_entry() {
        let hive = Hive::open(HiveConfig::in_memory()).unwrap();
        hive.agent("critic")
            .unwrap()
            .transition(AgentState::Initializing, TransitionOptions::default());

        hive.agents().remove("critic");
        assert_eq!(
            hive.agent("critic").unwrap().get_state(),
            AgentState::Initializing
        );
    }
}
