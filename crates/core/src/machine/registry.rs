//! Named machine registry.
//!
//! Repeated lookups by name return the same instance. Removing a name and
//! creating it again yields a fresh instance that restores from the store,
//! if one is configured.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use super::error::MachineError;
use super::machine::StateMachine;
use super::table::{Context, MachineState, TransitionTable};
use crate::bus::EventBus;
use crate::config::MachineConfig;
use crate::store::Store;

/// How the registry builds machines it has not seen yet
#[derive(Clone)]
pub struct MachineTemplate<S: MachineState> {
    pub initial: S,
    pub table: Arc<TransitionTable<S>>,
    pub context: Context,
    pub config: MachineConfig,
    pub store: Option<Store>,
    pub bus: Option<EventBus>,
}

impl<S: MachineState> MachineTemplate<S> {
    pub fn new(initial: S, table: impl Into<Arc<TransitionTable<S>>>) -> Self {
        Self {
            initial,
            table: table.into(),
            context: Context::new(),
            config: MachineConfig::default(),
            store: None,
            bus: None,
        }
    }

    pub fn with_config(mut self, config: MachineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_store(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    fn build(&self, name: &str) -> Result<StateMachine<S>, MachineError> {
        let mut builder = StateMachine::builder(name, self.initial.clone(), Arc::clone(&self.table))
            .context(self.context.clone())
            .config(&self.config, self.store.as_ref());
        if let Some(bus) = &self.bus {
            builder = builder.with_bus(bus.clone());
        }
        builder.build()
    }
}

pub struct MachineRegistry<S: MachineState> {
    template: MachineTemplate<S>,
    machines: Mutex<HashMap<String, StateMachine<S>>>,
}

impl<S: MachineState> MachineRegistry<S> {
    pub fn new(template: MachineTemplate<S>) -> Self {
        Self {
            template,
            machines: Mutex::new(HashMap::new()),
        }
    }

    /// Existing instance for `name`, or a new one built from the template
    pub fn get_or_create(&self, name: &str) -> Result<StateMachine<S>, MachineError> {
        let mut machines = self.machines.lock();
        if let Some(machine) = machines.get(name) {
            return Ok(machine.clone());
        }

        let machine = self.template.build(name)?;
        tracing::debug!(machine = name, state = ?machine.get_state(), "Machine registered");
        machines.insert(name.to_string(), machine.clone());
        Ok(machine)
    }

    pub fn get(&self, name: &str) -> Option<StateMachine<S>> {
        self.machines.lock().get(name).cloned()
    }

    /// Forget `name`. Existing handles keep working; the persisted snapshot
    /// is left in place.
    pub fn remove(&self, name: &str) -> Option<StateMachine<S>> {
        self.machines.lock().remove(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.machines.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.machines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.machines.lock().clear();
    }
}
