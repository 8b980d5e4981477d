//! Transition tables, guards and actions.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use crate::error::HandlerResult;

/// Machine context: a JSON object merged shallowly on every transition
pub type Context = Map<String, Value>;

/// Predicate gating a transition
pub type Guard = Arc<dyn Fn(&Context) -> HandlerResult<bool> + Send + Sync>;

/// Side effect run after a transition is applied
pub type Action = Arc<dyn Fn(&mut Context) -> HandlerResult + Send + Sync>;

/// A state type usable by [`StateMachine`](super::StateMachine)
pub trait MachineState:
    Clone + Eq + Hash + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// The state entered by `error()`
    fn error_state() -> Self;
}

impl MachineState for String {
    fn error_state() -> Self {
        "error".to_string()
    }
}

/// Guard and action attached to one edge
#[derive(Clone, Default)]
pub struct TransitionRule {
    guard: Option<Guard>,
    action: Option<Action>,
}

impl TransitionRule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guard<F>(mut self, guard: F) -> Self
    where
        F: Fn(&Context) -> HandlerResult<bool> + Send + Sync + 'static,
    {
        self.guard = Some(Arc::new(guard));
        self
    }

    pub fn action<F>(mut self, action: F) -> Self
    where
        F: Fn(&mut Context) -> HandlerResult + Send + Sync + 'static,
    {
        self.action = Some(Arc::new(action));
        self
    }

    pub fn has_guard(&self) -> bool {
        self.guard.is_some()
    }

    pub(crate) fn guard_fn(&self) -> Option<&Guard> {
        self.guard.as_ref()
    }

    pub(crate) fn action_fn(&self) -> Option<&Action> {
        self.action.as_ref()
    }
}

impl fmt::Debug for TransitionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitionRule")
            .field("guard", &self.guard.is_some())
            .field("action", &self.action.is_some())
            .finish()
    }
}

/// Allowed edges of a machine: `from -> [(to, rule)]`, targets kept in
/// insertion order.
#[derive(Clone)]
pub struct TransitionTable<S: MachineState> {
    edges: HashMap<S, Vec<(S, TransitionRule)>>,
}

impl<S: MachineState> Default for TransitionTable<S> {
    fn default() -> Self {
        Self {
            edges: HashMap::new(),
        }
    }
}

impl<S: MachineState> TransitionTable<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow-list shorthand: edges with no guard and no action
    pub fn allow(mut self, from: S, targets: impl IntoIterator<Item = S>) -> Self {
        for to in targets {
            self.insert(from.clone(), to, TransitionRule::default());
        }
        self
    }

    /// Add one edge with its rule. Replaces an existing `from -> to` edge.
    pub fn rule(mut self, from: S, to: S, rule: TransitionRule) -> Self {
        self.insert(from, to, rule);
        self
    }

    fn insert(&mut self, from: S, to: S, rule: TransitionRule) {
        let targets = self.edges.entry(from).or_default();
        match targets.iter_mut().find(|(t, _)| *t == to) {
            Some(slot) => slot.1 = rule,
            None => targets.push((to, rule)),
        }
    }

    pub fn get(&self, from: &S, to: &S) -> Option<&TransitionRule> {
        self.edges
            .get(from)?
            .iter()
            .find(|(t, _)| t == to)
            .map(|(_, rule)| rule)
    }

    pub fn contains(&self, from: &S, to: &S) -> bool {
        self.get(from, to).is_some()
    }

    /// Targets reachable from `from`, in insertion order
    pub fn targets(&self, from: &S) -> Vec<S> {
        self.edges
            .get(from)
            .map(|targets| targets.iter().map(|(t, _)| t.clone()).collect())
            .unwrap_or_default()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(Vec::len).sum()
    }
}

impl<S: MachineState> fmt::Debug for TransitionTable<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.edges.iter().map(|(from, targets)| {
                (from, targets.iter().map(|(t, _)| t).collect::<Vec<_>>())
            }))
            .finish()
    }
}
