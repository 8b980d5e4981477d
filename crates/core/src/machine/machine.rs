//! # State Machine
//!
//! Generic transition engine with guarded edges, lifecycle hooks, a bounded
//! history and optional write-through persistence.
//!
//! ## Transition flow
//!
//! ```text
//! DENIED?  (in ERROR, not forced)
//!    ↓
//! edge in table?  ── no ──→ INVALID_TRANSITION
//!    ↓
//! guard (skipped when forced) ── false/err ──→ GUARD_FAILED
//!    ↓
//! exit hooks → apply state + merge context → action → history
//!    ↓
//! enter hooks → transition hooks → persist → STATE_CHANGED
//! ```
//!
//! A machine is a cheap-to-clone handle. All mutation is serialised by a
//! re-entrant lock, so a hook may drive the same machine from inside a
//! transition on the same thread. Callbacks never run while the machine's
//! interior is borrowed.

use chrono::{DateTime, Utc};
use parking_lot::{ReentrantMutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use super::error::MachineError;
use super::table::{Action, Context, MachineState, TransitionTable};
use crate::bus::{EventBus, MessageType, PublishOptions};
use crate::config::MachineConfig;
use crate::error::{isolate, HandlerResult};
use crate::store::{SetOptions, Store};

/// Store namespace holding machine snapshots, keyed by machine name
pub const MACHINE_NAMESPACE: &str = "state_machines";

/// Outcome class of a transition attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransitionResult {
    Success,
    /// Ordinary transition attempted while in the error state
    Denied,
    GuardFailed,
    InvalidTransition,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionOutcome<S> {
    pub result: TransitionResult,
    pub from: S,
    pub to: S,
}

impl<S> TransitionOutcome<S> {
    pub fn is_success(&self) -> bool {
        self.result == TransitionResult::Success
    }
}

/// Options for [`StateMachine::transition`]
#[derive(Debug, Clone, Default)]
pub struct TransitionOptions {
    /// Shallow-merged into the machine context on success
    pub context: Option<Context>,
    pub reason: Option<String>,
    /// Skip the guard. The edge must still exist.
    pub force: bool,
}

impl TransitionOptions {
    pub fn reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = Some(context);
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

/// Options for [`StateMachine::reset`]
#[derive(Debug, Clone, Default)]
pub struct ResetOptions {
    /// Replacement context; the context is cleared when `None`
    pub context: Option<Context>,
    pub keep_history: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastError {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionRecord<S> {
    pub from: S,
    pub to: S,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub forced: bool,
    pub timestamp: DateTime<Utc>,
}

/// Passed to enter, exit and transition hooks
#[derive(Debug, Clone)]
pub struct TransitionEvent<S> {
    pub machine: String,
    pub from: S,
    pub to: S,
    pub reason: Option<String>,
    pub context: Context,
}

pub type Hook<S> = Arc<dyn Fn(&TransitionEvent<S>) -> HandlerResult + Send + Sync>;

/// Serialisable snapshot returned by [`StateMachine::get_info`]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineInfo<S> {
    pub name: String,
    pub current_state: S,
    pub previous_state: Option<S>,
    pub context: Context,
    pub transition_count: u64,
    pub error_count: u64,
    pub last_error: Option<LastError>,
    pub history_len: usize,
    pub valid_transitions: Vec<S>,
    pub persistent: bool,
}

/// Durable layout under [`MACHINE_NAMESPACE`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineSnapshot<S> {
    pub current_state: S,
    #[serde(default)]
    pub context: Context,
    #[serde(default)]
    pub last_error: Option<LastError>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HookKind {
    Enter,
    Exit,
    Transition,
}

struct Hooks<S> {
    enter: HashMap<S, Vec<(u64, Hook<S>)>>,
    exit: HashMap<S, Vec<(u64, Hook<S>)>>,
    any: Vec<(u64, Hook<S>)>,
}

impl<S: MachineState> Hooks<S> {
    fn new() -> Self {
        Self {
            enter: HashMap::new(),
            exit: HashMap::new(),
            any: Vec::new(),
        }
    }

    fn remove(&mut self, kind: HookKind, id: u64) -> bool {
        let before = self.count();
        match kind {
            HookKind::Enter => self.enter.values_mut().for_each(|v| v.retain(|(i, _)| *i != id)),
            HookKind::Exit => self.exit.values_mut().for_each(|v| v.retain(|(i, _)| *i != id)),
            HookKind::Transition => self.any.retain(|(i, _)| *i != id),
        }
        self.count() < before
    }

    fn count(&self) -> usize {
        self.enter.values().map(Vec::len).sum::<usize>()
            + self.exit.values().map(Vec::len).sum::<usize>()
            + self.any.len()
    }

    fn collect(&self, kind: HookKind, state: &S) -> Vec<Hook<S>> {
        let list = match kind {
            HookKind::Enter => self.enter.get(state),
            HookKind::Exit => self.exit.get(state),
            HookKind::Transition => Some(&self.any),
        };
        list.into_iter()
            .flatten()
            .map(|(_, hook)| Arc::clone(hook))
            .collect()
    }
}

struct Core<S> {
    current: S,
    previous: Option<S>,
    context: Context,
    history: VecDeque<TransitionRecord<S>>,
    transition_count: u64,
    last_error: Option<LastError>,
    error_count: u64,
}

struct Shared<S: MachineState> {
    name: String,
    initial: S,
    table: Arc<TransitionTable<S>>,
    max_history: usize,
    store: Option<Store>,
    bus: Option<EventBus>,
    core: ReentrantMutex<RefCell<Core<S>>>,
    hooks: RwLock<Hooks<S>>,
    next_hook: AtomicU64,
}

/// Handle returned by hook registration
pub struct HookHandle<S: MachineState> {
    shared: Weak<Shared<S>>,
    kind: HookKind,
    id: u64,
}

impl<S: MachineState> HookHandle<S> {
    /// Remove exactly this hook. Returns false if already removed.
    pub fn unsubscribe(&self) -> bool {
        match self.shared.upgrade() {
            Some(shared) => shared.hooks.write().remove(self.kind, self.id),
            None => false,
        }
    }
}

impl<S: MachineState> fmt::Debug for HookHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookHandle")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .finish()
    }
}

/// Builder for [`StateMachine`]
pub struct MachineBuilder<S: MachineState> {
    name: String,
    initial: S,
    table: Arc<TransitionTable<S>>,
    context: Context,
    max_history: usize,
    store: Option<Store>,
    bus: Option<EventBus>,
}

impl<S: MachineState> MachineBuilder<S> {
    pub fn context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    pub fn max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history;
        self
    }

    /// Persist after every change and restore the last snapshot on build
    pub fn with_store(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    /// Publish `STATE_CHANGED` after every successful transition
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Apply registry defaults
    pub fn config(mut self, config: &MachineConfig, store: Option<&Store>) -> Self {
        self.max_history = config.max_history;
        if config.persist {
            self.store = store.cloned();
        }
        self
    }

    pub fn build(self) -> Result<StateMachine<S>, MachineError> {
        let mut core = self.fresh_core();

        if let Some(store) = &self.store {
            if let Some(raw) = store.get_value(MACHINE_NAMESPACE, &self.name)? {
                match serde_json::from_value::<MachineSnapshot<S>>(raw) {
                    Ok(snapshot) => {
                        tracing::debug!(machine = %self.name, state = ?snapshot.current_state, "Restored machine state");
                        core.current = snapshot.current_state;
                        core.context = snapshot.context;
                        core.last_error = snapshot.last_error;
                    }
                    Err(e) => {
                        tracing::warn!(machine = %self.name, "Ignoring unreadable machine snapshot: {}", e)
                    }
                }
            }
        }

        Ok(self.assemble(core))
    }

    fn fresh_core(&self) -> Core<S> {
        Core {
            current: self.initial.clone(),
            previous: None,
            context: self.context.clone(),
            history: VecDeque::new(),
            transition_count: 0,
            last_error: None,
            error_count: 0,
        }
    }

    fn assemble(self, core: Core<S>) -> StateMachine<S> {
        StateMachine {
            shared: Arc::new(Shared {
                name: self.name,
                initial: self.initial,
                table: self.table,
                max_history: self.max_history,
                store: self.store,
                bus: self.bus,
                core: ReentrantMutex::new(RefCell::new(core)),
                hooks: RwLock::new(Hooks::new()),
                next_hook: AtomicU64::new(1),
            }),
        }
    }
}

/// A named finite-state machine. Cloning yields another handle to the same
/// instance.
pub struct StateMachine<S: MachineState> {
    shared: Arc<Shared<S>>,
}

impl<S: MachineState> Clone for StateMachine<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: MachineState> fmt::Debug for StateMachine<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("name", &self.shared.name)
            .field("state", &self.get_state())
            .finish()
    }
}

impl<S: MachineState> StateMachine<S> {
    pub fn builder(
        name: impl Into<String>,
        initial: S,
        table: impl Into<Arc<TransitionTable<S>>>,
    ) -> MachineBuilder<S> {
        MachineBuilder {
            name: name.into(),
            initial,
            table: table.into(),
            context: Context::new(),
            max_history: MachineConfig::default().max_history,
            store: None,
            bus: None,
        }
    }

    /// Volatile machine with default settings
    pub fn new(
        name: impl Into<String>,
        initial: S,
        table: impl Into<Arc<TransitionTable<S>>>,
    ) -> Self {
        let builder = Self::builder(name, initial, table);
        let core = builder.fresh_core();
        builder.assemble(core)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Attempt `current -> target`
    pub fn transition(&self, target: S, options: TransitionOptions) -> TransitionOutcome<S> {
        let shared = &*self.shared;
        let guard = shared.core.lock();
        let (from, context) = {
            let core = guard.borrow();
            (core.current.clone(), core.context.clone())
        };

        let outcome = |result| TransitionOutcome {
            result,
            from: from.clone(),
            to: target.clone(),
        };

        if from == S::error_state() && !options.force {
            tracing::debug!(machine = %shared.name, to = ?target, "Transition denied while in error state");
            return outcome(TransitionResult::Denied);
        }

        let Some(rule) = shared.table.get(&from, &target) else {
            tracing::debug!(machine = %shared.name, from = ?from, to = ?target, "Invalid transition");
            return outcome(TransitionResult::InvalidTransition);
        };

        if !options.force {
            if let Some(check) = rule.guard_fn() {
                match isolate(|| check(&context)) {
                    Ok(true) => {}
                    Ok(false) => return outcome(TransitionResult::GuardFailed),
                    Err(e) => {
                        tracing::warn!(machine = %shared.name, from = ?from, to = ?target, "Guard failed: {}", e);
                        return outcome(TransitionResult::GuardFailed);
                    }
                }
            }
        }

        self.apply(
            from.clone(),
            target.clone(),
            options.context,
            rule.action_fn(),
            options.reason,
            options.force,
        );
        drop(guard);
        outcome(TransitionResult::Success)
    }

    /// Whether `transition(state)` would currently succeed without force
    pub fn can_transition_to(&self, state: &S) -> bool {
        let guard = self.shared.core.lock();
        let (from, context) = {
            let core = guard.borrow();
            (core.current.clone(), core.context.clone())
        };
        if from == S::error_state() {
            return false;
        }
        match self.shared.table.get(&from, state) {
            Some(rule) => match rule.guard_fn() {
                Some(check) => matches!(isolate(|| check(&context)), Ok(true)),
                None => true,
            },
            None => false,
        }
    }

    /// Table targets from the current state, ignoring guards
    pub fn get_valid_transitions(&self) -> Vec<S> {
        self.shared.table.targets(&self.get_state())
    }

    /// Enter the error state unconditionally, recording `message`
    pub fn error(&self, message: impl Into<String>) -> TransitionOutcome<S> {
        let message = message.into();
        let guard = self.shared.core.lock();
        let from = guard.borrow().current.clone();
        let to = S::error_state();

        {
            let mut core = guard.borrow_mut();
            core.last_error = Some(LastError {
                message: message.clone(),
                timestamp: Utc::now(),
            });
            core.error_count += 1;
        }
        tracing::warn!(machine = %self.shared.name, from = ?from, "Machine entered error state: {}", message);

        self.apply(from.clone(), to.clone(), None, None, Some(message), true);
        drop(guard);
        TransitionOutcome {
            result: TransitionResult::Success,
            from,
            to,
        }
    }

    /// Leave the error state for `target`, bypassing the table. `None` when
    /// the machine is not in its error state.
    pub fn recover(&self, target: S) -> Option<TransitionOutcome<S>> {
        let guard = self.shared.core.lock();
        let from = guard.borrow().current.clone();
        if from != S::error_state() {
            return None;
        }

        tracing::info!(machine = %self.shared.name, to = ?target, "Machine recovering");
        self.apply(
            from.clone(),
            target.clone(),
            None,
            None,
            Some("recover".to_string()),
            true,
        );
        drop(guard);
        Some(TransitionOutcome {
            result: TransitionResult::Success,
            from,
            to: target,
        })
    }

    /// Return to the initial state. `error_count` is kept.
    pub fn reset(&self, options: ResetOptions) {
        let guard = self.shared.core.lock();
        {
            let mut core = guard.borrow_mut();
            core.current = self.shared.initial.clone();
            core.previous = None;
            core.context = options.context.unwrap_or_default();
            core.last_error = None;
            if !options.keep_history {
                core.history.clear();
                core.transition_count = 0;
            }
        }
        tracing::debug!(machine = %self.shared.name, "Machine reset");
        self.persist_logged();
        drop(guard);
    }

    pub fn on_enter<F>(&self, state: S, hook: F) -> HookHandle<S>
    where
        F: Fn(&TransitionEvent<S>) -> HandlerResult + Send + Sync + 'static,
    {
        let id = self.next_hook_id();
        self.shared
            .hooks
            .write()
            .enter
            .entry(state)
            .or_default()
            .push((id, Arc::new(hook)));
        self.hook_handle(HookKind::Enter, id)
    }

    pub fn on_exit<F>(&self, state: S, hook: F) -> HookHandle<S>
    where
        F: Fn(&TransitionEvent<S>) -> HandlerResult + Send + Sync + 'static,
    {
        let id = self.next_hook_id();
        self.shared
            .hooks
            .write()
            .exit
            .entry(state)
            .or_default()
            .push((id, Arc::new(hook)));
        self.hook_handle(HookKind::Exit, id)
    }

    pub fn on_transition<F>(&self, hook: F) -> HookHandle<S>
    where
        F: Fn(&TransitionEvent<S>) -> HandlerResult + Send + Sync + 'static,
    {
        let id = self.next_hook_id();
        self.shared.hooks.write().any.push((id, Arc::new(hook)));
        self.hook_handle(HookKind::Transition, id)
    }

    pub fn get_state(&self) -> S {
        self.shared.core.lock().borrow().current.clone()
    }

    pub fn is_in_state(&self, state: &S) -> bool {
        self.shared.core.lock().borrow().current == *state
    }

    pub fn previous_state(&self) -> Option<S> {
        self.shared.core.lock().borrow().previous.clone()
    }

    pub fn get_context(&self) -> Context {
        self.shared.core.lock().borrow().context.clone()
    }

    /// Shallow-merge `patch` into the context outside of any transition
    pub fn update_context(&self, patch: Context) {
        let guard = self.shared.core.lock();
        guard.borrow_mut().context.extend(patch);
        self.persist_logged();
        drop(guard);
    }

    /// Transition records, oldest first
    pub fn get_history(&self) -> Vec<TransitionRecord<S>> {
        self.shared
            .core
            .lock()
            .borrow()
            .history
            .iter()
            .cloned()
            .collect()
    }

    pub fn last_error(&self) -> Option<LastError> {
        self.shared.core.lock().borrow().last_error.clone()
    }

    pub fn get_info(&self) -> MachineInfo<S> {
        let guard = self.shared.core.lock();
        let core = guard.borrow();
        MachineInfo {
            name: self.shared.name.clone(),
            current_state: core.current.clone(),
            previous_state: core.previous.clone(),
            context: core.context.clone(),
            transition_count: core.transition_count,
            error_count: core.error_count,
            last_error: core.last_error.clone(),
            history_len: core.history.len(),
            valid_transitions: self.shared.table.targets(&core.current),
            persistent: self.shared.store.is_some(),
        }
    }

    /// Write the current snapshot to the store. No-op for volatile machines.
    pub fn persist(&self) -> Result<(), MachineError> {
        let Some(store) = &self.shared.store else {
            return Ok(());
        };
        let snapshot = {
            let guard = self.shared.core.lock();
            let core = guard.borrow();
            MachineSnapshot {
                current_state: core.current.clone(),
                context: core.context.clone(),
                last_error: core.last_error.clone(),
                timestamp: Utc::now(),
            }
        };
        store.set(
            MACHINE_NAMESPACE,
            &self.shared.name,
            &snapshot,
            SetOptions::default(),
        )?;
        Ok(())
    }

    /// Shared tail of every state change. Caller holds the core lock.
    fn apply(
        &self,
        from: S,
        to: S,
        patch: Option<Context>,
        action: Option<&Action>,
        reason: Option<String>,
        forced: bool,
    ) {
        let shared = &*self.shared;
        let changed = from != to;

        if changed {
            let event = self.event(&from, &to, &reason);
            self.run_hooks(HookKind::Exit, &from, &event);
        }

        let mut context = {
            let guard = shared.core.lock();
            let mut core = guard.borrow_mut();
            core.previous = Some(from.clone());
            core.current = to.clone();
            if let Some(patch) = patch {
                core.context.extend(patch);
            }
            core.context.clone()
        };

        if let Some(action) = action {
            if let Err(e) = isolate(|| action(&mut context)) {
                tracing::warn!(machine = %shared.name, from = ?from, to = ?to, "Transition action failed: {}", e);
            }
        }

        {
            let guard = shared.core.lock();
            let mut core = guard.borrow_mut();
            core.context = context;
            core.transition_count += 1;
            if shared.max_history > 0 {
                while core.history.len() >= shared.max_history {
                    core.history.pop_front();
                }
                core.history.push_back(TransitionRecord {
                    from: from.clone(),
                    to: to.clone(),
                    reason: reason.clone(),
                    forced,
                    timestamp: Utc::now(),
                });
            }
        }

        tracing::debug!(machine = %shared.name, from = ?from, to = ?to, "Transition applied");

        let event = self.event(&from, &to, &reason);
        if changed {
            self.run_hooks(HookKind::Enter, &to, &event);
        }
        self.run_hooks(HookKind::Transition, &to, &event);

        self.persist_logged();
        self.announce(&from, &to, &reason);
    }

    fn event(&self, from: &S, to: &S, reason: &Option<String>) -> TransitionEvent<S> {
        TransitionEvent {
            machine: self.shared.name.clone(),
            from: from.clone(),
            to: to.clone(),
            reason: reason.clone(),
            context: self.shared.core.lock().borrow().context.clone(),
        }
    }

    fn run_hooks(&self, kind: HookKind, state: &S, event: &TransitionEvent<S>) {
        let hooks = self.shared.hooks.read().collect(kind, state);
        for hook in hooks {
            if let Err(e) = isolate(|| hook(event)) {
                tracing::warn!(machine = %self.shared.name, hook = ?kind, "Hook failed: {}", e);
            }
        }
    }

    fn persist_logged(&self) {
        if let Err(e) = self.persist() {
            tracing::error!(machine = %self.shared.name, "Failed to persist machine state: {}", e);
        }
    }

    fn announce(&self, from: &S, to: &S, reason: &Option<String>) {
        let Some(bus) = &self.shared.bus else {
            return;
        };
        let payload = json!({
            "machine": self.shared.name,
            "from": from,
            "to": to,
            "reason": reason,
        });
        if let Err(e) = bus.publish(MessageType::StateChanged, payload, PublishOptions::default()) {
            tracing::warn!(machine = %self.shared.name, "Failed to publish state change: {}", e);
        }
    }

    fn next_hook_id(&self) -> u64 {
        self.shared.next_hook.fetch_add(1, Ordering::Relaxed)
    }

    fn hook_handle(&self, kind: HookKind, id: u64) -> HookHandle<S> {
        HookHandle {
            shared: Arc::downgrade(&self.shared),
            kind,
            id,
        }
    }
}

/// Build a context from a JSON object literal; other values yield an empty context
pub fn context(value: Value) -> Context {
    match value {
        Value::Object(map) => map,
        _ => Context::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{HistoryFilter, Priority};
    use crate::config::BusConfig;
    use crate::machine::table::TransitionRule;
    use std::sync::{mpsc, Mutex};
    use std::thread;
    use std::time::Duration;

    fn s(name: &str) -> String {
        name.to_string()
    }

    fn guarded_table() -> TransitionTable<String> {
        TransitionTable::new().rule(
            s("a"),
            s("b"),
            TransitionRule::new().guard(|ctx| Ok(ctx.get("allowed") == Some(&json!(true)))),
        )
    }

    #[test]
    fn test_guard_controls_transition() {
        let machine = StateMachine::builder("guarded", s("a"), guarded_table())
            .context(context(json!({ "allowed": false })))
            .build()
            .unwrap();

        let outcome = machine.transition(s("b"), TransitionOptions::default());
        assert_eq!(outcome.result, TransitionResult::GuardFailed);
        assert!(machine.is_in_state(&s("a")));
        assert!(!machine.can_transition_to(&s("b")));

        machine.update_context(context(json!({ "allowed": true })));
        let outcome = machine.transition(s("b"), TransitionOptions::default());
        assert_eq!(outcome.result, TransitionResult::Success);
        assert_eq!(outcome.from, s("a"));
        assert_eq!(machine.get_state(), s("b"));
        assert_eq!(machine.previous_state(), Some(s("a")));
    }

    #[test]
    fn test_guard_error_counts_as_failure() {
        let table = TransitionTable::new().rule(
            s("a"),
            s("b"),
            TransitionRule::new().guard(|_| Err("guard blew up".into())),
        );
        let machine = StateMachine::new("faulty", s("a"), table);

        let outcome = machine.transition(s("b"), TransitionOptions::default());
        assert_eq!(outcome.result, TransitionResult::GuardFailed);
        assert!(machine.get_history().is_empty());
    }

    #[test]
    fn test_unknown_edge_is_invalid_even_when_forced() {
        let machine = StateMachine::new("strict", s("a"), guarded_table());

        let outcome = machine.transition(s("z"), TransitionOptions::default());
        assert_eq!(outcome.result, TransitionResult::InvalidTransition);
        let outcome = machine.transition(s("z"), TransitionOptions::default().forced());
        assert_eq!(outcome.result, TransitionResult::InvalidTransition);
        assert!(machine.is_in_state(&s("a")));

        // Force skips the guard on an existing edge
        let outcome = machine.transition(s("b"), TransitionOptions::reason("override").forced());
        assert!(outcome.is_success());
        assert!(machine.get_history()[0].forced);
    }

    #[test]
    fn test_context_merge_and_action() {
        let table = TransitionTable::new().rule(
            s("idle"),
            s("busy"),
            TransitionRule::new().action(|ctx| {
                let runs = ctx.get("runs").and_then(Value::as_u64).unwrap_or(0);
                ctx.insert("runs".into(), json!(runs + 1));
                Ok(())
            }),
        );
        let machine = StateMachine::builder("worker", s("idle"), table)
            .context(context(json!({ "owner": "alice", "runs": 1 })))
            .build()
            .unwrap();

        machine.transition(
            s("busy"),
            TransitionOptions::default().with_context(context(json!({ "task": "t-1" }))),
        );

        let ctx = machine.get_context();
        assert_eq!(ctx["owner"], json!("alice"));
        assert_eq!(ctx["task"], json!("t-1"));
        assert_eq!(ctx["runs"], json!(2));
    }

    #[test]
    fn test_failing_action_still_succeeds() {
        let table = TransitionTable::new().rule(
            s("a"),
            s("b"),
            TransitionRule::new().action(|_| panic!("action exploded")),
        );
        let machine = StateMachine::new("loud", s("a"), table);

        assert!(machine.transition(s("b"), TransitionOptions::default()).is_success());
        assert!(machine.is_in_state(&s("b")));
    }

    #[test]
    fn test_history_is_bounded() {
        let table = TransitionTable::new()
            .allow(s("ping"), [s("pong")])
            .allow(s("pong"), [s("ping")]);
        let machine = StateMachine::builder("ring", s("ping"), table)
            .max_history(4)
            .build()
            .unwrap();

        for n in 0..9 {
            let target = if n % 2 == 0 { s("pong") } else { s("ping") };
            assert!(machine.transition(target, TransitionOptions::default()).is_success());
        }

        assert!(machine.get_history().len() <= 4);
        assert_eq!(machine.get_info().transition_count, 9);
    }

    #[test]
    fn test_hooks_run_in_order_and_are_isolated() {
        let table = TransitionTable::new().allow(s("a"), [s("b")]);
        let machine = StateMachine::new("hooked", s("a"), table);
        let calls = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&calls);
        machine.on_exit(s("a"), move |e| {
            log.lock().unwrap().push(format!("exit {}", e.from));
            Ok(())
        });
        machine.on_enter(s("b"), |_| Err("enter hook failed".into()));
        let log = Arc::clone(&calls);
        machine.on_enter(s("b"), move |e| {
            log.lock().unwrap().push(format!("enter {}", e.to));
            Ok(())
        });
        let log = Arc::clone(&calls);
        let any = machine.on_transition(move |e| {
            log.lock().unwrap().push(format!("{} -> {}", e.from, e.to));
            Ok(())
        });

        assert!(machine.transition(s("b"), TransitionOptions::default()).is_success());
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["exit a", "enter b", "a -> b"]
        );

        assert!(any.unsubscribe());
        assert!(!any.unsubscribe());
    }

    #[test]
    fn test_hook_may_drive_the_machine() {
        let table = TransitionTable::new()
            .allow(s("a"), [s("b")])
            .allow(s("b"), [s("c")]);
        let machine = StateMachine::new("chain", s("a"), table);

        let inner = machine.clone();
        machine.on_enter(s("b"), move |_| {
            inner.transition(s("c"), TransitionOptions::reason("auto-advance"));
            Ok(())
        });

        machine.transition(s("b"), TransitionOptions::default());
        assert_eq!(machine.get_state(), s("c"));
    }

    #[test]
    fn test_error_deny_and_recover() {
        let table = TransitionTable::new()
            .allow(s("idle"), [s("running")])
            .allow(s("error"), [s("idle")]);
        let machine = StateMachine::new("fragile", s("idle"), table);

        assert!(machine.recover(s("idle")).is_none());

        let outcome = machine.error("disk full");
        assert!(outcome.is_success());
        assert_eq!(outcome.to, s("error"));
        assert_eq!(machine.last_error().unwrap().message, "disk full");

        let outcome = machine.transition(s("idle"), TransitionOptions::default());
        assert_eq!(outcome.result, TransitionResult::Denied);
        assert!(machine.is_in_state(&s("error")));

        let recovered = machine.recover(s("running")).unwrap();
        assert!(recovered.is_success());
        assert!(machine.is_in_state(&s("running")));
        assert_eq!(machine.get_info().error_count, 1);
    }

    #[test]
    fn test_reset_clears_error_but_keeps_count() {
        let table = TransitionTable::new().allow(s("a"), [s("b")]);
        let machine = StateMachine::new("resettable", s("a"), table);
        machine.transition(s("b"), TransitionOptions::default());
        machine.error("boom");

        machine.reset(ResetOptions {
            context: Some(context(json!({ "fresh": true }))),
            keep_history: false,
        });

        let info = machine.get_info();
        assert_eq!(info.current_state, s("a"));
        assert!(info.last_error.is_none());
        assert_eq!(info.error_count, 1);
        assert_eq!(info.history_len, 0);
        assert_eq!(info.context["fresh"], json!(true));
        assert_eq!(info.valid_transitions, vec![s("b")]);
    }

    #[test]
    fn test_state_survives_rebuild() {
        let store = Store::memory();
        let table = Arc::new(TransitionTable::new().allow(s("a"), [s("b")]));

        let first = StateMachine::builder("durable", s("a"), Arc::clone(&table))
            .with_store(store.clone())
            .build()
            .unwrap();
        first.transition(
            s("b"),
            TransitionOptions::default().with_context(context(json!({ "step": 3 }))),
        );
        drop(first);

        let raw = store.get_value(MACHINE_NAMESPACE, "durable").unwrap().unwrap();
        assert_eq!(raw["currentState"], json!("b"));

        let second = StateMachine::builder("durable", s("a"), table)
            .with_store(store)
            .build()
            .unwrap();
        assert_eq!(second.get_state(), s("b"));
        assert_eq!(second.get_context()["step"], json!(3));
        assert!(second.get_info().persistent);
    }

    #[test]
    fn test_unreadable_snapshot_is_ignored() {
        let store = Store::memory();
        store
            .set(MACHINE_NAMESPACE, "corrupt", &json!({ "bogus": 1 }), SetOptions::default())
            .unwrap();

        let machine = StateMachine::builder("corrupt", s("a"), TransitionTable::new())
            .with_store(store)
            .build()
            .unwrap();
        assert_eq!(machine.get_state(), s("a"));
    }

    #[test]
    fn test_transitions_are_announced_on_bus() {
        let bus = EventBus::in_memory(BusConfig::default());
        let table = TransitionTable::new().allow(s("a"), [s("b")]);
        let machine = StateMachine::builder("announcer", s("a"), table)
            .with_bus(bus.clone())
            .build()
            .unwrap();

        machine.transition(s("b"), TransitionOptions::reason("ready"));
        bus.drain();

        let changes = bus.get_history(&HistoryFilter::kind(MessageType::StateChanged));
        assert_eq!(changes.len(), 1);
        assert_eq!(
            changes[0].payload,
            json!({ "machine": "announcer", "from": "a", "to": "b", "reason": "ready" })
        );
    }

    #[test]
    fn test_critical_hook_publish_while_another_thread_drains() {
        let bus = EventBus::in_memory(BusConfig::default());
        let table = TransitionTable::new().allow(s("a"), [s("b")]);
        let machine = StateMachine::new("contended", s("a"), table);

        // The drain holds the gate while its handler waits on the machine
        let observed = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&observed);
        let reader = machine.clone();
        bus.subscribe("WORK", "worker", move |_| {
            thread::sleep(Duration::from_millis(150));
            *slot.lock().unwrap() = Some(reader.get_state());
            Ok(None)
        });
        let alerts = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&alerts);
        bus.subscribe("ALERT", "pager", move |_| {
            *counter.lock().unwrap() += 1;
            Ok(None)
        });

        // The transition holds the machine while its hook publishes CRITICAL
        let publisher = bus.clone();
        machine.on_enter(s("b"), move |_| {
            publisher.publish("ALERT", json!(null), PublishOptions::priority(Priority::Critical))?;
            Ok(())
        });

        bus.publish("WORK", json!(null), PublishOptions::default()).unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        let drainer = {
            let bus = bus.clone();
            let done = done_tx.clone();
            thread::spawn(move || {
                bus.drain();
                done.send("drain").unwrap();
            })
        };
        let transitioner = {
            let machine = machine.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                let outcome = machine.transition(s("b"), TransitionOptions::default());
                assert!(outcome.is_success());
                done_tx.send("transition").unwrap();
            })
        };

        for _ in 0..2 {
            done_rx
                .recv_timeout(Duration::from_secs(3))
                .expect("drain and transition both finish");
        }
        drainer.join().unwrap();
        transitioner.join().unwrap();

        assert_eq!(*observed.lock().unwrap(), Some(s("b")));
        assert_eq!(*alerts.lock().unwrap(), 1);
        assert_eq!(bus.queued(), 0);
    }
}
