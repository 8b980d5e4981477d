//! # State Machines
//!
//! Finite-state machines with guarded transitions, hooks and optional
//! durability, plus a registry that hands out one instance per name.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use hive_core::machine::{agent_lifecycle_table, AgentState, StateMachine, TransitionOptions};
//!
//! let agent = StateMachine::builder("architect", AgentState::Idle, agent_lifecycle_table())
//!     .with_store(store.clone())
//!     .with_bus(bus.clone())
//!     .build()?;
//!
//! agent.transition(AgentState::Initializing, TransitionOptions::reason("boot"));
//! ```

pub mod error;
pub mod lifecycle;
#[allow(clippy::module_inception)]
pub mod machine;
pub mod registry;
pub mod table;

pub use error::MachineError;
pub use lifecycle::{agent_lifecycle_table, AgentState};
pub use machine::{
    context, HookHandle, LastError, MachineBuilder, MachineInfo, MachineSnapshot, ResetOptions,
    StateMachine, TransitionEvent, TransitionOptions, TransitionOutcome, TransitionRecord,
    TransitionResult, MACHINE_NAMESPACE,
};
pub use registry::{MachineRegistry, MachineTemplate};
pub use table::{Context, MachineState, TransitionRule, TransitionTable};
