//! # Agent Lifecycle
//!
//! The built-in state set for agents and the edges between them.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::table::{MachineState, TransitionTable};

/// Lifecycle stage of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Created, not yet started
    Idle,
    /// Loading configuration and dependencies
    Initializing,
    /// Ready to accept work
    Ready,
    /// Executing a task
    Working,
    /// Blocked on a request or another agent
    Waiting,
    Paused,
    /// Finished its assigned work
    Completed,
    Error,
    /// Stopped for good
    Terminated,
}

impl AgentState {
    pub const ALL: [AgentState; 9] = [
        AgentState::Idle,
        AgentState::Initializing,
        AgentState::Ready,
        AgentState::Working,
        AgentState::Waiting,
        AgentState::Paused,
        AgentState::Completed,
        AgentState::Error,
        AgentState::Terminated,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AgentState::Idle => "idle",
            AgentState::Initializing => "initializing",
            AgentState::Ready => "ready",
            AgentState::Working => "working",
            AgentState::Waiting => "waiting",
            AgentState::Paused => "paused",
            AgentState::Completed => "completed",
            AgentState::Error => "error",
            AgentState::Terminated => "terminated",
        }
    }

    /// Check if the agent can no longer do work
    pub fn is_terminal(self) -> bool {
        self == AgentState::Terminated
    }

    /// Check if the agent is holding a task
    pub fn is_busy(self) -> bool {
        matches!(self, AgentState::Working | AgentState::Waiting)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl MachineState for AgentState {
    fn error_state() -> Self {
        AgentState::Error
    }
}

/// Standard agent lifecycle edges.
///
/// Every non-terminal state may move to `Terminated`. `Error` is entered via
/// `StateMachine::error` and left via `recover`, so it needs no inbound edges.
pub fn agent_lifecycle_table() -> TransitionTable<AgentState> {
    use AgentState::*;

    TransitionTable::new()
        .allow(Idle, [Initializing, Terminated])
        .allow(Initializing, [Ready, Terminated])
        .allow(Ready, [Working, Paused, Terminated])
        .allow(Working, [Waiting, Ready, Completed, Paused, Terminated])
        .allow(Waiting, [Working, Ready, Terminated])
        .allow(Paused, [Ready, Working, Terminated])
        .allow(Completed, [Idle, Ready, Terminated])
        .allow(Error, [Idle, Ready, Terminated])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{StateMachine, TransitionOptions, TransitionResult};

    #[test]
    fn test_agent_happy_path() {
        let agent = StateMachine::new("builder", AgentState::Idle, agent_lifecycle_table());

        for next in [
            AgentState::Initializing,
            AgentState::Ready,
            AgentState::Working,
            AgentState::Waiting,
            AgentState::Working,
            AgentState::Completed,
        ] {
            let outcome = agent.transition(next, TransitionOptions::default());
            assert!(outcome.is_success(), "{:?} -> {:?} failed", outcome.from, next);
        }
        assert!(agent.is_in_state(&AgentState::Completed));
    }

    #[test]
    fn test_terminated_is_final() {
        let agent = StateMachine::new("critic", AgentState::Ready, agent_lifecycle_table());
        assert!(agent
            .transition(AgentState::Terminated, TransitionOptions::default())
            .is_success());
        assert!(agent.get_valid_transitions().is_empty());

        for state in AgentState::ALL {
            let outcome = agent.transition(state, TransitionOptions::default().forced());
            assert_eq!(outcome.result, TransitionResult::InvalidTransition);
        }
        assert!(AgentState::Terminated.is_terminal());
    }

    #[test]
    fn test_error_recovery_cycle() {
        let agent = StateMachine::new("researcher", AgentState::Working, agent_lifecycle_table());
        agent.error("model timeout");
        assert!(agent.is_in_state(&AgentState::Error));
        assert!(!agent.can_transition_to(&AgentState::Ready));

        agent.recover(AgentState::Ready).unwrap();
        assert!(agent.is_in_state(&AgentState::Ready));
        assert!(!AgentState::Ready.is_busy());
    }

    #[test]
    fn test_string_form() {
        assert_eq!(serde_json::to_string(&AgentState::Initializing).unwrap(), "\"initializing\"");
        assert_eq!(AgentState::Waiting.to_string(), "waiting");
    }
}
