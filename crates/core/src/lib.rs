//! # Hive Core
//!
//! The backbone of the Hive agent system: the infrastructure every agent
//! uses to talk, track progress and survive restarts.
//!
//! ## Architecture
//!
//! - `store/` - Namespaced key-value persistence with TTL (SQLite or memory)
//! - `bus/` - Priority message bus with request/response and broadcast
//! - `machine/` - Guarded state machines with hooks and durability
//! - `runtime` - [`Hive`], wiring the three together
//! - `config` - Configuration for all of the above
//!
//! ## Usage
//!
//! ```rust,ignore
//! use hive_core::{Hive, HiveConfig};
//! use hive_core::machine::{AgentState, TransitionOptions};
//!
//! let hive = Hive::open(HiveConfig::load().await)?;
//! hive.start();
//!
//! let agent = hive.agent("architect")?;
//! agent.transition(AgentState::Initializing, TransitionOptions::reason("boot"));
//! ```

pub mod bus;
pub mod config;
pub mod error;
pub mod machine;
pub mod runtime;
pub mod store;

pub use config::HiveConfig;
pub use error::{ErrorCode, HandlerError, HandlerResult};
pub use runtime::Hive;
