//! # Message Bus
//!
//! Prioritised publish/subscribe between agents, with request/response
//! correlation, broadcast channels and crash-recoverable delivery.
//!
//! ## Priorities
//!
//! | Level | Drain behaviour |
//! |-------|-----------------|
//! | `CRITICAL` | Drained on publish, or by the drain already running, then fully every tick |
//! | `HIGH` | Fully every tick |
//! | `NORMAL` / `LOW` / `DEFERRED` | One message per level per tick |
//!
//! ## Usage
//!
//! ```rust,ignore
//! use hive_core::bus::{EventBus, PublishOptions, RequestOptions};
//!
//! let bus = EventBus::in_memory(Default::default());
//! bus.subscribe("PING", "ponger", |m| Ok(Some(m.payload.clone())));
//! bus.start();
//!
//! let echo = bus.request("PING", "hello", RequestOptions::default()).await?;
//! ```

pub mod error;
pub mod event_bus;
pub mod history;
pub mod message;
pub mod queue;
pub mod registry;
pub mod request;

pub use error::BusError;
pub use event_bus::{
    BusStats, EventBus, PublishOptions, RequestOptions, Subscription, PENDING_NAMESPACE,
};
pub use history::HistoryFilter;
pub use message::{Message, MessageType, PersistedMessageRecord, Priority};
pub use registry::SubscriptionTarget;
