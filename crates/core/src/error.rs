//! # Errors
//!
//! Shared error plumbing for Hive components.
//!
//! Each component owns a typed error enum (`StoreError`, `BusError`,
//! `MachineError`). All of them implement [`ErrorCode`] so callers can match on
//! a stable machine-readable code and decide whether a retry makes sense.
//!
//! [`HandlerError`] is the failure half of every user-supplied callback:
//! subscriber handlers, broadcast callbacks, guards, actions and hooks.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use thiserror::Error;

/// Machine-readable classification shared by every Hive error type.
pub trait ErrorCode {
    /// Stable code with a component prefix (`STORE_`, `BUS_`, `MACHINE_`).
    fn code(&self) -> &'static str;

    /// Whether retrying the failed operation may succeed.
    fn is_recoverable(&self) -> bool;
}

/// Failure reported by a user callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// The callback returned an error.
    #[error("{0}")]
    Failed(String),

    /// The callback panicked; the panic was contained.
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    /// Convenience constructor for callback authors.
    pub fn new(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::Failed(message.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::Failed(message)
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(format!("{:#}", err))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Failed(err.to_string())
    }
}

impl ErrorCode for HandlerError {
    fn code(&self) -> &'static str {
        match self {
            Self::Failed(_) => "HANDLER_FAILED",
            Self::Panicked(_) => "HANDLER_PANICKED",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Result type returned by user callbacks.
pub type HandlerResult<T = ()> = Result<T, HandlerError>;

/// Run a user callback, converting a panic into [`HandlerError::Panicked`].
pub(crate) fn isolate<T>(f: impl FnOnce() -> HandlerResult<T>) -> HandlerResult<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(HandlerError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
