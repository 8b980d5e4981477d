//! Bus layer errors.
//!
//! | Error | Code | Recoverable |
//! |-------|------|-------------|
//! | [`BusError::Timeout`] | `BUS_TIMEOUT` | Yes |
//! | [`BusError::Rejected`] | `BUS_REJECTED` | No |
//! | [`BusError::Shutdown`] | `BUS_SHUTDOWN` | No |
//! | [`BusError::Store`] | `BUS_STORE` | Depends on the store error |
//! | [`BusError::Serialization`] | `BUS_SERIALIZATION` | No |

use std::time::Duration;
use thiserror::Error;

use crate::error::{ErrorCode, HandlerError};
use crate::store::StoreError;

/// Message bus error.
#[derive(Debug, Error)]
pub enum BusError {
    /// No response arrived before the request deadline.
    #[error("request {request_id} timed out after {}ms", .timeout.as_millis())]
    Timeout {
        request_id: String,
        timeout: Duration,
    },

    /// The responder reported an error, or a handler servicing the request failed.
    #[error("request {request_id} rejected: {reason}")]
    Rejected { request_id: String, reason: String },

    /// The bus shut down while the request was pending.
    #[error("event bus is shut down")]
    Shutdown,

    /// Persisting or replaying a message failed.
    #[error("message persistence failed: {0}")]
    Store(#[from] StoreError),

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BusError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<BusError> for HandlerError {
    fn from(err: BusError) -> Self {
        HandlerError::Failed(err.to_string())
    }
}

impl ErrorCode for BusError {
    fn code(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "BUS_TIMEOUT",
            Self::Rejected { .. } => "BUS_REJECTED",
            Self::Shutdown => "BUS_SHUTDOWN",
            Self::Store(_) => "BUS_STORE",
            Self::Serialization(_) => "BUS_SERIALIZATION",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Store(e) => e.is_recoverable(),
            Self::Rejected { .. } | Self::Shutdown | Self::Serialization(_) => false,
        }
    }
}
