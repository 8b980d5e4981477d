//! Store layer errors.
//!
//! | Error | Code | Recoverable |
//! |-------|------|-------------|
//! | [`StoreError::Sqlite`] | `STORE_SQLITE` | Yes |
//! | [`StoreError::Io`] | `STORE_IO` | Yes |
//! | [`StoreError::Serialization`] | `STORE_SERIALIZATION` | No |
//! | [`StoreError::LockPoisoned`] | `STORE_LOCK_POISONED` | No |

use thiserror::Error;

use crate::error::ErrorCode;

/// Durable store error.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The SQLite engine rejected an operation (busy, locked, corrupt file).
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem error while preparing the database location.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A value could not be encoded, or a stored value could not be decoded
    /// into the requested type.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A thread panicked while holding the backend lock.
    #[error("store lock poisoned: {0}")]
    LockPoisoned(String),
}

impl ErrorCode for StoreError {
    fn code(&self) -> &'static str {
        match self {
            Self::Sqlite(_) => "STORE_SQLITE",
            Self::Io(_) => "STORE_IO",
            Self::Serialization(_) => "STORE_SERIALIZATION",
            Self::LockPoisoned(_) => "STORE_LOCK_POISONED",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(self, Self::Sqlite(_) | Self::Io(_))
    }
}
