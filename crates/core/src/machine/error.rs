//! State machine errors.
//!
//! Transition outcomes (`DENIED`, `GUARD_FAILED`, `INVALID_TRANSITION`) are
//! ordinary results, not errors. `MachineError` only covers persistence;
//! snapshot encoding goes through the store and fails as
//! [`StoreError::Serialization`].

use thiserror::Error;

use crate::error::ErrorCode;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("machine persistence failed: {0}")]
    Store(#[from] StoreError),
}

impl ErrorCode for MachineError {
    fn code(&self) -> &'static str {
        match self {
            Self::Store(_) => "MACHINE_STORE",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_recoverable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_failures_keep_their_recoverability() {
        let err = MachineError::from(StoreError::LockPoisoned("poisoned".into()));
        assert_eq!(err.code(), "MACHINE_STORE");
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("poisoned"));
    }
}
