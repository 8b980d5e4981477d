//! Pending request table.
//!
//! Each `request()` registers one entry keyed by request id. The entry is
//! removed by exactly one terminal event: a response, a rejection, the
//! caller's timeout, shutdown, or the caller dropping its future. Whoever
//! removes the entry owns the outcome.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::oneshot;

use super::error::BusError;
use super::message::MessageType;

type Completion = oneshot::Sender<Result<Value, BusError>>;

/// A caller suspended in `request()`
#[derive(Debug)]
pub struct PendingRequest {
    pub request_id: String,
    pub request_type: MessageType,
    pub created_at: DateTime<Utc>,
    completion: Completion,
}

#[derive(Debug, Default)]
pub struct PendingRequests {
    entries: Mutex<HashMap<String, PendingRequest>>,
}

impl PendingRequests {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.entries.lock()
    }

    /// Register a request and return the receiving half of its completion
    pub fn register(
        &self,
        request_id: &str,
        request_type: MessageType,
    ) -> oneshot::Receiver<Result<Value, BusError>> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(
            request_id.to_string(),
            PendingRequest {
                request_id: request_id.to_string(),
                request_type,
                created_at: Utc::now(),
                completion: tx,
            },
        );
        rx
    }

    /// Resolve or reject a pending request. Returns false if none matched.
    pub fn complete(&self, request_id: &str, outcome: Result<Value, String>) -> bool {
        let Some(pending) = self.remove(request_id) else {
            return false;
        };

        let outcome = outcome.map_err(|reason| BusError::Rejected {
            request_id: pending.request_id.clone(),
            reason,
        });
        // The receiver may already be gone if the caller was cancelled
        let _ = pending.completion.send(outcome);
        true
    }

    pub fn remove(&self, request_id: &str) -> Option<PendingRequest> {
        self.lock().remove(request_id)
    }

    /// Fail every pending request with [`BusError::Shutdown`]
    pub fn reject_all(&self) -> usize {
        let drained: Vec<PendingRequest> = self.lock().drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for pending in drained {
            let _ = pending.completion.send(Err(BusError::Shutdown));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.lock().contains_key(request_id)
    }
}

/// Removes a pending entry when the awaiting future is dropped early
pub(crate) struct PendingGuard<'a> {
    table: &'a PendingRequests,
    request_id: &'a str,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(table: &'a PendingRequests, request_id: &'a str) -> Self {
        Self { table, request_id }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(self.request_id);
    }
}
