//! Bounded record of delivered messages.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;

use super::message::{Message, MessageType, Priority};

/// Query for [`EventBus::get_history`](super::EventBus::get_history)
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub kind: Option<MessageType>,
    pub priority: Option<Priority>,
    /// Only messages created at or after this instant
    pub since: Option<DateTime<Utc>>,
    /// Keep only the most recent `limit` matches
    pub limit: Option<usize>,
}

impl HistoryFilter {
    pub fn kind(kind: impl Into<MessageType>) -> Self {
        Self {
            kind: Some(kind.into()),
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, message: &Message) -> bool {
        self.kind.as_ref().map_or(true, |k| &message.kind == k)
            && self.priority.map_or(true, |p| message.priority == p)
            && self.since.map_or(true, |t| message.timestamp >= t)
    }
}

#[derive(Debug)]
pub(crate) struct MessageHistory {
    capacity: usize,
    messages: VecDeque<Message>,
}

impl MessageHistory {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            messages: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    pub(crate) fn record(&mut self, message: Message) {
        if self.capacity == 0 {
            return;
        }
        while self.messages.len() >= self.capacity {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }

    /// Matching messages, oldest first
    pub(crate) fn query(&self, filter: &HistoryFilter) -> Vec<Message> {
        let mut matches: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect();

        if let Some(limit) = filter.limit {
            let skip = matches.len().saturating_sub(limit);
            matches.drain(..skip);
        }
        matches
    }

    pub(crate) fn len(&self) -> usize {
        self.messages.len()
    }
}
