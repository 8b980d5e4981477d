//! # Bus Messages
//!
//! Message, priority and type definitions for agent-to-agent communication.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordinal rank controlling queue placement and drain order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Critical = 0,
    High = 1,
    #[default]
    Normal = 2,
    Low = 3,
    Deferred = 4,
}

impl Priority {
    /// All levels in drain order
    pub const ALL: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Deferred,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Whether one tick drains the whole queue at this level
    pub fn drains_fully(self) -> bool {
        matches!(self, Priority::Critical | Priority::High)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "CRITICAL",
            Priority::High => "HIGH",
            Priority::Normal => "NORMAL",
            Priority::Low => "LOW",
            Priority::Deferred => "DEFERRED",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of bus message.
///
/// The well-known kinds cover agent lifecycle, task flow and the bus's own
/// audit traffic. Anything else travels as [`MessageType::Custom`]; custom
/// names should be SCREAMING_SNAKE and must not reuse a well-known name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    AgentStarted,
    AgentStopped,
    TaskAssigned,
    TaskCompleted,
    TaskFailed,
    /// Emitted by state machines after every successful transition
    StateChanged,
    /// Emitted by the bus when a subscriber handler fails
    ErrorOccurred,
    /// Audit mirror of a broadcast
    Broadcast,
    Custom(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::AgentStarted => "AGENT_STARTED",
            Self::AgentStopped => "AGENT_STOPPED",
            Self::TaskAssigned => "TASK_ASSIGNED",
            Self::TaskCompleted => "TASK_COMPLETED",
            Self::TaskFailed => "TASK_FAILED",
            Self::StateChanged => "STATE_CHANGED",
            Self::ErrorOccurred => "ERROR_OCCURRED",
            Self::Broadcast => "BROADCAST",
            Self::Custom(name) => name,
        }
    }

    pub fn custom(name: impl Into<String>) -> Self {
        Self::from(name.into())
    }
}

impl From<String> for MessageType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "AGENT_STARTED" => Self::AgentStarted,
            "AGENT_STOPPED" => Self::AgentStopped,
            "TASK_ASSIGNED" => Self::TaskAssigned,
            "TASK_COMPLETED" => Self::TaskCompleted,
            "TASK_FAILED" => Self::TaskFailed,
            "STATE_CHANGED" => Self::StateChanged,
            "ERROR_OCCURRED" => Self::ErrorOccurred,
            "BROADCAST" => Self::Broadcast,
            _ => Self::Custom(s),
        }
    }
}

impl From<&str> for MessageType {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<MessageType> for String {
    fn from(kind: MessageType) -> Self {
        match kind {
            MessageType::Custom(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message on the bus. Immutable once enqueued.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Unique message ID
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Opaque payload
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub priority: Priority,
    /// Store key of the persisted record, if persisted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistence_key: Option<String>,
    /// Set when the message was sent by `request`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl Message {
    /// Create a new message
    pub fn new(kind: MessageType, payload: serde_json::Value, priority: Priority) -> Self {
        Self {
            id: generate_message_id(),
            kind,
            payload,
            timestamp: Utc::now(),
            priority,
            persistence_key: None,
            request_id: None,
        }
    }

    /// Tag the message as a request awaiting a response
    pub fn with_request(mut self, request_id: &str) -> Self {
        self.request_id = Some(request_id.to_string());
        self
    }

    pub fn is_request(&self) -> bool {
        self.request_id.is_some()
    }
}

/// Durable mirror of an in-flight message (`pending_messages` namespace)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedMessageRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub persisted_at: DateTime<Utc>,
    pub processed: bool,
}

impl PersistedMessageRecord {
    pub fn from_message(message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            kind: message.kind.clone(),
            payload: message.payload.clone(),
            timestamp: message.timestamp,
            priority: message.priority,
            request_id: message.request_id.clone(),
            persisted_at: Utc::now(),
            processed: false,
        }
    }

    /// Rebuild the in-memory message for replay
    pub fn into_message(self) -> Message {
        let key = persistence_key(&self.id);
        Message {
            id: self.id,
            kind: self.kind,
            payload: self.payload,
            timestamp: self.timestamp,
            priority: self.priority,
            persistence_key: Some(key),
            request_id: self.request_id,
        }
    }
}

/// Store key of a persisted message
pub fn persistence_key(message_id: &str) -> String {
    format!("msg_{}", message_id)
}

/// Time-ordered unique ID: epoch millis plus a random suffix
pub fn generate_message_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{:x}-{}", Utc::now().timestamp_millis(), &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_creation() {
        let msg = Message::new(MessageType::TaskAssigned, json!({"task": 1}), Priority::High)
            .with_request("req-1");

        assert_eq!(msg.kind, MessageType::TaskAssigned);
        assert_eq!(msg.request_id.as_deref(), Some("req-1"));
        assert!(msg.is_request());
        assert!(msg.persistence_key.is_none());
    }

    #[test]
    fn test_message_ids_are_unique() {
        let a = generate_message_id();
        let b = generate_message_id();
        assert_ne!(a, b);
        assert!(a.contains('-'));
    }

    #[test]
    fn test_message_type_string_form() {
        assert_eq!(
            serde_json::to_string(&MessageType::ErrorOccurred).unwrap(),
            "\"ERROR_OCCURRED\""
        );
        assert_eq!(MessageType::from("STATE_CHANGED"), MessageType::StateChanged);
        assert_eq!(
            MessageType::custom("CODE_GENERATED"),
            MessageType::Custom("CODE_GENERATED".to_string())
        );
        // A custom spelling of a well-known kind collapses to the known variant
        assert_eq!(MessageType::custom("BROADCAST"), MessageType::Broadcast);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::Low < Priority::Deferred);
        assert_eq!(serde_json::to_string(&Priority::Deferred).unwrap(), "\"DEFERRED\"");
        assert!(Priority::High.drains_fully());
        assert!(!Priority::Normal.drains_fully());
    }

    #[test]
    fn test_persisted_record_replays_as_message() {
        let msg = Message::new(MessageType::custom("SPEC_PARSED"), json!([1, 2]), Priority::Low);
        let record = PersistedMessageRecord::from_message(&msg);
        assert!(!record.processed);

        let encoded = serde_json::to_value(&record).unwrap();
        assert_eq!(encoded["type"], json!("SPEC_PARSED"));
        assert!(encoded.get("persistedAt").is_some());

        let replayed: PersistedMessageRecord = serde_json::from_value(encoded).unwrap();
        let replayed = replayed.into_message();
        assert_eq!(replayed.id, msg.id);
        assert_eq!(replayed.payload, msg.payload);
        assert_eq!(replayed.persistence_key, Some(persistence_key(&msg.id)));
    }
}
