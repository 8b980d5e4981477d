//! Subscription registry: typed subscriptions, wildcard monitors and
//! broadcast channels.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::message::{Message, MessageType};
use crate::error::HandlerResult;

/// Subscriber callback. A handler servicing a request may return
/// `Ok(Some(value))` to answer it.
pub type Handler = Arc<dyn Fn(&Message) -> HandlerResult<Option<Value>> + Send + Sync>;

/// Broadcast listener callback: `(channel, payload)`
pub type BroadcastCallback = Arc<dyn Fn(&str, &Value) -> HandlerResult + Send + Sync>;

/// What a [`Subscription`](super::Subscription) token points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionTarget {
    Type(MessageType),
    All,
    Broadcast(String),
}

struct SubscriberEntry {
    id: u64,
    name: String,
    handler: Handler,
}

struct BroadcastEntry {
    id: u64,
    name: String,
    callback: BroadcastCallback,
}

/// A handler selected for one message
pub(crate) struct Delivery {
    pub subscriber: String,
    pub handler: Handler,
    /// Registered through `subscribe_to_all`
    pub wildcard: bool,
}

#[derive(Default)]
pub(crate) struct Registry {
    typed: HashMap<MessageType, Vec<SubscriberEntry>>,
    wildcard: Vec<SubscriberEntry>,
    broadcast: HashMap<String, Vec<BroadcastEntry>>,
}

impl Registry {
    pub fn add_typed(&mut self, id: u64, kind: MessageType, name: &str, handler: Handler) {
        self.typed.entry(kind).or_default().push(SubscriberEntry {
            id,
            name: name.to_string(),
            handler,
        });
    }

    pub fn add_wildcard(&mut self, id: u64, name: &str, handler: Handler) {
        self.wildcard.push(SubscriberEntry {
            id,
            name: name.to_string(),
            handler,
        });
    }

    pub fn add_broadcast(&mut self, id: u64, channel: &str, name: &str, callback: BroadcastCallback) {
        self.broadcast
            .entry(channel.to_string())
            .or_default()
            .push(BroadcastEntry {
                id,
                name: name.to_string(),
                callback,
            });
    }

    /// Remove exactly one registration
    pub fn remove(&mut self, target: &SubscriptionTarget, id: u64) -> bool {
        match target {
            SubscriptionTarget::Type(kind) => {
                let Some(entries) = self.typed.get_mut(kind) else {
                    return false;
                };
                let removed = remove_where(entries, |e| e.id == id) > 0;
                if entries.is_empty() {
                    self.typed.remove(kind);
                }
                removed
            }
            SubscriptionTarget::All => remove_where(&mut self.wildcard, |e| e.id == id) > 0,
            SubscriptionTarget::Broadcast(channel) => {
                let Some(entries) = self.broadcast.get_mut(channel) else {
                    return false;
                };
                let removed = remove_where(entries, |e| e.id == id) > 0;
                if entries.is_empty() {
                    self.broadcast.remove(channel);
                }
                removed
            }
        }
    }

    /// Remove every registration of `(kind, name)`
    pub fn remove_named(&mut self, kind: &MessageType, name: &str) -> usize {
        let Some(entries) = self.typed.get_mut(kind) else {
            return 0;
        };
        let removed = remove_where(entries, |e| e.name == name);
        if entries.is_empty() {
            self.typed.remove(kind);
        }
        removed
    }

    /// Typed subscribers in registration order, then wildcard monitors
    pub fn deliveries(&self, kind: &MessageType) -> Vec<Delivery> {
        let typed = self.typed.get(kind).into_iter().flatten().map(|e| Delivery {
            subscriber: e.name.clone(),
            handler: Arc::clone(&e.handler),
            wildcard: false,
        });
        let wildcard = self.wildcard.iter().map(|e| Delivery {
            subscriber: e.name.clone(),
            handler: Arc::clone(&e.handler),
            wildcard: true,
        });
        typed.chain(wildcard).collect()
    }

    pub fn broadcast_listeners(&self, channel: &str) -> Vec<(String, BroadcastCallback)> {
        self.broadcast
            .get(channel)
            .into_iter()
            .flatten()
            .map(|e| (e.name.clone(), Arc::clone(&e.callback)))
            .collect()
    }

    pub fn subscriber_count(&self, kind: &MessageType) -> usize {
        self.typed.get(kind).map_or(0, Vec::len)
    }

    pub fn typed_count(&self) -> usize {
        self.typed.values().map(Vec::len).sum()
    }

    pub fn wildcard_count(&self) -> usize {
        self.wildcard.len()
    }

    pub fn broadcast_channel_count(&self) -> usize {
        self.broadcast.len()
    }
}

fn remove_where<T>(entries: &mut Vec<T>, pred: impl Fn(&T) -> bool) -> usize {
    let before = entries.len();
    entries.retain(|e| !pred(e));
    before - entries.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Handler {
        Arc::new(|_| Ok(None))
    }

    #[test]
    fn test_remove_by_id_leaves_siblings() {
        let mut registry = Registry::default();
        let kind = MessageType::TaskAssigned;
        registry.add_typed(1, kind.clone(), "builder", noop());
        registry.add_typed(2, kind.clone(), "builder", noop());
        registry.add_typed(3, kind.clone(), "critic", noop());

        assert!(registry.remove(&SubscriptionTarget::Type(kind.clone()), 1));
        assert!(!registry.remove(&SubscriptionTarget::Type(kind.clone()), 1));
        assert_eq!(registry.subscriber_count(&kind), 2);

        assert_eq!(registry.remove_named(&kind, "builder"), 1);
        let names: Vec<String> = registry.deliveries(&kind).into_iter().map(|d| d.subscriber).collect();
        assert_eq!(names, vec!["critic"]);
    }

    #[test]
    fn test_wildcard_follows_typed() {
        let mut registry = Registry::default();
        registry.add_wildcard(1, "audit", noop());
        registry.add_typed(2, MessageType::TaskFailed, "coordinator", noop());

        let deliveries = registry.deliveries(&MessageType::TaskFailed);
        assert_eq!(deliveries.len(), 2);
        assert!(!deliveries[0].wildcard);
        assert_eq!(deliveries[1].subscriber, "audit");

        assert_eq!(registry.deliveries(&MessageType::AgentStarted).len(), 1);
    }

    #[test]
    fn test_broadcast_channels() {
        let mut registry = Registry::default();
        registry.add_broadcast(1, "system", "ui", Arc::new(|_, _| Ok(())));
        assert_eq!(registry.broadcast_listeners("system").len(), 1);
        assert!(registry.broadcast_listeners("other").is_empty());

        assert!(registry.remove(&SubscriptionTarget::Broadcast("system".into()), 1));
        assert_eq!(registry.broadcast_channel_count(), 0);
    }
}
