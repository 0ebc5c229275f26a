//! Per-conversation fan-out of appended messages to open sync sessions
use crate::addressing::ConversationId;
use crate::messenger_types::Message;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::debug;

pub type SubscriberId = u64;

#[derive(Default)]
struct Registry {
    next_id: SubscriberId,
    subscribers: HashMap<ConversationId, Vec<(SubscriberId, UnboundedSender<Message>)>>,
}

/// Hands each appended message to every subscriber of its conversation.
///
/// Sends never block: every subscriber owns an unbounded queue and drains
/// it on its own task.
#[derive(Clone, Default)]
pub struct EventEmitter {
    registry: Arc<Mutex<Registry>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        // Critical sections never panic, but don't turn poisoning into a crash either
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self, conversation: &ConversationId) -> (SubscriberId, UnboundedReceiver<Message>) {
        let (tx, rx) = unbounded_channel();
        let mut registry = self.registry();
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .subscribers
            .entry(conversation.clone())
            .or_default()
            .push((id, tx));
        debug!("Subscriber {} registered on {}", id, conversation);
        (id, rx)
    }

    /// Returns false if `id` was not (or no longer) registered.
    pub fn unsubscribe(&self, conversation: &ConversationId, id: SubscriberId) -> bool {
        let mut registry = self.registry();
        let Some(list) = registry.subscribers.get_mut(conversation) else {
            return false;
        };
        let before = list.len();
        list.retain(|(sub, _)| *sub != id);
        let removed = list.len() != before;
        if list.is_empty() {
            registry.subscribers.remove(conversation);
        }
        if removed {
            debug!("Subscriber {} removed from {}", id, conversation);
        }
        removed
    }

    /// Queue `message` for every subscriber of `conversation`; returns how many took it.
    pub fn emit(&self, conversation: &ConversationId, message: &Message) -> usize {
        let mut registry = self.registry();
        let Some(list) = registry.subscribers.get_mut(conversation) else {
            return 0;
        };
        // Receivers that went away without unsubscribing get pruned here
        list.retain(|(_, tx)| tx.send(message.clone()).is_ok());
        let delivered = list.len();
        if list.is_empty() {
            registry.subscribers.remove(conversation);
        }
        delivered
    }

    pub fn subscriber_count(&self, conversation: &ConversationId) -> usize {
        self.registry()
            .subscribers
            .get(conversation)
            .map_or(0, Vec::len)
    }
}
