//! Live, ordered view of one conversation for one consumer
//!
//! A session registers with the store before reading the history, so
//! nothing appended in between is lost; anything seen twice is dropped by
//! seq. Each session runs on its own task, calls its consumer on the
//! blocking pool and always hands it the whole ordered sequence.
use crate::addressing::ConversationId;
use crate::error::Result;
use crate::message_store::MessageStore;
use crate::messenger_types::Message;
use crate::utils::event_emitter::SubscriberId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct SyncSession {
    conversation: ConversationId,
    store: MessageStore,
    subscriber: SubscriberId,
    closed: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncSession {
    /// Start watching `conversation`.
    ///
    /// `on_update` receives the current history right away and the full
    /// updated sequence after every successful append, own appends
    /// included. Must be called inside a tokio runtime.
    pub async fn open<F>(
        store: &MessageStore,
        conversation: ConversationId,
        on_update: F,
    ) -> Result<Self>
    where
        F: FnMut(&[Message]) + Send + 'static,
    {
        let (subscriber, rx) = store.subscribe(&conversation);
        let history = match store.load_all(&conversation).await {
            Ok(history) => history,
            Err(e) => {
                store.unsubscribe(&conversation, subscriber);
                return Err(e);
            }
        };

        let closed = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(deliver(
            conversation.clone(),
            history,
            rx,
            on_update,
            closed.clone(),
        ));
        info!("Sync session {} opened on {}", subscriber, conversation);

        Ok(Self {
            conversation,
            store: store.clone(),
            subscriber,
            closed,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Stop the subscription. Once this returns the callback never runs again.
    pub async fn close(&self) {
        let Some(task) = self.shutdown() else {
            return;
        };
        // Unregistering closed the queue; a callback already running finishes first
        if let Err(e) = task.await {
            warn!("Sync session {} ended badly: {}", self.subscriber, e);
        }
        info!("Sync session {} closed on {}", self.subscriber, self.conversation);
    }

    /// Flag and unregister; hands back the task if this call did the closing.
    fn shutdown(&self) -> Option<JoinHandle<()>> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return None;
        }
        self.store.unsubscribe(&self.conversation, self.subscriber);
        self.task.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        if self.shutdown().is_some() {
            debug!("Sync session {} dropped without close", self.subscriber);
        }
    }
}

/// Run the consumer on the blocking pool so a slow one never holds an async worker.
/// Hands the callback and the sequence back, or `None` if the callback panicked.
async fn run_callback<F>(mut on_update: F, messages: Vec<Message>) -> Option<(F, Vec<Message>)>
where
    F: FnMut(&[Message]) + Send + 'static,
{
    let outcome = tokio::task::spawn_blocking(move || {
        on_update(&messages);
        (on_update, messages)
    })
    .await;
    match outcome {
        Ok(handed_back) => Some(handed_back),
        Err(e) => {
            warn!("Sync callback failed: {}", e);
            None
        }
    }
}

async fn deliver<F>(
    conversation: ConversationId,
    mut messages: Vec<Message>,
    mut rx: UnboundedReceiver<Message>,
    mut on_update: F,
    closed: Arc<AtomicBool>,
) where
    F: FnMut(&[Message]) + Send + 'static,
{
    let mut changed = true;
    loop {
        if changed {
            if closed.load(Ordering::SeqCst) {
                break;
            }
            let Some((callback, delivered)) = run_callback(on_update, messages).await else {
                break;
            };
            on_update = callback;
            messages = delivered;
        }

        let Some(message) = rx.recv().await else {
            break;
        };
        changed = push_new(&mut messages, message);
        // Fold whatever queued up meanwhile into one delivery
        while let Ok(message) = rx.try_recv() {
            changed |= push_new(&mut messages, message);
        }
    }
    debug!("Delivery loop for {} finished", conversation);
}

/// Appends `message` unless the initial history already had it.
fn push_new(messages: &mut Vec<Message>, message: Message) -> bool {
    let last_seq = messages.last().map_or(0, |m| m.seq);
    if message.seq <= last_seq {
        return false;
    }
    messages.push(message);
    true
}
