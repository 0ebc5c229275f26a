//! Message persistence: append-only chat history per conversation
//!
//! The store assigns every message its seq and timestamp, persists it through
//! a [`Storage`] backend and then hands it to the sync sessions open on the
//! conversation. Appends to one conversation are serialized; different
//! conversations never wait on each other.
use crate::addressing::{conversation_id, ConversationId};
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::messenger_types::{Message, UserRef};
use crate::storage::{MemoryStorage, SledStorage, Storage};
use crate::utils::event_emitter::{EventEmitter, SubscriberId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Source of send timestamps (Unix milliseconds)
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Write cursor of one conversation, lazily seeded from storage
#[derive(Debug)]
struct LogState {
    loaded: bool,
    next_seq: u64,
    last_timestamp: i64,
}

impl Default for LogState {
    fn default() -> Self {
        Self {
            loaded: false,
            next_seq: 1,
            last_timestamp: i64::MIN,
        }
    }
}

type LogMap = HashMap<ConversationId, Arc<Mutex<LogState>>>;

/// Cursors nobody is using get dropped once the map grows past this
const MAX_IDLE_LOGS: usize = 1024;

/// Anything the backend reports is a storage failure from the caller's view
fn store_err(e: ChatError) -> ChatError {
    match e {
        ChatError::StoreUnavailable(_) => e,
        other => ChatError::StoreUnavailable(other.to_string()),
    }
}

/// Drops cursors held only by the map; returns how many went.
/// A dropped cursor is re-read from storage on the next append.
fn prune_idle(logs: &mut LogMap) -> usize {
    let before = logs.len();
    logs.retain(|_, log| Arc::strong_count(log) > 1);
    before - logs.len()
}

#[derive(Clone)]
pub struct MessageStore {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    emitter: EventEmitter,
    logs: Arc<std::sync::Mutex<LogMap>>,
}

impl MessageStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self::with_clock(storage, Arc::new(SystemClock))
    }

    pub fn with_clock(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            clock,
            emitter: EventEmitter::new(),
            logs: Arc::new(std::sync::Mutex::new(HashMap::new())),
        }
    }

    /// Sled-backed store under `config.data_dir`
    pub fn open(config: &Config) -> Result<Self> {
        let storage = SledStorage::open(&config.data_dir, config.flush_on_append)?;
        Ok(Self::new(Arc::new(storage)))
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    fn log(&self, conversation: &ConversationId) -> Arc<Mutex<LogState>> {
        let mut logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        if logs.len() > MAX_IDLE_LOGS {
            prune_idle(&mut logs);
        }
        logs.entry(conversation.clone()).or_default().clone()
    }

    #[cfg(test)]
    pub(crate) fn prune_idle_logs(&self) -> usize {
        let mut logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        prune_idle(&mut logs)
    }

    /// Append a message to `conversation`.
    ///
    /// Rejects blank bodies and sender/receiver pairs that do not address
    /// `conversation`. On success every sync session open on the
    /// conversation is handed the new message; on failure nothing is
    /// stored and nobody is notified.
    pub async fn append(
        &self,
        conversation: &ConversationId,
        sender_id: &str,
        receiver_id: &str,
        body: &str,
    ) -> Result<Message> {
        if body.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let addressed = conversation_id(sender_id, receiver_id)?;
        if &addressed != conversation {
            return Err(ChatError::InvalidParticipants(format!(
                "{} -> {} belongs to {}, not {}",
                sender_id, receiver_id, addressed, conversation
            )));
        }

        let log = self.log(conversation);
        let mut state = log.lock().await;

        if !state.loaded {
            if let Some(last) = self.storage.last(conversation).map_err(store_err)? {
                state.next_seq = last.seq + 1;
                state.last_timestamp = last.timestamp;
            }
            state.loaded = true;
        }

        // Never go backwards: seq order must stay timestamp order
        let timestamp = self.clock.now_millis().max(state.last_timestamp);
        let message = Message {
            seq: state.next_seq,
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            body: body.to_string(),
            timestamp,
        };

        if let Err(e) = self.storage.append(conversation, &message) {
            warn!("Append to {} failed: {}", conversation, e);
            // The backend may have kept part of the write; re-read the cursor next time
            state.loaded = false;
            return Err(store_err(e));
        }
        state.next_seq += 1;
        state.last_timestamp = timestamp;

        // Still under the conversation lock, so subscribers see seq order
        let delivered = self.emitter.emit(conversation, &message);
        debug!(
            "Appended #{} to {} ({} bytes, {} subscribers)",
            message.seq,
            conversation,
            message.body.len(),
            delivered
        );
        Ok(message)
    }

    /// Derive the conversation from the two parties and append.
    pub async fn send(&self, from: &UserRef, to_id: &str, body: &str) -> Result<Message> {
        let conversation = conversation_id(&from.id, to_id)?;
        self.append(&conversation, &from.id, to_id, body).await
    }

    /// Full history in conversation order; empty if nothing was sent yet.
    pub async fn load_all(&self, conversation: &ConversationId) -> Result<Vec<Message>> {
        self.storage.load(conversation).map_err(store_err)
    }

    pub(crate) fn subscribe(
        &self,
        conversation: &ConversationId,
    ) -> (SubscriberId, UnboundedReceiver<Message>) {
        self.emitter.subscribe(conversation)
    }

    pub(crate) fn unsubscribe(&self, conversation: &ConversationId, id: SubscriberId) -> bool {
        self.emitter.unsubscribe(conversation, id)
    }

    /// Number of sync sessions currently registered on `conversation`
    pub fn session_count(&self, conversation: &ConversationId) -> usize {
        self.emitter.subscriber_count(conversation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testing::FlakyStorage;
    use std::collections::VecDeque;

    /// Hands out the queued readings, then repeats the last one
    struct ScriptedClock {
        readings: std::sync::Mutex<VecDeque<i64>>,
        last: std::sync::Mutex<i64>,
    }

    impl ScriptedClock {
        fn new(readings: &[i64]) -> Self {
            Self {
                readings: std::sync::Mutex::new(readings.iter().copied().collect()),
                last: std::sync::Mutex::new(0),
            }
        }
    }

    impl Clock for ScriptedClock {
        fn now_millis(&self) -> i64 {
            let mut last = self.last.lock().unwrap();
            if let Some(next) = self.readings.lock().unwrap().pop_front() {
                *last = next;
            }
            *last
        }
    }

    fn alice_bob() -> ConversationId {
        conversation_id("alice", "bob").unwrap()
    }

    #[tokio::test]
    async fn test_append_order_wins_over_late_timestamp() {
        let clock = Arc::new(ScriptedClock::new(&[100, 100, 90]));
        let store = MessageStore::with_clock(Arc::new(MemoryStorage::new()), clock);
        let conv = alice_bob();

        store.append(&conv, "alice", "bob", "A1").await.unwrap();
        store.append(&conv, "bob", "alice", "A2").await.unwrap();
        let a3 = store.append(&conv, "alice", "bob", "A3").await.unwrap();
        assert_eq!(a3.timestamp, 100);

        let all = store.load_all(&conv).await.unwrap();
        let bodies: Vec<&str> = all.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["A1", "A2", "A3"]);
        let seqs: Vec<u64> = all.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(all.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn test_load_all_empty_and_idempotent() {
        let store = MessageStore::in_memory();
        let conv = alice_bob();
        assert!(store.load_all(&conv).await.unwrap().is_empty());

        store.append(&conv, "alice", "bob", "hi").await.unwrap();
        let first = store.load_all(&conv).await.unwrap();
        let second = store.load_all(&conv).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
    }

    #[tokio::test]
    async fn test_blank_body_rejected() {
        let store = MessageStore::in_memory();
        let conv = alice_bob();
        let (_, mut rx) = store.subscribe(&conv);

        for body in ["", "   ", "\n\t"] {
            let err = store.append(&conv, "alice", "bob", body).await.unwrap_err();
            assert!(matches!(err, ChatError::EmptyMessage));
        }
        assert!(store.load_all(&conv).await.unwrap().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_participants_must_match_conversation() {
        let store = MessageStore::in_memory();
        let conv = alice_bob();

        let err = store.append(&conv, "alice", "carol", "hi").await.unwrap_err();
        assert!(matches!(err, ChatError::InvalidParticipants(_)));
        let err = store.append(&conv, "alice", "alice", "hi").await.unwrap_err();
        assert!(matches!(err, ChatError::InvalidParticipants(_)));
    }

    #[tokio::test]
    async fn test_storage_failure_commits_nothing() {
        let storage = Arc::new(FlakyStorage::default());
        let store = MessageStore::new(storage.clone());
        let conv = alice_bob();
        let (_, mut rx) = store.subscribe(&conv);

        storage.set_writes_down(true);
        let err = store.append(&conv, "alice", "bob", "lost").await.unwrap_err();
        assert!(matches!(err, ChatError::StoreUnavailable(_)));
        assert!(rx.try_recv().is_err());

        storage.set_writes_down(false);
        let msg = store.append(&conv, "alice", "bob", "kept").await.unwrap();
        assert_eq!(msg.seq, 1);
        assert_eq!(rx.try_recv().unwrap(), msg);
    }

    #[tokio::test]
    async fn test_append_recovers_after_write_then_failure() {
        let storage = Arc::new(FlakyStorage::default());
        let store = MessageStore::new(storage.clone());
        let conv = alice_bob();
        let (_, mut rx) = store.subscribe(&conv);

        storage.fail_next_after_write();
        let err = store.append(&conv, "alice", "bob", "first").await.unwrap_err();
        assert!(matches!(err, ChatError::StoreUnavailable(_)));
        assert!(rx.try_recv().is_err());

        // The cursor is re-read, so the conversation is not wedged on seq 1
        for i in 0..3 {
            let msg = store
                .append(&conv, "bob", "alice", &format!("retry {}", i))
                .await
                .unwrap();
            assert_eq!(msg.seq, i + 2);
            assert_eq!(rx.try_recv().unwrap(), msg);
        }
    }

    #[tokio::test]
    async fn test_failed_read_is_reported() {
        let storage = Arc::new(FlakyStorage::default());
        let store = MessageStore::new(storage.clone());
        let conv = alice_bob();
        store.append(&conv, "alice", "bob", "hi").await.unwrap();

        storage.set_reads_down(true);
        let err = store.load_all(&conv).await.unwrap_err();
        assert!(matches!(err, ChatError::StoreUnavailable(_)));

        storage.set_reads_down(false);
        assert_eq!(store.load_all(&conv).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_idle_cursors_are_pruned_and_reloaded() {
        let store = MessageStore::in_memory();
        let ab = alice_bob();
        let ac = conversation_id("alice", "carol").unwrap();

        store.append(&ab, "alice", "bob", "one").await.unwrap();
        store.append(&ac, "alice", "carol", "one").await.unwrap();
        assert_eq!(store.prune_idle_logs(), 2);
        assert_eq!(store.prune_idle_logs(), 0);

        let m = store.append(&ab, "bob", "alice", "two").await.unwrap();
        assert_eq!(m.seq, 2);
    }

    #[tokio::test]
    async fn test_send_derives_conversation() {
        let store = MessageStore::in_memory();
        let bob = UserRef::new("bob", "Bob");
        let msg = store.send(&bob, "alice", "hello").await.unwrap();
        assert_eq!(msg.sender_id, "bob");
        assert_eq!(msg.receiver_id, "alice");
        assert_eq!(store.load_all(&alice_bob()).await.unwrap(), vec![msg]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_get_distinct_positions() {
        let store = MessageStore::in_memory();
        let conv = alice_bob();

        let mut handles = Vec::new();
        for i in 0..40 {
            let store = store.clone();
            let conv = conv.clone();
            handles.push(tokio::spawn(async move {
                let (from, to) = if i % 2 == 0 { ("alice", "bob") } else { ("bob", "alice") };
                store.append(&conv, from, to, &format!("msg {}", i)).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let all = store.load_all(&conv).await.unwrap();
        let seqs: Vec<u64> = all.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, (1..=40).collect::<Vec<_>>());
        assert!(all.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn test_conversations_are_independent() {
        let store = MessageStore::in_memory();
        let ab = alice_bob();
        let ac = conversation_id("alice", "carol").unwrap();

        store.append(&ab, "alice", "bob", "to bob").await.unwrap();
        let m = store.append(&ac, "alice", "carol", "to carol").await.unwrap();
        assert_eq!(m.seq, 1);
        assert_eq!(store.load_all(&ab).await.unwrap().len(), 1);
        assert_eq!(store.load_all(&ac).await.unwrap().len(), 1);
    }
}
