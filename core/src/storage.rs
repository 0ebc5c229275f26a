//! Durable storage behind the message store
//!
//! One sled tree per conversation (`conv/<conversation id>`), keyed by the
//! big-endian message seq so a plain tree scan yields append order.
use crate::addressing::ConversationId;
use crate::error::{ChatError, Result};
use crate::messenger_types::Message;
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use tracing::{debug, info, warn};

const TREE_PREFIX: &str = "conv/";

/// Append-only record storage keyed by conversation.
///
/// Implementations only persist and read; seq/timestamp assignment and
/// locking live in [`crate::message_store::MessageStore`].
pub trait Storage: Send + Sync {
    /// Persist `message` at `message.seq`. Must fail if that slot is taken.
    fn append(&self, conversation: &ConversationId, message: &Message) -> Result<()>;

    /// All records of a conversation in seq order.
    fn load(&self, conversation: &ConversationId) -> Result<Vec<Message>>;

    /// Record with the highest seq, if any.
    fn last(&self, conversation: &ConversationId) -> Result<Option<Message>>;
}

fn unavailable(what: &str, e: impl std::fmt::Display) -> ChatError {
    ChatError::StoreUnavailable(format!("{}: {}", what, e))
}

/// Storage backed by a sled database on disk
#[derive(Clone)]
pub struct SledStorage {
    db: sled::Db,
    flush_on_append: bool,
}

impl SledStorage {
    /// Open (or create) `messages.db` inside `data_dir`
    pub fn open(data_dir: &Path, flush_on_append: bool) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("messages.db");
        debug!("Opening message storage at {:?}", db_path);

        let db = sled::open(&db_path).map_err(|e| unavailable("Failed to open messages DB", e))?;

        info!("Message storage initialized at {:?}", db_path);
        Ok(Self { db, flush_on_append })
    }

    /// Throwaway database, removed when the last handle drops
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| unavailable("Failed to open temporary DB", e))?;
        Ok(Self {
            db,
            flush_on_append: false,
        })
    }

    fn tree(&self, conversation: &ConversationId) -> Result<sled::Tree> {
        self.db
            .open_tree(format!("{}{}", TREE_PREFIX, conversation))
            .map_err(|e| unavailable("Failed to open conversation tree", e))
    }
}

impl Storage for SledStorage {
    fn append(&self, conversation: &ConversationId, message: &Message) -> Result<()> {
        let tree = self.tree(conversation)?;
        let value = serde_json::to_vec(message)?;

        let key = message.seq.to_be_bytes();

        tree.compare_and_swap(key, None::<&[u8]>, Some(value))
            .map_err(|e| unavailable("Failed to save message", e))?
            .map_err(|_| {
                ChatError::StoreUnavailable(format!(
                    "seq {} already taken in {}",
                    message.seq, conversation
                ))
            })?;

        if self.flush_on_append {
            if let Err(e) = tree.flush() {
                // Not durable, so not appended: take the record back out
                if let Err(undo) = tree.remove(key) {
                    warn!("Could not roll back seq {} in {}: {}", message.seq, conversation, undo);
                }
                return Err(unavailable("Failed to flush messages DB", e));
            }
        }
        Ok(())
    }

    fn load(&self, conversation: &ConversationId) -> Result<Vec<Message>> {
        let tree = self.tree(conversation)?;
        let mut messages = Vec::with_capacity(tree.len());
        for entry in tree.iter() {
            let (_, value) = entry.map_err(|e| unavailable("Failed to read messages", e))?;
            messages.push(serde_json::from_slice::<Message>(&value)?);
        }
        Ok(messages)
    }

    fn last(&self, conversation: &ConversationId) -> Result<Option<Message>> {
        let tree = self.tree(conversation)?;
        match tree
            .last()
            .map_err(|e| unavailable("Failed to read last message", e))?
        {
            Some((_, value)) => Ok(Some(serde_json::from_slice::<Message>(&value)?)),
            None => Ok(None),
        }
    }
}

/// Process-local storage, nothing survives a restart
#[derive(Default)]
pub struct MemoryStorage {
    conversations: RwLock<HashMap<ConversationId, Vec<Message>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn append(&self, conversation: &ConversationId, message: &Message) -> Result<()> {
        let mut conversations = self
            .conversations
            .write()
            .map_err(|e| unavailable("Memory storage poisoned", e))?;
        let log = conversations.entry(conversation.clone()).or_default();
        if message.seq != log.len() as u64 + 1 {
            return Err(ChatError::StoreUnavailable(format!(
                "seq {} out of order in {} (next is {})",
                message.seq,
                conversation,
                log.len() + 1
            )));
        }
        log.push(message.clone());
        Ok(())
    }

    fn load(&self, conversation: &ConversationId) -> Result<Vec<Message>> {
        let conversations = self
            .conversations
            .read()
            .map_err(|e| unavailable("Memory storage poisoned", e))?;
        Ok(conversations.get(conversation).cloned().unwrap_or_default())
    }

    fn last(&self, conversation: &ConversationId) -> Result<Option<Message>> {
        let conversations = self
            .conversations
            .read()
            .map_err(|e| unavailable("Memory storage poisoned", e))?;
        Ok(conversations
            .get(conversation)
            .and_then(|log| log.last().cloned()))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Memory storage with switchable failures
    #[derive(Default)]
    pub(crate) struct FlakyStorage {
        inner: MemoryStorage,
        writes_down: AtomicBool,
        reads_down: AtomicBool,
        /// Next append keeps the record but still reports failure
        fail_after_write: AtomicBool,
    }

    impl FlakyStorage {
        pub(crate) fn set_writes_down(&self, down: bool) {
            self.writes_down.store(down, Ordering::SeqCst);
        }

        pub(crate) fn set_reads_down(&self, down: bool) {
            self.reads_down.store(down, Ordering::SeqCst);
        }

        pub(crate) fn fail_next_after_write(&self) {
            self.fail_after_write.store(true, Ordering::SeqCst);
        }
    }

    impl Storage for FlakyStorage {
        fn append(&self, conversation: &ConversationId, message: &Message) -> Result<()> {
            if self.writes_down.load(Ordering::SeqCst) {
                return Err(ChatError::StoreUnavailable("disk on fire".to_string()));
            }
            self.inner.append(conversation, message)?;
            if self.fail_after_write.swap(false, Ordering::SeqCst) {
                return Err(ChatError::StoreUnavailable("flush failed".to_string()));
            }
            Ok(())
        }

        fn load(&self, conversation: &ConversationId) -> Result<Vec<Message>> {
            if self.reads_down.load(Ordering::SeqCst) {
                return Err(ChatError::StoreUnavailable("read timed out".to_string()));
            }
            self.inner.load(conversation)
        }

        fn last(&self, conversation: &ConversationId) -> Result<Option<Message>> {
            if self.reads_down.load(Ordering::SeqCst) {
                return Err(ChatError::StoreUnavailable("read timed out".to_string()));
            }
            self.inner.last(conversation)
        }
    }
}
