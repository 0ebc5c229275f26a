//! PairChat - two-party direct messaging core
//!
//! Canonical conversation addressing, an append-only message store and live
//! sync sessions that push the ordered history of a conversation to every
//! open consumer.

pub mod addressing;
pub mod config;
pub mod directory;
pub mod error;
pub mod message_store;
pub mod messenger_types;
pub mod storage;
pub mod sync_session;
pub mod utils;

pub use addressing::{conversation_id, ConversationId};
pub use config::Config;
pub use directory::{DirectoryEntry, DirectoryIndex, DirectorySource, UserDirectory};
pub use error::{ChatError, Result};
pub use message_store::{Clock, MessageStore, SystemClock};
pub use messenger_types::{Message, UserRef};
pub use storage::{MemoryStorage, SledStorage, Storage};
pub use sync_session::SyncSession;
