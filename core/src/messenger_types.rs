//! Shared types for the messenger layer
use crate::addressing::{conversation_id, ConversationId};
use crate::error::Result;
use chrono::{DateTime, Local, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a participant, as handed to us by the identity provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserRef {
    pub id: String,
    pub display_name: String,
}

impl UserRef {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

/// One appended chat entry. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// 1-based position inside the conversation (append order)
    pub seq: u64,
    pub sender_id: String,
    pub receiver_id: String,
    pub body: String,
    /// Unix milliseconds, assigned by the store
    pub timestamp: i64,
}

impl Message {
    /// True when `user_id` wrote this message (drawn on the right-hand side).
    pub fn is_from(&self, user_id: &str) -> bool {
        self.sender_id == user_id
    }

    /// The other party, seen from `user_id`.
    pub fn peer_of(&self, user_id: &str) -> &str {
        if self.sender_id == user_id {
            &self.receiver_id
        } else {
            &self.sender_id
        }
    }

    pub fn conversation_id(&self) -> Result<ConversationId> {
        conversation_id(&self.sender_id, &self.receiver_id)
    }

    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }

    /// 12-hour clock label in the local timezone, e.g. "09:41 PM"
    pub fn time_label(&self) -> String {
        self.time_label_in(&Local)
    }

    pub fn time_label_in<Tz>(&self, tz: &Tz) -> String
    where
        Tz: TimeZone,
        Tz::Offset: std::fmt::Display,
    {
        self.sent_at()
            .map(|t| t.with_timezone(tz).format("%I:%M %p").to_string())
            .unwrap_or_default()
    }
}
