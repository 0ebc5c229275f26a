//! Conversation addressing: two user ids -> one canonical conversation key
//!
//! The key is the lexicographically ordered pair joined with `-`, which is
//! the layout already used by stored conversations. Ids that contain the
//! separator are rejected so that the split stays unambiguous.
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Joins the two participant ids of a conversation key.
pub const SEPARATOR: char = '-';

/// Canonical, order-independent key of a two-party conversation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Validate a stored key and wrap it.
    pub fn parse(raw: &str) -> Result<Self> {
        let (a, b) = raw.split_once(SEPARATOR).ok_or_else(|| {
            ChatError::InvalidParticipants(format!("conversation key without separator: {}", raw))
        })?;
        let id = conversation_id(a, b)?;
        if id.0 != raw {
            return Err(ChatError::InvalidParticipants(format!(
                "conversation key is not canonical: {}",
                raw
            )));
        }
        Ok(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The two participant ids, lower one first.
    pub fn participants(&self) -> (&str, &str) {
        // Construction guarantees exactly one separator.
        self.0.split_once(SEPARATOR).unwrap_or((self.0.as_str(), ""))
    }

    /// Whether `user_id` is one of the two participants.
    pub fn involves(&self, user_id: &str) -> bool {
        let (a, b) = self.participants();
        a == user_id || b == user_id
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ConversationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn check_identity(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(ChatError::InvalidParticipants("empty user id".to_string()));
    }
    if id.contains(SEPARATOR) {
        return Err(ChatError::UnsafeIdentifier(format!(
            "user id {:?} contains '{}'",
            id, SEPARATOR
        )));
    }
    Ok(())
}

/// Derive the conversation key shared by `a` and `b`.
///
/// `conversation_id(a, b) == conversation_id(b, a)`; distinct unordered
/// pairs never share a key.
pub fn conversation_id(a: &str, b: &str) -> Result<ConversationId> {
    check_identity(a)?;
    check_identity(b)?;
    if a == b {
        return Err(ChatError::InvalidParticipants(format!(
            "a conversation needs two different users, got {:?} twice",
            a
        )));
    }

    let (low, high) = if a < b { (a, b) } else { (b, a) };
    Ok(ConversationId(format!("{}{}{}", low, SEPARATOR, high)))
}
