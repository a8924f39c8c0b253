//! Turns: the unit of conversation memory

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{MemoryError, Result};

/// Chat-platform user identity
pub type UserId = i64;

/// Who produced a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Message written by the end user
    User,
    /// Reply produced by the assistant
    Assistant,
}

impl Role {
    /// Lowercase name used in records and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Importance score of a turn
///
/// Scores are plain integers so that threshold comparisons are exact.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Importance(u32);

impl Importance {
    /// Create a score
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Raw score value
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Whether the score reaches `threshold` (inclusive)
    pub fn meets(&self, threshold: u32) -> bool {
        self.0 >= threshold
    }
}

impl fmt::Display for Importance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One recorded message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Stable identity, shared by the STM copy and every durable copy
    pub turn_id: Uuid,
    /// Owner of the conversation
    pub user_id: UserId,
    /// Position in the user's conversation, assigned by the STM ring
    pub sequence: u64,
    /// Author of the message
    pub role: Role,
    /// Caller-supplied conversation mode tag
    pub mode: String,
    /// Message text
    pub content: String,
    /// When the turn was recorded
    pub created_at: DateTime<Utc>,
    /// Importance, `None` until scored
    pub importance: Option<Importance>,
    /// Set once a durable long-term copy exists
    pub promoted: bool,
}

impl Turn {
    /// Create an unscored, unpromoted turn
    pub fn new(
        user_id: UserId,
        role: Role,
        content: impl Into<String>,
        mode: impl Into<String>,
    ) -> Self {
        Self {
            turn_id: Uuid::new_v4(),
            user_id,
            sequence: 0,
            role,
            mode: mode.into(),
            content: content.into(),
            created_at: Utc::now(),
            importance: None,
            promoted: false,
        }
    }

    /// Length of the content in characters
    pub fn char_len(&self) -> usize {
        self.content.chars().count()
    }

    /// Whether the turn has been scored at or above `threshold`
    pub fn is_eligible(&self, threshold: u32) -> bool {
        self.importance.is_some_and(|score| score.meets(threshold))
    }
}

/// Reject content that must never become a turn.
///
/// # Errors
///
/// Returns `MemoryError::Validation` for blank content or content longer than
/// `max_chars` characters.
pub fn validate_content(content: &str, max_chars: usize) -> Result<()> {
    if content.trim().is_empty() {
        return Err(MemoryError::Validation(
            "message content must not be empty".to_string(),
        ));
    }

    let len = content.chars().count();
    if len > max_chars {
        return Err(MemoryError::Validation(format!(
            "message content is {} characters, limit is {}",
            len, max_chars
        )));
    }

    Ok(())
}
