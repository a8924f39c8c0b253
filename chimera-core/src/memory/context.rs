//! Context window assembly
//!
//! Builds the prompt context from a user's turns with a sliding window: the
//! newest turns are kept, the oldest are dropped until the flattened text fits
//! the character budget. A turn is either kept whole or dropped.

use serde::{Deserialize, Serialize};

use super::turn::{Turn, UserId};

/// Truncated, read-only view of a user's recent conversation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextWindow {
    /// Owner of the conversation
    pub user_id: UserId,
    /// Kept turns, oldest first
    pub turns: Vec<Turn>,
    /// Turn contents joined by the configured separator
    pub text: String,
    /// Number of turns dropped to fit the budget
    pub dropped: usize,
}

impl ContextWindow {
    /// Length of `text` in characters
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }

    /// Whether any turn had to be dropped
    pub fn is_truncated(&self) -> bool {
        self.dropped > 0
    }

    /// Whether the window holds no turns
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

/// Sliding-window context builder
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    max_chars: usize,
    separator: String,
}

impl ContextBuilder {
    /// Create a builder with a character budget and turn separator
    pub fn new(max_chars: usize, separator: impl Into<String>) -> Self {
        Self {
            max_chars,
            separator: separator.into(),
        }
    }

    /// Character budget
    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    /// Build the window from turns in conversation order
    pub fn build(&self, user_id: UserId, turns: Vec<Turn>) -> ContextWindow {
        let separator_len = self.separator.chars().count();

        // Walk newest to oldest, keeping turns while the budget allows
        let mut used = 0usize;
        let mut kept = 0usize;
        for turn in turns.iter().rev() {
            let cost = turn.char_len() + if kept > 0 { separator_len } else { 0 };
            if used + cost > self.max_chars {
                break;
            }
            used += cost;
            kept += 1;
        }

        let dropped = turns.len() - kept;
        let kept_turns: Vec<Turn> = turns.into_iter().skip(dropped).collect();
        let text = kept_turns
            .iter()
            .map(|t| t.content.as_str())
            .collect::<Vec<_>>()
            .join(&self.separator);

        ContextWindow {
            user_id,
            turns: kept_turns,
            text,
            dropped,
        }
    }
}
