//! Typed requests and replies of the memory actor

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::Result;
use crate::memory::context::ContextWindow;
use crate::memory::turn::{Importance, Turn, UserId};

/// Operation requested from the memory actor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MemoryCommand {
    /// Record a message written by the user
    StoreUserMessage {
        /// Conversation owner
        user_id: UserId,
        /// Message text
        content: String,
        /// Conversation mode tag
        mode: String,
    },

    /// Record a reply produced by the assistant
    StoreBotResponse {
        /// Conversation owner
        user_id: UserId,
        /// Reply text
        content: String,
        /// Conversation mode tag
        mode: String,
    },

    /// Build the context window
    GetContext {
        /// Conversation owner
        user_id: UserId,
    },

    /// Copy the short-term turns
    GetTurns {
        /// Conversation owner
        user_id: UserId,
    },
}

impl MemoryCommand {
    /// User whose queue handles the command
    pub fn user_id(&self) -> UserId {
        match self {
            MemoryCommand::StoreUserMessage { user_id, .. }
            | MemoryCommand::StoreBotResponse { user_id, .. }
            | MemoryCommand::GetContext { user_id }
            | MemoryCommand::GetTurns { user_id } => *user_id,
        }
    }

    /// Command name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            MemoryCommand::StoreUserMessage { .. } => "store_user_message",
            MemoryCommand::StoreBotResponse { .. } => "store_bot_response",
            MemoryCommand::GetContext { .. } => "get_context",
            MemoryCommand::GetTurns { .. } => "get_turns",
        }
    }
}

/// Request envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryMessage {
    /// Assigned by the actor on submission, strictly increasing
    pub request_id: u64,
    /// Free-form tag naming the component that sent the request
    pub sender: String,
    /// Requested operation
    pub command: MemoryCommand,
}

impl MemoryMessage {
    /// Create a message; the request id is assigned on submission
    pub fn new(command: MemoryCommand, sender: impl Into<String>) -> Self {
        Self {
            request_id: 0,
            sender: sender.into(),
            command,
        }
    }
}

/// Acknowledgement of a stored turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreAck {
    /// Request that produced the turn
    pub request_id: u64,
    /// Identity of the new turn
    pub turn_id: Uuid,
    /// Position of the turn in the user's conversation
    pub sequence: u64,
    /// Score assigned to the turn
    pub importance: Importance,
    /// Whether a long-term write was started
    pub promotion_scheduled: bool,
    /// Number of turns the append pushed out of short-term memory
    pub evicted: usize,
}

/// Reply to a [`MemoryMessage`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MemoryReply {
    /// Reply to a store command
    Stored(StoreAck),
    /// Reply to `GetContext`
    Context(ContextWindow),
    /// Reply to `GetTurns`
    Turns(Vec<Turn>),
}

impl MemoryReply {
    /// Reply variant name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            MemoryReply::Stored(_) => "stored",
            MemoryReply::Context(_) => "context",
            MemoryReply::Turns(_) => "turns",
        }
    }
}

/// A message paired with the channel its reply goes to
pub(crate) struct Envelope {
    pub message: MemoryMessage,
    pub reply: oneshot::Sender<Result<MemoryReply>>,
}
