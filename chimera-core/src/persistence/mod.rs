//! Durable storage for promoted and archived turns
//!
//! This module defines the `PersistenceBackend` trait that storage
//! implementations provide, the typed queries they execute, and the
//! `PersistenceGateway` that wraps every call with a deadline and retries.
//!
//! - SurrealDB (embedded memory, RocksDB, or a remote server)
//! - In-process maps (testing and ephemeral deployments)

pub mod gateway;
pub mod inmemory;
pub mod retry;
pub mod surreal;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::config::StorageConfig;
use crate::memory::turn::{Importance, Role, Turn, UserId};

pub use gateway::{GatewayStats, GatewayStatsSnapshot, PersistenceGateway};
pub use inmemory::InMemoryBackend;
pub use retry::{RetryPolicy, RetryState};
pub use surreal::SurrealBackend;

/// Table holding promoted turns
pub const LONG_TERM_TABLE: &str = "ltm_turn";

/// Table holding evicted turns that were never promoted
pub const ARCHIVE_TABLE: &str = "archive_turn";

/// Durable copy of a turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    /// Turn identity (UUID string)
    pub turn_id: String,
    /// Owner of the conversation
    pub user_id: UserId,
    /// Position in the user's conversation
    pub sequence: u64,
    /// Author of the message
    pub role: Role,
    /// Caller-supplied conversation mode tag
    pub mode: String,
    /// Message text
    pub content: String,
    /// When the turn was recorded
    pub created_at: DateTime<Utc>,
    /// Importance at the time of writing
    pub importance: u32,
}

impl From<&Turn> for TurnRecord {
    fn from(turn: &Turn) -> Self {
        Self {
            turn_id: turn.turn_id.to_string(),
            user_id: turn.user_id,
            sequence: turn.sequence,
            role: turn.role,
            mode: turn.mode.clone(),
            content: turn.content.clone(),
            created_at: turn.created_at,
            importance: turn.importance.map(|i| i.value()).unwrap_or(0),
        }
    }
}

impl TurnRecord {
    /// Rebuild a turn from its durable copy. Records read back from the
    /// long-term table are promoted by definition.
    pub fn into_turn(self, promoted: bool) -> Turn {
        Turn {
            turn_id: self.turn_id.parse().unwrap_or_else(|_| uuid::Uuid::nil()),
            user_id: self.user_id,
            sequence: self.sequence,
            role: self.role,
            mode: self.mode,
            content: self.content,
            created_at: self.created_at,
            importance: Some(Importance::new(self.importance)),
            promoted,
        }
    }
}

/// A query the gateway can execute
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// Connectivity check
    Ping,
    /// Write (or overwrite) one promoted turn
    UpsertLongTerm(TurnRecord),
    /// Write a batch of evicted, unpromoted turns
    ArchiveBatch(Vec<TurnRecord>),
    /// Most recent promoted turns of a user, newest first
    RecentLongTerm {
        /// Owner of the conversation
        user_id: UserId,
        /// Maximum number of records
        limit: usize,
    },
    /// Number of promoted turns of a user
    CountLongTerm {
        /// Owner of the conversation
        user_id: UserId,
    },
}

impl Query {
    /// Query kind, used in logs, stats and errors
    pub fn kind(&self) -> &'static str {
        match self {
            Query::Ping => "ping",
            Query::UpsertLongTerm(_) => "upsert_long_term",
            Query::ArchiveBatch(_) => "archive_batch",
            Query::RecentLongTerm { .. } => "recent_long_term",
            Query::CountLongTerm { .. } => "count_long_term",
        }
    }
}

/// Result of an executed query
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    /// Statement without a result
    Unit,
    /// Number of records written
    Written(usize),
    /// Records read
    Rows(Vec<TurnRecord>),
    /// Counted records
    Count(u64),
}

impl QueryOutput {
    /// Records carried by a `Rows` output, empty otherwise
    pub fn into_rows(self) -> Vec<TurnRecord> {
        match self {
            QueryOutput::Rows(rows) => rows,
            _ => Vec::new(),
        }
    }
}

/// Failure reported by a backend for a single attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendError {
    /// Whether retrying the same query may succeed
    pub transient: bool,
    /// Human-readable cause
    pub message: String,
}

impl BackendError {
    /// A failure worth retrying (connection loss, busy store)
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            transient: true,
            message: message.into(),
        }
    }

    /// A failure that will repeat on retry (bad query, bad data)
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            transient: false,
            message: message.into(),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for BackendError {}

/// The storage backend trait
///
/// Backends execute one attempt of a query; deadlines, retries and
/// concurrency limits belong to the [`PersistenceGateway`].
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Open the connection and prepare the schema
    async fn connect(&self) -> Result<(), BackendError>;

    /// Execute one attempt of `query`
    async fn execute(&self, query: &Query) -> Result<QueryOutput, BackendError>;

    /// Release the connection
    async fn close(&self) -> Result<(), BackendError> {
        Ok(())
    }

    /// Backend name for logs
    fn name(&self) -> &'static str;
}

/// Create the backend selected by `config.url`
pub fn backend_from_config(config: &StorageConfig) -> Arc<dyn PersistenceBackend> {
    if config.is_in_process() {
        Arc::new(InMemoryBackend::new())
    } else {
        Arc::new(SurrealBackend::new(config.clone()))
    }
}
