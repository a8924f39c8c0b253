//! # Chimera - conversation memory for chat assistants
//!
//! Chimera keeps what a chat assistant remembers about each user:
//! - Short-term memory: a bounded ring of recent turns per user
//! - Importance scoring of every turn
//! - Long-term memory: durable copies of important turns
//! - Batched archival of turns pushed out of short-term memory
//! - Context windows sized to a character budget
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chimera_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = ChimeraConfig::load()?;
//!     let actor = MemoryActor::from_config(&config)?;
//!     actor.initialize().await?;
//!
//!     let ack = actor.store_user_message(42, "Remember: my birthday is May 3", "auto").await?;
//!     println!("stored turn {} (importance {})", ack.sequence, ack.importance);
//!
//!     let context = actor.get_context(42).await?;
//!     println!("{}", context.text);
//!
//!     actor.shutdown().await
//! }
//! ```
//!
//! ## Architecture
//!
//! - **Memory actor**: owns every tier; one serial queue per user
//! - **Persistence gateway**: deadline, bounded retry and call accounting for
//!   every durable write and read
//! - **Backends**: SurrealDB (embedded memory, RocksDB, remote) or in-process
//! - **Event hooks**: react to stores, promotions and evictions

pub mod actor;
pub mod config;
pub mod error;
pub mod events;
pub mod memory;
pub mod persistence;

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::actor::{
        MemoryActor, MemoryActorBuilder, MemoryCommand, MemoryMessage, MemoryReply, StoreAck,
    };
    pub use crate::config::{ChimeraConfig, ConfigBuilder, EvictionPolicy, MemoryConfig, StorageConfig};
    pub use crate::error::{MemoryError, Result};
    pub use crate::events::{
        EventBus, HookRegistry, LoggingHook, MemoryEvent, MemoryEventKind, MemoryHook,
    };
    pub use crate::memory::{
        ContextWindow, HeuristicScorer, Importance, ImportanceScorer, Role, Turn, UserId,
    };
    pub use crate::persistence::{
        GatewayStatsSnapshot, InMemoryBackend, PersistenceBackend, PersistenceGateway,
        SurrealBackend,
    };
}
