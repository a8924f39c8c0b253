//! Conversation memory tiers
//!
//! - [`stm`]: per-user bounded rings of recent turns
//! - [`scoring`]: importance scoring
//! - [`ltm`]: promotion to long-term memory and cleanup of evicted turns
//! - [`context`]: context window assembly

pub mod context;
pub mod ltm;
pub mod scoring;
pub mod stm;
pub mod turn;

pub use context::{ContextBuilder, ContextWindow};
pub use ltm::{
    CleanupBatcher, EvictionOutcome, LtmPromoter, PendingPromotion, PromotionRetryQueue,
    SweepReport,
};
pub use scoring::{HeuristicScorer, ImportanceScorer, ScoringWeights};
pub use stm::{SharedRing, ShortTermMemory, StmRing};
pub use turn::{Importance, Role, Turn, UserId, validate_content};
