//! Long-term memory: promotion of important turns and cleanup of evicted ones
//!
//! Both write paths go through the [`PersistenceGateway`], so they inherit its
//! deadline and retry policy. Writes are upserts keyed by `turn_id`; repeating
//! one cannot duplicate a durable record.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use uuid::Uuid;

use super::turn::{Turn, UserId};
use crate::config::EvictionPolicy;
use crate::error::Result;
use crate::persistence::{PersistenceGateway, Query, QueryOutput, TurnRecord};

/// Writes eligible turns to the long-term table
pub struct LtmPromoter {
    gateway: Arc<PersistenceGateway>,
    threshold: u32,
}

impl LtmPromoter {
    /// Create a promoter with an importance threshold
    pub fn new(gateway: Arc<PersistenceGateway>, threshold: u32) -> Self {
        Self { gateway, threshold }
    }

    /// Minimum importance for promotion
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Promote `turn` if it is eligible and not promoted yet.
    ///
    /// Returns `true` when a durable copy was written. The caller owns the STM
    /// copy and is responsible for flagging it promoted.
    ///
    /// # Errors
    ///
    /// Returns the gateway error (`Timeout`, `PersistenceFailure`,
    /// `NotInitialized`) when the write fails.
    pub async fn maybe_promote(&self, turn: &Turn) -> Result<bool> {
        if turn.promoted {
            tracing::trace!(turn_id = %turn.turn_id, "Turn already promoted");
            return Ok(false);
        }
        if !turn.is_eligible(self.threshold) {
            return Ok(false);
        }

        self.gateway
            .execute(Query::UpsertLongTerm(TurnRecord::from(turn)))
            .await?;

        tracing::debug!(
            user_id = turn.user_id,
            turn_id = %turn.turn_id,
            importance = ?turn.importance,
            "Turn promoted to long-term memory"
        );
        Ok(true)
    }

    /// Most recent long-term turns of a user, oldest first
    pub async fn recent(&self, user_id: UserId, limit: usize) -> Result<Vec<Turn>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let rows = self
            .gateway
            .execute(Query::RecentLongTerm { user_id, limit })
            .await?
            .into_rows();

        let mut turns: Vec<Turn> = rows.into_iter().map(|r| r.into_turn(true)).collect();
        turns.reverse();
        Ok(turns)
    }

    /// Number of long-term turns of a user
    pub async fn count(&self, user_id: UserId) -> Result<u64> {
        match self
            .gateway
            .execute(Query::CountLongTerm { user_id })
            .await?
        {
            QueryOutput::Count(n) => Ok(n),
            _ => Ok(0),
        }
    }

    /// Retry every queued promotion once.
    ///
    /// Turns written now are returned in `promoted`; turns that failed for the
    /// `max_attempts`-th time are returned in `abandoned`. Turns that no longer
    /// need a write leave the queue unreported. Everything else goes back in
    /// the queue.
    pub async fn retry_pending(&self, queue: &PromotionRetryQueue, max_attempts: u32) -> SweepReport {
        let mut report = SweepReport::default();

        for mut pending in queue.take_all() {
            match self.maybe_promote(&pending.turn).await {
                Ok(true) => report.promoted.push(pending.turn),
                Ok(false) => {
                    tracing::trace!(
                        turn_id = %pending.turn.turn_id,
                        "Queued turn needs no promotion, dropping it"
                    );
                }
                Err(e) => {
                    pending.attempts += 1;
                    pending.last_error = e.to_string();
                    if pending.attempts >= max_attempts {
                        report.abandoned.push(pending);
                    } else {
                        report.requeued += 1;
                        queue.requeue(pending);
                    }
                }
            }
        }

        report
    }
}

/// What happened to an evicted batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvictionOutcome {
    /// Unpromoted turns written to the archive table
    pub archived: usize,
    /// Unpromoted turns dropped under the discard policy
    pub discarded: usize,
    /// Turns that already had a long-term copy
    pub already_promoted: usize,
}

/// Applies the eviction policy to batches leaving short-term memory
pub struct CleanupBatcher {
    gateway: Arc<PersistenceGateway>,
    policy: EvictionPolicy,
}

impl CleanupBatcher {
    /// Create a batcher
    pub fn new(gateway: Arc<PersistenceGateway>, policy: EvictionPolicy) -> Self {
        Self { gateway, policy }
    }

    /// Eviction policy in effect
    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// Handle one evicted batch.
    ///
    /// Promoted turns are dropped. Unpromoted turns are archived in a single
    /// gateway call or discarded, depending on the policy.
    ///
    /// # Errors
    ///
    /// Returns the gateway error when the archive write fails.
    pub async fn handle_evicted_batch(&self, turns: &[Turn]) -> Result<EvictionOutcome> {
        let (promoted, unpromoted): (Vec<&Turn>, Vec<&Turn>) =
            turns.iter().partition(|t| t.promoted);

        let mut outcome = EvictionOutcome {
            already_promoted: promoted.len(),
            ..Default::default()
        };
        if unpromoted.is_empty() {
            return Ok(outcome);
        }

        match self.policy {
            EvictionPolicy::Discard => {
                outcome.discarded = unpromoted.len();
                tracing::debug!(count = outcome.discarded, "Discarded evicted turns");
            }
            EvictionPolicy::Archive => {
                let records: Vec<TurnRecord> =
                    unpromoted.iter().map(|t| TurnRecord::from(*t)).collect();
                outcome.archived = match self.gateway.execute(Query::ArchiveBatch(records)).await? {
                    QueryOutput::Written(n) => n,
                    _ => unpromoted.len(),
                };
                tracing::debug!(count = outcome.archived, "Archived evicted turns");
            }
        }

        Ok(outcome)
    }
}

/// A promotion waiting for the sweep
#[derive(Debug, Clone)]
pub struct PendingPromotion {
    /// Turn to write
    pub turn: Turn,
    /// Sweep retries made so far
    pub attempts: u32,
    /// Most recent failure
    pub last_error: String,
}

/// Queue of failed promotions, one entry per turn
#[derive(Debug, Default)]
pub struct PromotionRetryQueue {
    entries: Mutex<VecDeque<PendingPromotion>>,
}

impl PromotionRetryQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a turn whose promotion failed. A turn already queued is not
    /// added twice.
    pub fn push(&self, turn: Turn, error: impl Into<String>) {
        let mut entries = self.entries.lock();
        if entries.iter().any(|p| p.turn.turn_id == turn.turn_id) {
            return;
        }
        entries.push_back(PendingPromotion {
            turn,
            attempts: 0,
            last_error: error.into(),
        });
    }

    /// Put back an entry taken by `take_all`
    pub fn requeue(&self, pending: PendingPromotion) {
        self.entries.lock().push_back(pending);
    }

    /// Remove and return every entry
    pub fn take_all(&self) -> Vec<PendingPromotion> {
        self.entries.lock().drain(..).collect()
    }

    /// Whether a turn is waiting
    pub fn contains(&self, turn_id: Uuid) -> bool {
        self.entries.lock().iter().any(|p| p.turn.turn_id == turn_id)
    }

    /// Number of waiting turns
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is waiting
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Result of one sweep pass
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Turns written during this pass
    pub promoted: Vec<Turn>,
    /// Entries still failing, put back in the queue
    pub requeued: usize,
    /// Entries that ran out of attempts
    pub abandoned: Vec<PendingPromotion>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MemoryError;
    use crate::memory::turn::{Importance, Role};
    use crate::persistence::{
        BackendError, InMemoryBackend, PersistenceBackend, RetryPolicy,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn scored(user_id: UserId, content: &str, importance: u32) -> Turn {
        let mut turn = Turn::new(user_id, Role::User, content, "auto");
        turn.importance = Some(Importance::new(importance));
        turn
    }

    async fn gateway_over(backend: Arc<dyn PersistenceBackend>) -> Arc<PersistenceGateway> {
        let gateway = PersistenceGateway::with_policy(
            backend,
            RetryPolicy::new(1, Duration::ZERO),
            Duration::from_secs(5),
            4,
            true,
        );
        gateway.connect().await.unwrap();
        Arc::new(gateway)
    }

    /// Fails every write while `down` is set
    struct SwitchableBackend {
        inner: InMemoryBackend,
        down: AtomicBool,
    }

    #[async_trait]
    impl PersistenceBackend for SwitchableBackend {
        async fn connect(&self) -> std::result::Result<(), BackendError> {
            self.inner.connect().await
        }

        async fn execute(&self, query: &Query) -> std::result::Result<QueryOutput, BackendError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(BackendError::transient("store unavailable"));
            }
            self.inner.execute(query).await
        }

        fn name(&self) -> &'static str {
            "switchable"
        }
    }

    #[tokio::test]
    async fn test_threshold_is_inclusive() {
        let backend = Arc::new(InMemoryBackend::new());
        let promoter = LtmPromoter::new(gateway_over(backend.clone()).await, 5);

        assert!(!promoter.maybe_promote(&scored(1, "four", 4)).await.unwrap());
        assert!(promoter.maybe_promote(&scored(1, "five", 5)).await.unwrap());

        let stored = backend.long_term(1);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].content, "five");
    }

    #[tokio::test]
    async fn test_promoted_turn_is_not_written_again() {
        let backend = Arc::new(InMemoryBackend::new());
        let promoter = LtmPromoter::new(gateway_over(backend.clone()).await, 5);

        let mut turn = scored(1, "remember my birthday", 9);
        assert!(promoter.maybe_promote(&turn).await.unwrap());
        turn.promoted = true;
        assert!(!promoter.maybe_promote(&turn).await.unwrap());

        assert_eq!(backend.write_count(), 1);
    }

    #[tokio::test]
    async fn test_unscored_turn_is_not_promoted() {
        let backend = Arc::new(InMemoryBackend::new());
        let promoter = LtmPromoter::new(gateway_over(backend.clone()).await, 0);

        let turn = Turn::new(1, Role::User, "unscored", "auto");
        assert!(!promoter.maybe_promote(&turn).await.unwrap());
        assert_eq!(backend.write_count(), 0);
    }

    #[tokio::test]
    async fn test_recent_is_oldest_first() {
        let backend = Arc::new(InMemoryBackend::new());
        let promoter = LtmPromoter::new(gateway_over(backend).await, 1);

        for (seq, content) in ["a", "b", "c"].iter().enumerate() {
            let mut turn = scored(2, content, 3);
            turn.sequence = seq as u64 + 1;
            promoter.maybe_promote(&turn).await.unwrap();
        }

        let recent = promoter.recent(2, 2).await.unwrap();
        let contents: Vec<&str> = recent.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["b", "c"]);
        assert!(recent.iter().all(|t| t.promoted));
        assert_eq!(promoter.count(2).await.unwrap(), 3);
        assert!(promoter.recent(2, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_archive_policy_writes_unpromoted_only() {
        let backend = Arc::new(InMemoryBackend::new());
        let batcher = CleanupBatcher::new(gateway_over(backend.clone()).await, EvictionPolicy::Archive);

        let mut kept = scored(3, "already durable", 8);
        kept.promoted = true;
        let batch = vec![kept, scored(3, "small talk", 1), scored(3, "ok", 0)];

        let outcome = batcher.handle_evicted_batch(&batch).await.unwrap();
        assert_eq!(
            outcome,
            EvictionOutcome {
                archived: 2,
                discarded: 0,
                already_promoted: 1,
            }
        );
        assert_eq!(backend.archived(3).len(), 2);
        assert_eq!(backend.write_count(), 1);
    }

    #[tokio::test]
    async fn test_discard_policy_writes_nothing() {
        let backend = Arc::new(InMemoryBackend::new());
        let batcher = CleanupBatcher::new(gateway_over(backend.clone()).await, EvictionPolicy::Discard);

        let outcome = batcher
            .handle_evicted_batch(&[scored(4, "a", 1), scored(4, "b", 1)])
            .await
            .unwrap();
        assert_eq!(outcome.discarded, 2);
        assert_eq!(backend.write_count(), 0);
    }

    #[tokio::test]
    async fn test_all_promoted_batch_is_a_no_op() {
        let backend = Arc::new(InMemoryBackend::new());
        let batcher = CleanupBatcher::new(gateway_over(backend.clone()).await, EvictionPolicy::Archive);

        let mut turn = scored(5, "durable", 9);
        turn.promoted = true;
        let outcome = batcher.handle_evicted_batch(&[turn]).await.unwrap();
        assert_eq!(outcome.already_promoted, 1);
        assert_eq!(backend.write_count(), 0);
    }

    #[tokio::test]
    async fn test_archive_failure_surfaces() {
        let backend = Arc::new(SwitchableBackend {
            inner: InMemoryBackend::new(),
            down: AtomicBool::new(true),
        });
        let batcher = CleanupBatcher::new(gateway_over(backend).await, EvictionPolicy::Archive);

        let err = batcher
            .handle_evicted_batch(&[scored(6, "lost?", 1)])
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::PersistenceFailure { attempts: 1, .. }));
    }

    #[test]
    fn test_retry_queue_deduplicates() {
        let queue = PromotionRetryQueue::new();
        let turn = scored(1, "x", 9);
        queue.push(turn.clone(), "down");
        queue.push(turn.clone(), "down again");

        assert_eq!(queue.len(), 1);
        assert!(queue.contains(turn.turn_id));
        assert_eq!(queue.take_all().len(), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_requeues_then_abandons() {
        let backend = Arc::new(SwitchableBackend {
            inner: InMemoryBackend::new(),
            down: AtomicBool::new(true),
        });
        let promoter = LtmPromoter::new(gateway_over(backend.clone()).await, 5);
        let queue = PromotionRetryQueue::new();
        queue.push(scored(7, "my name is Alice", 9), "down");

        let first = promoter.retry_pending(&queue, 2).await;
        assert_eq!(first.requeued, 1);
        assert!(first.abandoned.is_empty());

        let second = promoter.retry_pending(&queue, 2).await;
        assert_eq!(second.abandoned.len(), 1);
        assert_eq!(second.abandoned[0].attempts, 2);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_promotes_after_recovery() {
        let backend = Arc::new(SwitchableBackend {
            inner: InMemoryBackend::new(),
            down: AtomicBool::new(false),
        });
        let promoter = LtmPromoter::new(gateway_over(backend.clone()).await, 5);
        let queue = PromotionRetryQueue::new();
        queue.push(scored(8, "remember this", 9), "down");

        let report = promoter.retry_pending(&queue, 3).await;
        assert_eq!(report.promoted.len(), 1);
        assert!(queue.is_empty());
        assert_eq!(backend.inner.long_term(8).len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_drops_turns_that_need_no_write() {
        let backend = Arc::new(SwitchableBackend {
            inner: InMemoryBackend::new(),
            down: AtomicBool::new(false),
        });
        let promoter = LtmPromoter::new(gateway_over(backend.clone()).await, 5);
        let queue = PromotionRetryQueue::new();
        let mut already = scored(9, "stored elsewhere", 9);
        already.promoted = true;
        queue.push(already, "down");
        queue.push(scored(9, "too small", 2), "down");

        let report = promoter.retry_pending(&queue, 3).await;
        assert!(report.promoted.is_empty());
        assert_eq!(report.requeued, 0);
        assert!(report.abandoned.is_empty());
        assert!(queue.is_empty());
        assert!(backend.inner.long_term(9).is_empty());
    }
}
