//! Dispatcher, per-user workers and the background sweep
//!
//! The dispatcher reads the bounded inbound channel and forwards each request
//! to the queue of the user it concerns. Every user gets one worker task that
//! drains its queue in order, so requests of one user are serialized while
//! different users never wait on each other. A worker whose queue stays empty
//! for [`WORKER_IDLE_TIMEOUT`] exits and is spawned again on the user's next
//! request. Gateway writes run as tracked background tasks and never hold up
//! a worker.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use super::message::{Envelope, MemoryCommand, MemoryMessage, MemoryReply, StoreAck};
use crate::config::MemoryConfig;
use crate::error::{MemoryError, Result};
use crate::events::{EventBus, MemoryEvent, MemoryEventKind};
use crate::memory::context::{ContextBuilder, ContextWindow};
use crate::memory::ltm::{CleanupBatcher, LtmPromoter, PromotionRetryQueue};
use crate::memory::scoring::ImportanceScorer;
use crate::memory::stm::ShortTermMemory;
use crate::memory::turn::{Role, Turn, UserId, validate_content};
use crate::persistence::PersistenceGateway;

/// How long a worker waits on an empty queue before exiting
pub(crate) const WORKER_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// A finished worker hands its queue back so nothing sent meanwhile is lost
type IdleWorker = (UserId, mpsc::UnboundedReceiver<Envelope>);

/// State shared by the dispatcher, the workers and background tasks
pub(crate) struct MemoryCore {
    pub config: MemoryConfig,
    pub stm: ShortTermMemory,
    pub scorer: Arc<dyn ImportanceScorer>,
    pub gateway: Arc<PersistenceGateway>,
    pub promoter: LtmPromoter,
    pub batcher: CleanupBatcher,
    pub retry_queue: PromotionRetryQueue,
    pub events: EventBus,
    pub context: ContextBuilder,
    pub tracker: TaskTracker,
    pub active_workers: AtomicUsize,
    settle_lock: tokio::sync::Mutex<()>,
}

impl MemoryCore {
    pub fn new(
        config: MemoryConfig,
        gateway: Arc<PersistenceGateway>,
        scorer: Arc<dyn ImportanceScorer>,
        events: EventBus,
    ) -> Self {
        Self {
            stm: ShortTermMemory::new(config.stm_limit, config.cleanup_batch_size),
            promoter: LtmPromoter::new(gateway.clone(), config.importance_threshold),
            batcher: CleanupBatcher::new(gateway.clone(), config.eviction_policy),
            retry_queue: PromotionRetryQueue::new(),
            context: ContextBuilder::new(config.context_max_length, config.context_separator.clone()),
            tracker: TaskTracker::new(),
            active_workers: AtomicUsize::new(0),
            settle_lock: tokio::sync::Mutex::new(()),
            config,
            gateway,
            scorer,
            events,
        }
    }

    async fn handle(self: &Arc<Self>, message: MemoryMessage) -> Result<MemoryReply> {
        let request_id = message.request_id;
        match message.command {
            MemoryCommand::StoreUserMessage {
                user_id,
                content,
                mode,
            } => self
                .store(request_id, user_id, Role::User, content, mode)
                .await
                .map(MemoryReply::Stored),
            MemoryCommand::StoreBotResponse {
                user_id,
                content,
                mode,
            } => self
                .store(request_id, user_id, Role::Assistant, content, mode)
                .await
                .map(MemoryReply::Stored),
            MemoryCommand::GetContext { user_id } => {
                Ok(MemoryReply::Context(self.context_window(user_id).await))
            }
            MemoryCommand::GetTurns { user_id } => Ok(MemoryReply::Turns(self.stm.snapshot(user_id))),
        }
    }

    async fn store(
        self: &Arc<Self>,
        request_id: u64,
        user_id: UserId,
        role: Role,
        content: String,
        mode: String,
    ) -> Result<StoreAck> {
        validate_content(&content, self.config.max_content_length)?;

        let mut turn = Turn::new(user_id, role, content, mode);
        let ring = self.stm.ring(user_id);
        let (stored, evicted) = {
            let mut ring = ring.lock();
            turn.sequence = ring.next_sequence();
            // scored against the conversation as it was before this turn
            let conversation = ring.snapshot();
            turn.importance = Some(self.scorer.score(&turn, &conversation));
            let stored = turn.clone();
            let evicted = ring.append(turn);
            (stored, evicted)
        };

        let importance = stored.importance.unwrap_or_default();
        let promotion_scheduled = stored.is_eligible(self.config.importance_threshold);

        tracing::debug!(
            user_id,
            turn_id = %stored.turn_id,
            sequence = stored.sequence,
            role = %stored.role,
            importance = importance.value(),
            evicted = evicted.len(),
            "Turn stored"
        );
        self.events
            .emit(MemoryEvent::for_turn(MemoryEventKind::TurnStored, &stored))
            .await;

        let evicted_count = evicted.len();
        if !evicted.is_empty() {
            self.events
                .emit(MemoryEvent::for_batch(MemoryEventKind::BatchEvicted, user_id, &evicted))
                .await;
            let core = self.clone();
            self.tracker.spawn(async move {
                core.clean_up(user_id, evicted).await;
            });
        }

        let ack = StoreAck {
            request_id,
            turn_id: stored.turn_id,
            sequence: stored.sequence,
            importance,
            promotion_scheduled,
            evicted: evicted_count,
        };

        if promotion_scheduled {
            let core = self.clone();
            self.tracker.spawn(async move {
                core.promote(stored).await;
            });
        }

        Ok(ack)
    }

    /// Promote a turn and record the outcome. Failures are queued for the sweep.
    async fn promote(&self, turn: Turn) {
        match self.promoter.maybe_promote(&turn).await {
            Ok(true) => {
                if !self.stm.mark_promoted(turn.user_id, turn.turn_id) {
                    tracing::debug!(
                        turn_id = %turn.turn_id,
                        "Promoted turn already left short-term memory"
                    );
                }
                self.events
                    .emit(MemoryEvent::for_turn(MemoryEventKind::TurnPromoted, &turn))
                    .await;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(
                    user_id = turn.user_id,
                    turn_id = %turn.turn_id,
                    error = %e,
                    "Promotion failed, queued for retry"
                );
                self.events
                    .emit(MemoryEvent::for_turn(MemoryEventKind::PromotionFailed, &turn).with_error(&e))
                    .await;
                self.retry_queue.push(turn, e.to_string());
            }
        }
    }

    /// Hand an evicted batch to the cleanup batcher
    pub async fn clean_up(&self, user_id: UserId, turns: Vec<Turn>) {
        match self.batcher.handle_evicted_batch(&turns).await {
            Ok(outcome) => {
                if outcome.archived > 0 {
                    self.events
                        .emit(MemoryEvent::new(
                            MemoryEventKind::BatchArchived,
                            Some(user_id),
                            serde_json::json!(outcome),
                        ))
                        .await;
                }
            }
            Err(e) => {
                tracing::error!(
                    user_id,
                    count = turns.len(),
                    error = %e,
                    "Failed to archive evicted turns"
                );
                self.events
                    .emit(
                        MemoryEvent::for_batch(MemoryEventKind::ArchiveFailed, user_id, &turns)
                            .with_error(&e),
                    )
                    .await;
            }
        }
    }

    async fn context_window(&self, user_id: UserId) -> ContextWindow {
        let mut turns = self.stm.snapshot(user_id);

        if self.config.include_long_term_context {
            match self
                .promoter
                .recent(user_id, self.config.long_term_context_limit)
                .await
            {
                Ok(long_term) => {
                    let mut merged: Vec<Turn> = long_term
                        .into_iter()
                        .filter(|lt| !turns.iter().any(|t| t.turn_id == lt.turn_id))
                        .collect();
                    merged.append(&mut turns);
                    turns = merged;
                }
                Err(e) => {
                    tracing::warn!(
                        user_id,
                        error = %e,
                        "Long-term context unavailable, using short-term memory only"
                    );
                }
            }
        }

        self.context.build(user_id, turns)
    }

    /// One pass over the failed-promotion queue
    pub async fn sweep(&self) {
        if self.retry_queue.is_empty() {
            return;
        }

        let report = self
            .promoter
            .retry_pending(&self.retry_queue, self.config.sweep_max_attempts)
            .await;

        for turn in &report.promoted {
            self.stm.mark_promoted(turn.user_id, turn.turn_id);
            self.events
                .emit(MemoryEvent::for_turn(MemoryEventKind::TurnPromoted, turn))
                .await;
        }
        for pending in &report.abandoned {
            tracing::error!(
                user_id = pending.turn.user_id,
                turn_id = %pending.turn.turn_id,
                attempts = pending.attempts,
                error = %pending.last_error,
                "Giving up on promotion"
            );
            self.events
                .emit(
                    MemoryEvent::for_turn(MemoryEventKind::PromotionAbandoned, &pending.turn)
                        .with_error(&pending.last_error),
                )
                .await;
        }

        tracing::info!(
            promoted = report.promoted.len(),
            requeued = report.requeued,
            abandoned = report.abandoned.len(),
            "Promotion sweep finished"
        );
    }

    /// Wait until every background write has settled
    pub async fn settle(&self) {
        let _guard = self.settle_lock.lock().await;
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

/// Route inbound requests to per-user workers until the channel closes, then
/// wait for every worker to drain its queue.
pub(crate) async fn run_dispatcher(core: Arc<MemoryCore>, mut inbox: mpsc::Receiver<Envelope>) {
    let mut queues: HashMap<UserId, mpsc::UnboundedSender<Envelope>> = HashMap::new();
    let mut workers: JoinSet<IdleWorker> = JoinSet::new();

    loop {
        tokio::select! {
            received = inbox.recv() => match received {
                Some(envelope) => route(&core, &mut queues, &mut workers, envelope),
                None => break,
            },
            Some(joined) = workers.join_next(), if !workers.is_empty() => match joined {
                // requests may have arrived while the worker was winding down
                Ok((user_id, queue)) if !queue.is_empty() => {
                    workers.spawn(run_worker(core.clone(), user_id, queue));
                }
                Ok((user_id, _)) => {
                    queues.remove(&user_id);
                    core.active_workers.fetch_sub(1, Ordering::SeqCst);
                    tracing::trace!(user_id, "Idle worker released");
                }
                Err(e) => {
                    core.active_workers.fetch_sub(1, Ordering::SeqCst);
                    tracing::error!(error = %e, "Memory worker panicked");
                }
            },
        }
    }

    tracing::debug!(workers = workers.len(), "Inbound channel closed, draining workers");
    drop(queues);
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "Memory worker panicked");
        }
    }
    core.active_workers.store(0, Ordering::SeqCst);
}

fn route(
    core: &Arc<MemoryCore>,
    queues: &mut HashMap<UserId, mpsc::UnboundedSender<Envelope>>,
    workers: &mut JoinSet<IdleWorker>,
    envelope: Envelope,
) {
    let user_id = envelope.message.command.user_id();
    let envelope = match queues.get(&user_id) {
        Some(queue) => match queue.send(envelope) {
            Ok(()) => return,
            Err(mpsc::error::SendError(envelope)) => {
                tracing::error!(user_id, "Worker queue closed, restarting worker");
                envelope
            }
        },
        None => envelope,
    };

    let (tx, rx) = mpsc::unbounded_channel();
    // the receiver is alive, so this cannot fail
    let _ = tx.send(envelope);
    workers.spawn(run_worker(core.clone(), user_id, rx));
    queues.insert(user_id, tx);
    core.active_workers.fetch_add(1, Ordering::SeqCst);
}

async fn run_worker(
    core: Arc<MemoryCore>,
    user_id: UserId,
    mut queue: mpsc::UnboundedReceiver<Envelope>,
) -> IdleWorker {
    // closed or idle for too long
    while let Ok(Some(Envelope { message, reply })) =
        tokio::time::timeout(WORKER_IDLE_TIMEOUT, queue.recv()).await
    {
        let span = tracing::debug_span!(
            "memory_request",
            request_id = message.request_id,
            user_id,
            sender = %message.sender,
            command = message.command.kind(),
        );
        let result = core.handle(message).instrument(span).await;
        if let Err(e) = &result {
            tracing::debug!(user_id, error = %e, "Memory request failed");
        }
        // the caller may have gone away
        let _ = reply.send(result);
    }
    (user_id, queue)
}

/// Retry failed promotions every `sweep_interval` until cancelled
pub(crate) async fn run_sweep(core: Arc<MemoryCore>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(core.config.sweep_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => core.sweep().await,
        }
    }
    tracing::debug!("Promotion sweep stopped");
}
