//! The memory actor: single entry point to conversation memory
//!
//! All operations travel as [`MemoryMessage`]s through a bounded inbound
//! channel. A dispatcher hands each message to the worker of the user it
//! concerns; each user's requests run strictly in submission order and never
//! wait on another user's work.
//!
//! # Example
//!
//! ```rust,no_run
//! use chimera_core::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let actor = MemoryActor::new(MemoryConfig::default(), Arc::new(InMemoryBackend::new()))?;
//!     actor.initialize().await?;
//!
//!     actor.store_user_message(1, "My name is Alice", "auto").await?;
//!     let context = actor.get_context(1).await?;
//!     println!("{}", context.text);
//!
//!     actor.shutdown().await
//! }
//! ```

pub mod message;
mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{ChimeraConfig, MemoryConfig};
use crate::error::{MemoryError, Result};
use crate::events::{EventBus, MemoryEvent, MemoryHook};
use crate::memory::context::ContextWindow;
use crate::memory::scoring::{HeuristicScorer, ImportanceScorer};
use crate::memory::turn::{Turn, UserId};
use crate::persistence::{GatewayStatsSnapshot, PersistenceBackend, PersistenceGateway, backend_from_config};

pub use message::{MemoryCommand, MemoryMessage, MemoryReply, StoreAck};

use message::Envelope;
use worker::{MemoryCore, run_dispatcher, run_sweep};

/// Sender tag used by the convenience methods
pub const DIRECT_SENDER: &str = "direct";

const DEFAULT_EVENT_CAPACITY: usize = 1024;

struct RunningTasks {
    dispatcher: JoinHandle<()>,
    sweep: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Builder for [`MemoryActor`]
pub struct MemoryActorBuilder {
    config: MemoryConfig,
    backend: Arc<dyn PersistenceBackend>,
    scorer: Option<Arc<dyn ImportanceScorer>>,
    hooks: Vec<Arc<dyn MemoryHook>>,
    event_capacity: usize,
}

impl MemoryActorBuilder {
    /// Replace the default heuristic scorer
    pub fn scorer(mut self, scorer: impl ImportanceScorer + 'static) -> Self {
        self.scorer = Some(Arc::new(scorer));
        self
    }

    /// Register an event hook
    pub fn hook(mut self, hook: Arc<dyn MemoryHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// How far event subscribers may lag before missing events
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Build the actor. It accepts requests once `initialize` succeeds.
    ///
    /// # Errors
    ///
    /// Returns `MemoryError::Configuration` if the configuration is invalid.
    pub fn build(self) -> Result<MemoryActor> {
        self.config.validate()?;

        let gateway = Arc::new(PersistenceGateway::new(self.backend, &self.config));
        let scorer = self
            .scorer
            .unwrap_or_else(|| Arc::new(HeuristicScorer::new()));

        let mut events = EventBus::new(self.event_capacity);
        for hook in self.hooks {
            events.register(hook);
        }

        tracing::debug!(
            scorer = scorer.name(),
            backend = gateway.backend_name(),
            "Memory actor built"
        );

        Ok(MemoryActor {
            core: Arc::new(MemoryCore::new(self.config, gateway, scorer, events)),
            next_request_id: AtomicU64::new(0),
            intake: parking_lot::RwLock::new(None),
            running: tokio::sync::Mutex::new(None),
        })
    }
}

/// Owner of conversation memory for every user
pub struct MemoryActor {
    core: Arc<MemoryCore>,
    next_request_id: AtomicU64,
    intake: parking_lot::RwLock<Option<mpsc::Sender<Envelope>>>,
    running: tokio::sync::Mutex<Option<RunningTasks>>,
}

impl MemoryActor {
    /// Create an actor with the default scorer and no hooks
    ///
    /// # Errors
    ///
    /// Returns `MemoryError::Configuration` if the configuration is invalid.
    pub fn new(config: MemoryConfig, backend: Arc<dyn PersistenceBackend>) -> Result<Self> {
        Self::builder(config, backend).build()
    }

    /// Create an actor whose backend is selected by the storage configuration
    ///
    /// # Errors
    ///
    /// Returns `MemoryError::Configuration` if the configuration is invalid.
    pub fn from_config(config: &ChimeraConfig) -> Result<Self> {
        config.validate()?;
        Self::new(config.memory.clone(), backend_from_config(&config.storage))
    }

    /// Start building an actor
    pub fn builder(config: MemoryConfig, backend: Arc<dyn PersistenceBackend>) -> MemoryActorBuilder {
        MemoryActorBuilder {
            config,
            backend,
            scorer: None,
            hooks: Vec::new(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Memory configuration in effect
    pub fn config(&self) -> &MemoryConfig {
        &self.core.config
    }

    /// Connect the store and start the dispatcher and the promotion sweep.
    /// Calling it again while running does nothing.
    ///
    /// # Errors
    ///
    /// Returns the gateway error if the store cannot be reached.
    pub async fn initialize(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        self.core.gateway.connect().await?;

        let (tx, rx) = mpsc::channel(self.core.config.inbound_queue_capacity);
        let dispatcher = tokio::spawn(run_dispatcher(self.core.clone(), rx));
        let cancel = CancellationToken::new();
        let sweep = tokio::spawn(run_sweep(self.core.clone(), cancel.clone()));

        *self.intake.write() = Some(tx);
        *running = Some(RunningTasks {
            dispatcher,
            sweep,
            cancel,
        });

        tracing::info!(
            backend = self.core.gateway.backend_name(),
            stm_limit = self.core.config.stm_limit,
            importance_threshold = self.core.config.importance_threshold,
            "Memory actor initialized"
        );
        Ok(())
    }

    /// Whether the actor accepts requests
    pub fn is_running(&self) -> bool {
        self.intake.read().is_some()
    }

    /// Stop intake, finish queued requests and background writes, then
    /// release the store. Unpromoted short-term turns are handed to the
    /// cleanup batcher first when `flush_stm_on_shutdown` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the store connection cannot be released.
    pub async fn shutdown(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        let Some(tasks) = running.take() else {
            return Ok(());
        };

        // new requests fail with NotInitialized from here on
        self.intake.write().take();

        if let Err(e) = tasks.dispatcher.await {
            tracing::error!(error = %e, "Memory dispatcher panicked");
        }
        tasks.cancel.cancel();
        if let Err(e) = tasks.sweep.await {
            tracing::error!(error = %e, "Promotion sweep panicked");
        }

        self.core.settle().await;

        if self.core.config.flush_stm_on_shutdown {
            // promoted turns are dropped by the batcher, the rest are archived
            let batches = self.core.stm.drain_all();
            let flushed: usize = batches.iter().map(|(_, turns)| turns.len()).sum();
            futures::future::join_all(
                batches
                    .into_iter()
                    .map(|(user_id, turns)| self.core.clean_up(user_id, turns)),
            )
            .await;
            if flushed > 0 {
                tracing::info!(turns = flushed, "Flushed short-term memory");
            }
        }

        let pending = self.core.retry_queue.len();
        if pending > 0 {
            tracing::warn!(pending, "Shutting down with unpromoted turns in the retry queue");
        }

        self.core.gateway.close().await?;
        tracing::info!("Memory actor shut down");
        Ok(())
    }

    /// Submit a message and wait for its reply.
    ///
    /// The actor overwrites `request_id` with the next id.
    ///
    /// # Errors
    ///
    /// - `NotInitialized` before `initialize` or after `shutdown`
    /// - `Validation` for empty or oversized content
    pub async fn handle_message(&self, mut message: MemoryMessage) -> Result<MemoryReply> {
        let sender = self
            .intake
            .read()
            .clone()
            .ok_or(MemoryError::NotInitialized)?;

        message.request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(Envelope {
                message,
                reply: reply_tx,
            })
            .await
            .map_err(|_| MemoryError::NotInitialized)?;

        reply_rx.await.map_err(|_| MemoryError::NotInitialized)?
    }

    /// Record a message written by the user
    pub async fn store_user_message(
        &self,
        user_id: UserId,
        content: impl Into<String>,
        mode: impl Into<String>,
    ) -> Result<StoreAck> {
        let command = MemoryCommand::StoreUserMessage {
            user_id,
            content: content.into(),
            mode: mode.into(),
        };
        self.store(command).await
    }

    /// Record a reply produced by the assistant
    pub async fn store_bot_response(
        &self,
        user_id: UserId,
        content: impl Into<String>,
        mode: impl Into<String>,
    ) -> Result<StoreAck> {
        let command = MemoryCommand::StoreBotResponse {
            user_id,
            content: content.into(),
            mode: mode.into(),
        };
        self.store(command).await
    }

    /// Build the user's context window
    pub async fn get_context(&self, user_id: UserId) -> Result<ContextWindow> {
        match self.request(MemoryCommand::GetContext { user_id }).await? {
            MemoryReply::Context(window) => Ok(window),
            other => Err(unexpected(other)),
        }
    }

    /// Copy of the user's short-term turns, oldest first
    pub async fn get_turns(&self, user_id: UserId) -> Result<Vec<Turn>> {
        match self.request(MemoryCommand::GetTurns { user_id }).await? {
            MemoryReply::Turns(turns) => Ok(turns),
            other => Err(unexpected(other)),
        }
    }

    /// Most recent long-term turns of a user, oldest first
    pub async fn recent_long_term(&self, user_id: UserId, limit: usize) -> Result<Vec<Turn>> {
        self.core.promoter.recent(user_id, limit).await
    }

    /// Wait until every background promotion and archive write has settled
    pub async fn flush(&self) {
        self.core.settle().await;
    }

    /// Run one pass of the failed-promotion sweep now
    pub async fn sweep_now(&self) {
        self.core.sweep().await;
    }

    /// Number of failed promotions waiting for the sweep
    pub fn pending_promotions(&self) -> usize {
        self.core.retry_queue.len()
    }

    /// Number of users with a live worker task. Workers exit after a minute
    /// without requests.
    pub fn active_workers(&self) -> usize {
        self.core.active_workers.load(Ordering::SeqCst)
    }

    /// Gateway call counters
    pub fn gateway_stats(&self) -> GatewayStatsSnapshot {
        self.core.gateway.stats()
    }

    /// Receive every memory event emitted from now on
    pub fn subscribe_events(&self) -> broadcast::Receiver<MemoryEvent> {
        self.core.events.subscribe()
    }

    async fn request(&self, command: MemoryCommand) -> Result<MemoryReply> {
        self.handle_message(MemoryMessage::new(command, DIRECT_SENDER))
            .await
    }

    async fn store(&self, command: MemoryCommand) -> Result<StoreAck> {
        match self.request(command).await? {
            MemoryReply::Stored(ack) => Ok(ack),
            other => Err(unexpected(other)),
        }
    }
}

impl Drop for MemoryActor {
    fn drop(&mut self) {
        if let Some(tasks) = self.running.get_mut() {
            tasks.cancel.cancel();
        }
    }
}

fn unexpected(reply: MemoryReply) -> MemoryError {
    MemoryError::Other(format!("unexpected memory reply: {}", reply.kind()))
}
