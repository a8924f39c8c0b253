//! Memory events and hooks
//!
//! Every store, promotion, eviction and persistence failure produces a
//! [`MemoryEvent`]. Events are delivered to registered [`MemoryHook`]s and to
//! broadcast subscribers. Hook failures are logged and never fail the memory
//! operation that produced the event.
//!
//! # Example
//!
//! ```rust,ignore
//! use chimera_core::events::{EventBus, LoggingHook};
//!
//! let mut bus = EventBus::new(128);
//! bus.register(Arc::new(LoggingHook));
//! let mut events = bus.subscribe();
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::Result;
use crate::memory::turn::{Turn, UserId};

/// Kind of memory event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryEventKind {
    /// A turn entered short-term memory
    TurnStored,
    /// A turn was written to long-term memory
    TurnPromoted,
    /// A long-term write failed; the turn is queued for the sweep
    PromotionFailed,
    /// The sweep gave up on a turn
    PromotionAbandoned,
    /// A batch of turns left short-term memory
    BatchEvicted,
    /// Evicted turns were written to the archive tier
    BatchArchived,
    /// An archive write failed
    ArchiveFailed,
}

impl MemoryEventKind {
    /// snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryEventKind::TurnStored => "turn_stored",
            MemoryEventKind::TurnPromoted => "turn_promoted",
            MemoryEventKind::PromotionFailed => "promotion_failed",
            MemoryEventKind::PromotionAbandoned => "promotion_abandoned",
            MemoryEventKind::BatchEvicted => "batch_evicted",
            MemoryEventKind::BatchArchived => "batch_archived",
            MemoryEventKind::ArchiveFailed => "archive_failed",
        }
    }
}

/// Event emitted by the memory core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEvent {
    /// Event ID
    pub event_id: Uuid,

    /// Event type
    pub event_type: MemoryEventKind,

    /// Timestamp
    pub timestamp: DateTime<Utc>,

    /// User the event concerns, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,

    /// Event payload
    #[serde(default)]
    pub data: serde_json::Value,
}

impl MemoryEvent {
    /// Create an event stamped now
    pub fn new(event_type: MemoryEventKind, user_id: Option<UserId>, data: serde_json::Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            timestamp: Utc::now(),
            user_id,
            data,
        }
    }

    /// Event describing a single turn
    pub fn for_turn(event_type: MemoryEventKind, turn: &Turn) -> Self {
        Self::new(
            event_type,
            Some(turn.user_id),
            serde_json::json!({
                "turn_id": turn.turn_id,
                "sequence": turn.sequence,
                "role": turn.role,
                "importance": turn.importance,
                "content_length": turn.char_len(),
            }),
        )
    }

    /// Event describing a batch of turns
    pub fn for_batch(event_type: MemoryEventKind, user_id: UserId, turns: &[Turn]) -> Self {
        let turn_ids: Vec<Uuid> = turns.iter().map(|t| t.turn_id).collect();
        Self::new(
            event_type,
            Some(user_id),
            serde_json::json!({
                "count": turns.len(),
                "turn_ids": turn_ids,
            }),
        )
    }

    /// Attach an error description to the payload
    pub fn with_error(mut self, error: impl std::fmt::Display) -> Self {
        if let serde_json::Value::Object(ref mut map) = self.data {
            map.insert("error".to_string(), serde_json::json!(error.to_string()));
        }
        self
    }
}

/// Result type for hooks
pub type HookResult = Result<()>;

/// Trait for memory event hooks
#[async_trait]
pub trait MemoryHook: Send + Sync {
    /// Called for every event
    async fn on_event(&self, event: &MemoryEvent) -> HookResult;
}

/// Registry for managing hooks
#[derive(Default)]
pub struct HookRegistry {
    hooks: Vec<Arc<dyn MemoryHook>>,
}

impl HookRegistry {
    /// Create a new hook registry
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    /// Register a hook
    pub fn register(&mut self, hook: Arc<dyn MemoryHook>) {
        self.hooks.push(hook);
    }

    /// Number of registered hooks
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Whether no hook is registered
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Deliver an event to every hook, in registration order
    pub async fn trigger(&self, event: &MemoryEvent) {
        for hook in &self.hooks {
            if let Err(e) = hook.on_event(event).await {
                tracing::warn!(
                    event_type = event.event_type.as_str(),
                    error = %e,
                    "Memory hook failed"
                );
            }
        }
    }
}

/// Fan-out of memory events to hooks and broadcast subscribers
pub struct EventBus {
    hooks: HookRegistry,
    sender: broadcast::Sender<MemoryEvent>,
}

impl EventBus {
    /// Create a bus whose subscribers may lag by up to `capacity` events
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            hooks: HookRegistry::new(),
            sender,
        }
    }

    /// Register a hook
    pub fn register(&mut self, hook: Arc<dyn MemoryHook>) {
        self.hooks.register(hook);
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<MemoryEvent> {
        self.sender.subscribe()
    }

    /// Deliver an event
    pub async fn emit(&self, event: MemoryEvent) {
        self.hooks.trigger(&event).await;
        // no subscribers is fine
        let _ = self.sender.send(event);
    }
}

/// Logs each event as a JSON line
pub struct LoggingHook;

#[async_trait]
impl MemoryHook for LoggingHook {
    async fn on_event(&self, event: &MemoryEvent) -> HookResult {
        let json = serde_json::to_string(event)?;
        match event.event_type {
            MemoryEventKind::PromotionFailed
            | MemoryEventKind::PromotionAbandoned
            | MemoryEventKind::ArchiveFailed => {
                tracing::warn!(event = %json, "Memory event");
            }
            _ => tracing::info!(event = %json, "Memory event"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MemoryError;
    use crate::memory::turn::Role;

    struct CountingHook {
        seen: Arc<tokio::sync::Mutex<Vec<MemoryEventKind>>>,
    }

    #[async_trait]
    impl MemoryHook for CountingHook {
        async fn on_event(&self, event: &MemoryEvent) -> HookResult {
            self.seen.lock().await.push(event.event_type);
            Ok(())
        }
    }

    struct FailingHook;

    #[async_trait]
    impl MemoryHook for FailingHook {
        async fn on_event(&self, _event: &MemoryEvent) -> HookResult {
            Err(MemoryError::Other("hook exploded".to_string()))
        }
    }

    #[tokio::test]
    async fn test_bus_delivers_to_hooks_and_subscribers() {
        let seen = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let mut bus = EventBus::new(8);
        bus.register(Arc::new(FailingHook));
        bus.register(Arc::new(CountingHook { seen: seen.clone() }));
        let mut rx = bus.subscribe();

        let turn = Turn::new(3, Role::User, "hello", "auto");
        bus.emit(MemoryEvent::for_turn(MemoryEventKind::TurnStored, &turn))
            .await;

        // a failing hook does not stop later hooks
        assert_eq!(*seen.lock().await, vec![MemoryEventKind::TurnStored]);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.user_id, Some(3));
        assert_eq!(event.data["turn_id"], serde_json::json!(turn.turn_id));
    }

    #[tokio::test]
    async fn test_emit_without_subscribers() {
        let bus = EventBus::new(1);
        bus.emit(MemoryEvent::new(
            MemoryEventKind::BatchArchived,
            None,
            serde_json::json!({}),
        ))
        .await;
    }

    #[test]
    fn test_event_serialization() {
        let turn = Turn::new(1, Role::Assistant, "reply", "auto");
        let event = MemoryEvent::for_batch(MemoryEventKind::BatchEvicted, 1, &[turn])
            .with_error("disk full");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "batch_evicted");
        assert_eq!(json["data"]["count"], 1);
        assert_eq!(json["data"]["error"], "disk full");

        let parsed: MemoryEvent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.event_type, MemoryEventKind::BatchEvicted);
    }

    #[tokio::test]
    async fn test_logging_hook() {
        let event = MemoryEvent::new(MemoryEventKind::ArchiveFailed, Some(1), serde_json::json!({}));
        assert!(LoggingHook.on_event(&event).await.is_ok());
    }
}
