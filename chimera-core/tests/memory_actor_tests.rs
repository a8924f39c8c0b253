//! End-to-end tests of the memory actor

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_test::{assert_err, assert_ok};

use chimera_core::persistence::{BackendError, Query, QueryOutput};
use chimera_core::prelude::*;

fn config(stm_limit: usize, cleanup_batch_size: usize) -> MemoryConfig {
    MemoryConfig {
        stm_limit,
        cleanup_batch_size,
        query_timeout_seconds: 5,
        retry_delay_seconds: 0,
        ..Default::default()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn never_important(_turn: &Turn, _conversation: &[Turn]) -> Importance {
    Importance::new(0)
}

fn always_important(_turn: &Turn, _conversation: &[Turn]) -> Importance {
    Importance::new(9)
}

/// Score is the number written in the message
fn score_from_content(turn: &Turn, _conversation: &[Turn]) -> Importance {
    Importance::new(turn.content.trim().parse().unwrap_or(0))
}

fn contents(turns: &[Turn]) -> Vec<&str> {
    turns.iter().map(|t| t.content.as_str()).collect()
}

async fn started(
    config: MemoryConfig,
    backend: Arc<dyn PersistenceBackend>,
    scorer: fn(&Turn, &[Turn]) -> Importance,
) -> MemoryActor {
    init_tracing();
    let actor = MemoryActor::builder(config, backend)
        .scorer(scorer)
        .build()
        .expect("valid config");
    actor.initialize().await.expect("actor should start");
    actor
}

/// Fails every query while `down` is set
struct OutageBackend {
    inner: InMemoryBackend,
    down: AtomicBool,
}

impl OutageBackend {
    fn new(down: bool) -> Self {
        Self {
            inner: InMemoryBackend::new(),
            down: AtomicBool::new(down),
        }
    }
}

#[async_trait]
impl PersistenceBackend for OutageBackend {
    async fn connect(&self) -> std::result::Result<(), BackendError> {
        self.inner.connect().await
    }

    async fn execute(&self, query: &Query) -> std::result::Result<QueryOutput, BackendError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(BackendError::transient("connection refused"));
        }
        self.inner.execute(query).await
    }

    fn name(&self) -> &'static str {
        "outage"
    }
}

/// Holds long-term writes of one user until permits are added
struct GatedBackend {
    inner: InMemoryBackend,
    gate: Semaphore,
    gated_user: UserId,
}

#[async_trait]
impl PersistenceBackend for GatedBackend {
    async fn connect(&self) -> std::result::Result<(), BackendError> {
        self.inner.connect().await
    }

    async fn execute(&self, query: &Query) -> std::result::Result<QueryOutput, BackendError> {
        if let Query::UpsertLongTerm(record) = query {
            if record.user_id == self.gated_user {
                let _permit = self
                    .gate
                    .acquire()
                    .await
                    .map_err(|e| BackendError::permanent(e.to_string()))?;
            }
        }
        self.inner.execute(query).await
    }

    fn name(&self) -> &'static str {
        "gated"
    }
}

/// Every write takes a while
struct SlowBackend {
    inner: InMemoryBackend,
    delay: Duration,
}

#[async_trait]
impl PersistenceBackend for SlowBackend {
    async fn connect(&self) -> std::result::Result<(), BackendError> {
        self.inner.connect().await
    }

    async fn execute(&self, query: &Query) -> std::result::Result<QueryOutput, BackendError> {
        tokio::time::sleep(self.delay).await;
        self.inner.execute(query).await
    }

    fn name(&self) -> &'static str {
        "slow"
    }
}

#[tokio::test]
async fn test_requests_before_initialize_fail() {
    let actor = MemoryActor::new(config(3, 1), Arc::new(InMemoryBackend::new())).unwrap();

    let err = actor.store_user_message(1, "hello", "auto").await.unwrap_err();
    assert!(matches!(err, MemoryError::NotInitialized));
    let err = actor.get_context(1).await.unwrap_err();
    assert!(matches!(err, MemoryError::NotInitialized));
    assert!(!actor.is_running());
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let result = MemoryActor::new(config(3, 5), Arc::new(InMemoryBackend::new()));
    assert!(matches!(result, Err(MemoryError::Configuration(_))));
}

#[tokio::test]
async fn test_validation_errors_leave_memory_untouched() {
    let mut cfg = config(5, 1);
    cfg.max_content_length = 10;
    let actor = started(cfg, Arc::new(InMemoryBackend::new()), never_important).await;

    for content in ["", "   \n\t", "this is far too long"] {
        let err = actor.store_user_message(1, content, "auto").await.unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)), "{content:?}");
    }
    // exactly at the limit is fine
    actor.store_user_message(1, "0123456789", "auto").await.unwrap();

    let turns = actor.get_turns(1).await.unwrap();
    assert_eq!(contents(&turns), vec!["0123456789"]);
    actor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_batch_eviction_archives_oldest_turns() {
    let backend = Arc::new(InMemoryBackend::new());
    let actor = started(config(3, 2), backend.clone(), never_important).await;

    for content in ["T1", "T2", "T3"] {
        let ack = actor.store_user_message(1, content, "auto").await.unwrap();
        assert_eq!(ack.evicted, 0);
    }
    assert_eq!(contents(&actor.get_turns(1).await.unwrap()), vec!["T1", "T2", "T3"]);

    let ack = actor.store_bot_response(1, "T4", "auto").await.unwrap();
    assert_eq!(ack.evicted, 2);
    assert_eq!(ack.sequence, 4);
    assert_eq!(contents(&actor.get_turns(1).await.unwrap()), vec!["T3", "T4"]);

    actor.flush().await;
    let archived: Vec<String> = backend.archived(1).into_iter().map(|r| r.content).collect();
    assert_eq!(archived, vec!["T1", "T2"]);
    assert!(backend.long_term(1).is_empty());
    actor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_ring_never_exceeds_limit() {
    let actor = started(config(4, 1), Arc::new(InMemoryBackend::new()), never_important).await;

    for i in 1..=10 {
        actor
            .store_user_message(2, format!("m{}", i), "auto")
            .await
            .unwrap();
        assert!(actor.get_turns(2).await.unwrap().len() <= 4);
    }
    // batch of one keeps the ring exactly full
    assert_eq!(contents(&actor.get_turns(2).await.unwrap()), vec!["m7", "m8", "m9", "m10"]);
    actor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_promotion_threshold() {
    let backend = Arc::new(InMemoryBackend::new());
    let actor = started(config(10, 1), backend.clone(), score_from_content).await;

    let low = actor.store_user_message(3, "4", "auto").await.unwrap();
    let high = actor.store_user_message(3, "5", "auto").await.unwrap();
    assert_eq!(low.importance, Importance::new(4));
    assert!(!low.promotion_scheduled);
    assert!(high.promotion_scheduled);

    actor.flush().await;
    let turns = actor.get_turns(3).await.unwrap();
    assert!(!turns[0].promoted);
    assert!(turns[1].promoted);

    let stored = backend.long_term(3);
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].turn_id, high.turn_id.to_string());
    actor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_context_drops_oldest_turns() {
    let mut cfg = config(10, 1);
    cfg.context_max_length = 10;
    cfg.context_separator = String::new();
    let actor = started(cfg, Arc::new(InMemoryBackend::new()), never_important).await;

    for content in ["abcde", "fghij", "k"] {
        actor.store_user_message(4, content, "auto").await.unwrap();
    }

    let window = actor.get_context(4).await.unwrap();
    assert_eq!(window.text, "fghijk");
    assert_eq!(window.dropped, 1);
    assert!(window.char_len() <= 10);

    // reading the context does not change memory
    assert_eq!(actor.get_turns(4).await.unwrap().len(), 3);
    actor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_context_includes_long_term_turns() {
    let mut cfg = config(2, 1);
    cfg.include_long_term_context = true;
    cfg.flush_stm_on_shutdown = false;
    let actor = started(cfg, Arc::new(InMemoryBackend::new()), always_important).await;

    for content in ["a", "b", "c"] {
        actor.store_user_message(5, content, "auto").await.unwrap();
        actor.flush().await;
    }

    let window = actor.get_context(5).await.unwrap();
    assert_eq!(window.text, "a\nb\nc");
    assert_eq!(window.turns.len(), 3);
    actor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_long_term_outage_falls_back_to_short_term_context() {
    let backend = Arc::new(OutageBackend::new(false));
    let mut cfg = config(5, 1);
    cfg.include_long_term_context = true;
    cfg.retry_attempts = 1;
    let actor = started(cfg, backend.clone(), never_important).await;

    actor.store_user_message(6, "hello there", "auto").await.unwrap();
    backend.down.store(true, Ordering::SeqCst);

    let window = actor.get_context(6).await.unwrap();
    assert_eq!(window.text, "hello there");

    backend.down.store(false, Ordering::SeqCst);
    actor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_waits_for_promotions() {
    let backend = Arc::new(SlowBackend {
        inner: InMemoryBackend::new(),
        delay: Duration::from_millis(50),
    });
    let mut cfg = config(10, 1);
    cfg.flush_stm_on_shutdown = false;
    let actor = started(cfg, backend.clone(), always_important).await;

    for content in ["first", "second", "third"] {
        let ack = actor.store_user_message(7, content, "auto").await.unwrap();
        assert!(ack.promotion_scheduled);
    }
    actor.shutdown().await.unwrap();

    assert_eq!(backend.inner.long_term(7).len(), 3);
    let err = actor.store_user_message(7, "late", "auto").await.unwrap_err();
    assert!(matches!(err, MemoryError::NotInitialized));
}

#[tokio::test]
async fn test_shutdown_flushes_unpromoted_turns() {
    let backend = Arc::new(InMemoryBackend::new());
    let actor = started(config(10, 5), backend.clone(), score_from_content).await;

    actor.store_user_message(8, "1", "auto").await.unwrap();
    actor.store_user_message(8, "9", "auto").await.unwrap();
    actor.store_bot_response(8, "2", "auto").await.unwrap();
    actor.shutdown().await.unwrap();

    // the promoted turn is not archived again
    let archived: Vec<String> = backend.archived(8).into_iter().map(|r| r.content).collect();
    assert_eq!(archived, vec!["1", "2"]);
    assert_eq!(backend.long_term(8).len(), 1);
}

#[tokio::test]
async fn test_restart_starts_from_empty_short_term_memory() {
    let backend = Arc::new(InMemoryBackend::new());
    let actor = started(config(10, 1), backend.clone(), score_from_content).await;

    for content in ["1", "9", "2", "8", "3"] {
        actor.store_user_message(1, content, "auto").await.unwrap();
    }
    actor.shutdown().await.unwrap();
    actor.initialize().await.unwrap();

    assert!(actor.get_turns(1).await.unwrap().is_empty());
    let archived: Vec<String> = backend.archived(1).into_iter().map(|r| r.content).collect();
    assert_eq!(archived, vec!["1", "2", "3"]);
    let durable: Vec<String> = backend.long_term(1).into_iter().map(|r| r.content).collect();
    assert_eq!(durable, vec!["9", "8"]);

    let ack = actor.store_user_message(1, "4", "auto").await.unwrap();
    assert_eq!(ack.sequence, 6);
    let turns = actor.get_turns(1).await.unwrap();
    assert_eq!(contents(&turns), vec!["4"]);
    assert_eq!(actor.get_context(1).await.unwrap().text, "4");
    actor.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_idle_workers_are_released() {
    let actor = started(config(5, 1), Arc::new(InMemoryBackend::new()), never_important).await;

    actor.store_user_message(1, "a", "auto").await.unwrap();
    actor.store_user_message(2, "b", "auto").await.unwrap();
    assert_eq!(actor.active_workers(), 2);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(actor.active_workers(), 0);

    // a returning user gets a new worker and finds their turns in place
    actor.store_user_message(1, "c", "auto").await.unwrap();
    assert_eq!(actor.active_workers(), 1);
    let turns = actor.get_turns(1).await.unwrap();
    assert_eq!(contents(&turns), vec!["a", "c"]);

    actor.shutdown().await.unwrap();
    assert_eq!(actor.active_workers(), 0);
}

#[tokio::test]
async fn test_stalled_write_does_not_block_other_users() {
    let backend = Arc::new(GatedBackend {
        inner: InMemoryBackend::new(),
        gate: Semaphore::new(0),
        gated_user: 10,
    });
    let actor = started(config(10, 1), backend.clone(), always_important).await;

    let quick = Duration::from_secs(2);
    tokio::time::timeout(quick, actor.store_user_message(10, "stuck write", "auto"))
        .await
        .expect("store returns before the write completes")
        .unwrap();

    // the same user keeps working while its write is pending
    tokio::time::timeout(quick, actor.get_context(10))
        .await
        .expect("context is not blocked")
        .unwrap();

    // so does everyone else
    for content in ["other", "users"] {
        tokio::time::timeout(quick, actor.store_user_message(11, content, "auto"))
            .await
            .expect("other users are not blocked")
            .unwrap();
    }
    tokio::time::timeout(Duration::from_millis(200), actor.flush())
        .await
        .expect_err("the gated write is still pending");
    assert_eq!(backend.inner.long_term(11).len(), 2);
    assert!(backend.inner.long_term(10).is_empty());

    backend.gate.add_permits(1);
    actor.flush().await;
    assert_eq!(backend.inner.long_term(10).len(), 1);
    actor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_same_user_requests_keep_order() {
    let actor = Arc::new(started(config(50, 1), Arc::new(InMemoryBackend::new()), never_important).await);

    let mut handles = Vec::new();
    for user_id in 20..24 {
        let actor = actor.clone();
        handles.push(tokio::spawn(async move {
            let mut acks = Vec::new();
            for i in 0..10 {
                acks.push(
                    actor
                        .store_user_message(user_id, format!("u{}-{}", user_id, i), "auto")
                        .await
                        .unwrap(),
                );
            }
            acks
        }));
    }

    for (user_id, handle) in (20..24).zip(handles) {
        let acks = handle.await.unwrap();
        let sequences: Vec<u64> = acks.iter().map(|a| a.sequence).collect();
        assert_eq!(sequences, (1..=10).collect::<Vec<u64>>());
        assert!(acks.windows(2).all(|w| w[0].request_id < w[1].request_id));

        let turns = actor.get_turns(user_id).await.unwrap();
        let expected: Vec<String> = (0..10).map(|i| format!("u{}-{}", user_id, i)).collect();
        assert_eq!(
            turns.iter().map(|t| t.content.clone()).collect::<Vec<_>>(),
            expected
        );
    }
    actor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_promotion_is_retried_by_sweep() {
    let backend = Arc::new(OutageBackend::new(true));
    let mut cfg = config(10, 1);
    cfg.retry_attempts = 2;
    let actor = started(cfg, backend.clone(), always_important).await;
    let mut events = actor.subscribe_events();

    let ack = actor
        .store_user_message(12, "remember my passport number", "auto")
        .await
        .unwrap();
    assert!(ack.promotion_scheduled);
    actor.flush().await;

    assert_eq!(actor.pending_promotions(), 1);
    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.event_type);
    }
    assert_eq!(
        kinds,
        vec![MemoryEventKind::TurnStored, MemoryEventKind::PromotionFailed]
    );

    backend.down.store(false, Ordering::SeqCst);
    actor.sweep_now().await;

    assert_eq!(actor.pending_promotions(), 0);
    assert_eq!(backend.inner.long_term(12).len(), 1);
    let turns = actor.get_turns(12).await.unwrap();
    assert!(turns[0].promoted);
    actor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_persistent_outage_abandons_promotion() {
    let backend = Arc::new(OutageBackend::new(true));
    let mut cfg = config(10, 1);
    cfg.retry_attempts = 1;
    cfg.sweep_max_attempts = 2;
    cfg.flush_stm_on_shutdown = false;
    let actor = started(cfg, backend.clone(), always_important).await;
    let mut events = actor.subscribe_events();

    actor.store_user_message(13, "my name is Bob", "auto").await.unwrap();
    actor.flush().await;

    actor.sweep_now().await;
    assert_eq!(actor.pending_promotions(), 1);
    actor.sweep_now().await;
    assert_eq!(actor.pending_promotions(), 0);

    let mut abandoned = false;
    while let Ok(event) = events.try_recv() {
        abandoned |= event.event_type == MemoryEventKind::PromotionAbandoned;
    }
    assert!(abandoned);

    backend.down.store(false, Ordering::SeqCst);
    actor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_gateway_stats_count_background_writes() {
    let actor = started(config(10, 1), Arc::new(InMemoryBackend::new()), always_important).await;

    actor.store_user_message(14, "keep me", "auto").await.unwrap();
    actor.flush().await;

    let stats = actor.gateway_stats();
    // connect plus one promotion
    assert_eq!(stats.calls, 2);
    assert_eq!(stats.succeeded, 2);
    actor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_handle_message_assigns_request_ids() {
    let actor = started(config(10, 1), Arc::new(InMemoryBackend::new()), never_important).await;

    let message = MemoryMessage::new(
        MemoryCommand::StoreUserMessage {
            user_id: 15,
            content: "hi".to_string(),
            mode: "auto".to_string(),
        },
        "test-suite",
    );
    let first = actor.handle_message(message.clone()).await.unwrap();
    let second = actor.handle_message(message).await.unwrap();

    match (first, second) {
        (MemoryReply::Stored(a), MemoryReply::Stored(b)) => {
            assert!(a.request_id >= 1);
            assert!(b.request_id > a.request_id);
            assert_eq!(b.sequence, a.sequence + 1);
        }
        other => panic!("unexpected replies: {:?}", other),
    }
    actor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_initialize_and_shutdown_are_idempotent() {
    let actor = MemoryActor::new(config(3, 1), Arc::new(InMemoryBackend::new())).unwrap();
    assert_ok!(actor.initialize().await);
    assert_ok!(actor.initialize().await);
    assert!(actor.is_running());

    assert_ok!(actor.shutdown().await);
    assert_ok!(actor.shutdown().await);
    assert!(!actor.is_running());
    assert_err!(actor.get_turns(1).await);
}

#[tokio::test]
async fn test_surreal_store_end_to_end() {
    let backend = Arc::new(SurrealBackend::new(StorageConfig::default()));
    let actor = started(config(3, 1), backend, score_from_content).await;

    actor.store_user_message(16, "7", "auto").await.unwrap();
    actor.store_bot_response(16, "1", "auto").await.unwrap();
    actor.flush().await;

    let long_term = actor.recent_long_term(16, 10).await.unwrap();
    assert_eq!(contents(&long_term), vec!["7"]);
    actor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_default_scorer_promotes_personal_facts() {
    init_tracing();
    let backend = Arc::new(InMemoryBackend::new());
    let actor = MemoryActor::new(config(10, 1), backend.clone()).unwrap();
    actor.initialize().await.unwrap();

    let fact = actor.store_user_message(17, "My name is Alice", "auto").await.unwrap();
    let chatter = actor.store_bot_response(17, "ok", "auto").await.unwrap();
    assert!(fact.promotion_scheduled);
    assert!(!chatter.promotion_scheduled);

    actor.flush().await;
    let stored = backend.long_term(17);
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].content, "My name is Alice");
    actor.shutdown().await.unwrap();
}
