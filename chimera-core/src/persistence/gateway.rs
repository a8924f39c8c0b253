//! Persistence gateway: deadline, bounded retry and call accounting
//!
//! Call state machine:
//!
//! - `Pending -> Done` on success
//! - `Pending -> Pending` after `retry_delay` on a transient failure with tries left
//! - `Pending -> Failed(PersistenceFailure)` when tries run out or the failure is permanent
//! - `Pending -> Failed(Timeout)` when the whole call outlives `query_timeout`

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use super::retry::{RetryPolicy, RetryState};
use super::{BackendError, PersistenceBackend, Query, QueryOutput};
use crate::config::MemoryConfig;
use crate::error::{MemoryError, Result};

/// Call counters, updated only when performance logging is enabled
#[derive(Debug, Default)]
pub struct GatewayStats {
    calls: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    retries: AtomicU64,
    total_latency_us: AtomicU64,
    max_latency_us: AtomicU64,
}

/// Point-in-time copy of [`GatewayStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GatewayStatsSnapshot {
    /// Calls made
    pub calls: u64,
    /// Calls that returned a result
    pub succeeded: u64,
    /// Calls that ended in `PersistenceFailure`
    pub failed: u64,
    /// Calls that ended in `Timeout`
    pub timed_out: u64,
    /// Extra tries beyond the first
    pub retries: u64,
    /// Sum of call latencies in microseconds
    pub total_latency_us: u64,
    /// Slowest call in microseconds
    pub max_latency_us: u64,
}

impl GatewayStatsSnapshot {
    /// Mean call latency
    pub fn mean_latency(&self) -> Duration {
        if self.calls == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.total_latency_us / self.calls)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallOutcome {
    Succeeded,
    Failed,
    TimedOut,
}

impl CallOutcome {
    fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => CallOutcome::Succeeded,
            Err(MemoryError::Timeout { .. }) => CallOutcome::TimedOut,
            Err(_) => CallOutcome::Failed,
        }
    }
}

impl GatewayStats {
    fn record(&self, latency: Duration, attempts: usize, outcome: CallOutcome) {
        let micros = latency.as_micros() as u64;
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.retries
            .fetch_add(attempts.saturating_sub(1) as u64, Ordering::Relaxed);
        self.total_latency_us.fetch_add(micros, Ordering::Relaxed);
        self.max_latency_us.fetch_max(micros, Ordering::Relaxed);

        let counter = match outcome {
            CallOutcome::Succeeded => &self.succeeded,
            CallOutcome::Failed => &self.failed,
            CallOutcome::TimedOut => &self.timed_out,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the counters
    pub fn snapshot(&self) -> GatewayStatsSnapshot {
        GatewayStatsSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            total_latency_us: self.total_latency_us.load(Ordering::Relaxed),
            max_latency_us: self.max_latency_us.load(Ordering::Relaxed),
        }
    }
}

/// Shared entry point to the durable store
pub struct PersistenceGateway {
    backend: Arc<dyn PersistenceBackend>,
    retry: RetryPolicy,
    timeout: Duration,
    permits: Semaphore,
    connected: AtomicBool,
    performance_log: bool,
    stats: GatewayStats,
}

impl std::fmt::Debug for PersistenceGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceGateway")
            .field("backend", &self.backend.name())
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl PersistenceGateway {
    /// Create a gateway using the memory configuration's timeout, retry,
    /// concurrency and logging options
    pub fn new(backend: Arc<dyn PersistenceBackend>, config: &MemoryConfig) -> Self {
        Self::with_policy(
            backend,
            RetryPolicy::new(config.retry_attempts, config.retry_delay()),
            config.query_timeout(),
            config.max_concurrent_queries,
            config.performance_log_enabled,
        )
    }

    /// Create a gateway with explicit settings
    pub fn with_policy(
        backend: Arc<dyn PersistenceBackend>,
        retry: RetryPolicy,
        timeout: Duration,
        max_concurrent: usize,
        performance_log: bool,
    ) -> Self {
        Self {
            backend,
            retry,
            timeout,
            permits: Semaphore::new(max_concurrent.max(1)),
            connected: AtomicBool::new(false),
            performance_log,
            stats: GatewayStats::default(),
        }
    }

    /// Open the backend connection, under the same deadline and retry policy
    /// as queries
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let backend = self.backend.clone();
        self.call("connect", || {
            let backend = backend.clone();
            async move { backend.connect().await }
        })
        .await?;

        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(backend = self.backend.name(), "Persistence gateway connected");
        Ok(())
    }

    /// Release the backend connection. Later calls fail with `NotInitialized`.
    pub async fn close(&self) -> Result<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.backend
            .close()
            .await
            .map_err(|e| MemoryError::Backend(e.message))?;
        tracing::info!(backend = self.backend.name(), "Persistence gateway closed");
        Ok(())
    }

    /// Whether `connect` has completed and `close` has not been called
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Execute a query with deadline and retries.
    ///
    /// # Errors
    ///
    /// - `NotInitialized` before `connect`
    /// - `Timeout` when the call, retries included, exceeds the deadline
    /// - `PersistenceFailure` when tries run out or the backend reports a
    ///   permanent failure
    pub async fn execute(&self, query: Query) -> Result<QueryOutput> {
        if !self.is_connected() {
            return Err(MemoryError::NotInitialized);
        }

        let backend = &self.backend;
        let query = &query;
        self.call(query.kind(), || backend.execute(query)).await
    }

    /// Counters collected so far
    pub fn stats(&self) -> GatewayStatsSnapshot {
        self.stats.snapshot()
    }

    /// Name of the underlying backend
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    async fn call<T, F, Fut>(&self, kind: &'static str, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, BackendError>>,
    {
        let started = Instant::now();
        let attempts = AtomicUsize::new(0);

        let result = match tokio::time::timeout(
            self.timeout,
            self.run_attempts(kind, &attempts, operation),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(MemoryError::Timeout {
                query: kind,
                elapsed_ms: started.elapsed().as_millis() as u64,
            }),
        };

        if self.performance_log {
            let latency = started.elapsed();
            let attempts = attempts.load(Ordering::SeqCst);
            let outcome = CallOutcome::of(&result);
            self.stats.record(latency, attempts, outcome);
            tracing::debug!(
                query = kind,
                attempts,
                latency_ms = latency.as_millis() as u64,
                outcome = ?outcome,
                "Gateway call finished"
            );
        }

        result
    }

    async fn run_attempts<T, F, Fut>(
        &self,
        kind: &'static str,
        attempts: &AtomicUsize,
        operation: F,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, BackendError>>,
    {
        let mut state = RetryState::new(self.retry.clone());

        loop {
            let result = {
                let _permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(|_| MemoryError::NotInitialized)?;
                operation().await
            };

            match result {
                Ok(value) => {
                    attempts.store(state.attempts() + 1, Ordering::SeqCst);
                    return Ok(value);
                }
                Err(err) => {
                    state.record_attempt();
                    attempts.store(state.attempts(), Ordering::SeqCst);

                    if !err.transient || !state.should_retry() {
                        return Err(MemoryError::PersistenceFailure {
                            attempts: state.attempts(),
                            message: err.message,
                        });
                    }

                    tracing::warn!(
                        query = kind,
                        attempt = state.attempts(),
                        remaining = state.remaining_attempts(),
                        error = %err,
                        "Gateway call failed, retrying"
                    );
                    tokio::time::sleep(state.next_delay()).await;
                }
            }
        }
    }
}
