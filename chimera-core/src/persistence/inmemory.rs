//! In-process backend for testing and ephemeral deployments
//!
//! Records live in two maps keyed by turn id, one per tier. Nothing survives a
//! restart, so this backend suits:
//!
//! - Unit and integration testing
//! - Local runs of the CLI without a database

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{BackendError, PersistenceBackend, Query, QueryOutput, TurnRecord};
use crate::memory::turn::UserId;

/// In-process backend
pub struct InMemoryBackend {
    long_term: RwLock<HashMap<String, TurnRecord>>,
    archive: RwLock<HashMap<String, TurnRecord>>,
    connected: AtomicBool,
    writes: AtomicU64,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self {
            long_term: RwLock::new(HashMap::new()),
            archive: RwLock::new(HashMap::new()),
            connected: AtomicBool::new(false),
            writes: AtomicU64::new(0),
        }
    }

    /// Promoted records of a user, oldest first
    pub fn long_term(&self, user_id: UserId) -> Vec<TurnRecord> {
        Self::for_user(&self.long_term.read(), user_id)
    }

    /// Archived records of a user, oldest first
    pub fn archived(&self, user_id: UserId) -> Vec<TurnRecord> {
        Self::for_user(&self.archive.read(), user_id)
    }

    /// Number of write statements executed (each upsert or archive batch
    /// counts once)
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Clear both tiers
    pub fn clear(&self) {
        self.long_term.write().clear();
        self.archive.write().clear();
        self.writes.store(0, Ordering::SeqCst);
    }

    fn for_user(table: &HashMap<String, TurnRecord>, user_id: UserId) -> Vec<TurnRecord> {
        let mut records: Vec<TurnRecord> = table
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.sequence.cmp(&b.sequence))
        });
        records
    }
}

#[async_trait]
impl PersistenceBackend for InMemoryBackend {
    async fn connect(&self) -> Result<(), BackendError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn execute(&self, query: &Query) -> Result<QueryOutput, BackendError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BackendError::transient("in-memory backend is not connected"));
        }

        match query {
            Query::Ping => Ok(QueryOutput::Unit),
            Query::UpsertLongTerm(record) => {
                self.long_term
                    .write()
                    .insert(record.turn_id.clone(), record.clone());
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(QueryOutput::Written(1))
            }
            Query::ArchiveBatch(records) => {
                let mut archive = self.archive.write();
                for record in records {
                    archive.insert(record.turn_id.clone(), record.clone());
                }
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(QueryOutput::Written(records.len()))
            }
            Query::RecentLongTerm { user_id, limit } => {
                let mut records = self.long_term(*user_id);
                records.reverse();
                records.truncate(*limit);
                Ok(QueryOutput::Rows(records))
            }
            Query::CountLongTerm { user_id } => {
                let count = self
                    .long_term
                    .read()
                    .values()
                    .filter(|r| r.user_id == *user_id)
                    .count();
                Ok(QueryOutput::Count(count as u64))
            }
        }
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}
