//! SurrealDB backend
//!
//! Uses the any-engine so one backend covers embedded memory (`mem://`),
//! embedded RocksDB (`rocksdb://path`) and remote servers (`ws://`, `http://`).

use async_trait::async_trait;
use serde::Deserialize;
use surrealdb::Surreal;
use surrealdb::engine::any::{self, Any};
use surrealdb::opt::auth::Root;
use tokio::sync::RwLock;

use super::{
    ARCHIVE_TABLE, BackendError, LONG_TERM_TABLE, PersistenceBackend, Query, QueryOutput,
    TurnRecord,
};
use crate::config::StorageConfig;

const RECORD_FIELDS: &str = "turn_id, user_id, sequence, role, mode, content, created_at, importance";

#[derive(Debug, Deserialize)]
struct CountRow {
    count: u64,
}

/// SurrealDB-backed durable store
pub struct SurrealBackend {
    config: StorageConfig,
    db: RwLock<Option<Surreal<Any>>>,
}

impl SurrealBackend {
    /// Create an unconnected backend
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            db: RwLock::new(None),
        }
    }

    async fn client(&self) -> Result<Surreal<Any>, BackendError> {
        self.db
            .read()
            .await
            .clone()
            .ok_or_else(|| BackendError::transient("SurrealDB connection is not open"))
    }

    /// Create the tables and indexes if they are missing
    async fn create_schema(db: &Surreal<Any>) -> Result<(), BackendError> {
        for table in [LONG_TERM_TABLE, ARCHIVE_TABLE] {
            let statements = format!(
                "DEFINE TABLE IF NOT EXISTS {table} SCHEMALESS;
                 DEFINE INDEX IF NOT EXISTS {table}_user_idx ON {table} FIELDS user_id;"
            );
            db.query(statements)
                .await
                .map_err(classify)?
                .check()
                .map_err(classify)?;
        }
        Ok(())
    }

    async fn upsert(db: &Surreal<Any>, table: &str, record: &TurnRecord) -> Result<(), BackendError> {
        let statement =
            format!("UPSERT type::thing('{table}', $turn_id) CONTENT $record RETURN NONE");
        db.query(statement)
            .bind(("turn_id", record.turn_id.clone()))
            .bind(("record", record.clone()))
            .await
            .map_err(classify)?
            .check()
            .map_err(classify)?;
        Ok(())
    }
}

/// API errors (transport, connection) are worth retrying; database errors
/// (bad statement, bad data) are not.
fn classify(err: surrealdb::Error) -> BackendError {
    match err {
        surrealdb::Error::Api(e) => BackendError::transient(format!("SurrealDB API error: {}", e)),
        other => BackendError::permanent(format!("SurrealDB error: {}", other)),
    }
}

#[async_trait]
impl PersistenceBackend for SurrealBackend {
    async fn connect(&self) -> Result<(), BackendError> {
        let mut guard = self.db.write().await;
        if guard.is_some() {
            return Ok(());
        }

        let db = any::connect(self.config.url.as_str())
            .await
            .map_err(|e| {
                BackendError::transient(format!(
                    "Failed to connect to SurrealDB at {}: {}",
                    self.config.url, e
                ))
            })?;

        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            db.signin(Root {
                username: username.as_str(),
                password: password.as_str(),
            })
            .await
            .map_err(|e| BackendError::permanent(format!("SurrealDB sign-in failed: {}", e)))?;
        }

        db.use_ns(self.config.namespace.as_str())
            .use_db(self.config.database.as_str())
            .await
            .map_err(|e| {
                BackendError::transient(format!("Failed to set namespace/database: {}", e))
            })?;

        Self::create_schema(&db).await?;

        tracing::debug!(url = %self.config.url, "SurrealDB schema ready");
        *guard = Some(db);
        Ok(())
    }

    async fn execute(&self, query: &Query) -> Result<QueryOutput, BackendError> {
        let db = self.client().await?;

        match query {
            Query::Ping => {
                db.query("RETURN true")
                    .await
                    .map_err(classify)?
                    .check()
                    .map_err(classify)?;
                Ok(QueryOutput::Unit)
            }
            Query::UpsertLongTerm(record) => {
                Self::upsert(&db, LONG_TERM_TABLE, record).await?;
                Ok(QueryOutput::Written(1))
            }
            Query::ArchiveBatch(records) => {
                if records.is_empty() {
                    return Ok(QueryOutput::Written(0));
                }
                // one transaction per batch
                let statement = format!(
                    "BEGIN TRANSACTION;
                     FOR $record IN $records {{
                         UPSERT type::thing('{ARCHIVE_TABLE}', $record.turn_id) CONTENT $record RETURN NONE;
                     }};
                     COMMIT TRANSACTION;"
                );
                db.query(statement)
                    .bind(("records", records.clone()))
                    .await
                    .map_err(classify)?
                    .check()
                    .map_err(classify)?;
                Ok(QueryOutput::Written(records.len()))
            }
            Query::RecentLongTerm { user_id, limit } => {
                let statement = format!(
                    "SELECT {RECORD_FIELDS} FROM {LONG_TERM_TABLE} WHERE user_id = $user_id \
                     ORDER BY created_at DESC, sequence DESC LIMIT {limit}"
                );
                let mut response = db
                    .query(statement)
                    .bind(("user_id", *user_id))
                    .await
                    .map_err(classify)?
                    .check()
                    .map_err(classify)?;
                let rows: Vec<TurnRecord> = response.take(0).map_err(|e| {
                    BackendError::permanent(format!("Failed to decode turn records: {}", e))
                })?;
                Ok(QueryOutput::Rows(rows))
            }
            Query::CountLongTerm { user_id } => {
                let statement = format!(
                    "SELECT count() AS count FROM {LONG_TERM_TABLE} WHERE user_id = $user_id GROUP ALL"
                );
                let mut response = db
                    .query(statement)
                    .bind(("user_id", *user_id))
                    .await
                    .map_err(classify)?
                    .check()
                    .map_err(classify)?;
                let row: Option<CountRow> = response.take(0).map_err(|e| {
                    BackendError::permanent(format!("Failed to decode count: {}", e))
                })?;
                Ok(QueryOutput::Count(row.map(|r| r.count).unwrap_or(0)))
            }
        }
    }

    async fn close(&self) -> Result<(), BackendError> {
        // Dropping the last client handle shuts the engine down
        self.db.write().await.take();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "surrealdb"
    }
}
