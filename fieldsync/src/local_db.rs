//! Local SQLite database for offline-first operations
//!
//! Provides:
//! - Durable mutation queue backing fast push
//! - Entity tables receiving reconciled snapshot rows

use crate::error::{SyncError, SyncResult};
use crate::local_store::{LocalStore, StorageValue, WriteStatement};
use crate::mutation_queue::{Mutation, MutationQueue, MutationState, OperationType, QueueCounts};
use crate::registry::is_identifier;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite};
use std::collections::HashSet;
use std::str::FromStr;
use uuid::Uuid;

/// Configuration for local database
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalDbConfig {
    /// Path to the database file; `:memory:` for a throwaway database
    pub db_path: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Whether to enable WAL mode
    pub enable_wal: bool,
}

impl Default for LocalDbConfig {
    fn default() -> Self {
        Self {
            db_path: "fieldsync_local.db".to_string(),
            max_connections: 5,
            enable_wal: true,
        }
    }
}

/// Local database handle
#[derive(Debug, Clone)]
pub struct LocalDatabase {
    pool: SqlitePool,
}

impl LocalDatabase {
    /// Open (creating if needed) the database and its schema
    pub async fn new(config: LocalDbConfig) -> SyncResult<Self> {
        let in_memory = config.db_path == ":memory:";
        let mut options = SqliteConnectOptions::from_str(&format!("sqlite:{}", config.db_path))?
            .create_if_missing(true)
            .foreign_keys(true);

        if config.enable_wal && !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // Each in-memory connection is its own database
        let max_connections = if in_memory { 1 } else { config.max_connections.max(1) };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.initialize_schema().await?;

        tracing::debug!(db_path = %config.db_path, "Opened local database");
        Ok(db)
    }

    /// Initialize database schema
    async fn initialize_schema(&self) -> SyncResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mutation_queue (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                entity TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                operation TEXT NOT NULL,
                payload TEXT NOT NULL,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_mutation_queue_state ON mutation_queue(state)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_mutation_queue_entity ON mutation_queue(entity, entity_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close database connection
    pub async fn close(self) -> SyncResult<()> {
        self.pool.close().await;
        Ok(())
    }

    async fn update_state(
        &self,
        ids: &[Uuid],
        assignments: &str,
        required_state: Option<MutationState>,
        reason: Option<&str>,
    ) -> SyncResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut sql = format!("UPDATE mutation_queue SET {} WHERE id IN ({})", assignments, placeholders(ids.len()));
        if required_state.is_some() {
            sql.push_str(" AND state = ?");
        }

        let mut query = sqlx::query(&sql);
        if let Some(reason) = reason {
            query = query.bind(reason);
        }
        for id in ids {
            query = query.bind(id.to_string());
        }
        if let Some(state) = required_state {
            query = query.bind(state.as_str());
        }

        Ok(query.execute(&self.pool).await?.rows_affected())
    }

    async fn move_all(&self, from: MutationState, to: MutationState) -> SyncResult<usize> {
        let result = sqlx::query("UPDATE mutation_queue SET state = ? WHERE state = ?")
            .bind(to.as_str())
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }
}

/// SQLite's default SQLITE_MAX_VARIABLE_NUMBER
const MAX_BIND_VALUES: usize = 32_766;

fn bind_values(sql: &str, values: Vec<StorageValue>) -> Query<'_, Sqlite, SqliteArguments<'_>> {
    let mut query = sqlx::query(sql);
    for value in values {
        query = match value {
            StorageValue::Null => query.bind(None::<String>),
            StorageValue::Integer(i) => query.bind(i),
            StorageValue::Real(f) => query.bind(f),
            StorageValue::Text(s) => query.bind(s),
        };
    }
    query
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn mutation_from_row(row: &sqlx::sqlite::SqliteRow) -> SyncResult<Mutation> {
    let id: String = row.try_get("id")?;
    let operation: String = row.try_get("operation")?;
    let payload: String = row.try_get("payload")?;
    let state: String = row.try_get("state")?;
    let created_at: String = row.try_get("created_at")?;
    let attempts: i64 = row.try_get("attempts")?;

    Ok(Mutation {
        id: Uuid::parse_str(&id).map_err(|e| SyncError::Internal(format!("Invalid UUID: {}", e)))?,
        entity: row.try_get("entity")?,
        entity_id: row.try_get("entity_id")?,
        operation: OperationType::parse(&operation)?,
        payload: serde_json::from_str(&payload)?,
        state: MutationState::parse(&state)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| SyncError::Internal(format!("Invalid timestamp: {}", e)))?
            .with_timezone(&Utc),
        attempts: u32::try_from(attempts).unwrap_or(0),
        last_error: row.try_get("last_error")?,
    })
}

#[async_trait]
impl MutationQueue for LocalDatabase {
    async fn enqueue(&self, mutation: Mutation) -> SyncResult<Uuid> {
        sqlx::query(
            r#"
            INSERT INTO mutation_queue (
                id, entity, entity_id, operation, payload,
                state, created_at, attempts, last_error
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(mutation.id.to_string())
        .bind(&mutation.entity)
        .bind(&mutation.entity_id)
        .bind(mutation.operation.as_str())
        .bind(mutation.payload.to_string())
        .bind(MutationState::Pending.as_str())
        .bind(mutation.created_at.to_rfc3339())
        .bind(i64::from(mutation.attempts))
        .bind(mutation.last_error.clone())
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            mutation_id = %mutation.id,
            entity = %mutation.entity,
            entity_id = %mutation.entity_id,
            operation = ?mutation.operation,
            "Queued mutation"
        );

        Ok(mutation.id)
    }

    async fn get_pending(&self, entity: Option<&str>) -> SyncResult<Vec<Mutation>> {
        let rows = match entity {
            Some(entity) => {
                sqlx::query(
                    "SELECT * FROM mutation_queue WHERE state = ? AND entity = ? ORDER BY seq ASC",
                )
                .bind(MutationState::Pending.as_str())
                .bind(entity)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM mutation_queue WHERE state = ? ORDER BY seq ASC")
                    .bind(MutationState::Pending.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter().map(mutation_from_row).collect()
    }

    async fn mark_processing(&self, ids: &[Uuid]) -> SyncResult<()> {
        self.update_state(
            ids,
            "state = 'PROCESSING', attempts = attempts + 1",
            Some(MutationState::Pending),
            None,
        )
        .await?;
        Ok(())
    }

    async fn mark_completed(&self, ids: &[Uuid]) -> SyncResult<()> {
        self.update_state(ids, "state = 'COMPLETED', last_error = NULL", None, None)
            .await?;
        Ok(())
    }

    async fn mark_failed(&self, ids: &[Uuid], reason: &str) -> SyncResult<()> {
        self.update_state(ids, "state = 'FAILED', last_error = ?", None, Some(reason))
            .await?;
        tracing::warn!(count = ids.len(), reason = reason, "Mutations rejected by server");
        Ok(())
    }

    async fn release(&self, ids: &[Uuid]) -> SyncResult<()> {
        self.update_state(ids, "state = 'PENDING'", Some(MutationState::Processing), None)
            .await?;
        Ok(())
    }

    async fn reset_failed(&self) -> SyncResult<usize> {
        self.move_all(MutationState::Failed, MutationState::Pending).await
    }

    async fn recover_interrupted(&self) -> SyncResult<usize> {
        let recovered = self
            .move_all(MutationState::Processing, MutationState::Pending)
            .await?;
        if recovered > 0 {
            tracing::info!(recovered, "Recovered mutations left in PROCESSING");
        }
        Ok(recovered)
    }

    async fn purge_completed(&self) -> SyncResult<usize> {
        let result = sqlx::query("DELETE FROM mutation_queue WHERE state = ?")
            .bind(MutationState::Completed.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn counts(&self) -> SyncResult<QueueCounts> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM mutation_queue GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = QueueCounts::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let n: i64 = row.try_get("n")?;
            let n = usize::try_from(n).unwrap_or(0);
            match MutationState::parse(&state)? {
                MutationState::Pending => counts.pending = n,
                MutationState::Processing => counts.processing = n,
                MutationState::Completed => counts.completed = n,
                MutationState::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }

    async fn unsynced_entity_ids(&self, entity: &str) -> SyncResult<HashSet<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT entity_id FROM mutation_queue WHERE entity = ? AND state IN (?, ?)",
        )
        .bind(entity)
        .bind(MutationState::Pending.as_str())
        .bind(MutationState::Processing.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("entity_id").map_err(SyncError::from))
            .collect()
    }
}

#[async_trait]
impl LocalStore for LocalDatabase {
    async fn ensure_table(&self, table: &str, columns: &[String]) -> SyncResult<()> {
        if !is_identifier(table) || columns.iter().any(|c| !is_identifier(c)) {
            return Err(SyncError::InvalidConfig(format!("invalid table definition for {}", table)));
        }
        let Some(id_column) = columns.first() else {
            return Err(SyncError::InvalidConfig(format!("table {} has no columns", table)));
        };

        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({}, PRIMARY KEY ({}))",
            table,
            columns.join(", "),
            id_column
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn execute(&self, statement: WriteStatement) -> SyncResult<u64> {
        let parts = statement.split(MAX_BIND_VALUES);
        if parts.len() > 1 {
            tracing::debug!(statements = parts.len(), "Split bulk write to stay under the bind limit");
        }

        // all or nothing, like the single statement it replaces
        let mut tx = self.pool.begin().await?;
        let mut affected = 0;
        for part in parts {
            let WriteStatement { sql, values, .. } = part;
            affected += bind_values(&sql, values).execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;

        Ok(affected)
    }
}
