//! Postgres-backed outbox store.
//!
//! ## Claiming
//!
//! Two strategies with identical semantics (see [`ClaimStrategy`]):
//!
//! - `PerRow`: select candidate ids, then lease each with a conditional
//!   `UPDATE ... WHERE id = $1 AND <claimable>`. The predicate is re-evaluated
//!   by the `UPDATE` itself, so two workers racing for a row cannot both see
//!   `rows_affected = 1`.
//! - `SetBased`: one `UPDATE ... WHERE id IN (SELECT ... FOR UPDATE SKIP LOCKED)
//!   RETURNING *`. Competing workers skip each other's locked candidates
//!   instead of blocking.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | OutboxStoreError |
//! |------------|----------------------|------------------|
//! | Database (unique violation) on insert | `23505` | `AlreadyExists` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / RowNotFound / Other | N/A | `Storage` |
//! | Row decode failure | N/A | `Serialization` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgConnection, PgPool, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use bankrelay_core::EventId;

use super::retry::RetryPolicy;
use super::row::{OutboxRow, truncate_error};
use super::store::{FailureOutcome, OutboxStats, OutboxStore, OutboxStoreError, lease_expiry};

const MIGRATION: &str = include_str!("../../migrations/0001_create_outbox_messages.sql");

const COLUMNS: &str = "id, occurred_at, created_at, type, payload, correlation_id, aggregate_id, \
     key, processed_at, error, attempts, next_attempt_at, locked_by, locked_until, dead_lettered_at";

/// How `claim_batch` acquires leases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStrategy {
    /// Candidate select (over-fetched) followed by one conditional update per row.
    #[default]
    PerRow,
    /// A single conditional update over a `SKIP LOCKED` subselect.
    SetBased,
}

impl ClaimStrategy {
    /// Candidates fetched per requested row in `PerRow` mode, so rows lost to
    /// competing workers can be replaced from the same scan.
    pub const OVERFETCH_FACTOR: usize = 3;
}

impl std::str::FromStr for ClaimStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per_row" | "per-row" | "perrow" => Ok(Self::PerRow),
            "set_based" | "set-based" | "setbased" => Ok(Self::SetBased),
            other => Err(format!("unknown claim strategy '{other}'")),
        }
    }
}

/// Postgres-backed outbox.
///
/// `Send + Sync`; all work goes through the SQLx pool.
#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: Arc<PgPool>,
    strategy: ClaimStrategy,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            strategy: ClaimStrategy::default(),
        }
    }

    pub fn with_claim_strategy(mut self, strategy: ClaimStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn claim_strategy(&self) -> ClaimStrategy {
        self.strategy
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `outbox_messages` table and its indexes if missing.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), OutboxStoreError> {
        sqlx::raw_sql(MIGRATION)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    #[instrument(skip(self, rows), fields(row_count = rows.len()), err)]
    async fn insert(&self, rows: Vec<OutboxRow>) -> Result<(), OutboxStoreError> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        insert_rows(&mut tx, &rows).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    #[instrument(
        skip(self),
        fields(strategy = ?self.strategy, claimed = tracing::field::Empty),
        err
    )]
    async fn claim(
        &self,
        take: usize,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRow>, OutboxStoreError> {
        let locked_until = lease_expiry(now, lease)?;
        if take == 0 {
            return Ok(Vec::new());
        }

        let mut claimed = match self.strategy {
            ClaimStrategy::PerRow => self.claim_per_row(take, worker_id, locked_until, now).await?,
            ClaimStrategy::SetBased => {
                self.claim_set_based(take, worker_id, locked_until, now).await?
            }
        };

        claimed.sort_by_key(|r| (r.occurred_at, r.id));
        tracing::Span::current().record("claimed", claimed.len());
        Ok(claimed)
    }

    async fn claim_per_row(
        &self,
        take: usize,
        worker_id: &str,
        locked_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRow>, OutboxStoreError> {
        let limit = take.saturating_mul(ClaimStrategy::OVERFETCH_FACTOR);

        let candidates = sqlx::query(
            r#"
            SELECT id
            FROM outbox_messages
            WHERE processed_at IS NULL
                AND dead_lettered_at IS NULL
                AND (next_attempt_at IS NULL OR next_attempt_at <= $1)
                AND (locked_until IS NULL OR locked_until < $1)
            ORDER BY occurred_at ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(to_i64(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("select_claim_candidates", e))?;

        let update = format!(
            r#"
            UPDATE outbox_messages
            SET locked_by = $2, locked_until = $3
            WHERE id = $1
                AND processed_at IS NULL
                AND dead_lettered_at IS NULL
                AND (next_attempt_at IS NULL OR next_attempt_at <= $4)
                AND (locked_until IS NULL OR locked_until < $4)
            RETURNING {COLUMNS}
            "#
        );

        let mut claimed = Vec::with_capacity(take);
        for candidate in candidates {
            if claimed.len() >= take {
                break;
            }
            let id: Uuid = candidate
                .try_get("id")
                .map_err(|e| OutboxStoreError::Serialization(format!("failed to read id: {e}")))?;

            let row = sqlx::query(&update)
                .bind(id)
                .bind(worker_id)
                .bind(locked_until)
                .bind(now)
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("lease_row", e))?;

            match row {
                Some(row) => claimed.push(decode(&row)?),
                None => debug!(outbox_id = %id, "candidate taken by another worker"),
            }
        }
        Ok(claimed)
    }

    async fn claim_set_based(
        &self,
        take: usize,
        worker_id: &str,
        locked_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRow>, OutboxStoreError> {
        let sql = format!(
            r#"
            UPDATE outbox_messages
            SET locked_by = $1, locked_until = $2
            WHERE id IN (
                SELECT id
                FROM outbox_messages
                WHERE processed_at IS NULL
                    AND dead_lettered_at IS NULL
                    AND (next_attempt_at IS NULL OR next_attempt_at <= $3)
                    AND (locked_until IS NULL OR locked_until < $3)
                ORDER BY occurred_at ASC, id ASC
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {COLUMNS}
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(worker_id)
            .bind(locked_until)
            .bind(now)
            .bind(to_i64(take))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_set_based", e))?;

        rows.iter().map(decode).collect()
    }

    #[instrument(skip(self), fields(outbox_id = %id), err)]
    async fn set_processed(
        &self,
        id: EventId,
        processed_at: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET processed_at = $2, error = NULL, locked_by = NULL, locked_until = NULL
            WHERE id = $1 AND processed_at IS NULL AND dead_lettered_at IS NULL
            "#,
        )
        .bind(id.as_uuid())
        .bind(processed_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_processed", e))?;

        if result.rows_affected() == 0 && !self.exists(id).await? {
            return Err(OutboxStoreError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self, error, policy), fields(outbox_id = %id), err)]
    async fn set_failed(
        &self,
        id: EventId,
        error: &str,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Result<FailureOutcome, OutboxStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let current = sqlx::query(
            r#"
            SELECT attempts, processed_at, dead_lettered_at
            FROM outbox_messages
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("load_attempts", e))?
        .ok_or(OutboxStoreError::NotFound(id))?;

        let processed_at: Option<DateTime<Utc>> = current
            .try_get("processed_at")
            .map_err(|e| OutboxStoreError::Serialization(format!("failed to read processed_at: {e}")))?;
        let dead_lettered_at: Option<DateTime<Utc>> = current
            .try_get("dead_lettered_at")
            .map_err(|e| {
                OutboxStoreError::Serialization(format!("failed to read dead_lettered_at: {e}"))
            })?;
        if processed_at.is_some() || dead_lettered_at.is_some() {
            return Ok(FailureOutcome::Unchanged);
        }

        let attempts: i32 = current
            .try_get("attempts")
            .map_err(|e| OutboxStoreError::Serialization(format!("failed to read attempts: {e}")))?;
        let attempts = u32::try_from(attempts).unwrap_or(0).saturating_add(1);

        let next_attempt_at = policy.next_attempt_at(attempts, now);
        let dead_lettered_at = next_attempt_at.is_none().then_some(now);

        sqlx::query(
            r#"
            UPDATE outbox_messages
            SET attempts = $2,
                error = $3,
                next_attempt_at = $4,
                dead_lettered_at = $5,
                locked_by = NULL,
                locked_until = NULL
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(to_i32(attempts))
        .bind(truncate_error(error))
        .bind(next_attempt_at)
        .bind(dead_lettered_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("mark_failed", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(match next_attempt_at {
            Some(next_attempt_at) => FailureOutcome::Retrying {
                attempts,
                next_attempt_at,
            },
            None => FailureOutcome::DeadLettered { attempts },
        })
    }

    async fn exists(&self, id: EventId) -> Result<bool, OutboxStoreError> {
        let row = sqlx::query("SELECT 1 AS present FROM outbox_messages WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("exists", e))?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn add_range(&self, rows: Vec<OutboxRow>) -> Result<(), OutboxStoreError> {
        self.insert(rows).await
    }

    async fn claim_batch(
        &self,
        take: usize,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRow>, OutboxStoreError> {
        self.claim(take, worker_id, lease, now).await
    }

    async fn mark_processed(
        &self,
        id: EventId,
        processed_at: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        self.set_processed(id, processed_at).await
    }

    async fn mark_failed(
        &self,
        id: EventId,
        error: &str,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Result<FailureOutcome, OutboxStoreError> {
        self.set_failed(id, error, now, policy).await
    }

    async fn get(&self, id: EventId) -> Result<Option<OutboxRow>, OutboxStoreError> {
        let sql = format!("SELECT {COLUMNS} FROM outbox_messages WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(decode).transpose()
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<OutboxRow>, OutboxStoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM outbox_messages \
             WHERE dead_lettered_at IS NOT NULL \
             ORDER BY dead_lettered_at ASC, id ASC LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(to_i64(limit))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_dead_letters", e))?;

        rows.iter().map(decode).collect()
    }

    async fn requeue_dead_letter(&self, id: EventId) -> Result<OutboxRow, OutboxStoreError> {
        let sql = format!(
            r#"
            UPDATE outbox_messages
            SET attempts = 0,
                dead_lettered_at = NULL,
                next_attempt_at = NULL,
                locked_by = NULL,
                locked_until = NULL
            WHERE id = $1 AND dead_lettered_at IS NOT NULL
            RETURNING {COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("requeue_dead_letter", e))?
            .ok_or(OutboxStoreError::NotFound(id))?;

        decode(&row)
    }

    async fn purge_processed(&self, before: DateTime<Utc>) -> Result<u64, OutboxStoreError> {
        let result = sqlx::query(
            "DELETE FROM outbox_messages WHERE processed_at IS NOT NULL AND processed_at < $1",
        )
        .bind(before)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("purge_processed", e))?;

        Ok(result.rows_affected())
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<OutboxStats, OutboxStoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE processed_at IS NOT NULL) AS processed,
                COUNT(*) FILTER (WHERE dead_lettered_at IS NOT NULL) AS dead_lettered,
                COUNT(*) FILTER (
                    WHERE processed_at IS NULL AND dead_lettered_at IS NULL
                        AND locked_until >= $1
                ) AS leased,
                COUNT(*) FILTER (
                    WHERE processed_at IS NULL AND dead_lettered_at IS NULL
                        AND (locked_until IS NULL OR locked_until < $1)
                        AND next_attempt_at > $1
                ) AS retrying,
                COUNT(*) FILTER (
                    WHERE processed_at IS NULL AND dead_lettered_at IS NULL
                        AND (locked_until IS NULL OR locked_until < $1)
                        AND (next_attempt_at IS NULL OR next_attempt_at <= $1)
                ) AS pending
            FROM outbox_messages
            "#,
        )
        .bind(now)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let count = |column: &str| -> Result<usize, OutboxStoreError> {
            let n: i64 = row.try_get(column).map_err(|e| {
                OutboxStoreError::Serialization(format!("failed to read {column}: {e}"))
            })?;
            Ok(usize::try_from(n).unwrap_or(0))
        };

        Ok(OutboxStats {
            pending: count("pending")?,
            leased: count("leased")?,
            retrying: count("retrying")?,
            processed: count("processed")?,
            dead_lettered: count("dead_lettered")?,
        })
    }
}

/// Insert staged rows on an open connection or transaction.
pub(crate) async fn insert_rows(
    conn: &mut PgConnection,
    rows: &[OutboxRow],
) -> Result<(), OutboxStoreError> {
    for row in rows {
        sqlx::query(
            r#"
            INSERT INTO outbox_messages (
                id,
                occurred_at,
                created_at,
                type,
                payload,
                correlation_id,
                aggregate_id,
                key,
                attempts
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(row.id.as_uuid())
        .bind(row.occurred_at)
        .bind(row.created_at)
        .bind(&row.event_type)
        .bind(&row.payload)
        .bind(row.correlation_id.as_deref())
        .bind(row.aggregate_id.as_deref())
        .bind(row.key.as_deref())
        .bind(to_i32(row.attempts))
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                OutboxStoreError::AlreadyExists(row.id)
            } else {
                map_sqlx_error("insert_outbox_row", e)
            }
        })?;
    }
    Ok(())
}

fn decode(row: &PgRow) -> Result<OutboxRow, OutboxStoreError> {
    OutboxRecord::from_row(row)
        .map(Into::into)
        .map_err(|e| OutboxStoreError::Serialization(format!("failed to decode outbox row: {e}")))
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn to_i32(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

/// Map SQLx errors to OutboxStoreError.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> OutboxStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            OutboxStoreError::Storage(format!(
                "database error in {operation} ({code}): {}",
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => {
            OutboxStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::RowNotFound => {
            OutboxStoreError::Storage(format!("unexpected row not found in {operation}"))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            OutboxStoreError::Serialization(format!("decode error in {operation}: {err}"))
        }
        _ => OutboxStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row type

#[derive(Debug)]
struct OutboxRecord {
    id: Uuid,
    occurred_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    event_type: String,
    payload: String,
    correlation_id: Option<String>,
    aggregate_id: Option<String>,
    key: Option<String>,
    processed_at: Option<DateTime<Utc>>,
    error: Option<String>,
    attempts: i32,
    next_attempt_at: Option<DateTime<Utc>>,
    locked_by: Option<String>,
    locked_until: Option<DateTime<Utc>>,
    dead_lettered_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for OutboxRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(OutboxRecord {
            id: row.try_get("id")?,
            occurred_at: row.try_get("occurred_at")?,
            created_at: row.try_get("created_at")?,
            event_type: row.try_get("type")?,
            payload: row.try_get("payload")?,
            correlation_id: row.try_get("correlation_id")?,
            aggregate_id: row.try_get("aggregate_id")?,
            key: row.try_get("key")?,
            processed_at: row.try_get("processed_at")?,
            error: row.try_get("error")?,
            attempts: row.try_get("attempts")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            locked_by: row.try_get("locked_by")?,
            locked_until: row.try_get("locked_until")?,
            dead_lettered_at: row.try_get("dead_lettered_at")?,
        })
    }
}

impl From<OutboxRecord> for OutboxRow {
    fn from(row: OutboxRecord) -> Self {
        OutboxRow {
            id: EventId::from_uuid(row.id),
            occurred_at: row.occurred_at,
            event_type: row.event_type,
            payload: row.payload,
            correlation_id: row.correlation_id,
            aggregate_id: row.aggregate_id,
            key: row.key,
            processed_at: row.processed_at,
            error: row.error,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            next_attempt_at: row.next_attempt_at,
            locked_by: row.locked_by,
            locked_until: row.locked_until,
            dead_lettered_at: row.dead_lettered_at,
            created_at: row.created_at,
        }
    }
}
