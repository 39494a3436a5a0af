//! Postgres-backed operation and keyframe stores.

use std::sync::atomic::AtomicBool;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::keyframe::{Keyframe, KeyframeStore};
use crate::store::{check_cancel, Mutation, OperationStore, OperationTxn};
use crate::types::{
    Action, Operation, OperationContext, OperationWithContext, PagedResults, Paging, Revisions,
    StreamKey,
};

const OP_ID_CONSTRAINT: &str = "operations_op_id_key";
const STREAM_INDEX_CONSTRAINT: &str = "operations_stream_idx_key";

const OPERATION_COLUMNS: &str = "id, op_id, prev_op_id, document_id, document_type, scope, branch, \
     idx, skip, hash, timestamp_utc, action, resulting_state, error";

/// Run the embedded SQL migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

struct OperationRow(OperationWithContext);

impl<'r> sqlx::FromRow<'r, PgRow> for OperationRow {
    fn from_row(row: &'r PgRow) -> std::result::Result<Self, sqlx::Error> {
        let action: serde_json::Value = row.try_get("action")?;
        let action: Action =
            serde_json::from_value(action).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        let index: i64 = row.try_get("idx")?;
        let skip: i64 = row.try_get("skip")?;

        Ok(OperationRow(OperationWithContext {
            operation: Operation {
                op_id: row.try_get("op_id")?,
                prev_op_id: row.try_get("prev_op_id")?,
                index: index as u64,
                skip: skip as u64,
                hash: row.try_get("hash")?,
                timestamp_utc: row.try_get("timestamp_utc")?,
                action,
                resulting_state: row.try_get("resulting_state")?,
                error: row.try_get("error")?,
            },
            context: OperationContext {
                document_id: row.try_get("document_id")?,
                document_type: row.try_get("document_type")?,
                scope: row.try_get("scope")?,
                branch: row.try_get("branch")?,
                ordinal: row.try_get("id")?,
            },
        }))
    }
}

/// LIMIT (one extra row to detect a further page) and OFFSET for a page.
fn page_bounds(paging: Option<&Paging>) -> (Option<i64>, i64) {
    match paging {
        Some(p) => (Some(p.limit as i64 + 1), p.offset() as i64),
        None => (None, 0),
    }
}

fn into_page<T>(mut rows: Vec<T>, paging: Option<&Paging>) -> PagedResults<T> {
    let Some(paging) = paging else {
        return PagedResults {
            results: rows,
            next_cursor: None,
        };
    };
    let has_more = rows.len() > paging.limit;
    rows.truncate(paging.limit);
    let next = paging.offset() + rows.len();
    PagedResults {
        results: rows,
        next_cursor: has_more.then(|| next.to_string()),
    }
}

fn unique_constraint(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            db.constraint().map(str::to_string)
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// PgOperationStore
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgOperationStore {
    pool: PgPool,
}

impl PgOperationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn current_revision(&self, stream: &StreamKey) -> Result<u64> {
        let row = sqlx::query_as::<_, (Option<i64>,)>(
            "SELECT MAX(idx) FROM operations WHERE document_id = $1 AND scope = $2 AND branch = $3",
        )
        .bind(&stream.document_id)
        .bind(&stream.scope)
        .bind(&stream.branch)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0.map(|i| i as u64 + 1).unwrap_or(0))
    }

    async fn insert_all(
        &self,
        stream: &StreamKey,
        document_type: &str,
        expected_revision: u64,
        mutate: Mutation<'_>,
    ) -> std::result::Result<Vec<OperationWithContext>, InsertError> {
        let mut tx = self.pool.begin().await?;

        let latest = sqlx::query_as::<_, (i64, String)>(
            r#"
            SELECT idx, op_id FROM operations
            WHERE document_id = $1 AND scope = $2 AND branch = $3
            ORDER BY idx DESC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(&stream.document_id)
        .bind(&stream.scope)
        .bind(&stream.branch)
        .fetch_optional(&mut *tx)
        .await?;

        let actual = latest.as_ref().map(|(i, _)| *i as u64 + 1).unwrap_or(0);
        if actual != expected_revision {
            return Err(StoreError::RevisionMismatch {
                expected: expected_revision,
                actual,
            }
            .into());
        }

        let mut txn = OperationTxn::default();
        mutate(&mut txn)?;
        let operations = txn.seal(expected_revision, latest.map(|(_, op_id)| op_id))?;

        let mut committed = Vec::with_capacity(operations.len());
        for op in operations {
            let action = serde_json::to_value(&op.action).map_err(StoreError::from)?;
            let inserted = sqlx::query_as::<_, OperationRow>(&format!(
                r#"
                INSERT INTO operations
                    (op_id, prev_op_id, document_id, document_type, scope, branch,
                     idx, skip, hash, timestamp_utc, action, resulting_state, error)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                RETURNING {OPERATION_COLUMNS}
                "#
            ))
            .bind(&op.op_id)
            .bind(&op.prev_op_id)
            .bind(&stream.document_id)
            .bind(document_type)
            .bind(&stream.scope)
            .bind(&stream.branch)
            .bind(op.index as i64)
            .bind(op.skip as i64)
            .bind(&op.hash)
            .bind(op.timestamp_utc)
            .bind(&action)
            .bind(&op.resulting_state)
            .bind(&op.error)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| InsertError::Insert {
                op_id: op.op_id.clone(),
                source: e,
            })?;
            committed.push(inserted.0);
        }

        tx.commit().await?;
        Ok(committed)
    }
}

enum InsertError {
    Store(StoreError),
    Insert { op_id: String, source: sqlx::Error },
}

impl From<StoreError> for InsertError {
    fn from(e: StoreError) -> Self {
        InsertError::Store(e)
    }
}

impl From<sqlx::Error> for InsertError {
    fn from(e: sqlx::Error) -> Self {
        InsertError::Store(StoreError::Database(e))
    }
}

#[async_trait]
impl OperationStore for PgOperationStore {
    async fn apply(
        &self,
        stream: &StreamKey,
        document_type: &str,
        expected_revision: u64,
        mutate: Mutation<'_>,
        cancel: Option<&AtomicBool>,
    ) -> Result<Vec<OperationWithContext>> {
        check_cancel(cancel)?;

        match self
            .insert_all(stream, document_type, expected_revision, mutate)
            .await
        {
            Ok(committed) => {
                debug!(stream = %stream, count = committed.len(), "Committed operations");
                Ok(committed)
            }
            Err(InsertError::Store(e)) => Err(e),
            Err(InsertError::Insert { op_id, source }) => {
                match unique_constraint(&source).as_deref() {
                    Some(OP_ID_CONSTRAINT) => Err(StoreError::DuplicateOperation { op_id }),
                    // A concurrent writer claimed the index first.
                    Some(STREAM_INDEX_CONSTRAINT) => Err(StoreError::RevisionMismatch {
                        expected: expected_revision,
                        actual: self.current_revision(stream).await?,
                    }),
                    _ => Err(StoreError::Database(source)),
                }
            }
        }
    }

    async fn get(&self, stream: &StreamKey, index: u64) -> Result<Operation> {
        let row = sqlx::query_as::<_, OperationRow>(&format!(
            r#"
            SELECT {OPERATION_COLUMNS} FROM operations
            WHERE document_id = $1 AND scope = $2 AND branch = $3 AND idx = $4
            "#
        ))
        .bind(&stream.document_id)
        .bind(&stream.scope)
        .bind(&stream.branch)
        .bind(index as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.0.operation)
            .ok_or_else(|| StoreError::OperationNotFound(format!("{stream}@{index}")))
    }

    async fn get_since(
        &self,
        stream: &StreamKey,
        revision: u64,
        paging: Option<&Paging>,
    ) -> Result<PagedResults<Operation>> {
        let (limit, offset) = page_bounds(paging);
        let rows = sqlx::query_as::<_, OperationRow>(&format!(
            r#"
            SELECT {OPERATION_COLUMNS} FROM operations
            WHERE document_id = $1 AND scope = $2 AND branch = $3 AND idx >= $4
            ORDER BY idx ASC
            LIMIT $5 OFFSET $6
            "#
        ))
        .bind(&stream.document_id)
        .bind(&stream.scope)
        .bind(&stream.branch)
        .bind(revision as i64)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let ops = rows.into_iter().map(|r| r.0.operation).collect();
        Ok(into_page(ops, paging))
    }

    async fn get_since_timestamp(
        &self,
        stream: &StreamKey,
        timestamp: DateTime<Utc>,
        paging: Option<&Paging>,
    ) -> Result<PagedResults<Operation>> {
        let (limit, offset) = page_bounds(paging);
        let rows = sqlx::query_as::<_, OperationRow>(&format!(
            r#"
            SELECT {OPERATION_COLUMNS} FROM operations
            WHERE document_id = $1 AND scope = $2 AND branch = $3 AND timestamp_utc > $4
            ORDER BY idx ASC
            LIMIT $5 OFFSET $6
            "#
        ))
        .bind(&stream.document_id)
        .bind(&stream.scope)
        .bind(&stream.branch)
        .bind(timestamp)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let ops = rows.into_iter().map(|r| r.0.operation).collect();
        Ok(into_page(ops, paging))
    }

    async fn get_since_id(
        &self,
        ordinal: i64,
        paging: Option<&Paging>,
    ) -> Result<PagedResults<OperationWithContext>> {
        let (limit, offset) = page_bounds(paging);
        let rows = sqlx::query_as::<_, OperationRow>(&format!(
            r#"
            SELECT {OPERATION_COLUMNS} FROM operations
            WHERE id > $1
            ORDER BY id ASC
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(ordinal)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let rows = rows.into_iter().map(|r| r.0).collect();
        Ok(into_page(rows, paging))
    }

    async fn get_revisions(&self, document_id: &str, branch: &str) -> Result<Revisions> {
        let rows = sqlx::query_as::<_, (String, i64, DateTime<Utc>)>(
            r#"
            SELECT scope, MAX(idx), MAX(timestamp_utc)
            FROM operations
            WHERE document_id = $1 AND branch = $2
            GROUP BY scope
            "#,
        )
        .bind(document_id)
        .bind(branch)
        .fetch_all(&self.pool)
        .await?;

        let mut revisions = Revisions::default();
        for (scope, max_index, latest) in rows {
            revisions.revision.insert(scope, max_index as u64 + 1);
            revisions.latest_timestamp =
                Some(revisions.latest_timestamp.map_or(latest, |t| t.max(latest)));
        }
        Ok(revisions)
    }
}

#[cfg(feature = "test-utils")]
impl PgOperationStore {
    /// Every row in commit order (for tests).
    pub async fn read_all(&self) -> Result<Vec<OperationWithContext>> {
        let rows = sqlx::query_as::<_, OperationRow>(&format!(
            "SELECT {OPERATION_COLUMNS} FROM operations ORDER BY id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }
}

// ---------------------------------------------------------------------------
// PgKeyframeStore
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgKeyframeStore {
    pool: PgPool,
}

impl PgKeyframeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KeyframeStore for PgKeyframeStore {
    async fn put_keyframe(
        &self,
        stream: &StreamKey,
        revision: u64,
        document: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO keyframes (document_id, scope, branch, revision, document)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (document_id, scope, branch, revision)
            DO UPDATE SET document = EXCLUDED.document, created_at = now()
            "#,
        )
        .bind(&stream.document_id)
        .bind(&stream.scope)
        .bind(&stream.branch)
        .bind(revision as i64)
        .bind(document)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_nearest_keyframe(
        &self,
        stream: &StreamKey,
        target_revision: u64,
    ) -> Result<Option<Keyframe>> {
        let row = sqlx::query_as::<_, (i64, serde_json::Value)>(
            r#"
            SELECT revision, document FROM keyframes
            WHERE document_id = $1 AND scope = $2 AND branch = $3 AND revision <= $4
            ORDER BY revision DESC
            LIMIT 1
            "#,
        )
        .bind(&stream.document_id)
        .bind(&stream.scope)
        .bind(&stream.branch)
        .bind(target_revision as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(revision, document)| Keyframe {
            revision: revision as u64,
            document,
        }))
    }

    async fn delete_keyframes(
        &self,
        document_id: &str,
        scope: Option<&str>,
        branch: Option<&str>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM keyframes
            WHERE document_id = $1
              AND ($2::text IS NULL OR scope = $2)
              AND ($3::text IS NULL OR branch = $3)
            "#,
        )
        .bind(document_id)
        .bind(scope)
        .bind(branch)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get_view_state(&self, read_model: &str) -> Result<Option<i64>> {
        let row = sqlx::query_as::<_, (i64,)>(
            "SELECT last_ordinal FROM view_state WHERE read_model = $1",
        )
        .bind(read_model)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(ordinal,)| ordinal))
    }

    async fn put_view_state(&self, read_model: &str, ordinal: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO view_state (read_model, last_ordinal)
            VALUES ($1, $2)
            ON CONFLICT (read_model) DO UPDATE
            SET last_ordinal = GREATEST(view_state.last_ordinal, EXCLUDED.last_ordinal),
                updated_at = now()
            "#,
        )
        .bind(read_model)
        .bind(ordinal)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
