//! Postgres-backed dataset reader.
//!
//! Reads the `tasks` / `records` tables filled by the upload pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use recap_core::TaskId;

use super::{Record, RecordId, RecordStore, RecordStoreError};

#[derive(Debug, Clone)]
pub struct PostgresRecordStore {
    pool: Arc<PgPool>,
}

impl PostgresRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn from_arc(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Create the dataset tables if they do not exist yet.
    pub async fn migrate(&self) -> Result<(), RecordStoreError> {
        for stmt in [
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id          UUID PRIMARY KEY,
                name        TEXT,
                created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS records (
                task_id   UUID NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                id        BIGINT NOT NULL,
                sender    TEXT,
                receiver  TEXT,
                subject   TEXT,
                content   TEXT,
                sent_at   TIMESTAMPTZ,
                PRIMARY KEY (task_id, id)
            )
            "#,
        ] {
            sqlx::query(stmt)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }

    async fn ensure_task(&self, task_id: TaskId) -> Result<(), RecordStoreError> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM tasks WHERE id = $1)")
            .bind(task_id.as_uuid())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_task", e))?;
        if exists {
            Ok(())
        } else {
            Err(RecordStoreError::TaskNotFound(task_id))
        }
    }
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    #[instrument(skip(self), fields(task_id = %task_id), err)]
    async fn list_records(&self, task_id: TaskId) -> Result<Vec<Record>, RecordStoreError> {
        self.ensure_task(task_id).await?;

        let rows = sqlx::query(
            r#"
            SELECT id, task_id, sender, receiver, subject, content, sent_at
            FROM records
            WHERE task_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(task_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_records", e))?;

        decode_rows(rows)
    }

    #[instrument(skip(self, ids), fields(task_id = %task_id, requested = ids.len()), err)]
    async fn get_records(
        &self,
        task_id: TaskId,
        ids: &[RecordId],
    ) -> Result<Vec<Record>, RecordStoreError> {
        self.ensure_task(task_id).await?;

        let rows = sqlx::query(
            r#"
            SELECT id, task_id, sender, receiver, subject, content, sent_at
            FROM records
            WHERE task_id = $1 AND id = ANY($2)
            ORDER BY id ASC
            "#,
        )
        .bind(task_id.as_uuid())
        .bind(ids)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_records", e))?;

        decode_rows(rows)
    }
}

fn decode_rows(rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<Record>, RecordStoreError> {
    rows.iter()
        .map(|row| {
            RecordRow::from_row(row)
                .map(Record::from)
                .map_err(|e| RecordStoreError::Storage(format!("failed to decode record row: {e}")))
        })
        .collect()
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RecordStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            RecordStoreError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            RecordStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => RecordStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

#[derive(Debug)]
struct RecordRow {
    id: i64,
    task_id: Uuid,
    sender: Option<String>,
    receiver: Option<String>,
    subject: Option<String>,
    content: Option<String>,
    sent_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for RecordRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(RecordRow {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            sender: row.try_get("sender")?,
            receiver: row.try_get("receiver")?,
            subject: row.try_get("subject")?,
            content: row.try_get("content")?,
            sent_at: row.try_get("sent_at")?,
        })
    }
}

impl From<RecordRow> for Record {
    fn from(row: RecordRow) -> Self {
        Record {
            id: row.id,
            task_id: TaskId::from_uuid(row.task_id),
            sender: row.sender,
            receiver: row.receiver,
            subject: row.subject,
            content: row.content,
            sent_at: row.sent_at,
        }
    }
}
