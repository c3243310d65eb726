//! Postgres-backed job store and result sink.
//!
//! ## Atomicity
//!
//! Every counter or status change is a single guarded `UPDATE ... RETURNING`.
//! Counters are incremented in SQL (`x = x + $n`), never read-modify-written
//! from the application, so concurrent workers cannot lose updates. Guards in
//! the `WHERE` clause enforce the lifecycle (`status = 'RUNNING'`,
//! `processed + $n <= total`); a guard miss is reported as `NotFound` for an
//! unknown job and `InvalidTransition` otherwise.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | Mapped to |
//! |------------|----------------------|-----------|
//! | Database (unique violation) | `23505` | `AlreadyExists` on insert |
//! | Database (check constraint violation) | `23514` | `Storage` (counter invariant) |
//! | anything else | | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use recap_ai::AnalysisResult;
use recap_core::TaskId;

use super::sink::{ResultSink, SinkError, StoredResult};
use super::store::{JobStore, JobStoreError};
use super::types::{ItemOutcome, Job, JobConfig, JobCounters, JobId, JobStatus, ResultKind};

macro_rules! job_columns {
    () => {
        "id, task_id, status, config, total, processed, success, failed, skipped, \
         created_at, started_at, completed_at, error_message, resumed_from"
    };
}

/// Postgres-backed [`JobStore`].
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn from_arc(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Create the `batch_jobs` table if it does not exist yet.
    pub async fn migrate(&self) -> Result<(), JobStoreError> {
        for stmt in [
            r#"
            CREATE TABLE IF NOT EXISTS batch_jobs (
                id             UUID PRIMARY KEY,
                task_id        UUID NOT NULL,
                status         TEXT NOT NULL,
                config         JSONB NOT NULL,
                total          BIGINT NOT NULL DEFAULT 0,
                processed      BIGINT NOT NULL DEFAULT 0,
                success        BIGINT NOT NULL DEFAULT 0,
                failed         BIGINT NOT NULL DEFAULT 0,
                skipped        BIGINT NOT NULL DEFAULT 0,
                created_at     TIMESTAMPTZ NOT NULL,
                started_at     TIMESTAMPTZ,
                completed_at   TIMESTAMPTZ,
                error_message  TEXT,
                resumed_from   UUID,
                CONSTRAINT batch_jobs_counters_chk
                    CHECK (processed = success + failed + skipped AND processed <= total)
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS batch_jobs_task_idx
                ON batch_jobs (task_id, created_at DESC)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS batch_jobs_status_idx
                ON batch_jobs (status)
            "#,
        ] {
            sqlx::query(stmt)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_job_error("migrate", e))?;
        }
        Ok(())
    }

    /// Explain why a guarded update matched no row.
    async fn guard_miss(&self, job_id: JobId, attempted: &str) -> JobStoreError {
        let status: Result<Option<String>, sqlx::Error> =
            sqlx::query_scalar("SELECT status FROM batch_jobs WHERE id = $1")
                .bind(job_id.as_uuid())
                .fetch_optional(&*self.pool)
                .await;
        match status {
            Ok(Some(status)) => JobStoreError::InvalidTransition {
                job_id,
                message: format!("cannot {attempted} a {status} job"),
            },
            Ok(None) => JobStoreError::NotFound(job_id),
            Err(e) => map_job_error("guard_miss", e),
        }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, task_id = %job.task_id), err)]
    async fn insert(&self, job: &Job) -> Result<(), JobStoreError> {
        let config = serde_json::to_value(&job.config)
            .map_err(|e| JobStoreError::Storage(format!("failed to encode job config: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO batch_jobs (
                id, task_id, status, config, total, processed, success, failed, skipped,
                created_at, started_at, completed_at, error_message, resumed_from
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.task_id.as_uuid())
        .bind(job.status.as_str())
        .bind(config)
        .bind(job.counters.total as i64)
        .bind(job.counters.processed as i64)
        .bind(job.counters.success as i64)
        .bind(job.counters.failed as i64)
        .bind(job.counters.skipped as i64)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.error_message.as_deref())
        .bind(job.resumed_from.map(Uuid::from))
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(job.id)
            } else {
                map_job_error("insert", e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(concat!("SELECT ", job_columns!(), " FROM batch_jobs WHERE id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_job_error("get", e))?;

        row.as_ref().map(decode_job).transpose()
    }

    #[instrument(skip(self), fields(task_id = %task_id), err)]
    async fn list_by_task(&self, task_id: TaskId) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(concat!(
            "SELECT ",
            job_columns!(),
            " FROM batch_jobs WHERE task_id = $1 ORDER BY created_at DESC, id DESC"
        ))
        .bind(task_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_job_error("list_by_task", e))?;

        rows.iter().map(decode_job).collect()
    }

    #[instrument(skip(self), err)]
    async fn list_by_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>, JobStoreError> {
        let statuses: Vec<&str> = statuses.iter().map(JobStatus::as_str).collect();
        let rows = sqlx::query(concat!(
            "SELECT ",
            job_columns!(),
            " FROM batch_jobs WHERE status = ANY($1) ORDER BY created_at ASC, id ASC"
        ))
        .bind(&statuses)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_job_error("list_by_status", e))?;

        rows.iter().map(decode_job).collect()
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn begin(&self, job_id: JobId, total: u64, filtered: u64) -> Result<Job, JobStoreError> {
        if filtered > total {
            return Err(JobStoreError::InvalidTransition {
                job_id,
                message: format!("filtered count {filtered} exceeds total {total}"),
            });
        }

        let row = sqlx::query(concat!(
            r#"
            UPDATE batch_jobs
            SET status = 'RUNNING',
                total = $2,
                processed = $3,
                success = 0,
                failed = 0,
                skipped = $3,
                started_at = now()
            WHERE id = $1 AND status = 'PENDING'
            RETURNING "#,
            job_columns!()
        ))
        .bind(job_id.as_uuid())
        .bind(total as i64)
        .bind(filtered as i64)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_job_error("begin", e))?;

        match row {
            Some(row) => decode_job(&row),
            None => Err(self.guard_miss(job_id, "start").await),
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id, outcome = ?outcome), err)]
    async fn record(
        &self,
        job_id: JobId,
        outcome: ItemOutcome,
        count: u64,
    ) -> Result<Job, JobStoreError> {
        let sql = match outcome {
            ItemOutcome::Success => concat!(
                "UPDATE batch_jobs SET success = success + $2, processed = processed + $2 ",
                "WHERE id = $1 AND status = 'RUNNING' AND processed + $2 <= total RETURNING ",
                job_columns!()
            ),
            ItemOutcome::Failed => concat!(
                "UPDATE batch_jobs SET failed = failed + $2, processed = processed + $2 ",
                "WHERE id = $1 AND status = 'RUNNING' AND processed + $2 <= total RETURNING ",
                job_columns!()
            ),
            ItemOutcome::Skipped => concat!(
                "UPDATE batch_jobs SET skipped = skipped + $2, processed = processed + $2 ",
                "WHERE id = $1 AND status = 'RUNNING' AND processed + $2 <= total RETURNING ",
                job_columns!()
            ),
        };

        let row = sqlx::query(sql)
            .bind(job_id.as_uuid())
            .bind(count as i64)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_job_error("record", e))?;

        match row {
            Some(row) => decode_job(&row),
            None => Err(self.guard_miss(job_id, "record outcomes on").await),
        }
    }

    #[instrument(skip(self, error_message), fields(job_id = %job_id, status = %status), err)]
    async fn finish(
        &self,
        job_id: JobId,
        status: JobStatus,
        error_message: Option<String>,
    ) -> Result<Job, JobStoreError> {
        if !status.is_terminal() {
            return Err(JobStoreError::InvalidTransition {
                job_id,
                message: format!("{status} is not a terminal status"),
            });
        }

        let row = sqlx::query(concat!(
            r#"
            UPDATE batch_jobs
            SET status = $2,
                error_message = COALESCE($3, error_message),
                completed_at = now()
            WHERE id = $1 AND status IN ('PENDING', 'RUNNING')
            RETURNING "#,
            job_columns!()
        ))
        .bind(job_id.as_uuid())
        .bind(status.as_str())
        .bind(error_message.as_deref())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_job_error("finish", e))?;

        match row {
            Some(row) => decode_job(&row),
            None => Err(self.guard_miss(job_id, "finish").await),
        }
    }
}

/// Postgres-backed [`ResultSink`], keyed by `(task_id, item_key, kind)`.
#[derive(Debug, Clone)]
pub struct PostgresResultSink {
    pool: Arc<PgPool>,
}

impl PostgresResultSink {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn from_arc(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Create the `analysis_results` table if it does not exist yet.
    pub async fn migrate(&self) -> Result<(), SinkError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS analysis_results (
                task_id      UUID NOT NULL,
                item_key     TEXT NOT NULL,
                kind         TEXT NOT NULL,
                provider     TEXT NOT NULL,
                result       JSONB NOT NULL,
                is_fallback  BOOLEAN NOT NULL DEFAULT FALSE,
                created_at   TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (task_id, item_key, kind)
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sink_error("migrate", e))?;
        Ok(())
    }
}

#[async_trait]
impl ResultSink for PostgresResultSink {
    #[instrument(skip(self), fields(task_id = %task_id, kind = kind.as_str()), err)]
    async fn has_result(
        &self,
        task_id: TaskId,
        key: &str,
        kind: ResultKind,
    ) -> Result<bool, SinkError> {
        sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM analysis_results
                WHERE task_id = $1 AND item_key = $2 AND kind = $3 AND NOT is_fallback
            )
            "#,
        )
        .bind(task_id.as_uuid())
        .bind(key)
        .bind(kind.as_str())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sink_error("has_result", e))
    }

    #[instrument(
        skip(self, result),
        fields(task_id = %result.task_id, key = %result.key, kind = result.kind.as_str()),
        err
    )]
    async fn save_result(&self, result: StoredResult) -> Result<(), SinkError> {
        let payload = serde_json::to_value(&result.result)
            .map_err(|e| SinkError::Storage(format!("failed to encode result: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO analysis_results
                (task_id, item_key, kind, provider, result, is_fallback, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (task_id, item_key, kind) DO UPDATE
            SET provider = EXCLUDED.provider,
                result = EXCLUDED.result,
                is_fallback = EXCLUDED.is_fallback,
                created_at = EXCLUDED.created_at
            "#,
        )
        .bind(result.task_id.as_uuid())
        .bind(&result.key)
        .bind(result.kind.as_str())
        .bind(&result.provider)
        .bind(payload)
        .bind(result.is_fallback)
        .bind(result.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sink_error("save_result", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(task_id = %task_id, kind = kind.as_str()), err)]
    async fn get_result(
        &self,
        task_id: TaskId,
        key: &str,
        kind: ResultKind,
    ) -> Result<Option<StoredResult>, SinkError> {
        let row = sqlx::query(
            r#"
            SELECT task_id, item_key, kind, provider, result, is_fallback, created_at
            FROM analysis_results
            WHERE task_id = $1 AND item_key = $2 AND kind = $3
            "#,
        )
        .bind(task_id.as_uuid())
        .bind(key)
        .bind(kind.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sink_error("get_result", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let row = ResultRow::from_row(&row)
            .map_err(|e| SinkError::Storage(format!("failed to decode result row: {e}")))?;
        row.try_into().map(Some)
    }
}

fn decode_job(row: &sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
    let row = JobRow::from_row(row)
        .map_err(|e| JobStoreError::Storage(format!("failed to decode job row: {e}")))?;
    row.try_into()
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

fn map_job_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                // batch_jobs_counters_chk
                Some("23514") => JobStoreError::Storage(format!("counter constraint violated: {msg}")),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

fn map_sink_error(operation: &str, err: sqlx::Error) -> SinkError {
    match err {
        sqlx::Error::Database(db_err) => {
            SinkError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => SinkError::Storage(format!("connection pool closed in {operation}")),
        _ => SinkError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

#[derive(Debug)]
struct JobRow {
    id: Uuid,
    task_id: Uuid,
    status: String,
    config: JsonValue,
    total: i64,
    processed: i64,
    success: i64,
    failed: i64,
    skipped: i64,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    resumed_from: Option<Uuid>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            status: row.try_get("status")?,
            config: row.try_get("config")?,
            total: row.try_get("total")?,
            processed: row.try_get("processed")?,
            success: row.try_get("success")?,
            failed: row.try_get("failed")?,
            skipped: row.try_get("skipped")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            error_message: row.try_get("error_message")?,
            resumed_from: row.try_get("resumed_from")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(|e| JobStoreError::Storage(e.to_string()))?;
        let config: JobConfig = serde_json::from_value(row.config)
            .map_err(|e| JobStoreError::Storage(format!("failed to decode job config: {e}")))?;

        Ok(Job {
            id: JobId::from_uuid(row.id),
            task_id: TaskId::from_uuid(row.task_id),
            status,
            config,
            counters: JobCounters {
                total: row.total as u64,
                processed: row.processed as u64,
                success: row.success as u64,
                failed: row.failed as u64,
                skipped: row.skipped as u64,
            },
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            error_message: row.error_message,
            resumed_from: row.resumed_from.map(JobId::from_uuid),
        })
    }
}

#[derive(Debug)]
struct ResultRow {
    task_id: Uuid,
    item_key: String,
    kind: String,
    provider: String,
    result: JsonValue,
    is_fallback: bool,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for ResultRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(ResultRow {
            task_id: row.try_get("task_id")?,
            item_key: row.try_get("item_key")?,
            kind: row.try_get("kind")?,
            provider: row.try_get("provider")?,
            result: row.try_get("result")?,
            is_fallback: row.try_get("is_fallback")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<ResultRow> for StoredResult {
    type Error = SinkError;

    fn try_from(row: ResultRow) -> Result<Self, Self::Error> {
        let kind = row
            .kind
            .parse::<ResultKind>()
            .map_err(|e| SinkError::Storage(e.to_string()))?;
        let result: AnalysisResult = serde_json::from_value(row.result)
            .map_err(|e| SinkError::Storage(format!("failed to decode result: {e}")))?;

        Ok(StoredResult {
            task_id: TaskId::from_uuid(row.task_id),
            key: row.item_key,
            kind,
            provider: row.provider,
            result,
            is_fallback: row.is_fallback,
            created_at: row.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_statements_only_touch_their_counter() {
        let success = concat!(
            "UPDATE batch_jobs SET success = success + $2, processed = processed + $2 ",
            "WHERE id = $1 AND status = 'RUNNING' AND processed + $2 <= total RETURNING ",
            job_columns!()
        );
        assert!(success.contains("resumed_from"));
        assert!(!success.contains("failed = failed"));
    }

    #[test]
    fn job_row_round_trips_into_domain() {
        let config = JobConfig::default().with_concurrency(4);
        let id = Uuid::now_v7();
        let row = JobRow {
            id,
            task_id: Uuid::now_v7(),
            status: "INTERRUPTED".into(),
            config: serde_json::to_value(&config).unwrap(),
            total: 10,
            processed: 4,
            success: 3,
            failed: 1,
            skipped: 0,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: None,
            error_message: Some("stopped".into()),
            resumed_from: None,
        };

        let job: Job = row.try_into().unwrap();
        assert_eq!(job.id, JobId::from_uuid(id));
        assert_eq!(job.status, JobStatus::Interrupted);
        assert_eq!(job.config, config);
        assert!(job.counters.is_consistent());
    }

    #[test]
    fn unknown_status_is_a_storage_error() {
        let row = JobRow {
            id: Uuid::now_v7(),
            task_id: Uuid::now_v7(),
            status: "EXPLODED".into(),
            config: serde_json::to_value(JobConfig::default()).unwrap(),
            total: 0,
            processed: 0,
            success: 0,
            failed: 0,
            skipped: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            resumed_from: None,
        };
        assert!(matches!(Job::try_from(row), Err(JobStoreError::Storage(_))));
    }
}
