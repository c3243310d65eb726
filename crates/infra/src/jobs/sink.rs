//! Result persistence, also the idempotency checkpoint for resume.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use recap_ai::AnalysisResult;
use recap_core::TaskId;

use super::types::ResultKind;

/// One saved analysis outcome, keyed by `(task_id, key, kind)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResult {
    pub task_id: TaskId,
    pub key: String,
    pub kind: ResultKind,
    /// Provider/model label of the AI caller that produced it.
    pub provider: String,
    pub result: AnalysisResult,
    /// A placeholder describing a failed one-off analysis; never counts as done.
    pub is_fallback: bool,
    pub created_at: DateTime<Utc>,
}

impl StoredResult {
    pub fn new(
        task_id: TaskId,
        key: impl Into<String>,
        kind: ResultKind,
        provider: impl Into<String>,
        result: AnalysisResult,
    ) -> Self {
        Self {
            task_id,
            key: key.into(),
            kind,
            provider: provider.into(),
            result,
            is_fallback: false,
            created_at: Utc::now(),
        }
    }

    pub fn fallback(mut self) -> Self {
        self.is_fallback = true;
        self
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SinkError {
    #[error("result storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait ResultSink: Send + Sync + 'static {
    /// Whether a successful (non-fallback) result exists for the key.
    async fn has_result(
        &self,
        task_id: TaskId,
        key: &str,
        kind: ResultKind,
    ) -> Result<bool, SinkError>;

    /// Insert or replace the result for `(task_id, key, kind)`.
    async fn save_result(&self, result: StoredResult) -> Result<(), SinkError>;

    async fn get_result(
        &self,
        task_id: TaskId,
        key: &str,
        kind: ResultKind,
    ) -> Result<Option<StoredResult>, SinkError>;
}

type SinkKey = (TaskId, String, ResultKind);

/// In-memory result sink for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryResultSink {
    results: RwLock<HashMap<SinkKey, StoredResult>>,
}

impl InMemoryResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful results stored for a task.
    pub fn success_count(&self, task_id: TaskId) -> usize {
        self.results
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|r| r.task_id == task_id && !r.is_fallback)
            .count()
    }
}

#[async_trait]
impl ResultSink for InMemoryResultSink {
    async fn has_result(
        &self,
        task_id: TaskId,
        key: &str,
        kind: ResultKind,
    ) -> Result<bool, SinkError> {
        Ok(self
            .get_result(task_id, key, kind)
            .await?
            .is_some_and(|r| !r.is_fallback))
    }

    async fn save_result(&self, result: StoredResult) -> Result<(), SinkError> {
        let mut results = self
            .results
            .write()
            .map_err(|_| SinkError::Storage("result sink lock poisoned".into()))?;
        results.insert((result.task_id, result.key.clone(), result.kind), result);
        Ok(())
    }

    async fn get_result(
        &self,
        task_id: TaskId,
        key: &str,
        kind: ResultKind,
    ) -> Result<Option<StoredResult>, SinkError> {
        let results = self
            .results
            .read()
            .map_err(|_| SinkError::Storage("result sink lock poisoned".into()))?;
        Ok(results.get(&(task_id, key.to_string(), kind)).cloned())
    }
}
