//! Job record storage (the progress tracker read by polling clients).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use recap_core::{DomainError, TaskId};

use super::types::{ItemOutcome, Job, JobId, JobStatus};

/// Durable job records.
///
/// Every mutation is a single atomic step on the stored record, so concurrent
/// workers reporting outcomes never lose updates.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Persist a new job.
    async fn insert(&self, job: &Job) -> Result<(), JobStoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// All jobs of a task, newest first.
    async fn list_by_task(&self, task_id: TaskId) -> Result<Vec<Job>, JobStoreError>;

    /// All jobs currently in one of `statuses`, oldest first.
    async fn list_by_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>, JobStoreError>;

    /// `Pending -> Running`: fix `total`, count `filtered` items as skipped, stamp `started_at`.
    async fn begin(&self, job_id: JobId, total: u64, filtered: u64) -> Result<Job, JobStoreError>;

    /// Add `count` outcomes to a running job's counters.
    async fn record(
        &self,
        job_id: JobId,
        outcome: ItemOutcome,
        count: u64,
    ) -> Result<Job, JobStoreError>;

    /// Move an active job to a terminal status and stamp `completed_at`.
    async fn finish(
        &self,
        job_id: JobId,
        status: JobStatus,
        error_message: Option<String>,
    ) -> Result<Job, JobStoreError>;
}

#[async_trait]
impl<T: JobStore + ?Sized> JobStore for Arc<T> {
    async fn insert(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).insert(job).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id).await
    }

    async fn list_by_task(&self, task_id: TaskId) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_by_task(task_id).await
    }

    async fn list_by_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_by_status(statuses).await
    }

    async fn begin(&self, job_id: JobId, total: u64, filtered: u64) -> Result<Job, JobStoreError> {
        (**self).begin(job_id, total, filtered).await
    }

    async fn record(
        &self,
        job_id: JobId,
        outcome: ItemOutcome,
        count: u64,
    ) -> Result<Job, JobStoreError> {
        (**self).record(job_id, outcome, count).await
    }

    async fn finish(
        &self,
        job_id: JobId,
        status: JobStatus,
        error_message: Option<String>,
    ) -> Result<Job, JobStoreError> {
        (**self).finish(job_id, status, error_message).await
    }
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("invalid transition for job {job_id}: {message}")]
    InvalidTransition { job_id: JobId, message: String },
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    fn from_domain(job_id: JobId, err: DomainError) -> Self {
        JobStoreError::InvalidTransition {
            job_id,
            message: err.to_string(),
        }
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn update<F>(&self, job_id: JobId, f: F) -> Result<Job, JobStoreError>
    where
        F: FnOnce(&mut Job) -> Result<(), DomainError>,
    {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".into()))?;
        let stored = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;

        // Mutate a copy so a rejected update leaves the stored record intact.
        let mut next = stored.clone();
        f(&mut next).map_err(|e| JobStoreError::from_domain(job_id, e))?;
        *stored = next.clone();
        Ok(next)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".into()))?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self
            .jobs
            .read()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".into()))?;
        Ok(jobs.get(&job_id).cloned())
    }

    async fn list_by_task(&self, task_id: TaskId) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self
            .jobs
            .read()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".into()))?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.task_id == task_id)
            .cloned()
            .collect();

        // UUIDv7 ids break ties between jobs created in the same instant.
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(result)
    }

    async fn list_by_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self
            .jobs
            .read()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".into()))?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| statuses.contains(&j.status))
            .cloned()
            .collect();

        result.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(result)
    }

    async fn begin(&self, job_id: JobId, total: u64, filtered: u64) -> Result<Job, JobStoreError> {
        self.update(job_id, |job| job.begin(total, filtered))
    }

    async fn record(
        &self,
        job_id: JobId,
        outcome: ItemOutcome,
        count: u64,
    ) -> Result<Job, JobStoreError> {
        self.update(job_id, |job| job.record(outcome, count))
    }

    async fn finish(
        &self,
        job_id: JobId,
        status: JobStatus,
        error_message: Option<String>,
    ) -> Result<Job, JobStoreError> {
        self.update(job_id, |job| job.finish(status, error_message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::JobConfig;

    fn pending_job(task_id: TaskId) -> Job {
        Job::new(task_id, JobConfig::default())
    }

    #[tokio::test]
    async fn insert_and_get() {
        let store = InMemoryJobStore::new();
        let job = pending_job(TaskId::new());

        store.insert(&job).await.unwrap();
        assert_eq!(store.get(job.id).await.unwrap(), Some(job.clone()));
        assert!(matches!(
            store.insert(&job).await,
            Err(JobStoreError::AlreadyExists(_))
        ));
        assert!(store.get(JobId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn counters_follow_the_lifecycle() {
        let store = InMemoryJobStore::new();
        let job = pending_job(TaskId::new());
        store.insert(&job).await.unwrap();

        let running = store.begin(job.id, 4, 1).await.unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert_eq!(running.counters.skipped, 1);

        store.record(job.id, ItemOutcome::Success, 1).await.unwrap();
        store.record(job.id, ItemOutcome::Failed, 1).await.unwrap();
        let after = store.record(job.id, ItemOutcome::Skipped, 1).await.unwrap();
        assert_eq!(after.counters.processed, 4);
        assert!(after.counters.is_consistent());

        let err = store.record(job.id, ItemOutcome::Success, 1).await.unwrap_err();
        assert!(matches!(err, JobStoreError::InvalidTransition { .. }));
        assert_eq!(store.get(job.id).await.unwrap().unwrap().counters.processed, 4);

        let done = store.finish(job.id, JobStatus::Completed, None).await.unwrap();
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn terminal_jobs_reject_updates() {
        let store = InMemoryJobStore::new();
        let job = pending_job(TaskId::new());
        store.insert(&job).await.unwrap();
        store.finish(job.id, JobStatus::Cancelled, None).await.unwrap();

        assert!(store.begin(job.id, 1, 0).await.is_err());
        assert!(store.finish(job.id, JobStatus::Failed, Some("x".into())).await.is_err());
        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert!(stored.error_message.is_none());
    }

    #[tokio::test]
    async fn lists_newest_first_per_task() {
        let store = InMemoryJobStore::new();
        let task = TaskId::new();
        let first = pending_job(task);
        let second = pending_job(task);
        store.insert(&first).await.unwrap();
        store.insert(&second).await.unwrap();
        store.insert(&pending_job(TaskId::new())).await.unwrap();

        let ids: Vec<_> = store
            .list_by_task(task)
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }

    #[tokio::test]
    async fn list_by_status_filters() {
        let store = InMemoryJobStore::new();
        let a = pending_job(TaskId::new());
        let b = pending_job(TaskId::new());
        store.insert(&a).await.unwrap();
        store.insert(&b).await.unwrap();
        store.begin(b.id, 0, 0).await.unwrap();

        let running = store.list_by_status(&[JobStatus::Running]).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, b.id);

        let active = store
            .list_by_status(&[JobStatus::Pending, JobStatus::Running])
            .await
            .unwrap();
        assert_eq!(active.len(), 2);
    }

    #[tokio::test]
    async fn concurrent_records_are_not_lost() {
        let store = InMemoryJobStore::arc();
        let job = pending_job(TaskId::new());
        store.insert(&job).await.unwrap();
        store.begin(job.id, 200, 0).await.unwrap();
        let job_id = job.id;

        let mut handles = Vec::new();
        for i in 0..200 {
            let store = store.clone();
            let outcome = if i % 3 == 0 {
                ItemOutcome::Failed
            } else {
                ItemOutcome::Success
            };
            handles.push(tokio::spawn(async move {
                store.record(job_id, outcome, 1).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let stored = store.get(job_id).await.unwrap().unwrap();
        assert_eq!(stored.counters.processed, 200);
        assert_eq!(stored.counters.failed, 67);
        assert_eq!(stored.counters.success, 133);
    }
}
