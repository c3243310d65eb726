//! Job control surface: create, observe, cancel, resume.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};

use recap_ai::{AnalysisResult, DEFAULT_ANALYSIS_INSTRUCTIONS, default_filter_keywords};
use recap_core::TaskId;

use crate::dataset::{RecordId, RecordStoreError};

use super::cancel::CancellationFlag;
use super::prepare::PrepareError;
use super::retry::call_with_retry;
use super::scheduler::BatchScheduler;
use super::sink::StoredResult;
use super::source::WorkItem;
use super::store::JobStoreError;
use super::types::{
    DEFAULT_CONCURRENCY, DEFAULT_MAX_RETRIES, Job, JobConfig, JobId, JobStatus, MAX_CONCURRENCY,
    MAX_RETRIES, RetryPolicy, WorkItemKind,
};

/// Message stored on jobs found active with no executor behind them.
pub const INTERRUPTED_MESSAGE: &str = "process stopped while the job was active";

/// Errors returned synchronously by control operations. None of them mutate state.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobControlError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("record {record_id} not found in task {task_id}")]
    RecordNotFound { task_id: TaskId, record_id: RecordId },

    #[error("job {job_id} is {status} and cannot be cancelled")]
    NotCancellable { job_id: JobId, status: JobStatus },

    #[error("job {job_id} is {status}; only FAILED, CANCELLED or INTERRUPTED jobs can be resumed")]
    NotResumable { job_id: JobId, status: JobStatus },

    #[error("task {task_id} already has an active job ({active})")]
    Conflict { task_id: TaskId, active: JobId },

    #[error("invalid job configuration: {0}")]
    InvalidConfig(String),

    #[error("timed out waiting for job {0}")]
    Timeout(JobId),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<JobStoreError> for JobControlError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(id) => JobControlError::NotFound(id),
            other => JobControlError::Storage(other.to_string()),
        }
    }
}

/// Values a client starts from when configuring a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobDefaults {
    pub instructions: String,
    pub filter_keywords: Vec<String>,
    pub concurrency: usize,
    pub max_retries: u32,
    pub max_concurrency: usize,
    pub max_retries_limit: u32,
}

/// Outcome of a one-off single-record analysis.
#[derive(Debug, Clone, Serialize)]
pub struct SingleAnalysis {
    pub task_id: TaskId,
    pub record_id: RecordId,
    pub provider: String,
    pub result: AnalysisResult,
    /// The AI call failed and `result` describes the failure.
    pub fallback: bool,
}

/// Owns the running jobs of this process.
///
/// A job is live while its executor is registered here. Readers report an
/// active job with no live executor as INTERRUPTED.
#[derive(Clone)]
pub struct BatchJobManager {
    scheduler: BatchScheduler,
    active: Arc<RwLock<HashMap<JobId, CancellationFlag>>>,
    // Serialises the conflict check with job insertion.
    launch: Arc<AsyncMutex<()>>,
}

impl BatchJobManager {
    pub fn new(scheduler: BatchScheduler) -> Self {
        Self {
            scheduler,
            active: Arc::new(RwLock::new(HashMap::new())),
            launch: Arc::new(AsyncMutex::new(())),
        }
    }

    pub fn scheduler(&self) -> &BatchScheduler {
        &self.scheduler
    }

    /// Whether an executor for `job_id` is running in this process.
    pub fn is_live(&self, job_id: JobId) -> bool {
        self.active
            .read()
            .map(|a| a.contains_key(&job_id))
            .unwrap_or(false)
    }

    /// Validate `config`, persist a PENDING job and start executing it.
    pub async fn create_job(&self, task_id: TaskId, config: JobConfig) -> Result<Job, JobControlError> {
        config
            .validate()
            .map_err(|e| JobControlError::InvalidConfig(e.to_string()))?;
        self.ensure_known_model(&config)?;

        let _guard = self.launch.lock().await;
        self.ensure_no_active_job(task_id).await?;

        let job = Job::new(task_id, config);
        self.launch_job(job).await
    }

    /// Create a new job replaying a terminated job's task and configuration.
    ///
    /// The old record is left as it is; items it already completed are
    /// skipped by the new run.
    pub async fn resume(&self, job_id: JobId) -> Result<Job, JobControlError> {
        let previous = self.get_job(job_id).await?;
        if !previous.status.is_resumable() {
            return Err(JobControlError::NotResumable {
                job_id,
                status: previous.status,
            });
        }
        self.ensure_known_model(&previous.config)?;

        let _guard = self.launch.lock().await;
        self.ensure_no_active_job(previous.task_id).await?;

        let job = Job::resume_of(&previous);
        info!(job_id = %job.id, resumed_from = %job_id, "resuming job");
        self.launch_job(job).await
    }

    /// Current job record, with dead active jobs reported as INTERRUPTED.
    pub async fn get_job(&self, job_id: JobId) -> Result<Job, JobControlError> {
        let job = self
            .scheduler
            .store()
            .get(job_id)
            .await?
            .ok_or(JobControlError::NotFound(job_id))?;
        Ok(self.reclassify(job))
    }

    /// All jobs of a task, newest first.
    pub async fn list_jobs(&self, task_id: TaskId) -> Result<Vec<Job>, JobControlError> {
        let jobs = self.scheduler.store().list_by_task(task_id).await?;
        Ok(jobs.into_iter().map(|j| self.reclassify(j)).collect())
    }

    /// Request cooperative cancellation of an active job.
    ///
    /// Once the executor has started finalising the job the request is
    /// refused, so a successful return always ends in CANCELLED.
    pub async fn cancel(&self, job_id: JobId) -> Result<Job, JobControlError> {
        let job = self.get_job(job_id).await?;
        if !job.status.is_active() {
            return Err(JobControlError::NotCancellable {
                job_id,
                status: job.status,
            });
        }

        let flag = self
            .active
            .read()
            .ok()
            .and_then(|a| a.get(&job_id).cloned());
        match flag {
            Some(flag) if flag.cancel() => {
                info!(job_id = %job_id, "cancellation requested");
                Ok(job)
            }
            // The executor is finalising or finished between the read and now.
            _ => {
                let job = self.get_job(job_id).await?;
                Err(JobControlError::NotCancellable {
                    job_id,
                    status: job.status,
                })
            }
        }
    }

    /// Persist INTERRUPTED for active jobs with no executor in this process.
    ///
    /// Meant to run once at startup, before any job is launched.
    pub async fn recover_interrupted(&self) -> Result<Vec<JobId>, JobControlError> {
        let store = self.scheduler.store();
        let stale = store
            .list_by_status(&[JobStatus::Pending, JobStatus::Running])
            .await?;

        let mut recovered = Vec::new();
        for job in stale {
            if self.is_live(job.id) {
                continue;
            }
            match store
                .finish(job.id, JobStatus::Interrupted, Some(INTERRUPTED_MESSAGE.to_string()))
                .await
            {
                Ok(_) => {
                    warn!(job_id = %job.id, previous = %job.status, "marked interrupted");
                    recovered.push(job.id);
                }
                Err(JobStoreError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(recovered)
    }

    /// Analyse one record outside any job and save the result.
    ///
    /// Uses `instructions`, else those of the task's latest record job, else
    /// the defaults. `model` picks a registered caller. A failed AI call
    /// saves and returns a fallback result.
    pub async fn analyze_single(
        &self,
        task_id: TaskId,
        record_id: RecordId,
        instructions: Option<String>,
        model: Option<String>,
    ) -> Result<SingleAnalysis, JobControlError> {
        let caller = self
            .scheduler
            .callers()
            .resolve(model.as_deref())
            .map_err(|e| JobControlError::InvalidConfig(e.to_string()))?
            .clone();
        let instructions = match instructions.filter(|i| !i.trim().is_empty()) {
            Some(i) => i,
            None => self.latest_record_instructions(task_id).await?,
        };

        let item = WorkItem::record(record_id);
        let provider = caller.provider().to_string();

        let outcome = match self.scheduler.preparer().prepare(task_id, &item).await {
            Ok(text) => {
                call_with_retry(
                    caller.as_ref(),
                    &item.key,
                    &text,
                    &instructions,
                    &RetryPolicy::no_retry(),
                    self.scheduler.settings().record_timeout,
                    &CancellationFlag::new(),
                )
                .await
                .outcome
                .map_err(|e| e.to_string())
            }
            Err(PrepareError::RecordNotFound(_))
            | Err(PrepareError::Dataset(RecordStoreError::TaskNotFound(_))) => {
                return Err(JobControlError::RecordNotFound { task_id, record_id });
            }
            Err(PrepareError::Dataset(e)) => return Err(JobControlError::Storage(e.to_string())),
            Err(e) => Err(e.to_string()),
        };

        let (result, fallback) = match outcome {
            Ok(result) => (result, false),
            Err(message) => {
                warn!(task_id = %task_id, record_id, error = %message, "single analysis failed");
                (
                    AnalysisResult::new("analysis failed")
                        .with_risk_level("low")
                        .with_key_findings(format!("Error: {message}")),
                    true,
                )
            }
        };

        let kind = WorkItemKind::Record.result_kind();
        let mut stored = StoredResult::new(task_id, item.key, kind, provider.clone(), result.clone());
        if fallback {
            stored = stored.fallback();
        }
        self.scheduler
            .sink()
            .save_result(stored)
            .await
            .map_err(|e| JobControlError::Storage(e.to_string()))?;

        Ok(SingleAnalysis {
            task_id,
            record_id,
            provider,
            result,
            fallback,
        })
    }

    pub fn defaults(&self) -> JobDefaults {
        JobDefaults {
            instructions: DEFAULT_ANALYSIS_INSTRUCTIONS.to_string(),
            filter_keywords: default_filter_keywords(),
            concurrency: DEFAULT_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            max_concurrency: MAX_CONCURRENCY,
            max_retries_limit: MAX_RETRIES,
        }
    }

    /// Poll until the job reaches a terminal status.
    pub async fn wait_for_terminal(&self, job_id: JobId, timeout: Duration) -> Result<Job, JobControlError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let job = self.get_job(job_id).await?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(JobControlError::Timeout(job_id));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn reclassify(&self, mut job: Job) -> Job {
        if job.status.is_active() && !self.is_live(job.id) {
            job.status = JobStatus::Interrupted;
            job.error_message
                .get_or_insert_with(|| INTERRUPTED_MESSAGE.to_string());
        }
        job
    }

    fn ensure_known_model(&self, config: &JobConfig) -> Result<(), JobControlError> {
        self.scheduler
            .callers()
            .resolve(config.model.as_deref())
            .map(|_| ())
            .map_err(|e| JobControlError::InvalidConfig(e.to_string()))
    }

    async fn ensure_no_active_job(&self, task_id: TaskId) -> Result<(), JobControlError> {
        let jobs = self.scheduler.store().list_by_task(task_id).await?;
        if let Some(active) = jobs
            .iter()
            .find(|j| j.status.is_active() && self.is_live(j.id))
        {
            return Err(JobControlError::Conflict {
                task_id,
                active: active.id,
            });
        }
        Ok(())
    }

    async fn latest_record_instructions(&self, task_id: TaskId) -> Result<String, JobControlError> {
        let jobs = self.scheduler.store().list_by_task(task_id).await?;
        Ok(jobs
            .into_iter()
            .find(|j| j.config.kind == WorkItemKind::Record)
            .map(|j| j.config.instructions)
            .unwrap_or_else(|| DEFAULT_ANALYSIS_INSTRUCTIONS.to_string()))
    }

    async fn launch_job(&self, job: Job) -> Result<Job, JobControlError> {
        let job_id = job.id;
        let flag = CancellationFlag::new();

        // Registered before the record is visible so readers never see it as dead.
        self.register(job_id, flag.clone());
        if let Err(e) = self.scheduler.store().insert(&job).await {
            self.unregister(job_id);
            return Err(e.into());
        }

        let scheduler = self.scheduler.clone();
        let active = self.active.clone();
        tokio::spawn(async move {
            if let Err(e) = scheduler.run(job_id, flag.clone()).await {
                error!(job_id = %job_id, error = %e, "job execution failed");
                let status = if flag.seal() {
                    JobStatus::Cancelled
                } else {
                    JobStatus::Failed
                };
                if let Err(e) = scheduler
                    .store()
                    .finish(job_id, status, Some(e.to_string()))
                    .await
                {
                    error!(job_id = %job_id, error = %e, "could not mark job failed");
                }
            }
            if let Ok(mut a) = active.write() {
                a.remove(&job_id);
            }
        });

        info!(job_id = %job_id, task_id = %job.task_id, kind = job.config.kind.as_str(), "job created");
        Ok(job)
    }

    fn register(&self, job_id: JobId, flag: CancellationFlag) {
        if let Ok(mut a) = self.active.write() {
            a.insert(job_id, flag);
        }
    }

    fn unregister(&self, job_id: JobId) {
        if let Ok(mut a) = self.active.write() {
            a.remove(&job_id);
        }
    }
}
