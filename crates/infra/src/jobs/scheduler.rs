//! Worker pool driving one job from enumeration to a terminal status.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use recap_ai::{AiCaller, AiCallers};

use super::cancel::CancellationFlag;
use super::prepare::{ContentPreparer, DEFAULT_CLUSTER_LIMIT};
use super::retry::call_with_retry;
use super::sink::{ResultSink, StoredResult};
use super::source::{WorkItem, WorkItemSource};
use super::store::{JobStore, JobStoreError};
use super::types::{ItemOutcome, Job, JobId, JobStatus, RetryPolicy, WorkItemKind};

/// Process-wide scheduler tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// Per-call timeout for single-record items.
    pub record_timeout: Duration,
    /// Per-call timeout for cluster items (longer texts).
    pub cluster_timeout: Duration,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Most recent records composing a cluster's text.
    pub cluster_limit: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            record_timeout: Duration::from_secs(60),
            cluster_timeout: Duration::from_secs(90),
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            cluster_limit: DEFAULT_CLUSTER_LIMIT,
        }
    }
}

impl SchedulerSettings {
    pub fn timeout_for(&self, kind: WorkItemKind) -> Duration {
        if kind.is_cluster() {
            self.cluster_timeout
        } else {
            self.record_timeout
        }
    }

    pub fn retry_policy(&self, max_retries: u32) -> RetryPolicy {
        RetryPolicy::exponential(max_retries, self.retry_base_delay, self.retry_max_delay)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SchedulerError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Runs batch jobs against a set of collaborators.
///
/// The scheduler owns no job state of its own; everything a polling client
/// sees goes through the [`JobStore`].
#[derive(Clone)]
pub struct BatchScheduler {
    store: Arc<dyn JobStore>,
    source: Arc<dyn WorkItemSource>,
    preparer: Arc<dyn ContentPreparer>,
    callers: AiCallers,
    sink: Arc<dyn ResultSink>,
    settings: SchedulerSettings,
}

impl BatchScheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        source: Arc<dyn WorkItemSource>,
        preparer: Arc<dyn ContentPreparer>,
        caller: Arc<dyn AiCaller>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            store,
            source,
            preparer,
            callers: AiCallers::new(caller),
            sink,
            settings: SchedulerSettings::default(),
        }
    }

    /// Replace the callers jobs pick from by model name.
    pub fn with_callers(mut self, callers: AiCallers) -> Self {
        self.callers = callers;
        self
    }

    pub fn with_settings(mut self, settings: SchedulerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn callers(&self) -> &AiCallers {
        &self.callers
    }

    pub fn preparer(&self) -> &Arc<dyn ContentPreparer> {
        &self.preparer
    }

    pub fn sink(&self) -> &Arc<dyn ResultSink> {
        &self.sink
    }

    /// Run a pending job to completion and return its final record.
    ///
    /// Item failures only move counters. The job ends FAILED only on a
    /// systemic fault: enumeration, an unregistered model, the result sink
    /// or the job store itself.
    pub async fn run(&self, job_id: JobId, cancel: CancellationFlag) -> Result<Job, SchedulerError> {
        let job = self
            .store
            .get(job_id)
            .await?
            .ok_or(SchedulerError::JobNotFound(job_id))?;

        if cancel.is_cancelled() {
            info!(job_id = %job_id, "job cancelled before start");
            return Ok(self.store.finish(job_id, JobStatus::Cancelled, None).await?);
        }

        let enumeration = match self
            .source
            .enumerate(job.task_id, job.config.kind, &job.config.filter_keywords)
            .await
        {
            Ok(e) => e,
            Err(e) => {
                error!(job_id = %job_id, task_id = %job.task_id, error = %e, "enumeration failed");
                let (status, message) = terminal_status(&cancel, Some(e.to_string()));
                return Ok(self.store.finish(job_id, status, message).await?);
            }
        };

        let caller = match self.callers.resolve(job.config.model.as_deref()) {
            Ok(caller) => caller.clone(),
            Err(e) => {
                error!(job_id = %job_id, error = %e, "no caller for job model");
                let (status, message) = terminal_status(&cancel, Some(e.to_string()));
                return Ok(self.store.finish(job_id, status, message).await?);
            }
        };

        let total = enumeration.total();
        let filtered = enumeration.filtered_count();
        let job = self.store.begin(job_id, total, filtered).await?;
        let items = enumeration.into_dispatchable();

        info!(
            job_id = %job_id,
            task_id = %job.task_id,
            kind = job.config.kind.as_str(),
            total,
            filtered,
            dispatchable = items.len(),
            concurrency = job.config.concurrency,
            provider = caller.provider(),
            "job started"
        );

        let fault = self.drain(&job, items, &caller, &cancel).await;

        let (status, message) = terminal_status(&cancel, fault);
        let finished = self.store.finish(job_id, status, message).await?;

        info!(
            job_id = %job_id,
            status = %finished.status,
            processed = finished.counters.processed,
            success = finished.counters.success,
            failed = finished.counters.failed,
            skipped = finished.counters.skipped,
            "job finished"
        );
        Ok(finished)
    }

    /// Process `items` with at most `concurrency` workers. Returns the first
    /// systemic fault, if any.
    async fn drain(
        &self,
        job: &Job,
        items: Vec<WorkItem>,
        caller: &Arc<dyn AiCaller>,
        cancel: &CancellationFlag,
    ) -> Option<String> {
        let workers = job.config.concurrency.max(1).min(items.len());
        let queue = Arc::new(Mutex::new(VecDeque::from(items)));
        let fault: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        let mut pool = JoinSet::new();
        for worker in 0..workers {
            let this = self.clone();
            let job = job.clone();
            let queue = queue.clone();
            let fault = fault.clone();
            let caller = caller.clone();
            let cancel = cancel.clone();
            pool.spawn(async move {
                this.worker_loop(worker, &job, &queue, &fault, &caller, &cancel).await;
            });
        }

        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                error!(job_id = %job.id, error = %e, "worker task aborted");
                set_fault(&fault, format!("worker task aborted: {e}"));
            }
        }

        let fault = fault.lock().ok().and_then(|mut f| f.take());

        if fault.is_none() && cancel.is_cancelled() {
            let remaining = queue.lock().map(|q| q.len()).unwrap_or(0) as u64;
            if remaining > 0 {
                info!(job_id = %job.id, remaining, "cancellation observed, skipping unclaimed items");
                if let Err(e) = self.store.record(job.id, ItemOutcome::Skipped, remaining).await {
                    return Some(format!("failed to record skipped items: {e}"));
                }
            }
        }

        fault
    }

    async fn worker_loop(
        &self,
        worker: usize,
        job: &Job,
        queue: &Mutex<VecDeque<WorkItem>>,
        fault: &Mutex<Option<String>>,
        caller: &Arc<dyn AiCaller>,
        cancel: &CancellationFlag,
    ) {
        loop {
            if cancel.is_cancelled() || has_fault(fault) {
                break;
            }
            let Some(item) = queue.lock().ok().and_then(|mut q| q.pop_front()) else {
                break;
            };

            let outcome = match self.process_item(job, &item, caller, cancel).await {
                Ok(outcome) => outcome,
                Err(message) => {
                    error!(job_id = %job.id, key = %item.key, error = %message, "systemic failure");
                    set_fault(fault, message);
                    break;
                }
            };

            if let Err(e) = self.store.record(job.id, outcome, 1).await {
                error!(job_id = %job.id, key = %item.key, error = %e, "failed to record outcome");
                set_fault(fault, format!("failed to record outcome: {e}"));
                break;
            }
        }
        debug!(job_id = %job.id, worker, "worker exiting");
    }

    /// One item: idempotency check, preparation, AI call with retry, save.
    ///
    /// `Err` carries a systemic fault message; every item-level problem is
    /// folded into the returned outcome.
    async fn process_item(
        &self,
        job: &Job,
        item: &WorkItem,
        caller: &Arc<dyn AiCaller>,
        cancel: &CancellationFlag,
    ) -> Result<ItemOutcome, String> {
        let kind = job.config.kind.result_kind();

        let done = self
            .sink
            .has_result(job.task_id, &item.key, kind)
            .await
            .map_err(|e| e.to_string())?;
        if done {
            debug!(job_id = %job.id, key = %item.key, "already analysed, skipping");
            return Ok(ItemOutcome::Skipped);
        }

        if cancel.is_cancelled() {
            return Ok(ItemOutcome::Skipped);
        }

        let text = match self.preparer.prepare(job.task_id, item).await {
            Ok(text) => text,
            Err(e) => {
                warn!(job_id = %job.id, key = %item.key, error = %e, "preparation failed");
                return Ok(ItemOutcome::Failed);
            }
        };

        if cancel.is_cancelled() {
            return Ok(ItemOutcome::Skipped);
        }

        let report = call_with_retry(
            caller.as_ref(),
            &item.key,
            &text,
            &job.config.instructions,
            &self.settings.retry_policy(job.config.max_retries),
            self.settings.timeout_for(job.config.kind),
            cancel,
        )
        .await;

        match report.outcome {
            Ok(result) => {
                let provider = caller.provider().to_string();
                self.sink
                    .save_result(StoredResult::new(job.task_id, item.key.clone(), kind, provider, result))
                    .await
                    .map_err(|e| e.to_string())?;
                debug!(job_id = %job.id, key = %item.key, attempts = report.attempts, "item analysed");
                Ok(ItemOutcome::Success)
            }
            Err(e) => {
                warn!(
                    job_id = %job.id,
                    key = %item.key,
                    attempts = report.attempts,
                    cancelled = report.cancelled,
                    error = %e,
                    "item failed"
                );
                Ok(ItemOutcome::Failed)
            }
        }
    }
}

/// Seal `cancel` and pick the terminal status. An accepted cancellation
/// always wins; a fault message is kept either way.
fn terminal_status(cancel: &CancellationFlag, fault: Option<String>) -> (JobStatus, Option<String>) {
    if cancel.seal() {
        return (JobStatus::Cancelled, fault);
    }
    match fault {
        Some(message) => (JobStatus::Failed, Some(message)),
        None => (JobStatus::Completed, None),
    }
}

fn has_fault(fault: &Mutex<Option<String>>) -> bool {
    fault.lock().map(|f| f.is_some()).unwrap_or(true)
}

fn set_fault(fault: &Mutex<Option<String>>, message: String) {
    if let Ok(mut f) = fault.lock() {
        f.get_or_insert(message);
    }
}
