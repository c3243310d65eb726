use serde::{Deserialize, Serialize};

use recap_core::{JobId, TaskId};
use recap_infra::dataset::RecordId;
use recap_infra::jobs::{Job, JobConfig, JobStatus, WorkItemKind};

// -------------------------
// Request DTOs
// -------------------------

/// Body of `POST /batch-analysis/start`. Omitted fields take the defaults.
#[derive(Debug, Deserialize)]
pub struct StartBatchRequest {
    pub task_id: String,
    pub kind: Option<WorkItemKind>,
    pub instructions: Option<String>,
    pub filter_keywords: Option<Vec<String>>,
    pub concurrency: Option<usize>,
    pub max_retries: Option<u32>,
    pub model: Option<String>,
}

impl StartBatchRequest {
    pub fn to_config(&self) -> JobConfig {
        let mut config = JobConfig::for_kind(self.kind.unwrap_or(WorkItemKind::Record));
        if let Some(instructions) = &self.instructions {
            config = config.with_instructions(instructions.clone());
        }
        if let Some(keywords) = &self.filter_keywords {
            config = config.with_filter_keywords(keywords.iter().cloned());
        }
        if let Some(concurrency) = self.concurrency {
            config = config.with_concurrency(concurrency);
        }
        if let Some(max_retries) = self.max_retries {
            config = config.with_max_retries(max_retries);
        }
        if let Some(model) = self.model.as_deref().filter(|m| !m.trim().is_empty()) {
            config = config.with_model(model);
        }
        config
    }
}

#[derive(Debug, Deserialize)]
pub struct SingleAnalysisRequest {
    pub task_id: String,
    pub record_id: RecordId,
    pub instructions: Option<String>,
    /// Registered model name; the default caller when omitted.
    pub model: Option<String>,
}

// -------------------------
// Response DTOs
// -------------------------

/// Answer to start and resume: the job exists and runs in the background.
#[derive(Debug, Serialize)]
pub struct JobAccepted {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub status: JobStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<JobId>,
}

impl JobAccepted {
    pub fn new(job: &Job, message: impl Into<String>) -> Self {
        Self {
            job_id: job.id,
            task_id: job.task_id,
            status: job.status,
            message: message.into(),
            resumed_from: job.resumed_from,
        }
    }
}

/// Job record plus derived progress.
#[derive(Debug, Serialize)]
pub struct JobView {
    #[serde(flatten)]
    pub job: Job,
    pub progress_percent: u8,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        let progress_percent = job.percent_complete();
        Self {
            job,
            progress_percent,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub task_id: TaskId,
    pub jobs: Vec<JobView>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    pub message: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn omitted_fields_take_defaults() {
        let req: StartBatchRequest =
            serde_json::from_str(r#"{"task_id":"x","concurrency":8}"#).unwrap();
        let config = req.to_config();
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.kind, WorkItemKind::Record);
        assert_eq!(config.max_retries, JobConfig::default().max_retries);
        assert_eq!(config.instructions, JobConfig::default().instructions);
        assert!(config.model.is_none());
    }

    #[test]
    fn cluster_kind_and_empty_keywords() {
        let req: StartBatchRequest = serde_json::from_str(
            r#"{"task_id":"x","kind":"people_cluster","filter_keywords":[],"model":"m1"}"#,
        )
        .unwrap();
        let config = req.to_config();
        assert_eq!(config.kind, WorkItemKind::PeopleCluster);
        assert!(config.filter_keywords.is_empty());
        assert_eq!(config.model.as_deref(), Some("m1"));
    }

    #[test]
    fn job_view_carries_progress_and_flat_counters() {
        let job = Job::new(TaskId::new(), JobConfig::default());
        let value = serde_json::to_value(JobView::from(job)).unwrap();
        assert_eq!(value["status"], "PENDING");
        assert_eq!(value["total"], 0);
        assert_eq!(value["progress_percent"], 100);
    }
}
