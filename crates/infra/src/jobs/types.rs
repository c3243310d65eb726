//! Core job types and policies.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use recap_ai::{DEFAULT_ANALYSIS_INSTRUCTIONS, default_filter_keywords};
use recap_core::{DomainError, DomainResult, TaskId};

pub use recap_core::JobId;

/// Upper bound on `JobConfig::concurrency` (external rate limits).
pub const MAX_CONCURRENCY: usize = 20;
/// Upper bound on `JobConfig::max_retries`.
pub const MAX_RETRIES: u32 = 10;

pub const DEFAULT_CONCURRENCY: usize = 5;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// What one work item of a job represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemKind {
    /// One item per record.
    Record,
    /// One item per unordered sender/receiver pair.
    PeopleCluster,
    /// One item per distinct subject line.
    SubjectCluster,
}

impl WorkItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkItemKind::Record => "record",
            WorkItemKind::PeopleCluster => "people_cluster",
            WorkItemKind::SubjectCluster => "subject_cluster",
        }
    }

    pub fn is_cluster(&self) -> bool {
        !matches!(self, WorkItemKind::Record)
    }

    /// The analysis kind results of this item kind are stored under.
    pub fn result_kind(&self) -> ResultKind {
        match self {
            WorkItemKind::Record => ResultKind::RecordSummary,
            WorkItemKind::PeopleCluster => ResultKind::PeopleInsight,
            WorkItemKind::SubjectCluster => ResultKind::SubjectInsight,
        }
    }
}

impl FromStr for WorkItemKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "record" => Ok(WorkItemKind::Record),
            "people_cluster" => Ok(WorkItemKind::PeopleCluster),
            "subject_cluster" => Ok(WorkItemKind::SubjectCluster),
            other => Err(DomainError::validation(format!(
                "unknown work item kind `{other}` (expected record, people_cluster or subject_cluster)"
            ))),
        }
    }
}

/// Analysis kind component of a Result Sink key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    RecordSummary,
    PeopleInsight,
    SubjectInsight,
}

impl ResultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultKind::RecordSummary => "record_summary",
            ResultKind::PeopleInsight => "people_insight",
            ResultKind::SubjectInsight => "subject_insight",
        }
    }
}

impl FromStr for ResultKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "record_summary" => Ok(ResultKind::RecordSummary),
            "people_insight" => Ok(ResultKind::PeopleInsight),
            "subject_insight" => Ok(ResultKind::SubjectInsight),
            other => Err(DomainError::validation(format!("unknown result kind `{other}`"))),
        }
    }
}

/// Job lifecycle status.
///
/// `Pending -> Running -> {Completed, Failed, Cancelled, Interrupted}`; a
/// pending job may also go straight to a terminal state. Terminal states are
/// final: a resume creates a new job instead of reopening an old one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    /// Systemic fault (dataset unreadable, storage down); see `error_message`.
    Failed,
    Cancelled,
    /// The hosting process stopped while the job was active.
    Interrupted,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Interrupted => "INTERRUPTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            JobStatus::Failed | JobStatus::Cancelled | JobStatus::Interrupted
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Pending, JobStatus::Running) => true,
            (JobStatus::Pending | JobStatus::Running, n) => n.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            "CANCELLED" => Ok(JobStatus::Cancelled),
            "INTERRUPTED" => Ok(JobStatus::Interrupted),
            other => Err(DomainError::validation(format!("unknown job status `{other}`"))),
        }
    }
}

/// Immutable per-job configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Instructions sent with every AI call.
    pub instructions: String,
    /// Case-insensitive keywords; matching records are skipped at enumeration.
    pub filter_keywords: Vec<String>,
    /// Maximum number of AI calls in flight (1..=20).
    pub concurrency: usize,
    /// Retries after the first attempt for transient failures (0..=10).
    pub max_retries: u32,
    pub kind: WorkItemKind,
    /// Registered model name picking the AI caller; the default caller when unset.
    pub model: Option<String>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            instructions: DEFAULT_ANALYSIS_INSTRUCTIONS.to_string(),
            filter_keywords: default_filter_keywords(),
            concurrency: DEFAULT_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            kind: WorkItemKind::Record,
            model: None,
        }
    }
}

impl JobConfig {
    pub fn for_kind(kind: WorkItemKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_filter_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter_keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.concurrency == 0 || self.concurrency > MAX_CONCURRENCY {
            return Err(DomainError::validation(format!(
                "concurrency must be between 1 and {MAX_CONCURRENCY}, got {}",
                self.concurrency
            )));
        }
        if self.max_retries > MAX_RETRIES {
            return Err(DomainError::validation(format!(
                "max_retries must be at most {MAX_RETRIES}, got {}",
                self.max_retries
            )));
        }
        if self.instructions.trim().is_empty() {
            return Err(DomainError::validation("instructions must not be empty"));
        }
        Ok(())
    }
}

/// Final disposition of one work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    Success,
    Failed,
    Skipped,
}

/// Aggregated progress counters.
///
/// Invariant: `processed == success + failed + skipped` and `processed <= total`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    pub total: u64,
    pub processed: u64,
    pub success: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl JobCounters {
    /// Apply `count` outcomes; fails (without mutating) if that would exceed `total`.
    pub fn record(&mut self, outcome: ItemOutcome, count: u64) -> DomainResult<()> {
        if self.processed + count > self.total {
            return Err(DomainError::conflict(format!(
                "recording {count} outcome(s) would exceed total ({} of {} processed)",
                self.processed, self.total
            )));
        }
        match outcome {
            ItemOutcome::Success => self.success += count,
            ItemOutcome::Failed => self.failed += count,
            ItemOutcome::Skipped => self.skipped += count,
        }
        self.processed += count;
        Ok(())
    }

    pub fn remaining(&self) -> u64 {
        self.total - self.processed
    }

    pub fn is_consistent(&self) -> bool {
        self.processed == self.success + self.failed + self.skipped && self.processed <= self.total
    }

    /// `floor(processed / total * 100)`; an empty job counts as done.
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        ((self.processed * 100) / self.total) as u8
    }
}

/// Retry policy for a single work item.
///
/// Only transient failures are retried. The delay before retry `n` is
/// `base_delay * 2^(n-1)`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = single attempt).
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// Delay before retry number `retry` (1-indexed).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis();
        let max_ms = self.max_delay.as_millis().max(base_ms);

        let exp = 1u128 << (retry - 1).min(32);
        let delay_ms = base_ms.saturating_mul(exp).min(max_ms);

        Duration::from_millis(delay_ms.min(u64::MAX as u128) as u64)
    }

    /// Whether another attempt is allowed after `retries_done` retries.
    pub fn should_retry(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }

    /// Total attempts an always-transient item gets.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

/// One batch analysis run (the job record read by polling clients).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Dataset whose records are enumerated.
    pub task_id: TaskId,
    pub status: JobStatus,
    pub config: JobConfig,
    #[serde(flatten)]
    pub counters: JobCounters,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Job-level fault only; per-item failures are counted, not reported here.
    pub error_message: Option<String>,
    /// The terminated job this one resumes, if any.
    pub resumed_from: Option<JobId>,
}

impl Job {
    /// Create a new pending job.
    pub fn new(task_id: TaskId, config: JobConfig) -> Self {
        Self {
            id: JobId::new(),
            task_id,
            status: JobStatus::Pending,
            config,
            counters: JobCounters::default(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            resumed_from: None,
        }
    }

    /// A fresh pending job replaying `previous`'s task and configuration.
    pub fn resume_of(previous: &Job) -> Self {
        let mut job = Self::new(previous.task_id, previous.config.clone());
        job.resumed_from = Some(previous.id);
        job
    }

    /// Fix `total` after enumeration, count filtered items, and start running.
    pub fn begin(&mut self, total: u64, filtered: u64) -> DomainResult<()> {
        self.transition(JobStatus::Running)?;
        if filtered > total {
            return Err(DomainError::validation(format!(
                "filtered count {filtered} exceeds total {total}"
            )));
        }
        self.counters = JobCounters {
            total,
            processed: filtered,
            skipped: filtered,
            ..Default::default()
        };
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn record(&mut self, outcome: ItemOutcome, count: u64) -> DomainResult<()> {
        if self.status != JobStatus::Running {
            return Err(DomainError::conflict(format!(
                "cannot record outcomes on a {} job",
                self.status
            )));
        }
        self.counters.record(outcome, count)
    }

    /// Move to a terminal status and stamp `completed_at`.
    pub fn finish(&mut self, status: JobStatus, error_message: Option<String>) -> DomainResult<()> {
        if !status.is_terminal() {
            return Err(DomainError::validation(format!("{status} is not a terminal status")));
        }
        self.transition(status)?;
        if error_message.is_some() {
            self.error_message = error_message;
        }
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn percent_complete(&self) -> u8 {
        self.counters.percent()
    }

    fn transition(&mut self, next: JobStatus) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::conflict(format!(
                "invalid job transition {} -> {}",
                self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy = RetryPolicy::exponential(
            5,
            Duration::from_millis(100),
            Duration::from_millis(500),
        );

        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_retry(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for_retry(60), Duration::from_millis(500));
    }

    #[test]
    fn cap_below_base_uses_base() {
        let policy = RetryPolicy::exponential(3, Duration::from_millis(500), Duration::from_millis(100));

        assert_eq!(policy.delay_for_retry(0), Duration::ZERO);
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(500));
    }

    #[test]
    fn should_retry_respects_max_retries() {
        let policy = RetryPolicy {
            max_retries: 2,
            ..Default::default()
        };

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
        assert_eq!(policy.max_attempts(), 3);
        assert!(!RetryPolicy::no_retry().should_retry(0));
    }

    #[test]
    fn config_validation_bounds() {
        assert!(JobConfig::default().validate().is_ok());
        assert!(JobConfig::default().with_concurrency(0).validate().is_err());
        assert!(JobConfig::default().with_concurrency(21).validate().is_err());
        assert!(JobConfig::default().with_concurrency(20).validate().is_ok());
        assert!(JobConfig::default().with_max_retries(11).validate().is_err());
        assert!(JobConfig::default().with_max_retries(0).validate().is_ok());
        assert!(JobConfig::default().with_instructions("  ").validate().is_err());
    }

    #[test]
    fn job_lifecycle() {
        let mut job = Job::new(TaskId::new(), JobConfig::default());
        assert_eq!(job.status, JobStatus::Pending);

        job.begin(3, 1).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.started_at.is_some());
        assert_eq!(job.counters.skipped, 1);
        assert_eq!(job.counters.processed, 1);

        job.record(ItemOutcome::Success, 1).unwrap();
        job.record(ItemOutcome::Failed, 1).unwrap();
        assert!(job.record(ItemOutcome::Success, 1).is_err());

        job.finish(JobStatus::Completed, None).unwrap();
        assert!(job.completed_at.is_some());
        assert_eq!(job.percent_complete(), 100);
        assert!(job.counters.is_consistent());
    }

    #[test]
    fn terminal_states_are_final() {
        let mut job = Job::new(TaskId::new(), JobConfig::default());
        job.finish(JobStatus::Cancelled, None).unwrap();

        assert!(job.begin(1, 0).is_err());
        assert!(job.finish(JobStatus::Completed, None).is_err());
        assert_eq!(job.status, JobStatus::Cancelled);
    }

    #[test]
    fn outcomes_need_a_running_job() {
        let mut job = Job::new(TaskId::new(), JobConfig::default());
        assert!(job.record(ItemOutcome::Success, 1).is_err());
    }

    #[test]
    fn resume_copies_config_and_links_back() {
        let mut old = Job::new(
            TaskId::new(),
            JobConfig::for_kind(WorkItemKind::SubjectCluster).with_concurrency(7),
        );
        old.finish(JobStatus::Failed, Some("dataset unreadable".into())).unwrap();

        let new = Job::resume_of(&old);
        assert_ne!(new.id, old.id);
        assert_eq!(new.task_id, old.task_id);
        assert_eq!(new.config, old.config);
        assert_eq!(new.status, JobStatus::Pending);
        assert_eq!(new.resumed_from, Some(old.id));
        assert!(new.error_message.is_none());
    }

    #[test]
    fn percent_floors() {
        let c = JobCounters {
            total: 3,
            processed: 2,
            success: 2,
            ..Default::default()
        };
        assert_eq!(c.percent(), 66);
        assert_eq!(JobCounters::default().percent(), 100);
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
            JobStatus::Interrupted,
        ] {
            assert_eq!(s.as_str().parse::<JobStatus>().unwrap(), s);
        }
        assert_eq!(
            serde_json::to_value(JobStatus::Interrupted).unwrap(),
            serde_json::json!("INTERRUPTED")
        );
    }

    proptest! {
        #[test]
        fn backoff_delays_never_decrease(
            base_ms in 1u64..5_000,
            cap_ms in 1u64..120_000,
        ) {
            let policy = RetryPolicy::exponential(
                10,
                Duration::from_millis(base_ms),
                Duration::from_millis(cap_ms),
            );
            let mut prev = Duration::ZERO;
            for retry in 1..=40 {
                let d = policy.delay_for_retry(retry);
                prop_assert!(d >= prev);
                prev = d;
            }
        }

        #[test]
        fn counters_stay_consistent(
            total in 0u64..200,
            outcomes in proptest::collection::vec(0u8..3, 0..300),
        ) {
            let mut c = JobCounters { total, ..Default::default() };
            for o in outcomes {
                let outcome = match o {
                    0 => ItemOutcome::Success,
                    1 => ItemOutcome::Failed,
                    _ => ItemOutcome::Skipped,
                };
                let before = c;
                if c.record(outcome, 1).is_err() {
                    prop_assert_eq!(c, before);
                }
                prop_assert!(c.is_consistent());
            }
        }
    }
}
