//! Batch analysis jobs.
//!
//! ## Components
//!
//! - `WorkItemSource`: enumerates a job's items (records or clusters)
//! - `ContentPreparer`: turns an item into the text sent to the AI caller
//! - `call_with_retry`: per-item timeout, classification and backoff
//! - `BatchScheduler`: bounded worker pool running one job
//! - `JobStore`: durable job records and counters (progress tracker)
//! - `ResultSink`: saved results, the idempotency checkpoint for resume
//! - `BatchJobManager`: create / status / cancel / resume

pub mod cancel;
pub mod manager;
pub mod postgres;
pub mod prepare;
pub mod retry;
pub mod scheduler;
pub mod sink;
pub mod source;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use cancel::CancellationFlag;
pub use manager::{BatchJobManager, INTERRUPTED_MESSAGE, JobControlError, JobDefaults, SingleAnalysis};
pub use postgres::{PostgresJobStore, PostgresResultSink};
pub use prepare::{ContentPreparer, IdentityMasker, PrepareError, RecordContentPreparer, TextMasker};
pub use retry::{AttemptReport, call_with_retry};
pub use scheduler::{BatchScheduler, SchedulerError, SchedulerSettings};
pub use sink::{InMemoryResultSink, ResultSink, SinkError, StoredResult};
pub use source::{DatasetWorkSource, Disposition, Enumeration, SourceError, WorkItem, WorkItemSource, WorkPayload};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{
    ItemOutcome, Job, JobConfig, JobCounters, JobId, JobStatus, ResultKind, RetryPolicy,
    WorkItemKind,
};
