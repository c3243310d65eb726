//! Content preparation: turn a work item into the text sent to the AI caller.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use recap_core::TaskId;

use crate::dataset::{Record, RecordStore, RecordStoreError};

use super::source::{WorkItem, WorkPayload};

/// Default number of most recent records composing a cluster's text.
pub const DEFAULT_CLUSTER_LIMIT: usize = 20;
/// Default character budget of a cluster's text.
pub const DEFAULT_MAX_CONTEXT_CHARS: usize = 15_000;

/// Preparation failures. All of them fail the item without retry.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PrepareError {
    #[error("no records found for item `{0}`")]
    RecordNotFound(String),
    #[error("item `{0}` has no content to analyse")]
    EmptyContent(String),
    #[error("dataset read failed: {0}")]
    Dataset(#[from] RecordStoreError),
}

/// Masks sensitive values before text leaves the process.
///
/// One instance serves a whole task so replacement tokens stay consistent
/// across the items of a job.
pub trait TextMasker: Send + Sync + 'static {
    fn mask(&self, task_id: TaskId, text: &str) -> String;
}

/// Passes text through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityMasker;

impl TextMasker for IdentityMasker {
    fn mask(&self, _task_id: TaskId, text: &str) -> String {
        text.to_string()
    }
}

#[async_trait]
pub trait ContentPreparer: Send + Sync + 'static {
    async fn prepare(&self, task_id: TaskId, item: &WorkItem) -> Result<String, PrepareError>;
}

/// Builds analysis text from dataset records.
pub struct RecordContentPreparer {
    records: Arc<dyn RecordStore>,
    masker: Arc<dyn TextMasker>,
    cluster_limit: usize,
    max_chars: usize,
}

impl RecordContentPreparer {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self {
            records,
            masker: Arc::new(IdentityMasker),
            cluster_limit: DEFAULT_CLUSTER_LIMIT,
            max_chars: DEFAULT_MAX_CONTEXT_CHARS,
        }
    }

    pub fn with_masker(mut self, masker: Arc<dyn TextMasker>) -> Self {
        self.masker = masker;
        self
    }

    pub fn with_cluster_limit(mut self, limit: usize) -> Self {
        self.cluster_limit = limit.max(1);
        self
    }

    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }
}

#[async_trait]
impl ContentPreparer for RecordContentPreparer {
    async fn prepare(&self, task_id: TaskId, item: &WorkItem) -> Result<String, PrepareError> {
        let records = self.records.get_records(task_id, item.record_ids()).await?;
        if records.is_empty() {
            return Err(PrepareError::RecordNotFound(item.key.clone()));
        }

        let text = match &item.payload {
            WorkPayload::Record { .. } => record_text(&records[0]),
            WorkPayload::Cluster { .. } => cluster_text(records, self.cluster_limit, self.max_chars),
        }
        .ok_or_else(|| PrepareError::EmptyContent(item.key.clone()))?;

        Ok(self.masker.mask(task_id, &text))
    }
}

/// `"Subject: ...\n\n<content>"`, or `None` when both are blank.
pub fn record_text(record: &Record) -> Option<String> {
    let subject = record.subject.as_deref().unwrap_or("").trim();
    let content = record.content.as_deref().unwrap_or("").trim();
    if subject.is_empty() && content.is_empty() {
        return None;
    }
    Some(format!("Subject: {subject}\n\n{content}"))
}

/// Consecutively numbered blocks of the most recent `limit` records,
/// duplicates and blank records dropped, capped at `max_chars` characters.
pub fn cluster_text(mut records: Vec<Record>, limit: usize, max_chars: usize) -> Option<String> {
    // Newest first; undated records sort last.
    records.sort_by(|a, b| b.sent_at.cmp(&a.sent_at).then(b.id.cmp(&a.id)));
    records.truncate(limit);

    let mut seen: HashSet<&str> = HashSet::new();
    let mut out = String::new();
    let mut used = 0usize;
    let mut emitted = 0usize;

    for record in &records {
        let content = record.content.as_deref().unwrap_or("").trim();
        if content.is_empty() || !seen.insert(content) {
            continue;
        }

        let block = format!(
            "[Record {n}]\nSubject: {subject}\nFrom: {from}\nTo: {to}\nDate: {date}\nContent:\n{content}\n---\n",
            n = emitted + 1,
            subject = record.subject.as_deref().unwrap_or("(no subject)"),
            from = record.sender.as_deref().unwrap_or("unknown"),
            to = record.receiver.as_deref().unwrap_or("unknown"),
            date = record
                .sent_at
                .map(|d| d.to_rfc3339())
                .unwrap_or_else(|| "unknown".to_string()),
        );
        let len = block.chars().count();

        if used + len > max_chars {
            if used == 0 {
                // A single oversized record still gets analysed, cut to the budget.
                let cut: String = block.chars().take(max_chars).collect();
                return Some(format!("{cut}\n...(truncated)"));
            }
            break;
        }
        out.push_str(&block);
        used += len;
        emitted += 1;
    }

    (!out.is_empty()).then_some(out)
}
