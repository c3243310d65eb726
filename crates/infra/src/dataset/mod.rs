//! Read access to uploaded datasets.
//!
//! A dataset belongs to a task and is a flat list of correspondence records.
//! The engine only reads it: enumeration lists a task's records, preparation
//! fetches the records a work item refers to.

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use recap_core::TaskId;

pub use in_memory::InMemoryRecordStore;
pub use postgres::PostgresRecordStore;

/// Identifier of a record within its dataset.
pub type RecordId = i64;

/// One row of an uploaded dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub task_id: TaskId,
    pub sender: Option<String>,
    pub receiver: Option<String>,
    pub subject: Option<String>,
    pub content: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl Record {
    pub fn new(id: RecordId, task_id: TaskId) -> Self {
        Self {
            id,
            task_id,
            sender: None,
            receiver: None,
            subject: None,
            content: None,
            sent_at: None,
        }
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_receiver(mut self, receiver: impl Into<String>) -> Self {
        self.receiver = Some(receiver.into());
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_sent_at(mut self, sent_at: DateTime<Utc>) -> Self {
        self.sent_at = Some(sent_at);
        self
    }

    /// Key of the people cluster this record belongs to, if it has both parties.
    pub fn people_key(&self) -> Option<String> {
        let a = non_blank(self.sender.as_deref())?;
        let b = non_blank(self.receiver.as_deref())?;
        Some(people_key(a, b))
    }

    /// Key of the subject cluster this record belongs to, if it has a subject.
    pub fn subject_key(&self) -> Option<String> {
        non_blank(self.subject.as_deref()).map(str::to_string)
    }
}

/// Order-independent key for a pair of correspondents: `"a ↔ b"` with `a <= b`.
pub fn people_key(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{lo} ↔ {hi}")
}

fn non_blank(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RecordStoreError {
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Dataset read boundary.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// All records of a task, ordered by id.
    async fn list_records(&self, task_id: TaskId) -> Result<Vec<Record>, RecordStoreError>;

    /// The records of `task_id` whose id is in `ids`, ordered by id. Unknown ids are ignored.
    async fn get_records(
        &self,
        task_id: TaskId,
        ids: &[RecordId],
    ) -> Result<Vec<Record>, RecordStoreError>;

    async fn get_record(
        &self,
        task_id: TaskId,
        id: RecordId,
    ) -> Result<Option<Record>, RecordStoreError> {
        Ok(self.get_records(task_id, &[id]).await?.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn people_key_ignores_direction() {
        assert_eq!(people_key("bob@x", "alice@x"), "alice@x ↔ bob@x");
        assert_eq!(people_key("alice@x", "bob@x"), "alice@x ↔ bob@x");
    }

    #[test]
    fn cluster_keys_need_their_fields() {
        let task = TaskId::new();
        let r = Record::new(1, task).with_sender("a").with_subject("  ");
        assert!(r.people_key().is_none());
        assert!(r.subject_key().is_none());

        let r = r.with_receiver("b").with_subject("Q3 plan");
        assert_eq!(r.people_key().as_deref(), Some("a ↔ b"));
        assert_eq!(r.subject_key().as_deref(), Some("Q3 plan"));
    }
}
