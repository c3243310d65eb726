//! Work item enumeration.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use recap_core::TaskId;

use crate::dataset::{Record, RecordId, RecordStore, RecordStoreError};

use super::types::WorkItemKind;

/// The unit dispatched to one worker. Never persisted; only its outcome is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Stable identity used for Result Sink lookups.
    pub key: String,
    pub payload: WorkPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkPayload {
    Record { record_id: RecordId },
    Cluster { record_ids: Vec<RecordId> },
}

impl WorkItem {
    pub fn record(record_id: RecordId) -> Self {
        Self {
            key: record_id.to_string(),
            payload: WorkPayload::Record { record_id },
        }
    }

    pub fn cluster(key: impl Into<String>, record_ids: Vec<RecordId>) -> Self {
        Self {
            key: key.into(),
            payload: WorkPayload::Cluster { record_ids },
        }
    }

    pub fn record_ids(&self) -> &[RecordId] {
        match &self.payload {
            WorkPayload::Record { record_id } => std::slice::from_ref(record_id),
            WorkPayload::Cluster { record_ids } => record_ids,
        }
    }
}

/// What happens to an enumerated item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Dispatch,
    /// Matched a filter keyword; counted skipped without dispatch.
    Filtered { keyword: String },
}

/// Ordered result of enumerating a job's items.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Enumeration {
    pub entries: Vec<(WorkItem, Disposition)>,
}

impl Enumeration {
    pub fn total(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn filtered_count(&self) -> u64 {
        self.entries
            .iter()
            .filter(|(_, d)| matches!(d, Disposition::Filtered { .. }))
            .count() as u64
    }

    /// Items that should reach the worker pool, in enumeration order.
    pub fn into_dispatchable(self) -> Vec<WorkItem> {
        self.entries
            .into_iter()
            .filter_map(|(item, d)| matches!(d, Disposition::Dispatch).then_some(item))
            .collect()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    #[error("dataset unavailable: {0}")]
    Dataset(#[from] RecordStoreError),
}

/// Produces the work items of a job.
///
/// For unchanged underlying data the result must be identical between calls
/// (same keys, same order); resume relies on it.
#[async_trait]
pub trait WorkItemSource: Send + Sync + 'static {
    async fn enumerate(
        &self,
        task_id: TaskId,
        kind: WorkItemKind,
        filter_keywords: &[String],
    ) -> Result<Enumeration, SourceError>;
}

/// Enumerates work items from a task's dataset.
pub struct DatasetWorkSource {
    records: Arc<dyn RecordStore>,
}

impl DatasetWorkSource {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl WorkItemSource for DatasetWorkSource {
    async fn enumerate(
        &self,
        task_id: TaskId,
        kind: WorkItemKind,
        filter_keywords: &[String],
    ) -> Result<Enumeration, SourceError> {
        let records = self.records.list_records(task_id).await?;
        Ok(enumerate_records(&records, kind, filter_keywords))
    }
}

/// Pure enumeration over an already-loaded dataset.
pub fn enumerate_records(
    records: &[Record],
    kind: WorkItemKind,
    filter_keywords: &[String],
) -> Enumeration {
    let mut records: Vec<&Record> = records.iter().collect();
    records.sort_by_key(|r| r.id);

    let entries = match kind {
        WorkItemKind::Record => {
            let keywords: Vec<String> = filter_keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect();
            records
                .into_iter()
                .map(|r| {
                    let disposition = match matching_keyword(r, &keywords) {
                        Some(keyword) => Disposition::Filtered { keyword },
                        None => Disposition::Dispatch,
                    };
                    (WorkItem::record(r.id), disposition)
                })
                .collect()
        }
        WorkItemKind::PeopleCluster => clusters(records, Record::people_key),
        WorkItemKind::SubjectCluster => clusters(records, Record::subject_key),
    };

    Enumeration { entries }
}

fn matching_keyword(record: &Record, keywords: &[String]) -> Option<String> {
    let haystacks = [record.subject.as_deref(), record.sender.as_deref()]
        .into_iter()
        .flatten()
        .map(str::to_lowercase)
        .collect::<Vec<_>>();

    keywords
        .iter()
        .find(|k| haystacks.iter().any(|h| h.contains(k.as_str())))
        .cloned()
}

fn clusters<F>(records: Vec<&Record>, key_of: F) -> Vec<(WorkItem, Disposition)>
where
    F: Fn(&Record) -> Option<String>,
{
    // BTreeMap: clusters come out ordered by key; ids stay in id order.
    let mut groups: BTreeMap<String, Vec<RecordId>> = BTreeMap::new();
    for r in records {
        if let Some(key) = key_of(r) {
            groups.entry(key).or_default().push(r.id);
        }
    }
    groups
        .into_iter()
        .map(|(key, ids)| (WorkItem::cluster(key, ids), Disposition::Dispatch))
        .collect()
}
