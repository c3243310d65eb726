use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use recap_core::TaskId;

use super::{Record, RecordId, RecordStore, RecordStoreError};

/// In-memory dataset store.
///
/// Intended for tests/dev and database-less runs.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    tasks: RwLock<HashMap<TaskId, BTreeMap<RecordId, Record>>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an (initially empty) task.
    pub fn insert_task(&self, task_id: TaskId) {
        self.tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(task_id)
            .or_default();
    }

    /// Add or replace records; each record goes to its own task, created on demand.
    pub fn add_records(&self, records: impl IntoIterator<Item = Record>) {
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        for record in records {
            tasks
                .entry(record.task_id)
                .or_default()
                .insert(record.id, record);
        }
    }

    pub fn record_count(&self, task_id: TaskId) -> usize {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&task_id)
            .map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn list_records(&self, task_id: TaskId) -> Result<Vec<Record>, RecordStoreError> {
        let tasks = self
            .tasks
            .read()
            .map_err(|_| RecordStoreError::Storage("record store lock poisoned".into()))?;
        let records = tasks
            .get(&task_id)
            .ok_or(RecordStoreError::TaskNotFound(task_id))?;
        Ok(records.values().cloned().collect())
    }

    async fn get_records(
        &self,
        task_id: TaskId,
        ids: &[RecordId],
    ) -> Result<Vec<Record>, RecordStoreError> {
        let tasks = self
            .tasks
            .read()
            .map_err(|_| RecordStoreError::Storage("record store lock poisoned".into()))?;
        let records = tasks
            .get(&task_id)
            .ok_or(RecordStoreError::TaskNotFound(task_id))?;

        let mut found: Vec<Record> = ids.iter().filter_map(|id| records.get(id).cloned()).collect();
        found.sort_by_key(|r| r.id);
        found.dedup_by_key(|r| r.id);
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn helpers_survive_a_poisoned_lock() {
        let store = Arc::new(InMemoryRecordStore::new());
        let holder = store.clone();
        let _ = std::thread::spawn(move || {
            let _guard = holder.tasks.write().unwrap();
            panic!("writer died holding the lock");
        })
        .join();
        assert!(store.tasks.is_poisoned());

        let task = TaskId::new();
        store.insert_task(task);
        store.add_records([Record::new(1, task), Record::new(2, task)]);
        assert_eq!(store.record_count(task), 2);
    }

    #[tokio::test]
    async fn lists_in_id_order() {
        let store = InMemoryRecordStore::new();
        let task = TaskId::new();
        store.add_records([
            Record::new(3, task).with_subject("c"),
            Record::new(1, task).with_subject("a"),
            Record::new(2, task).with_subject("b"),
        ]);

        let ids: Vec<_> = store
            .list_records(task)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn unknown_task_is_an_error() {
        let store = InMemoryRecordStore::new();
        let err = store.list_records(TaskId::new()).await.unwrap_err();
        assert!(matches!(err, RecordStoreError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn empty_task_lists_nothing() {
        let store = InMemoryRecordStore::new();
        let task = TaskId::new();
        store.insert_task(task);
        assert!(store.list_records(task).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_records_skips_unknown_ids() {
        let store = InMemoryRecordStore::new();
        let task = TaskId::new();
        store.add_records([Record::new(1, task), Record::new(2, task)]);

        let got = store.get_records(task, &[2, 9, 1, 2]).await.unwrap();
        assert_eq!(got.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2]);
        assert!(store.get_record(task, 9).await.unwrap().is_none());
    }
}
