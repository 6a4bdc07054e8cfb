//! Injectable task storage.
//!
//! The store is a transient cache with process lifetime, not an archival
//! format; losing it across restarts is acceptable. The trait exists so
//! tests construct isolated instances and so a shared external store can
//! stand in for the map. `update` takes a closure executed under the entry's
//! lock, which is what serializes writers per task while readers elsewhere
//! proceed.

use dashmap::DashMap;
use uuid::Uuid;

use super::task::TaskRecord;

/// Storage contract for task records.
pub trait TaskStore: Send + Sync {
    fn insert(&self, record: TaskRecord);

    /// Snapshot of one record.
    fn get(&self, id: &Uuid) -> Option<TaskRecord>;

    /// Mutate one record in place under its lock. Returns whether the record
    /// existed.
    fn update(&self, id: &Uuid, mutate: &mut dyn FnMut(&mut TaskRecord)) -> bool;

    fn remove(&self, id: &Uuid) -> bool;

    /// Snapshot of all records, in no particular order.
    fn all(&self) -> Vec<TaskRecord>;
}

/// Concurrent-map store used by default.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: DashMap<Uuid, TaskRecord>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl TaskStore for InMemoryTaskStore {
    fn insert(&self, record: TaskRecord) {
        self.tasks.insert(record.id, record);
    }

    fn get(&self, id: &Uuid) -> Option<TaskRecord> {
        self.tasks.get(id).map(|entry| entry.value().clone())
    }

    fn update(&self, id: &Uuid, mutate: &mut dyn FnMut(&mut TaskRecord)) -> bool {
        match self.tasks.get_mut(id) {
            Some(mut entry) => {
                mutate(entry.value_mut());
                true
            }
            None => false,
        }
    }

    fn remove(&self, id: &Uuid) -> bool {
        self.tasks.remove(id).is_some()
    }

    fn all(&self) -> Vec<TaskRecord> {
        self.tasks.iter().map(|entry| entry.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::task::{TaskPriority, TaskStatus};
    use serde_json::json;

    #[test]
    fn test_insert_get_update_remove() {
        let store = InMemoryTaskStore::new();
        let record = TaskRecord::new("tool_a", json!({}), "user_1", TaskPriority::Normal);
        let id = record.id;
        store.insert(record);

        assert_eq!(store.get(&id).unwrap().status, TaskStatus::Pending);
        assert!(store.update(&id, &mut |r| r.status = TaskStatus::Running));
        assert_eq!(store.get(&id).unwrap().status, TaskStatus::Running);
        assert!(store.remove(&id));
        assert!(store.get(&id).is_none());
        assert!(!store.update(&id, &mut |_| {}));
    }

    #[test]
    fn test_all_snapshots() {
        let store = InMemoryTaskStore::new();
        for _ in 0..3 {
            store.insert(TaskRecord::new("tool_a", json!({}), "u", TaskPriority::Low));
        }
        assert_eq!(store.all().len(), 3);
    }
}
