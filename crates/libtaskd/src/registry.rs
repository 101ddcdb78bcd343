use std::time::SystemTime;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use taskd_protocol::{TaskId, TaskInfo};

use crate::error::TaskError;
use crate::task::TaskRecord;

/// Authoritative map from task id to task record.
///
/// Backed by `DashMap`, so every operation locks only the shard holding the
/// key. `update` runs its mutator under that lock: readers see a record either
/// before or after the whole mutation. Mutators must not block or await, and
/// must not call back into the registry.
pub struct TaskRegistry {
    tasks: DashMap<TaskId, TaskRecord>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
        }
    }

    /// Publish a fully formed record. Fails if the id is taken.
    pub fn create(&self, record: TaskRecord) -> Result<(), TaskError> {
        match self.tasks.entry(record.id().clone()) {
            Entry::Occupied(entry) => Err(TaskError::AlreadyExists(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(record);
                Ok(())
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<TaskInfo> {
        self.tasks.get(id).map(|r| r.value().info())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    /// Apply `mutator` to the record atomically with respect to other readers
    /// and writers of the same task.
    pub fn update<R>(
        &self,
        id: &str,
        mutator: impl FnOnce(&mut TaskRecord) -> R,
    ) -> Result<R, TaskError> {
        let mut entry = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;
        Ok(mutator(entry.value_mut()))
    }

    /// Remove and return the record.
    pub fn delete(&self, id: &str) -> Result<TaskRecord, TaskError> {
        self.tasks
            .remove(id)
            .map(|(_, record)| record)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))
    }

    /// Snapshot of every task, oldest first.
    pub fn list_all(&self) -> Vec<TaskInfo> {
        let mut tasks: Vec<TaskInfo> = self.tasks.iter().map(|r| r.value().info()).collect();
        tasks.sort_by(|a, b| {
            a.created_at_epoch_ms
                .cmp(&b.created_at_epoch_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        tasks
    }

    /// Ids of terminal tasks whose retention window has elapsed at `now`.
    pub fn expired(&self, now: SystemTime) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|r| r.value().is_expired(now))
            .map(|r| r.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::tests::working_record;
    use std::sync::Arc;
    use std::time::Duration;
    use taskd_protocol::TaskStatus;

    #[tokio::test]
    async fn create_get_delete_cycle() {
        let registry = TaskRegistry::new();
        registry.create(working_record("t1")).unwrap();

        let info = registry.get("t1").expect("task visible after create");
        assert_eq!(info.status, TaskStatus::Working);
        assert_eq!(registry.len(), 1);

        registry.delete("t1").unwrap();
        assert!(registry.get("t1").is_none());
        assert!(matches!(registry.delete("t1"), Err(TaskError::NotFound(_))));
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let registry = TaskRegistry::new();
        registry.create(working_record("t1")).unwrap();
        let err = registry.create(working_record("t1")).unwrap_err();
        assert!(matches!(err, TaskError::AlreadyExists(id) if id == "t1"));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn update_unknown_task_is_not_found() {
        let registry = TaskRegistry::new();
        let result = registry.update("missing", |_| ());
        assert!(matches!(result, Err(TaskError::NotFound(_))));
    }

    #[tokio::test]
    async fn list_all_is_a_snapshot() {
        let registry = TaskRegistry::new();
        registry.create(working_record("a")).unwrap();
        registry.create(working_record("b")).unwrap();

        let snapshot = registry.list_all();
        registry
            .update("a", |rec| {
                rec.terminate(
                    TaskStatus::Done,
                    SystemTime::now(),
                    Duration::from_secs(1),
                    None,
                )
            })
            .unwrap()
            .unwrap();

        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|t| t.status == TaskStatus::Working));
        assert_eq!(registry.get("a").unwrap().status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn expired_only_reports_terminal_tasks_past_retention() {
        let registry = TaskRegistry::new();
        registry.create(working_record("running")).unwrap();
        registry.create(working_record("done")).unwrap();
        let now = SystemTime::now();
        registry
            .update("done", |rec| {
                rec.terminate(TaskStatus::Done, now, Duration::from_secs(10), None)
            })
            .unwrap()
            .unwrap();

        assert!(registry.expired(now).is_empty());
        assert_eq!(
            registry.expired(now + Duration::from_secs(10)),
            vec!["done".to_string()]
        );
    }

    #[tokio::test]
    async fn concurrent_terminations_commit_once() {
        let registry = Arc::new(TaskRegistry::new());
        registry.create(working_record("t1")).unwrap();

        let mut joins = Vec::new();
        for status in [TaskStatus::Done, TaskStatus::Cancelled, TaskStatus::Failed] {
            let registry = Arc::clone(&registry);
            joins.push(tokio::spawn(async move {
                registry
                    .update("t1", |rec| {
                        rec.terminate(status, SystemTime::now(), Duration::ZERO, None)
                    })
                    .unwrap()
                    .is_ok()
            }));
        }

        let mut committed = 0;
        for join in joins {
            if join.await.unwrap() {
                committed += 1;
            }
        }
        assert_eq!(committed, 1);
        assert!(registry.get("t1").unwrap().status.is_terminal());
    }
}
