use std::sync::Arc;

use foreman_core::store::{Result, TaskStore};
use foreman_core::types::{ProjectAggregate, TaskStatus};
use uuid::Uuid;

/// A project's rollup row combined with its live task id lists.
#[derive(Debug, Clone)]
pub struct ProjectStatus {
    /// `None` when the project has never seen a task event.
    pub aggregate: Option<ProjectAggregate>,
    pub active_task_ids: Vec<Uuid>,
    pub pending_task_ids: Vec<Uuid>,
}

/// Read-only project status queries. Pure store reads, no side effects.
pub struct ProjectAggregator {
    store: Arc<TaskStore>,
}

impl ProjectAggregator {
    pub fn new(store: Arc<TaskStore>) -> Self {
        Self { store }
    }

    pub async fn status_of(&self, project_ref: &str) -> Result<ProjectStatus> {
        let aggregate = self.store.get_project(project_ref).await?;
        let active = self
            .store
            .list_tasks(project_ref, Some(TaskStatus::Running))
            .await?;
        let pending = self
            .store
            .list_tasks(project_ref, Some(TaskStatus::Pending))
            .await?;
        Ok(ProjectStatus {
            aggregate,
            active_task_ids: active.iter().map(|t| t.id).collect(),
            pending_task_ids: pending.iter().map(|t| t.id).collect(),
        })
    }

    pub async fn all_projects(&self) -> Result<Vec<ProjectAggregate>> {
        self.store.list_projects().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use foreman_core::types::{AgentStatus, Task, TaskPriority};

    #[tokio::test]
    async fn unknown_project_has_empty_status() {
        let store = Arc::new(TaskStore::open_in_memory().await.unwrap());
        let aggregator = ProjectAggregator::new(store);
        let status = aggregator.status_of("/tmp/nowhere").await.unwrap();
        assert!(status.aggregate.is_none());
        assert!(status.active_task_ids.is_empty());
        assert!(status.pending_task_ids.is_empty());
    }

    #[tokio::test]
    async fn status_splits_active_and_pending() {
        let store = Arc::new(TaskStore::open_in_memory().await.unwrap());
        let queued = Task::new("/tmp/p", "q", "i", TaskPriority::Low);
        let active = Task::new("/tmp/p", "a", "i", TaskPriority::High);
        store.save_task(&queued).await.unwrap();
        store.save_task(&active).await.unwrap();
        store.start_task(active.id, Utc::now()).await.unwrap();
        store.mark_project_busy("/tmp/p").await.unwrap();

        let aggregator = ProjectAggregator::new(store);
        let status = aggregator.status_of("/tmp/p").await.unwrap();
        assert_eq!(status.active_task_ids, vec![active.id]);
        assert_eq!(status.pending_task_ids, vec![queued.id]);
        let aggregate = status.aggregate.unwrap();
        assert_eq!(aggregate.agent_status, AgentStatus::Busy);
    }
}
