//! State Store
//!
//! Keyed state for tasks, plans, steps and the audit trail. The store holds
//! no business logic: status transitions are decided by the dispatcher and
//! orchestrator, the store only records them.
//!
//! Two backends satisfy the same contract:
//! - `MemoryStore`: maps behind `tokio::sync::RwLock`, one per session
//! - `SqliteStore`: JSON rows keyed by `(entity, id)` in SQLite

pub mod sqlite;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::models::{Plan, Step, StoredMessage, Task};

pub use sqlite::SqliteStore;

/// Counts of stored records
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub tasks: usize,
    pub plans: usize,
    pub steps: usize,
    pub messages: usize,
}

/// Storage contract shared by all backends.
///
/// Writes are visible to every subsequent read. The store does not resolve
/// concurrent writers to the same step; callers guarantee at most one.
#[async_trait]
pub trait Store: Send + Sync {
    async fn put_task(&self, task: &Task) -> EngineResult<()>;
    async fn get_task(&self, id: &str) -> EngineResult<Task>;

    async fn put_plan(&self, plan: &Plan) -> EngineResult<()>;
    async fn get_plan(&self, id: &str) -> EngineResult<Plan>;
    /// Plans of a session, oldest first
    async fn list_plans_for_session(&self, session_id: &str) -> EngineResult<Vec<Plan>>;

    async fn put_step(&self, step: &Step) -> EngineResult<()>;
    async fn get_step(&self, id: &str) -> EngineResult<Step>;
    /// Steps of a plan ordered by `sequence_index`
    async fn list_steps_for_plan(&self, plan_id: &str) -> EngineResult<Vec<Step>>;

    /// Append to the audit trail. Messages are never updated or removed.
    async fn append_message(&self, message: &StoredMessage) -> EngineResult<()>;
    async fn list_messages_for_plan(&self, plan_id: &str) -> EngineResult<Vec<StoredMessage>>;
    async fn list_messages_for_step(&self, step_id: &str) -> EngineResult<Vec<StoredMessage>>;

    async fn stats(&self) -> EngineResult<StoreStats>;

    /// Most recent plan of a session; newer plans supersede older ones
    async fn latest_plan_for_session(&self, session_id: &str) -> EngineResult<Option<Plan>> {
        let plans = self.list_plans_for_session(session_id).await?;
        Ok(plans.into_iter().last())
    }
}

/// In-memory backend
#[derive(Default)]
pub struct MemoryStore {
    tasks: RwLock<HashMap<String, Task>>,
    /// Plans with the sequence number of their first insert
    plans: RwLock<HashMap<String, (u64, Plan)>>,
    next_plan_seq: AtomicU64,
    steps: RwLock<HashMap<String, Step>>,
    messages: RwLock<Vec<StoredMessage>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put_task(&self, task: &Task) -> EngineResult<()> {
        self.tasks.write().await.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get_task(&self, id: &str) -> EngineResult<Task> {
        self.tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("task", id))
    }

    async fn put_plan(&self, plan: &Plan) -> EngineResult<()> {
        let mut plans = self.plans.write().await;
        let seq = match plans.get(&plan.id) {
            Some((seq, _)) => *seq,
            None => self.next_plan_seq.fetch_add(1, Ordering::Relaxed),
        };
        plans.insert(plan.id.clone(), (seq, plan.clone()));
        debug!("Stored plan {} ({})", plan.id, plan.status.as_str());
        Ok(())
    }

    async fn get_plan(&self, id: &str) -> EngineResult<Plan> {
        self.plans
            .read()
            .await
            .get(id)
            .map(|(_, plan)| plan.clone())
            .ok_or_else(|| EngineError::not_found("plan", id))
    }

    async fn list_plans_for_session(&self, session_id: &str) -> EngineResult<Vec<Plan>> {
        let mut plans: Vec<(u64, Plan)> = self
            .plans
            .read()
            .await
            .values()
            .filter(|(_, p)| p.session_id == session_id)
            .cloned()
            .collect();
        // Same-millisecond plans keep insertion order
        plans.sort_by_key(|(seq, p)| (p.created_at, *seq));
        Ok(plans.into_iter().map(|(_, p)| p).collect())
    }

    async fn put_step(&self, step: &Step) -> EngineResult<()> {
        // A step must belong to a stored plan
        if !self.plans.read().await.contains_key(&step.plan_id) {
            return Err(EngineError::not_found("plan", &step.plan_id));
        }
        self.steps.write().await.insert(step.id.clone(), step.clone());
        debug!("Stored step {} ({})", step.id, step.status.as_str());
        Ok(())
    }

    async fn get_step(&self, id: &str) -> EngineResult<Step> {
        self.steps
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("step", id))
    }

    async fn list_steps_for_plan(&self, plan_id: &str) -> EngineResult<Vec<Step>> {
        let mut steps: Vec<Step> = self
            .steps
            .read()
            .await
            .values()
            .filter(|s| s.plan_id == plan_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.sequence_index);
        Ok(steps)
    }

    async fn append_message(&self, message: &StoredMessage) -> EngineResult<()> {
        self.messages.write().await.push(message.clone());
        Ok(())
    }

    async fn list_messages_for_plan(&self, plan_id: &str) -> EngineResult<Vec<StoredMessage>> {
        Ok(self
            .messages
            .read()
            .await
            .iter()
            .filter(|m| m.plan_id.as_deref() == Some(plan_id))
            .cloned()
            .collect())
    }

    async fn list_messages_for_step(&self, step_id: &str) -> EngineResult<Vec<StoredMessage>> {
        Ok(self
            .messages
            .read()
            .await
            .iter()
            .filter(|m| m.step_id.as_deref() == Some(step_id))
            .cloned()
            .collect())
    }

    async fn stats(&self) -> EngineResult<StoreStats> {
        Ok(StoreStats {
            tasks: self.tasks.read().await.len(),
            plans: self.plans.read().await.len(),
            steps: self.steps.read().await.len(),
            messages: self.messages.read().await.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExecutorKind, Session};

    fn fixtures() -> (Session, Task, Plan) {
        let session = Session::new("tester");
        let task = Task::new(&session, "Launch a product");
        let plan = Plan::new(&task);
        (session, task, plan)
    }

    #[tokio::test]
    async fn test_get_unknown_is_not_found() {
        let store = MemoryStore::new();
        assert!(store.get_plan("missing").await.unwrap_err().is_not_found());
        assert!(store.get_step("missing").await.unwrap_err().is_not_found());
        assert!(store.get_task("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_steps_ordered_by_sequence_index() {
        let store = MemoryStore::new();
        let (_, _, plan) = fixtures();
        store.put_plan(&plan).await.unwrap();

        // Insert out of order
        for idx in [2, 0, 1] {
            let step = Step::new(&plan, idx, &format!("step {}", idx), ExecutorKind::Generic);
            store.put_step(&step).await.unwrap();
        }

        let steps = store.list_steps_for_plan(&plan.id).await.unwrap();
        let order: Vec<usize> = steps.iter().map(|s| s.sequence_index).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_step_requires_existing_plan() {
        let store = MemoryStore::new();
        let (_, _, plan) = fixtures();
        let step = Step::new(&plan, 0, "orphan", ExecutorKind::Hr);

        let err = store.put_step(&step).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_read_your_writes() {
        let store = MemoryStore::new();
        let (_, _, mut plan) = fixtures();
        store.put_plan(&plan).await.unwrap();

        plan.set_status(crate::models::PlanStatus::InProgress);
        store.put_plan(&plan).await.unwrap();

        let read = store.get_plan(&plan.id).await.unwrap();
        assert_eq!(read.status, crate::models::PlanStatus::InProgress);
    }

    #[tokio::test]
    async fn test_messages_and_stats() {
        let store = MemoryStore::new();
        let (session, task, plan) = fixtures();
        store.put_task(&task).await.unwrap();
        store.put_plan(&plan).await.unwrap();
        let step = Step::new(&plan, 0, "a", ExecutorKind::Marketing);
        store.put_step(&step).await.unwrap();

        store
            .append_message(&StoredMessage::new(&session, "user", "task").for_plan(&plan.id))
            .await
            .unwrap();
        store
            .append_message(&StoredMessage::new(&session, "MARKETING", "done").for_step(&step))
            .await
            .unwrap();

        assert_eq!(store.list_messages_for_plan(&plan.id).await.unwrap().len(), 2);
        assert_eq!(store.list_messages_for_step(&step.id).await.unwrap().len(), 1);

        let stats = store.stats().await.unwrap();
        assert_eq!(
            stats,
            StoreStats {
                tasks: 1,
                plans: 1,
                steps: 1,
                messages: 2
            }
        );
    }

    #[tokio::test]
    async fn test_latest_plan_for_session() {
        let store = MemoryStore::new();
        let (session, task, first) = fixtures();
        store.put_plan(&first).await.unwrap();

        let mut second = Plan::new(&task);
        second.created_at = first.created_at + 10;
        store.put_plan(&second).await.unwrap();

        let latest = store
            .latest_plan_for_session(&session.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, second.id);
        assert!(store.latest_plan_for_session("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_same_millisecond_plans_keep_insertion_order() {
        let store = MemoryStore::new();
        let (session, task, _) = fixtures();

        for _ in 0..50 {
            let first = Plan::new(&task);
            let mut second = Plan::new(&task);
            second.created_at = first.created_at;
            store.put_plan(&first).await.unwrap();
            store.put_plan(&second).await.unwrap();

            // Updating an older plan does not move it forward
            store.put_plan(&first).await.unwrap();

            let latest = store
                .latest_plan_for_session(&session.session_id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(latest.id, second.id);
        }
    }
}
