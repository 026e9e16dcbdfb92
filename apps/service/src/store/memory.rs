use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use taskpilot_proto::{Proposal, ProposalKind, Task, TaskNode, TaskPayload, User};

use super::{
    ProposalStore, StoreError, TaskStore, UserRecord, UserStore, build_task_tree,
    validate_task_fields,
};

/// Reference storage collaborator. Everything lives under one lock, so
/// ownership checks and the approve claim are atomic with respect to
/// each other; the relational implementation behind the same traits
/// relies on row ownership predicates instead.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    users: HashMap<i64, UserRecord>,
    next_user_id: i64,
    tasks: HashMap<i64, Task>,
    next_task_id: i64,
    proposals: HashMap<(i64, String), Proposal>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    fn owned_task(&self, owner_id: i64, id: i64) -> Option<&Task> {
        self.tasks
            .get(&id)
            .filter(|task| task.owner_id == owner_id)
    }

    fn check_parent(&self, owner_id: i64, parent_id: Option<i64>) -> Result<(), StoreError> {
        if let Some(parent_id) = parent_id {
            if self.owned_task(owner_id, parent_id).is_none() {
                return Err(StoreError::validation(
                    "parent_id does not reference a task owned by this user",
                ));
            }
        }
        Ok(())
    }

    /// Walk the ancestor chain upward from `new_parent`; reattaching
    /// under `id` itself or any of its descendants would close a loop.
    fn would_cycle(&self, id: i64, new_parent: i64) -> bool {
        let mut cursor = Some(new_parent);
        let mut hops = 0usize;
        while let Some(current) = cursor {
            if current == id {
                return true;
            }
            hops += 1;
            if hops > self.tasks.len() {
                return true;
            }
            cursor = self.tasks.get(&current).and_then(|task| task.parent_id);
        }
        false
    }

    fn descendants(&self, id: i64) -> Vec<i64> {
        let mut children: HashMap<i64, Vec<i64>> = HashMap::new();
        for task in self.tasks.values() {
            if let Some(parent_id) = task.parent_id {
                children.entry(parent_id).or_default().push(task.id);
            }
        }
        let mut collected = Vec::new();
        let mut queue = vec![id];
        while let Some(current) = queue.pop() {
            if let Some(kids) = children.get(&current) {
                for kid in kids {
                    collected.push(*kid);
                    queue.push(*kid);
                }
            }
        }
        collected
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn create_user(
        &self,
        email: &str,
        name: &str,
        password_hash: &str,
    ) -> Result<User, StoreError> {
        let email = email.trim().to_string();
        let mut inner = self.inner.lock().await;
        if inner
            .users
            .values()
            .any(|record| record.user.email == email)
        {
            return Err(StoreError::EmailTaken);
        }
        inner.next_user_id += 1;
        let user = User {
            id: inner.next_user_id,
            email,
            name: name.to_string(),
        };
        inner.users.insert(
            user.id,
            UserRecord {
                user: user.clone(),
                password_hash: password_hash.to_string(),
            },
        );
        Ok(user)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError> {
        let email = email.trim();
        let inner = self.inner.lock().await;
        Ok(inner
            .users
            .values()
            .find(|record| record.user.email == email)
            .cloned())
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<User>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.users.get(&id).map(|record| record.user.clone()))
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn list(&self, owner_id: i64) -> Result<Vec<TaskNode>, StoreError> {
        let inner = self.inner.lock().await;
        let rows = inner
            .tasks
            .values()
            .filter(|task| task.owner_id == owner_id)
            .cloned()
            .collect();
        Ok(build_task_tree(rows))
    }

    async fn create(&self, owner_id: i64, fields: &TaskPayload) -> Result<i64, StoreError> {
        validate_task_fields(fields)?;
        let mut inner = self.inner.lock().await;
        inner.check_parent(owner_id, fields.parent_id)?;
        inner.next_task_id += 1;
        let id = inner.next_task_id;
        let task = Task {
            id,
            owner_id,
            name: fields.name.clone().unwrap_or_default(),
            description: fields.description.clone(),
            priority: fields.priority.unwrap_or(taskpilot_proto::Priority::Medium),
            due_date: fields.due_date,
            status: fields.status.unwrap_or(taskpilot_proto::TaskStatus::Pending),
            parent_id: fields.parent_id,
        };
        inner.tasks.insert(id, task);
        Ok(id)
    }

    async fn update(
        &self,
        owner_id: i64,
        id: i64,
        fields: &TaskPayload,
    ) -> Result<(), StoreError> {
        validate_task_fields(fields)?;
        let mut inner = self.inner.lock().await;
        if inner.owned_task(owner_id, id).is_none() {
            return Err(StoreError::NotFound);
        }
        if let Some(parent_id) = fields.parent_id {
            if parent_id == id {
                return Err(StoreError::validation("a task cannot be its own parent"));
            }
            inner.check_parent(owner_id, Some(parent_id))?;
            if inner.would_cycle(id, parent_id) {
                return Err(StoreError::validation(
                    "parent_id would create a cycle in the task tree",
                ));
            }
        }
        if let Some(task) = inner.tasks.get_mut(&id) {
            task.name = fields.name.clone().unwrap_or_default();
            task.description = fields.description.clone();
            task.priority = fields.priority.unwrap_or(task.priority);
            task.due_date = fields.due_date;
            task.status = fields.status.unwrap_or(task.status);
            task.parent_id = fields.parent_id;
        }
        Ok(())
    }

    async fn delete(&self, owner_id: i64, id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.owned_task(owner_id, id).is_none() {
            return Err(StoreError::NotFound);
        }
        for descendant in inner.descendants(id) {
            inner.tasks.remove(&descendant);
        }
        inner.tasks.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl ProposalStore for MemoryStore {
    async fn save(&self, owner_id: i64, proposal: &Proposal) -> Result<(), StoreError> {
        if proposal.id.trim().is_empty() {
            return Err(StoreError::validation("proposal id is required"));
        }
        if proposal.description.trim().is_empty() {
            return Err(StoreError::validation("proposal description is required"));
        }
        if !proposal.payload.is_object() {
            return Err(StoreError::validation(
                "proposal payload must be a JSON object",
            ));
        }
        let mut inner = self.inner.lock().await;
        inner
            .proposals
            .insert((owner_id, proposal.id.clone()), proposal.clone());
        Ok(())
    }

    async fn approve(
        &self,
        owner_id: i64,
        proposal_id: &str,
        tasks: &dyn TaskStore,
    ) -> Result<(), StoreError> {
        let key = (owner_id, proposal_id.to_string());
        let proposal = {
            let mut inner = self.inner.lock().await;
            inner.proposals.remove(&key).ok_or(StoreError::NotFound)?
        };
        if let Err(error) = apply_proposal(owner_id, &proposal, tasks).await {
            // The claim is rolled back so the proposal stays pending for
            // a manual retry; only a successful apply consumes the row.
            let mut inner = self.inner.lock().await;
            inner.proposals.insert(key, proposal);
            return Err(error);
        }
        Ok(())
    }

    async fn reject(&self, owner_id: i64, proposal_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .proposals
            .remove(&(owner_id, proposal_id.to_string()))
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }
}

/// Dispatch an approved proposal against the task store by kind.
async fn apply_proposal(
    owner_id: i64,
    proposal: &Proposal,
    tasks: &dyn TaskStore,
) -> Result<(), StoreError> {
    match proposal.kind {
        ProposalKind::Create => {
            let fields = proposal
                .task_payload()
                .map_err(|error| StoreError::validation(error.to_string()))?;
            tasks.create(owner_id, &fields).await.map(|_| ())
        }
        ProposalKind::Update => {
            let id = proposal
                .target_id()
                .map_err(|error| StoreError::validation(error.to_string()))?;
            let fields = proposal
                .task_payload()
                .map_err(|error| StoreError::validation(error.to_string()))?;
            tasks.update(owner_id, id, &fields).await
        }
        ProposalKind::Delete => {
            let id = proposal
                .target_id()
                .map_err(|error| StoreError::validation(error.to_string()))?;
            tasks.delete(owner_id, id).await
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use serde_json::json;
    use taskpilot_proto::{Priority, ProposalEntity, TaskStatus};

    use super::*;

    fn fields(name: &str, parent_id: Option<i64>) -> TaskPayload {
        TaskPayload {
            name: Some(name.to_string()),
            priority: Some(Priority::Medium),
            status: Some(TaskStatus::Pending),
            parent_id,
            ..TaskPayload::default()
        }
    }

    fn create_proposal(id: &str, name: &str) -> Proposal {
        Proposal {
            id: id.to_string(),
            kind: ProposalKind::Create,
            entity: ProposalEntity::Task,
            payload: json!({
                "name": name,
                "priority": "high",
                "status": "pending",
            }),
            description: "Proposal to create task".to_string(),
        }
    }

    #[tokio::test]
    async fn unique_email_is_enforced_at_the_storage_layer() -> Result<()> {
        let store = MemoryStore::new();
        store.create_user("ada@example.com", "Ada", "hash").await?;
        assert_eq!(
            store
                .create_user("ada@example.com", "Imposter", "hash2")
                .await,
            Err(StoreError::EmailTaken)
        );
        Ok(())
    }

    #[tokio::test]
    async fn created_tasks_show_up_under_their_parent() -> Result<()> {
        let store = MemoryStore::new();
        let root = store.create(1, &fields("root", None)).await?;
        let child = store.create(1, &fields("child", Some(root))).await?;

        let tree = store.list(1).await?;
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].task.id, root);
        assert_eq!(tree[0].subtasks.len(), 1);
        assert_eq!(tree[0].subtasks[0].task.id, child);
        Ok(())
    }

    #[tokio::test]
    async fn dangling_or_foreign_parents_are_rejected() -> Result<()> {
        let store = MemoryStore::new();
        assert!(matches!(
            store.create(1, &fields("orphan", Some(99))).await,
            Err(StoreError::Validation(_))
        ));

        let other_users_task = store.create(2, &fields("theirs", None)).await?;
        assert!(matches!(
            store
                .create(1, &fields("crossing", Some(other_users_task)))
                .await,
            Err(StoreError::Validation(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn self_and_descendant_reparenting_is_rejected() -> Result<()> {
        let store = MemoryStore::new();
        let a = store.create(1, &fields("a", None)).await?;
        let b = store.create(1, &fields("b", Some(a))).await?;
        let c = store.create(1, &fields("c", Some(b))).await?;

        assert!(matches!(
            store.update(1, a, &fields("a", Some(a))).await,
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(
            store.update(1, a, &fields("a", Some(c))).await,
            Err(StoreError::Validation(_))
        ));

        // A legal reparent still works afterwards.
        store.update(1, c, &fields("c", Some(a))).await?;
        Ok(())
    }

    #[tokio::test]
    async fn delete_cascades_over_all_descendants() -> Result<()> {
        let store = MemoryStore::new();
        let a = store.create(1, &fields("a", None)).await?;
        let b = store.create(1, &fields("b", Some(a))).await?;
        store.create(1, &fields("c", Some(b))).await?;
        let keep = store.create(1, &fields("keep", None)).await?;

        store.delete(1, a).await?;

        let tree = store.list(1).await?;
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].task.id, keep);
        Ok(())
    }

    #[tokio::test]
    async fn mutations_on_foreign_rows_report_not_found() -> Result<()> {
        let store = MemoryStore::new();
        let theirs = store.create(2, &fields("theirs", None)).await?;

        assert_eq!(
            store.update(1, theirs, &fields("mine", None)).await,
            Err(StoreError::NotFound)
        );
        assert_eq!(store.delete(1, theirs).await, Err(StoreError::NotFound));
        // Untouched for the real owner.
        assert_eq!(store.list(2).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn approving_a_create_proposal_applies_once_and_consumes_it() -> Result<()> {
        let store = MemoryStore::new();
        store
            .save(1, &create_proposal("proposal_1", "From chat"))
            .await?;
        // Re-saving the same id upserts instead of queueing a duplicate.
        store
            .save(1, &create_proposal("proposal_1", "From chat"))
            .await?;

        store.approve(1, "proposal_1", &store).await?;

        let tree = store.list(1).await?;
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].task.name, "From chat");
        assert_eq!(tree[0].task.priority, Priority::High);

        // Second approval finds nothing: the row is gone.
        assert_eq!(
            store.approve(1, "proposal_1", &store).await,
            Err(StoreError::NotFound)
        );
        Ok(())
    }

    #[tokio::test]
    async fn rejecting_leaves_the_task_store_unchanged() -> Result<()> {
        let store = MemoryStore::new();
        store
            .save(1, &create_proposal("proposal_2", "Never applied"))
            .await?;
        store.reject(1, "proposal_2").await?;

        assert!(store.list(1).await?.is_empty());
        assert_eq!(
            store.reject(1, "proposal_2").await,
            Err(StoreError::NotFound)
        );
        Ok(())
    }

    #[tokio::test]
    async fn failed_apply_keeps_the_proposal_pending() -> Result<()> {
        let store = MemoryStore::new();
        let proposal = Proposal {
            id: "proposal_3".to_string(),
            kind: ProposalKind::Delete,
            entity: ProposalEntity::Task,
            payload: json!({"id": 404}),
            description: "Proposal to delete task".to_string(),
        };
        store.save(1, &proposal).await?;

        assert_eq!(
            store.approve(1, "proposal_3", &store).await,
            Err(StoreError::NotFound)
        );

        // The row survived the failed apply and can be retried or
        // rejected later.
        store.reject(1, "proposal_3").await?;
        Ok(())
    }

    #[tokio::test]
    async fn proposals_are_scoped_to_their_owner() -> Result<()> {
        let store = MemoryStore::new();
        store
            .save(1, &create_proposal("proposal_4", "Owner one"))
            .await?;

        assert_eq!(
            store.approve(2, "proposal_4", &store).await,
            Err(StoreError::NotFound)
        );
        assert_eq!(
            store.reject(2, "proposal_4").await,
            Err(StoreError::NotFound)
        );
        Ok(())
    }

    #[tokio::test]
    async fn save_requires_the_full_proposal_shape() {
        let store = MemoryStore::new();
        let mut proposal = create_proposal("", "x");
        assert!(matches!(
            store.save(1, &proposal).await,
            Err(StoreError::Validation(_))
        ));

        proposal.id = "proposal_5".to_string();
        proposal.payload = json!("not an object");
        assert!(matches!(
            store.save(1, &proposal).await,
            Err(StoreError::Validation(_))
        ));
    }
}
