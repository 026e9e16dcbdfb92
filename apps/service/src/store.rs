use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use taskpilot_proto::{Proposal, Task, TaskNode, TaskPayload, User};

pub mod memory;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{0}")]
    Validation(String),
    #[error("not found")]
    NotFound,
    #[error("email is already registered")]
    EmailTaken,
    #[error("storage failure: {0}")]
    Internal(String),
}

impl StoreError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

/// A stored user row. The hash never leaves the storage boundary except
/// through this record, which only the login handler sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub user: User,
    pub password_hash: String,
}

/// User rows. The unique-email constraint is enforced here, at the
/// storage layer, not in handler code.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn create_user(
        &self,
        email: &str,
        name: &str,
        password_hash: &str,
    ) -> Result<User, StoreError>;

    async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError>;

    async fn find_by_id(&self, id: i64) -> Result<Option<User>, StoreError>;
}

/// The task/subtask tree. Rows are flat; the forest is derived on read.
/// Ownership is checked on every mutation: a row that exists under
/// another owner behaves exactly like a row that does not exist.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn list(&self, owner_id: i64) -> Result<Vec<TaskNode>, StoreError>;

    async fn create(&self, owner_id: i64, fields: &TaskPayload) -> Result<i64, StoreError>;

    async fn update(&self, owner_id: i64, id: i64, fields: &TaskPayload)
    -> Result<(), StoreError>;

    async fn delete(&self, owner_id: i64, id: i64) -> Result<(), StoreError>;
}

/// Pending proposals keyed by (owner, id). `save` is an upsert per id so
/// a re-sent proposal cannot double-apply at approval time. `approve`
/// claims the row, dispatches the stored payload against the task store,
/// and restores the row if the mutation fails; the row is gone only
/// after a successful apply. `reject` deletes with no task effect.
#[async_trait]
pub trait ProposalStore: Send + Sync {
    async fn save(&self, owner_id: i64, proposal: &Proposal) -> Result<(), StoreError>;

    async fn approve(
        &self,
        owner_id: i64,
        proposal_id: &str,
        tasks: &dyn TaskStore,
    ) -> Result<(), StoreError>;

    async fn reject(&self, owner_id: i64, proposal_id: &str) -> Result<(), StoreError>;
}

pub(crate) fn validate_task_fields(fields: &TaskPayload) -> Result<(), StoreError> {
    match &fields.name {
        Some(name) if !name.trim().is_empty() => {}
        _ => return Err(StoreError::validation("name is required")),
    }
    if fields.priority.is_none() {
        return Err(StoreError::validation("priority is required"));
    }
    if fields.status.is_none() {
        return Err(StoreError::validation("status is required"));
    }
    Ok(())
}

/// Build the derived forest from a flat row list by grouping on
/// `parent_id`, starting from the roots. Each group is consumed at most
/// once, so a cyclic parent chain (which writes reject anyway) cannot
/// make construction loop; rows on such a chain are unreachable from any
/// root and are simply left out.
#[must_use]
pub fn build_task_tree(mut rows: Vec<Task>) -> Vec<TaskNode> {
    rows.sort_by_key(|task| task.id);
    let mut children: HashMap<Option<i64>, Vec<Task>> = HashMap::new();
    for task in rows {
        children.entry(task.parent_id).or_default().push(task);
    }
    attach(&mut children, None)
}

fn attach(children: &mut HashMap<Option<i64>, Vec<Task>>, parent: Option<i64>) -> Vec<TaskNode> {
    let Some(group) = children.remove(&parent) else {
        return Vec::new();
    };
    group
        .into_iter()
        .map(|task| {
            let id = task.id;
            TaskNode {
                task,
                subtasks: attach(children, Some(id)),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use taskpilot_proto::{Priority, TaskStatus};

    use super::*;

    fn row(id: i64, parent_id: Option<i64>) -> Task {
        Task {
            id,
            owner_id: 1,
            name: format!("task-{id}"),
            description: None,
            priority: Priority::Medium,
            due_date: None,
            status: TaskStatus::Pending,
            parent_id,
        }
    }

    #[test]
    fn forest_groups_rows_under_their_parents() {
        let tree = build_task_tree(vec![
            row(3, Some(1)),
            row(1, None),
            row(2, None),
            row(4, Some(3)),
        ]);
        assert_eq!(tree.len(), 2);
        assert_eq!(tree[0].task.id, 1);
        assert_eq!(tree[0].subtasks.len(), 1);
        assert_eq!(tree[0].subtasks[0].task.id, 3);
        assert_eq!(tree[0].subtasks[0].subtasks[0].task.id, 4);
        assert!(tree[1].subtasks.is_empty());
    }

    #[test]
    fn construction_terminates_on_a_cyclic_chain() {
        // 5 <-> 6 reference each other; neither is reachable from a root.
        let tree = build_task_tree(vec![row(1, None), row(5, Some(6)), row(6, Some(5))]);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].task.id, 1);
    }
}
