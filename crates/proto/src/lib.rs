//! Taskpilot wire contracts.
//!
//! This crate owns the JSON shapes exchanged between the service and its
//! clients: task rows and derived tree nodes, pending change proposals,
//! chat messages, and the newline-delimited chunks of the chat stream.
//! It intentionally separates wire types from service-side domain logic.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Task priority, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
}

impl TaskStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Done => "done",
        }
    }
}

/// A stored task row. Subtask membership is derived from `parent_id`;
/// rows never hold child pointers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub priority: Priority,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    pub status: TaskStatus,
    #[serde(default)]
    pub parent_id: Option<i64>,
}

/// One node of the derived task forest returned by `GET /tasks`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskNode {
    #[serde(flatten)]
    pub task: Task,
    #[serde(default)]
    pub subtasks: Vec<TaskNode>,
}

/// The caller-supplied field set for task create/update and for the
/// payload of create/update proposals. Required fields are validated at
/// the store boundary, not by serde, so missing fields surface as a 400
/// rather than a body-rejection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<i64>,
}

/// What a proposal wants to do to the task tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalKind {
    Create,
    Update,
    Delete,
}

impl ProposalKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Which level of the tree a proposal targets. The distinction only
/// changes the human description; subtasks are tasks with a parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalEntity {
    Task,
    Subtask,
}

impl ProposalEntity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Subtask => "subtask",
        }
    }
}

/// A structured, pending change to the task tree extracted from model
/// output. Requires explicit user approval before taking effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub kind: ProposalKind,
    pub entity: ProposalEntity,
    pub payload: serde_json::Value,
    pub description: String,
}

/// Chat participant role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

/// A single turn of conversation history sent to `POST /chat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

/// Request body for `POST /chat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatTurn>,
}

/// A client-side chat message. The assistant message accumulates content
/// while its stream is active and is immutable after completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: ChatRole,
    pub content: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub proposed_changes: Vec<Proposal>,
}

/// Terminal failure carried inside the chat stream when the upstream
/// model connection breaks after the response has started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFailure {
    pub message: String,
    pub code: String,
}

/// One newline-delimited JSON line of the `POST /chat` response.
///
/// Content lines carry `content`; the line that triggered proposal
/// detection additionally carries `proposals`; the final line has
/// `done = true` and is emitted exactly once per stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposals: Option<Vec<Proposal>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StreamFailure>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub done: bool,
}

impl StreamChunk {
    #[must_use]
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn terminal() -> Self {
        Self {
            done: true,
            ..Self::default()
        }
    }
}

/// Public view of a registered user. The credential hash never crosses
/// the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub name: String,
}

/// Bearer token claims. Field names match the tokens the web client
/// already stores, hence the camelCase `userId`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthClaims {
    #[serde(rename = "userId")]
    pub user_id: i64,
    pub email: String,
    pub name: String,
    pub iat: usize,
    pub exp: usize,
}

/// Request body for `POST /auth/register`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Request body for `POST /auth/login`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Response body for login and register.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    pub user: User,
    pub token: String,
}

/// Response body for `GET /tasks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTreeResponse {
    pub tasks: Vec<TaskNode>,
}

/// Response body for `POST /tasks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCreatedResponse {
    pub id: i64,
}

/// Response body for `GET /auth/verify`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserResponse {
    pub user: User,
}

/// Request body for `POST /tasks/proposals/save`. Field presence is
/// validated by the handler so omissions surface as a 400.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalSaveRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub kind: Option<ProposalKind>,
    #[serde(default)]
    pub entity: Option<ProposalEntity>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Request body for proposal approve/reject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalActionRequest {
    #[serde(rename = "proposalId", default)]
    pub proposal_id: Option<String>,
}

/// Conversion failures when interpreting a proposal payload against the
/// task schema.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("proposal payload is not a JSON object")]
    NotAnObject,
    #[error("proposal payload field {0} is missing")]
    MissingField(&'static str),
    #[error("proposal payload does not match the task schema: {0}")]
    Schema(String),
}

impl Proposal {
    /// Interpret the free-form payload as task fields. Used when an
    /// approved proposal is dispatched against the task store.
    pub fn task_payload(&self) -> Result<TaskPayload, PayloadError> {
        if !self.payload.is_object() {
            return Err(PayloadError::NotAnObject);
        }
        serde_json::from_value(self.payload.clone())
            .map_err(|error| PayloadError::Schema(error.to_string()))
    }

    /// The task id a delete/update proposal targets.
    pub fn target_id(&self) -> Result<i64, PayloadError> {
        self.payload
            .get("id")
            .and_then(serde_json::Value::as_i64)
            .ok_or(PayloadError::MissingField("id"))
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;

    #[test]
    fn stream_chunk_lines_omit_absent_fields() -> Result<()> {
        let line = serde_json::to_string(&StreamChunk::content("hola"))?;
        assert_eq!(line, r#"{"content":"hola"}"#);

        let terminal = serde_json::to_string(&StreamChunk::terminal())?;
        assert_eq!(terminal, r#"{"done":true}"#);
        Ok(())
    }

    #[test]
    fn task_status_uses_snake_case_on_the_wire() -> Result<()> {
        let status: TaskStatus = serde_json::from_str(r#""in_progress""#)?;
        assert_eq!(status, TaskStatus::InProgress);
        assert_eq!(serde_json::to_string(&status)?, r#""in_progress""#);
        Ok(())
    }

    #[test]
    fn proposal_payload_interprets_task_fields() -> Result<()> {
        let proposal = Proposal {
            id: "proposal_1".to_string(),
            kind: ProposalKind::Update,
            entity: ProposalEntity::Task,
            payload: serde_json::json!({
                "id": 7,
                "name": "Rename me",
                "priority": "high",
                "status": "pending",
            }),
            description: "Proposal to update task".to_string(),
        };
        let fields = proposal.task_payload()?;
        assert_eq!(fields.name.as_deref(), Some("Rename me"));
        assert_eq!(fields.priority, Some(Priority::High));
        assert_eq!(proposal.target_id()?, 7);
        Ok(())
    }

    #[test]
    fn delete_payload_without_id_is_rejected() {
        let proposal = Proposal {
            id: "proposal_2".to_string(),
            kind: ProposalKind::Delete,
            entity: ProposalEntity::Task,
            payload: serde_json::json!({}),
            description: "Proposal to delete task".to_string(),
        };
        assert_eq!(
            proposal.target_id(),
            Err(PayloadError::MissingField("id"))
        );
    }
}
