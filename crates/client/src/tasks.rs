use thiserror::Error;

use taskpilot_proto::{TaskCreatedResponse, TaskNode, TaskPayload, TaskTreeResponse};

/// Direct CRUD companion to the task tree view. Every call carries the
/// session's bearer token; ownership is enforced server-side.
#[derive(Clone)]
pub struct TasksClient {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

#[derive(Debug, Error)]
pub enum TasksClientError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("http status {status}: {message}")]
    Http { status: u16, message: String },
    #[error("response decode failed: {0}")]
    Decode(String),
}

impl TasksClient {
    #[must_use]
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            http: reqwest::Client::new(),
        }
    }

    pub async fn list(&self) -> Result<Vec<TaskNode>, TasksClientError> {
        let response = self
            .http
            .get(format!("{}/tasks", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|error| TasksClientError::Request(error.to_string()))?;
        let response = check_status(response).await?;
        let body: TaskTreeResponse = response
            .json()
            .await
            .map_err(|error| TasksClientError::Decode(error.to_string()))?;
        Ok(body.tasks)
    }

    pub async fn create(&self, payload: &TaskPayload) -> Result<i64, TasksClientError> {
        let response = self
            .http
            .post(format!("{}/tasks", self.base_url))
            .bearer_auth(&self.token)
            .json(payload)
            .send()
            .await
            .map_err(|error| TasksClientError::Request(error.to_string()))?;
        let response = check_status(response).await?;
        let body: TaskCreatedResponse = response
            .json()
            .await
            .map_err(|error| TasksClientError::Decode(error.to_string()))?;
        Ok(body.id)
    }

    pub async fn update(&self, id: i64, payload: &TaskPayload) -> Result<(), TasksClientError> {
        let response = self
            .http
            .put(format!("{}/tasks/{id}", self.base_url))
            .bearer_auth(&self.token)
            .json(payload)
            .send()
            .await
            .map_err(|error| TasksClientError::Request(error.to_string()))?;
        check_status(response).await?;
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> Result<(), TasksClientError> {
        let response = self
            .http
            .delete(format!("{}/tasks/{id}", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|error| TasksClientError::Request(error.to_string()))?;
        check_status(response).await?;
        Ok(())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, TasksClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(TasksClientError::Http {
        status: status.as_u16(),
        message,
    })
}
