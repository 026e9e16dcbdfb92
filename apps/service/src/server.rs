use std::{sync::Arc, time::Duration};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
    routing::{get, post, put},
};
use futures::channel::mpsc;

use taskpilot_proto::{
    AuthClaims, AuthResponse, ChatRequest, LoginRequest, Proposal, ProposalActionRequest,
    ProposalSaveRequest, RegisterRequest, TaskCreatedResponse, TaskPayload, TaskTreeResponse,
    UserResponse,
};

use crate::{
    auth::{AuthError, PasswordHasher, TokenAuthority},
    config::Config,
    relay::{build_prompt, pump_upstream},
    store::{ProposalStore, StoreError, TaskStore, UserStore, memory::MemoryStore},
};

#[derive(Clone)]
pub struct AppState {
    config: Config,
    store: Arc<MemoryStore>,
    auth: Arc<TokenAuthority>,
    passwords: Arc<dyn PasswordHasher>,
    http: reqwest::Client,
}

impl AppState {
    #[must_use]
    pub fn new(
        config: Config,
        store: Arc<MemoryStore>,
        auth: Arc<TokenAuthority>,
        passwords: Arc<dyn PasswordHasher>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.model_request_timeout_ms))
            .build()
            .unwrap_or_default();
        Self {
            config,
            store,
            auth,
            passwords,
            http,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/readyz", get(readiness))
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/verify", get(verify))
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/:id", put(update_task).delete(delete_task))
        .route("/tasks/proposals/save", post(save_proposal))
        .route("/tasks/proposals/approve", post(approve_proposal))
        .route("/tasks/proposals/reject", post(reject_proposal))
        .route("/chat", post(chat))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": state.config.service_name,
        "build_sha": state.config.build_sha,
    }))
}

async fn readiness() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ready": true }))
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<AuthClaims, ApiError> {
    let header_value = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    let token = TokenAuthority::extract_bearer_token(header_value).map_err(ApiError::from_auth)?;
    state.auth.verify(token).map_err(ApiError::from_auth)
}

async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<AuthResponse>), ApiError> {
    let email = required_field(body.email, "email")?;
    let password = required_field(body.password, "password")?;
    let name = required_field(body.name, "name")?;

    let hash = state.passwords.hash(&password);
    let user = state
        .store
        .create_user(&email, &name, &hash)
        .await
        .map_err(ApiError::from_store)?;
    let token = state.auth.issue(&user).map_err(ApiError::from_auth)?;
    tracing::info!(user_id = user.id, "registered new user");
    Ok((StatusCode::CREATED, Json(AuthResponse { user, token })))
}

async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    let email = required_field(body.email, "email")?;
    let password = required_field(body.password, "password")?;

    let record = state
        .store
        .find_by_email(&email)
        .await
        .map_err(ApiError::from_store)?
        .ok_or(ApiError::InvalidCredentials)?;
    if !state.passwords.verify(&password, &record.password_hash) {
        return Err(ApiError::InvalidCredentials);
    }
    let token = state.auth.issue(&record.user).map_err(ApiError::from_auth)?;
    Ok(Json(AuthResponse {
        user: record.user,
        token,
    }))
}

async fn verify(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<UserResponse>, ApiError> {
    let claims = authenticate(&state, &headers)?;
    let user = state
        .store
        .find_by_id(claims.user_id)
        .await
        .map_err(ApiError::from_store)?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(UserResponse { user }))
}

async fn list_tasks(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<TaskTreeResponse>, ApiError> {
    let claims = authenticate(&state, &headers)?;
    let tasks = state
        .store
        .list(claims.user_id)
        .await
        .map_err(ApiError::from_store)?;
    Ok(Json(TaskTreeResponse { tasks }))
}

async fn create_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<TaskPayload>,
) -> Result<(StatusCode, Json<TaskCreatedResponse>), ApiError> {
    let claims = authenticate(&state, &headers)?;
    let id = state
        .store
        .create(claims.user_id, &body)
        .await
        .map_err(ApiError::from_store)?;
    Ok((StatusCode::CREATED, Json(TaskCreatedResponse { id })))
}

async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(body): Json<TaskPayload>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let claims = authenticate(&state, &headers)?;
    state
        .store
        .update(claims.user_id, id, &body)
        .await
        .map_err(ApiError::from_store)?;
    Ok(Json(serde_json::json!({ "message": "task updated" })))
}

async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let claims = authenticate(&state, &headers)?;
    state
        .store
        .delete(claims.user_id, id)
        .await
        .map_err(ApiError::from_store)?;
    Ok(Json(serde_json::json!({ "message": "task deleted" })))
}

async fn save_proposal(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ProposalSaveRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let claims = authenticate(&state, &headers)?;
    let proposal = Proposal {
        id: required_field(body.id, "id")?,
        kind: body
            .kind
            .ok_or_else(|| ApiError::Validation("kind is required".to_string()))?,
        entity: body
            .entity
            .ok_or_else(|| ApiError::Validation("entity is required".to_string()))?,
        payload: body
            .payload
            .ok_or_else(|| ApiError::Validation("payload is required".to_string()))?,
        description: required_field(body.description, "description")?,
    };
    state
        .store
        .save(claims.user_id, &proposal)
        .await
        .map_err(ApiError::from_store)?;
    Ok(Json(serde_json::json!({ "message": "proposal saved" })))
}

async fn approve_proposal(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ProposalActionRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let claims = authenticate(&state, &headers)?;
    let proposal_id = required_field(body.proposal_id, "proposalId")?;
    state
        .store
        .approve(claims.user_id, &proposal_id, state.store.as_ref())
        .await
        .map_err(ApiError::from_store)?;
    tracing::info!(user_id = claims.user_id, proposal_id = %proposal_id, "proposal approved");
    Ok(Json(
        serde_json::json!({ "message": "proposal approved and applied" }),
    ))
}

async fn reject_proposal(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ProposalActionRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let claims = authenticate(&state, &headers)?;
    let proposal_id = required_field(body.proposal_id, "proposalId")?;
    state
        .store
        .reject(claims.user_id, &proposal_id)
        .await
        .map_err(ApiError::from_store)?;
    Ok(Json(serde_json::json!({ "message": "proposal rejected" })))
}

/// Streamed chat endpoint. The upstream model response is relayed as
/// newline-delimited JSON with proposal metadata injected inline.
async fn chat(
    State(state): State<AppState>,
    Json(body): Json<ChatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if body.messages.is_empty() {
        return Err(ApiError::Validation("messages must not be empty".to_string()));
    }
    let prompt = build_prompt(&body.messages);
    let upstream = state
        .http
        .post(format!("{}/api/generate", state.config.model_base_url))
        .json(&serde_json::json!({
            "model": state.config.model_name,
            "prompt": prompt,
            "stream": true,
        }))
        .send()
        .await
        .map_err(|error| ApiError::Upstream(error.to_string()))?;
    if !upstream.status().is_success() {
        return Err(ApiError::Upstream(format!(
            "model server returned {}",
            upstream.status()
        )));
    }

    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(pump_upstream(upstream, tx));
    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(rx),
    ))
}

fn required_field(value: Option<String>, name: &str) -> Result<String, ApiError> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ApiError::Validation(format!("{name} is required"))),
    }
}

pub enum ApiError {
    Validation(String),
    Unauthorized(&'static str),
    InvalidCredentials,
    NotFound,
    Upstream(String),
    Internal(String),
}

impl ApiError {
    fn from_store(error: StoreError) -> Self {
        match error {
            StoreError::Validation(message) => Self::Validation(message),
            StoreError::NotFound => Self::NotFound,
            StoreError::EmailTaken => Self::Validation("email is already registered".to_string()),
            StoreError::Internal(message) => Self::Internal(message),
        }
    }

    fn from_auth(error: AuthError) -> Self {
        Self::Unauthorized(error.code())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        match self {
            Self::Validation(message) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": "validation_failed",
                    "message": message,
                })),
            )
                .into_response(),
            Self::Unauthorized(reason_code) => (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({
                    "error": "unauthorized",
                    "message": "authorization failed",
                    "reason_code": reason_code,
                })),
            )
                .into_response(),
            Self::InvalidCredentials => (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({
                    "error": "unauthorized",
                    "message": "invalid credentials",
                })),
            )
                .into_response(),
            Self::NotFound => (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({
                    "error": "not_found",
                })),
            )
                .into_response(),
            Self::Upstream(message) => {
                tracing::warn!(reason = %message, "model service unavailable");
                (
                    StatusCode::BAD_GATEWAY,
                    Json(serde_json::json!({
                        "error": "upstream_unavailable",
                        "message": "the model service could not be reached",
                    })),
                )
                    .into_response()
            }
            Self::Internal(message) => {
                tracing::error!(reason = %message, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({
                        "error": "internal",
                        "message": "internal server error",
                    })),
                )
                    .into_response()
            }
        }
    }
}
