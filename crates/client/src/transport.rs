use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use thiserror::Error;

use taskpilot_proto::{ChatRequest, Proposal};

/// Raw bytes of the chat response body, in arrival order. Reads may cut
/// logical lines anywhere; reassembly is the session's job.
pub type ChatByteStream = BoxStream<'static, Result<Vec<u8>, TransportError>>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request cancelled")]
    Aborted,
    #[error("network failure: {0}")]
    Network(String),
    #[error("http status {status}: {message}")]
    Status { status: u16, message: String },
}

/// Where the session controller gets its token stream from. The HTTP
/// implementation talks to the service; tests script the stream.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn open_stream(&self, request: &ChatRequest) -> Result<ChatByteStream, TransportError>;
}

/// Where proposals found in the stream are persisted pending approval.
#[async_trait]
pub trait ProposalSink: Send + Sync {
    async fn save(&self, proposal: &Proposal) -> Result<(), TransportError>;
}

/// Streams `POST /chat` from a running taskpilot service.
#[derive(Clone)]
pub struct HttpChatTransport {
    base_url: String,
    http: reqwest::Client,
}

impl HttpChatTransport {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ChatTransport for HttpChatTransport {
    async fn open_stream(&self, request: &ChatRequest) -> Result<ChatByteStream, TransportError> {
        let response = self
            .http
            .post(format!("{}/chat", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(|error| TransportError::Network(error.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response
            .bytes_stream()
            .map(|next| match next {
                Ok(bytes) => Ok(bytes.to_vec()),
                Err(error) => Err(TransportError::Network(error.to_string())),
            })
            .boxed())
    }
}

/// Persists proposals through `POST /tasks/proposals/save` with the
/// session's bearer token.
#[derive(Clone)]
pub struct HttpProposalSink {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

impl HttpProposalSink {
    #[must_use]
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ProposalSink for HttpProposalSink {
    async fn save(&self, proposal: &Proposal) -> Result<(), TransportError> {
        let response = self
            .http
            .post(format!("{}/tasks/proposals/save", self.base_url))
            .bearer_auth(&self.token)
            .json(proposal)
            .send()
            .await
            .map_err(|error| TransportError::Network(error.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }
}
