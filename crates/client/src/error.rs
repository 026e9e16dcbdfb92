use thiserror::Error;

use crate::transport::TransportError;

/// Failure classes for a chat exchange, split by whether an automatic
/// retry is worth attempting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatErrorCode {
    Aborted,
    NetworkError,
    RateLimit,
    ServerError,
    ClientError,
    UnknownError,
}

impl ChatErrorCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aborted => "ABORTED",
            Self::NetworkError => "NETWORK_ERROR",
            Self::RateLimit => "RATE_LIMIT",
            Self::ServerError => "SERVER_ERROR",
            Self::ClientError => "CLIENT_ERROR",
            Self::UnknownError => "UNKNOWN_ERROR",
        }
    }

    /// User cancellations and caller mistakes are final; everything else
    /// is assumed transient.
    #[must_use]
    pub fn retryable(self) -> bool {
        !matches!(self, Self::Aborted | Self::ClientError)
    }
}

/// A classified chat failure surfaced to the UI, retaining whether the
/// session may retry it automatically.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ChatError {
    pub message: String,
    pub code: ChatErrorCode,
    pub retryable: bool,
}

impl ChatError {
    #[must_use]
    pub fn new(code: ChatErrorCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code,
            retryable: code.retryable(),
        }
    }

    #[must_use]
    pub fn aborted() -> Self {
        Self::new(ChatErrorCode::Aborted, "the request was cancelled")
    }

    /// Map a transport-level failure onto the retry taxonomy.
    #[must_use]
    pub fn classify(error: &TransportError) -> Self {
        match error {
            TransportError::Aborted => Self::aborted(),
            TransportError::Network(message) => Self::new(
                ChatErrorCode::NetworkError,
                format!("connection failed: {message}"),
            ),
            TransportError::Status { status: 429, .. } => Self::new(
                ChatErrorCode::RateLimit,
                "too many requests, wait a moment before trying again",
            ),
            TransportError::Status { status, message } if *status >= 500 => Self::new(
                ChatErrorCode::ServerError,
                format!("server error {status}: {message}"),
            ),
            TransportError::Status { status, message } if *status >= 400 => Self::new(
                ChatErrorCode::ClientError,
                format!("request rejected ({status}): {message}"),
            ),
            TransportError::Status { status, message } => Self::new(
                ChatErrorCode::UnknownError,
                format!("unexpected status {status}: {message}"),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_the_retry_table() {
        let cases = [
            (TransportError::Aborted, ChatErrorCode::Aborted, false),
            (
                TransportError::Network("refused".to_string()),
                ChatErrorCode::NetworkError,
                true,
            ),
            (
                TransportError::Status {
                    status: 429,
                    message: String::new(),
                },
                ChatErrorCode::RateLimit,
                true,
            ),
            (
                TransportError::Status {
                    status: 503,
                    message: String::new(),
                },
                ChatErrorCode::ServerError,
                true,
            ),
            (
                TransportError::Status {
                    status: 404,
                    message: String::new(),
                },
                ChatErrorCode::ClientError,
                false,
            ),
            (
                TransportError::Status {
                    status: 302,
                    message: String::new(),
                },
                ChatErrorCode::UnknownError,
                true,
            ),
        ];
        for (transport_error, code, retryable) in cases {
            let error = ChatError::classify(&transport_error);
            assert_eq!(error.code, code);
            assert_eq!(error.retryable, retryable);
        }
    }
}
