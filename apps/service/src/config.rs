use std::{
    env,
    net::{AddrParseError, SocketAddr},
};

use thiserror::Error;

/// Seven days, matching the lifetime of tokens the web client caches.
pub const DEFAULT_TOKEN_TTL_SECONDS: u64 = 7 * 24 * 60 * 60;

#[derive(Clone, Debug)]
pub struct Config {
    pub service_name: String,
    pub bind_addr: SocketAddr,
    pub build_sha: String,
    pub token_signing_key: String,
    pub token_ttl_seconds: u64,
    pub password_hash_key: String,
    pub model_base_url: String,
    pub model_name: String,
    pub model_request_timeout_ms: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid TASKPILOT_BIND_ADDR: {0}")]
    InvalidBindAddr(#[from] AddrParseError),
    #[error("TASKPILOT_TOKEN_SIGNING_KEY must not be empty")]
    EmptyTokenSigningKey,
    #[error("invalid TASKPILOT_TOKEN_TTL_SECONDS: {0}")]
    InvalidTokenTtlSeconds(String),
    #[error("invalid TASKPILOT_MODEL_TIMEOUT_MS: {0}")]
    InvalidModelTimeoutMs(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr = env::var("TASKPILOT_BIND_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:4200".to_string())
            .parse()?;
        let service_name =
            env::var("TASKPILOT_SERVICE_NAME").unwrap_or_else(|_| "taskpilot".to_string());
        let build_sha = env::var("TASKPILOT_BUILD_SHA").unwrap_or_else(|_| "dev".to_string());
        let token_signing_key = env::var("TASKPILOT_TOKEN_SIGNING_KEY")
            .unwrap_or_else(|_| "taskpilot-dev-signing-key".to_string());
        if token_signing_key.trim().is_empty() {
            return Err(ConfigError::EmptyTokenSigningKey);
        }
        let token_ttl_seconds = env::var("TASKPILOT_TOKEN_TTL_SECONDS")
            .unwrap_or_else(|_| DEFAULT_TOKEN_TTL_SECONDS.to_string())
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidTokenTtlSeconds(error.to_string()))?;
        let password_hash_key = env::var("TASKPILOT_PASSWORD_HASH_KEY")
            .unwrap_or_else(|_| "taskpilot-dev-password-key".to_string());
        let model_base_url = env::var("TASKPILOT_MODEL_BASE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:11434".to_string())
            .trim_end_matches('/')
            .to_string();
        let model_name =
            env::var("TASKPILOT_MODEL_NAME").unwrap_or_else(|_| "phi3:mini".to_string());
        let model_request_timeout_ms = env::var("TASKPILOT_MODEL_TIMEOUT_MS")
            .unwrap_or_else(|_| "120000".to_string())
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidModelTimeoutMs(error.to_string()))?;

        Ok(Self {
            service_name,
            bind_addr,
            build_sha,
            token_signing_key,
            token_ttl_seconds,
            password_hash_key,
            model_base_url,
            model_name,
            model_request_timeout_ms,
        })
    }
}
