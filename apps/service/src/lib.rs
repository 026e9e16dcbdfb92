#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::info;

use crate::{
    auth::{HmacPasswordHasher, TokenAuthority},
    config::Config,
    server::{AppState, build_router},
    store::memory::MemoryStore,
};

pub mod auth;
pub mod config;
pub mod extract;
pub mod relay;
pub mod server;
pub mod store;

#[must_use]
pub fn build_state(config: Config) -> AppState {
    let store = Arc::new(MemoryStore::new());
    let auth = Arc::new(TokenAuthority::new(
        &config.token_signing_key,
        config.token_ttl_seconds,
    ));
    let passwords = Arc::new(HmacPasswordHasher::new(&config.password_hash_key));
    AppState::new(config, store, auth, passwords)
}

#[must_use]
pub fn build_app(config: Config) -> axum::Router {
    build_router(build_state(config))
}

pub async fn serve(config: Config) -> Result<()> {
    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(
        service = %config.service_name,
        bind_addr = %config.bind_addr,
        model = %config.model_name,
        "taskpilot service listening"
    );
    axum::serve(listener, build_app(config)).await?;
    Ok(())
}
