use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use modelgate_storage::GatewayStorage;

use crate::handler;
use crate::ratelimit::RateLimiter;
use crate::resolver::DeploymentResolver;
use crate::spend::SpendQueue;
use crate::upstream::ProxyEngine;

/// Shared per-process dependencies handed to every request. Connection pools and
/// the spend queue are constructed once at startup and injected here; nothing in
/// the request path reaches for ambient globals.
pub struct GatewayState {
    pub storage: GatewayStorage,
    pub resolver: DeploymentResolver,
    pub limiter: RateLimiter,
    pub engine: ProxyEngine,
    pub queue: SpendQueue,
    pub free_models: Vec<String>,
}

pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(handler::chat_completions))
        .route("/v1/completions", post(handler::completions))
        .route("/v1/embeddings", post(handler::embeddings))
        .route("/v1/messages", post(handler::messages))
        .route("/v1/models", get(handler::list_models))
        .route("/v1/models/{provider}", get(handler::list_models_by_provider))
        .route("/v1/attestation/report", get(handler::attestation_report))
        .route("/v1/signature/{*path}", get(handler::signature))
        .with_state(state)
}
