//! HTTP handlers for the gateway API.

use super::types::*;
use super::AppState;
use crate::completion::CompletionRequest;
use crate::error::GatewayError;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    Json,
};
use std::sync::Arc;

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        app: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub async fn complete(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CompletionBody>, JsonRejection>,
) -> Result<Json<CompletionReply>, GatewayError> {
    let Json(body) = body?;
    if body.messages.is_empty() {
        return Err(GatewayError::InvalidRequest(
            "messages must not be empty".to_string(),
        ));
    }

    let request = CompletionRequest::from(body);
    let response = state.router.complete(request).await?;
    Ok(Json(response.into()))
}

pub async fn list_providers(State(state): State<Arc<AppState>>) -> Json<ProvidersResponse> {
    let snapshot = state.router.whitelist().snapshot();
    let health = state.router.health();
    let now = health.now();

    let providers = snapshot
        .entries()
        .iter()
        .map(|entry| ProviderStatus {
            id: entry.id.clone(),
            priority: entry.priority,
            models: entry.supported_models.iter().cloned().collect(),
            timeout_ms: entry.timeout.as_millis() as u64,
            enabled: entry.enabled,
            available: entry.enabled && health.is_available(&entry.id, now),
            has_adapter: state.router.adapters().contains(&entry.id),
            health: health.get(&entry.id),
        })
        .collect();

    Json(ProvidersResponse { providers })
}

pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        models: state.router.whitelist().models(),
    })
}

pub async fn provider_failures(State(state): State<Arc<AppState>>) -> Json<FailuresResponse> {
    Json(FailuresResponse {
        failures: state.prober.failures().all(),
    })
}

pub async fn reload_whitelist(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReloadResponse>, GatewayError> {
    let providers = state.reload_from_disk()?;
    Ok(Json(ReloadResponse { providers }))
}

pub async fn reset_provider(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ResetResponse>, GatewayError> {
    let listed = state.router.whitelist().get(&id).is_some();
    let reset = state.router.health().reset(&id);
    if !listed && !reset {
        return Err(GatewayError::NotFound(format!("provider '{}'", id)));
    }
    if reset {
        tracing::info!(provider = %id, "health record cleared");
    }
    Ok(Json(ResetResponse { provider: id, reset }))
}
