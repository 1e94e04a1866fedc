//! HTTP surface of the gateway.
//!
//! Endpoints:
//! - POST /api/completions - Route a conversation to the first working provider
//! - GET /api/providers - Whitelist entries with their health
//! - GET /api/models - Models and the providers serving them
//! - GET /api/health - Liveness check
//! - GET /api/provider-failures - Latest probe failures
//! - POST /api/whitelist/reload - Re-read the whitelist from the config file
//! - POST /api/providers/{id}/reset - Clear a provider's health record

mod handlers;
mod types;


use axum::routing::{get, post};
use reqwest::Client;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::{Config, ConfigError};
use crate::error::GatewayError;
use crate::health::HealthCache;
use crate::http::create_client;
use crate::probe::Prober;
use crate::provider::AdapterRegistry;
use crate::router::Router;
use crate::whitelist::Whitelist;

pub use types::*;

/// Application state shared across handlers.
#[derive(Debug)]
pub struct AppState {
    pub router: Arc<Router>,
    pub prober: Arc<Prober>,
    client: Client,
    config_path: Option<PathBuf>,
}

impl AppState {
    pub fn new(router: Arc<Router>, prober: Arc<Prober>, client: Client) -> Self {
        Self {
            router,
            prober,
            client,
            config_path: None,
        }
    }

    /// File re-read by [`AppState::reload_from_disk`]. Defaults to [`Config::default_path`].
    pub fn with_config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    /// Wire whitelist, health cache, adapters, router and prober from a config.
    pub fn from_config(config: &Config, config_path: Option<PathBuf>) -> Result<Self, GatewayError> {
        let client = create_client()?;
        let whitelist = Arc::new(Whitelist::new(config.whitelist_entries())?);
        let health = Arc::new(HealthCache::new(config.health.backoff_policy()));
        let adapters = Arc::new(AdapterRegistry::new());
        let registered = adapters.register_http_providers(&config.providers, &client);
        tracing::info!(
            providers = config.providers.len(),
            adapters = registered,
            "gateway configured"
        );

        let router = Arc::new(Router::new(
            whitelist.clone(),
            health.clone(),
            adapters.clone(),
            config.routing.router_config(),
        ));
        let prober = Arc::new(Prober::new(
            whitelist,
            adapters,
            health,
            config.probe.timeout(),
            config.probe.interval(),
        ));

        Ok(Self::new(router, prober, client).with_config_path(config_path))
    }

    /// Swap in the providers of `config`. Returns the new whitelist size.
    ///
    /// Health records of providers that left the whitelist are dropped.
    pub fn apply_config(&self, config: &Config) -> Result<usize, GatewayError> {
        // Adapters go in first so new entries are routable the moment they are listed.
        self.router
            .adapters()
            .register_http_providers(&config.providers, &self.client);
        let count = self.router.whitelist().reload(config.whitelist_entries())?;
        let ids: HashSet<&str> = config.providers.iter().map(|p| p.id.as_str()).collect();
        self.router.health().retain(&ids);
        Ok(count)
    }

    pub fn reload_from_disk(&self) -> Result<usize, GatewayError> {
        let path = self
            .config_path
            .clone()
            .unwrap_or_else(Config::default_path);
        // A vanished file must not swap in an empty whitelist.
        let config = match Config::load_existing(&path) {
            Ok(config) => config.with_env_overrides(),
            Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(GatewayError::NotFound(format!(
                    "config file {}",
                    path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        tracing::info!(path = %path.display(), "reloading whitelist");
        self.apply_config(&config)
    }
}

/// Create the API router with the given state.
pub fn create_router_with_state(state: AppState) -> axum::Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    axum::Router::new()
        .route("/api/completions", post(handlers::complete))
        .route("/api/providers", get(handlers::list_providers))
        .route("/api/providers/{id}/reset", post(handlers::reset_provider))
        .route("/api/models", get(handlers::list_models))
        .route("/api/health", get(handlers::health_check))
        .route("/api/provider-failures", get(handlers::provider_failures))
        .route("/api/whitelist/reload", post(handlers::reload_whitelist))
        .with_state(Arc::new(state))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
