//! Provider adapters: the uniform "send conversation, get completion" capability.
//!
//! The router only talks to [`ProviderAdapter`]. Adding a provider means
//! registering another implementation in the [`AdapterRegistry`].

mod mock;
mod openai;

pub use mock::{MockAdapter, MockBehavior};
pub use openai::{normalize_response, OpenAiCompatAdapter};

use crate::completion::{CompletionOptions, Message};
use crate::config::ProviderConfig;
use crate::health::AttemptOutcome;
use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// A completion produced by an adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub model: Option<String>,
}

/// Ways an adapter call can fail.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },
}

impl AdapterError {
    pub fn outcome(&self) -> AttemptOutcome {
        match self {
            Self::Timeout(_) => AttemptOutcome::Timeout,
            Self::Upstream(_) => AttemptOutcome::Error,
            Self::RateLimited { .. } => AttemptOutcome::RateLimited,
        }
    }

    /// Short name used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "TimeoutError",
            Self::Upstream(_) => "UpstreamError",
            Self::RateLimited { .. } => "RateLimitedError",
        }
    }
}

/// Capability every provider backend implements.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Whitelist id this adapter serves.
    fn id(&self) -> &str;

    /// Send the conversation and wait for a completion.
    ///
    /// Implementations must give up with [`AdapterError::Timeout`] once
    /// `deadline` has passed rather than block past it.
    async fn send(
        &self,
        conversation: &[Message],
        options: &CompletionOptions,
        model: Option<&str>,
        deadline: Duration,
    ) -> Result<Completion, AdapterError>;
}

/// Maps provider ids to adapter instances.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: RwLock<HashMap<String, Arc<dyn ProviderAdapter>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own id, replacing any previous one.
    pub fn register(&self, adapter: Arc<dyn ProviderAdapter>) -> Option<Arc<dyn ProviderAdapter>> {
        let id = adapter.id().to_string();
        self.adapters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, adapter)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.adapters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .adapters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.adapters.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register an HTTP adapter for every provider that has a `base_url`.
    ///
    /// Returns how many adapters were (re)registered.
    pub fn register_http_providers(&self, providers: &[ProviderConfig], client: &Client) -> usize {
        let mut registered = 0;
        for provider in providers {
            let Some(base_url) = &provider.base_url else {
                continue;
            };
            let adapter = OpenAiCompatAdapter::new(&provider.id, base_url, client.clone())
                .with_api_key(provider.api_key());
            self.register(Arc::new(adapter));
            registered += 1;
        }
        registered
    }
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("ids", &self.ids())
            .finish()
    }
}
