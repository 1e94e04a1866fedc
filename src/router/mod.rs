//! Candidate selection, dispatch and failover.
//!
//! A request walks the whitelist candidates for its model in priority
//! order, skipping providers in cooldown. Every finished attempt is fed
//! back into the [`HealthCache`]. The first success wins; if every
//! candidate fails the caller gets the full list of attempts.
//!
//! Parallel mode dispatches `fanout` candidates at once and drops the
//! losers as soon as one succeeds. It burns provider quota, so it is
//! opt-in.

#[cfg(test)]
mod tests;

use crate::completion::{CompletionRequest, CompletionResponse};
use crate::health::{AttemptOutcome, AttemptResult, HealthCache};
use crate::provider::{AdapterError, AdapterRegistry};
use crate::whitelist::{ProviderEntry, Whitelist};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoutingMode {
    /// One adapter call at a time, in priority order.
    #[default]
    Sequential,
    /// Up to `fanout` concurrent calls, first success wins.
    Parallel { fanout: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouterConfig {
    pub mode: RoutingMode,
    /// Deadline for the whole request, across all attempts.
    pub request_timeout: Option<Duration>,
}

/// A failed attempt, as reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attempt {
    pub provider_id: String,
    pub outcome: AttemptOutcome,
    pub message: String,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    /// Nothing was attempted: no whitelisted provider is currently usable.
    #[error("no available provider for model {}", .model.as_deref().unwrap_or("(any)"))]
    AllProvidersUnavailable { model: Option<String> },
    /// Every attempted candidate failed.
    #[error("all {} attempted providers failed", .attempts.len())]
    AggregateFailure { attempts: Vec<Attempt> },
    #[error("request deadline of {timeout:?} exceeded after {} failed attempts", .attempts.len())]
    DeadlineExceeded {
        timeout: Duration,
        attempts: Vec<Attempt>,
    },
    #[error("provider '{0}' is not whitelisted")]
    UnknownProvider(String),
}

impl RouteError {
    pub fn attempts(&self) -> &[Attempt] {
        match self {
            Self::AggregateFailure { attempts } | Self::DeadlineExceeded { attempts, .. } => attempts,
            _ => &[],
        }
    }
}

/// Failed attempts tagged with their candidate index.
type AttemptLog = Vec<(usize, Attempt)>;

#[derive(Debug)]
pub struct Router {
    whitelist: Arc<Whitelist>,
    health: Arc<HealthCache>,
    adapters: Arc<AdapterRegistry>,
    config: RouterConfig,
}

impl Router {
    pub fn new(
        whitelist: Arc<Whitelist>,
        health: Arc<HealthCache>,
        adapters: Arc<AdapterRegistry>,
        config: RouterConfig,
    ) -> Self {
        Self {
            whitelist,
            health,
            adapters,
            config,
        }
    }

    pub fn whitelist(&self) -> &Arc<Whitelist> {
        &self.whitelist
    }

    pub fn health(&self) -> &Arc<HealthCache> {
        &self.health
    }

    pub fn adapters(&self) -> &Arc<AdapterRegistry> {
        &self.adapters
    }

    pub fn config(&self) -> RouterConfig {
        self.config
    }

    /// Whitelisted, currently available providers for the request, in attempt order.
    pub fn candidates(&self, request: &CompletionRequest) -> Result<Vec<ProviderEntry>, RouteError> {
        let model = request.model.as_deref();
        let snapshot = self.whitelist.snapshot();

        let listed = match &request.provider {
            Some(id) => {
                let entry = snapshot
                    .get(id)
                    .filter(|e| e.enabled)
                    .ok_or_else(|| RouteError::UnknownProvider(id.clone()))?;
                if entry.supports(model) {
                    vec![entry.clone()]
                } else {
                    Vec::new()
                }
            }
            None => snapshot.candidates(model),
        };

        let now = self.health.now();
        let available: Vec<ProviderEntry> = listed
            .into_iter()
            .filter(|entry| {
                let available = self.health.is_available(&entry.id, now);
                if !available {
                    tracing::debug!(provider = %entry.id, "skipping provider in cooldown");
                }
                available
            })
            .collect();

        if available.is_empty() {
            return Err(RouteError::AllProvidersUnavailable {
                model: request.model.clone(),
            });
        }
        Ok(available)
    }

    /// Route one request to the first provider that answers.
    pub async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, RouteError> {
        let span = tracing::info_span!(
            "complete",
            request_id = %Uuid::new_v4(),
            model = request.model.as_deref().unwrap_or("-"),
        );
        self.route(request).instrument(span).await
    }

    async fn route(&self, request: CompletionRequest) -> Result<CompletionResponse, RouteError> {
        let candidates = self.candidates(&request)?;
        tracing::debug!(
            candidates = ?candidates.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(),
            mode = ?self.config.mode,
            "dispatching"
        );

        let mut log = AttemptLog::new();
        let dispatch = self.dispatch(&request, &candidates, &mut log);

        let finished = match self.config.request_timeout {
            Some(limit) => tokio::time::timeout(limit, dispatch).await.map_err(|_| limit),
            None => Ok(dispatch.await),
        };

        match finished {
            Ok(Some(response)) => Ok(response),
            Ok(None) => {
                let attempts = ordered(log);
                tracing::warn!(attempted = attempts.len(), "all providers failed");
                Err(RouteError::AggregateFailure { attempts })
            }
            Err(timeout) => {
                let attempts = ordered(log);
                tracing::warn!(?timeout, attempted = attempts.len(), "request deadline exceeded");
                Err(RouteError::DeadlineExceeded { timeout, attempts })
            }
        }
    }

    /// Run attempts until one succeeds. Failures are appended to `log`.
    async fn dispatch(
        &self,
        request: &CompletionRequest,
        candidates: &[ProviderEntry],
        log: &mut AttemptLog,
    ) -> Option<CompletionResponse> {
        match self.config.mode {
            RoutingMode::Sequential => {
                for (index, entry) in candidates.iter().enumerate() {
                    match self.attempt(entry, request).await {
                        Ok(response) => return Some(response),
                        Err(attempt) => log.push((index, attempt)),
                    }
                }
                None
            }
            RoutingMode::Parallel { fanout } => {
                let fanout = fanout.max(1);
                for (batch_index, batch) in candidates.chunks(fanout).enumerate() {
                    let offset = batch_index * fanout;
                    let mut in_flight: FuturesUnordered<_> = batch
                        .iter()
                        .enumerate()
                        .map(|(i, entry)| {
                            let attempt = self.attempt(entry, request);
                            async move { (offset + i, attempt.await) }
                        })
                        .collect();

                    while let Some((index, result)) = in_flight.next().await {
                        match result {
                            Ok(response) => {
                                if !in_flight.is_empty() {
                                    tracing::debug!(cancelled = in_flight.len(), "dropping slower attempts");
                                }
                                return Some(response);
                            }
                            Err(attempt) => log.push((index, attempt)),
                        }
                    }
                }
                None
            }
        }
    }

    /// One adapter call under the entry's deadline, recorded in the health cache.
    async fn attempt(
        &self,
        entry: &ProviderEntry,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, Attempt> {
        let Some(adapter) = self.adapters.get(&entry.id) else {
            tracing::warn!(provider = %entry.id, "no adapter registered");
            return Err(Attempt {
                provider_id: entry.id.clone(),
                outcome: AttemptOutcome::Error,
                message: "no adapter registered".to_string(),
                latency_ms: 0,
            });
        };

        // Upstreams need a concrete model; fall back to the entry's first one.
        let model = request
            .model
            .as_deref()
            .or_else(|| entry.supported_models.iter().next().map(String::as_str));

        let started = Instant::now();
        let call = adapter.send(&request.conversation, &request.options, model, entry.timeout);
        let result = match tokio::time::timeout(entry.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Timeout(entry.timeout)),
        }
        .and_then(|completion| {
            if completion.content.trim().is_empty() {
                Err(AdapterError::Upstream("empty completion".to_string()))
            } else {
                Ok(completion)
            }
        });
        let latency = started.elapsed();

        let outcome = match &result {
            Ok(_) => AttemptOutcome::Success,
            Err(e) => e.outcome(),
        };
        self.health.record(&AttemptResult {
            provider_id: entry.id.clone(),
            outcome,
            latency,
            timestamp: self.health.now(),
        });

        match result {
            Ok(completion) => {
                tracing::info!(provider = %entry.id, latency_ms = latency.as_millis() as u64, "completion succeeded");
                Ok(CompletionResponse {
                    content: completion.content,
                    provider_id: entry.id.clone(),
                    model: completion.model,
                    latency,
                })
            }
            Err(error) => {
                tracing::warn!(provider = %entry.id, %error, "attempt failed");
                Err(Attempt {
                    provider_id: entry.id.clone(),
                    outcome,
                    message: error.to_string(),
                    latency_ms: latency.as_millis() as u64,
                })
            }
        }
    }
}

fn ordered(mut log: AttemptLog) -> Vec<Attempt> {
    log.sort_by_key(|(index, _)| *index);
    log.into_iter().map(|(_, attempt)| attempt).collect()
}
