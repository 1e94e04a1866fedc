//! Background health checks.
//!
//! The prober sends a one-line conversation to every enabled whitelist
//! entry, feeds the outcome into the [`HealthCache`] and remembers the
//! latest failure of each provider for `GET /api/provider-failures`.

use crate::completion::{CompletionOptions, Message};
use crate::health::{AttemptOutcome, AttemptResult, HealthCache};
use crate::provider::{AdapterError, AdapterRegistry, ProviderAdapter};
use crate::whitelist::{ProviderEntry, Whitelist};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use moka::future::Cache;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub const PROBE_PROMPT: &str = "hi, how are you?";

/// Upper bound on probes running at the same time.
pub const MAX_CONCURRENT_PROBES: usize = 8;

/// Last recorded probe failure of a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderFailure {
    pub provider_id: String,
    pub error_type: String,
    pub error_message: String,
    pub timestamp: DateTime<Utc>,
    pub model_used: Option<String>,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub working: Vec<String>,
    pub failed: Vec<ProviderFailure>,
}

impl ProbeReport {
    pub fn any_working(&self) -> bool {
        !self.working.is_empty()
    }
}

/// Outcome of a single probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub provider_id: String,
    pub model: Option<String>,
    pub latency: Duration,
    pub error: Option<AdapterError>,
}

/// Probe one provider with the entry's first supported model.
pub async fn probe_provider(
    entry: &ProviderEntry,
    adapter: &dyn ProviderAdapter,
    timeout: Duration,
) -> ProbeResult {
    let model = entry.supported_models.iter().next().cloned();
    let conversation = [Message::user(PROBE_PROMPT)];
    let options = CompletionOptions::default();

    let started = Instant::now();
    let call = adapter.send(&conversation, &options, model.as_deref(), timeout);
    let error = match tokio::time::timeout(timeout, call).await {
        Ok(Ok(completion)) if !completion.content.trim().is_empty() => None,
        Ok(Ok(_)) => Some(AdapterError::Upstream("empty completion".to_string())),
        Ok(Err(e)) => Some(e),
        Err(_) => Some(AdapterError::Timeout(timeout)),
    };

    ProbeResult {
        provider_id: entry.id.clone(),
        model,
        latency: started.elapsed(),
        error,
    }
}

/// Latest failure per provider, forgotten after a TTL.
#[derive(Clone)]
pub struct FailureLog {
    cache: Cache<String, Arc<ProviderFailure>>,
}

impl FailureLog {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: Cache::builder().time_to_live(ttl).build(),
        }
    }

    pub async fn insert(&self, failure: ProviderFailure) {
        self.cache
            .insert(failure.provider_id.clone(), Arc::new(failure))
            .await;
    }

    pub async fn remove(&self, provider_id: &str) {
        self.cache.invalidate(provider_id).await;
    }

    pub async fn get(&self, provider_id: &str) -> Option<Arc<ProviderFailure>> {
        self.cache.get(provider_id).await
    }

    /// All live failures sorted by provider id.
    pub fn all(&self) -> Vec<ProviderFailure> {
        let mut failures: Vec<ProviderFailure> = self
            .cache
            .iter()
            .map(|(_, failure)| failure.as_ref().clone())
            .collect();
        failures.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        failures
    }
}

impl std::fmt::Debug for FailureLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureLog")
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

#[derive(Debug)]
pub struct Prober {
    whitelist: Arc<Whitelist>,
    adapters: Arc<AdapterRegistry>,
    health: Arc<HealthCache>,
    failures: FailureLog,
    timeout: Duration,
    running: Mutex<()>,
}

impl Prober {
    /// `interval` sets how long failures stay in the log (two intervals).
    pub fn new(
        whitelist: Arc<Whitelist>,
        adapters: Arc<AdapterRegistry>,
        health: Arc<HealthCache>,
        timeout: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            whitelist,
            adapters,
            health,
            failures: FailureLog::new(interval.saturating_mul(2)),
            timeout,
            running: Mutex::new(()),
        }
    }

    pub fn failures(&self) -> &FailureLog {
        &self.failures
    }

    /// Probe every enabled entry once.
    ///
    /// Returns `None` without probing when another run is in progress.
    pub async fn probe_all(&self) -> Option<ProbeReport> {
        let Ok(_running) = self.running.try_lock() else {
            tracing::debug!("probe run already in progress, skipping");
            return None;
        };

        let entries = self.whitelist.list_candidates(None);
        tracing::info!(providers = entries.len(), "probing providers");

        let semaphore = Semaphore::new(MAX_CONCURRENT_PROBES);
        let probes = entries.iter().map(|entry| {
            let semaphore = &semaphore;
            async move {
                let _permit = semaphore.acquire().await.ok();
                self.probe_entry(entry).await
            }
        });
        let results = join_all(probes).await;

        let mut report = ProbeReport::default();
        for result in results {
            match result {
                Ok(provider_id) => report.working.push(provider_id),
                Err(failure) => report.failed.push(failure),
            }
        }
        report.working.sort();
        report
            .failed
            .sort_by(|a, b| a.provider_id.cmp(&b.provider_id));

        tracing::info!(
            working = report.working.len(),
            failed = report.failed.len(),
            "probe run finished"
        );
        Some(report)
    }

    async fn probe_entry(&self, entry: &ProviderEntry) -> Result<String, ProviderFailure> {
        let Some(adapter) = self.adapters.get(&entry.id) else {
            let failure = ProviderFailure {
                provider_id: entry.id.clone(),
                error_type: "MissingAdapter".to_string(),
                error_message: "no adapter registered".to_string(),
                timestamp: self.health.now(),
                model_used: None,
                latency_ms: 0,
            };
            self.failures.insert(failure.clone()).await;
            return Err(failure);
        };

        let result = probe_provider(entry, adapter.as_ref(), self.timeout).await;
        let timestamp = self.health.now();
        let outcome = result
            .error
            .as_ref()
            .map_or(AttemptOutcome::Success, AdapterError::outcome);
        self.health.record(&AttemptResult {
            provider_id: entry.id.clone(),
            outcome,
            latency: result.latency,
            timestamp,
        });

        match result.error {
            None => {
                self.failures.remove(&entry.id).await;
                tracing::debug!(provider = %entry.id, "probe succeeded");
                Ok(result.provider_id)
            }
            Some(error) => {
                tracing::warn!(provider = %entry.id, %error, "probe failed");
                let failure = ProviderFailure {
                    provider_id: result.provider_id,
                    error_type: error.kind().to_string(),
                    error_message: error.to_string(),
                    timestamp,
                    model_used: result.model,
                    latency_ms: result.latency.as_millis() as u64,
                };
                self.failures.insert(failure.clone()).await;
                Err(failure)
            }
        }
    }

    /// Probe every `interval`, starting immediately, until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.probe_all() => {}
                }
            }
            tracing::info!("prober stopped");
        })
    }
}
