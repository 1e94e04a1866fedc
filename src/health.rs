//! Short-lived memory of provider successes and failures.
//!
//! Providers that fail `failure_threshold` times in a row are put in
//! cooldown and skipped by candidate selection until the window elapses.
//! A single success clears the record.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Largest exponent used by the backoff formula.
const MAX_BACKOFF_EXPONENT: u32 = 6;

/// Source of wall-clock time, injectable so cooldowns can be tested.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Arc::new(Mutex::new(start)) }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += to_chrono(by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// How a single attempt against a provider ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Timeout,
    Error,
    RateLimited,
}

impl AttemptOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Timeout => write!(f, "timeout"),
            Self::Error => write!(f, "error"),
            Self::RateLimited => write!(f, "rate_limited"),
        }
    }
}

/// One finished attempt, fed into the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptResult {
    pub provider_id: String,
    pub outcome: AttemptOutcome,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthRecord {
    pub provider_id: String,
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub cooling_down_until: Option<DateTime<Utc>>,
}

impl HealthRecord {
    fn new(provider_id: &str) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            consecutive_failures: 0,
            last_success_at: None,
            cooling_down_until: None,
        }
    }

    pub fn is_cooling_down(&self, now: DateTime<Utc>) -> bool {
        self.cooling_down_until.is_some_and(|until| until > now)
    }
}

/// When a provider enters cooldown and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub failure_threshold: u32,
    pub max_backoff: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            max_backoff: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    /// `2^min(failures, 6)` seconds, capped at `max_backoff`.
    pub fn backoff(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.min(MAX_BACKOFF_EXPONENT);
        Duration::from_secs(1u64 << exponent).min(self.max_backoff)
    }
}

/// Per-provider health shared by all in-flight requests.
#[derive(Debug)]
pub struct HealthCache {
    records: DashMap<String, HealthRecord>,
    policy: BackoffPolicy,
    clock: Arc<dyn Clock>,
}

impl HealthCache {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self::with_clock(policy, Arc::new(SystemClock))
    }

    pub fn with_clock(policy: BackoffPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            policy,
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    /// False iff the provider is cooling down at `now`. Unknown providers are available.
    pub fn is_available(&self, provider_id: &str, now: DateTime<Utc>) -> bool {
        self.records
            .get(provider_id)
            .map_or(true, |record| !record.is_cooling_down(now))
    }

    /// Apply an attempt to the provider's record and return the updated copy.
    ///
    /// The record stays locked for the whole update, so concurrent failures
    /// against the same provider are all counted.
    pub fn record(&self, result: &AttemptResult) -> HealthRecord {
        let mut entry = self
            .records
            .entry(result.provider_id.clone())
            .or_insert_with(|| HealthRecord::new(&result.provider_id));
        let record = entry.value_mut();

        if result.outcome.is_success() {
            record.consecutive_failures = 0;
            record.cooling_down_until = None;
            record.last_success_at = Some(result.timestamp);
        } else {
            record.consecutive_failures = record.consecutive_failures.saturating_add(1);
            if record.consecutive_failures >= self.policy.failure_threshold {
                let backoff = self.policy.backoff(record.consecutive_failures);
                record.cooling_down_until = Some(
                    result
                        .timestamp
                        .checked_add_signed(to_chrono(backoff))
                        .unwrap_or(DateTime::<Utc>::MAX_UTC),
                );
                tracing::warn!(
                    provider = %record.provider_id,
                    failures = record.consecutive_failures,
                    backoff_secs = backoff.as_secs(),
                    "provider entered cooldown"
                );
            }
        }

        record.clone()
    }

    pub fn get(&self, provider_id: &str) -> Option<HealthRecord> {
        self.records.get(provider_id).map(|r| r.value().clone())
    }

    /// All records, sorted by provider id.
    pub fn snapshot(&self) -> Vec<HealthRecord> {
        let mut records: Vec<HealthRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        records
    }

    /// Forget everything about a provider. Returns whether a record existed.
    pub fn reset(&self, provider_id: &str) -> bool {
        self.records.remove(provider_id).is_some()
    }

    /// Drop records of providers no longer whitelisted.
    pub fn retain(&self, provider_ids: &HashSet<&str>) {
        self.records.retain(|id, _| provider_ids.contains(id.as_str()));
    }
}

impl Default for HealthCache {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
