//! Operator-curated set of providers the router may use.
//!
//! The table is an immutable snapshot behind an [`ArcSwap`]: requests load
//! it without locking and a reload replaces it wholesale, so no request
//! ever sees a half-applied update.

use arc_swap::ArcSwap;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Per-request timeout used when an entry does not set one.
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEntry {
    pub id: String,
    /// Lower is tried first.
    pub priority: i32,
    pub supported_models: BTreeSet<String>,
    pub timeout: Duration,
    pub enabled: bool,
}

impl ProviderEntry {
    pub fn new(id: impl Into<String>, priority: i32) -> Self {
        Self {
            id: id.into(),
            priority,
            supported_models: BTreeSet::new(),
            timeout: DEFAULT_PROVIDER_TIMEOUT,
            enabled: true,
        }
    }

    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.supported_models = models.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// True when no model is requested or the entry lists the model.
    pub fn supports(&self, model: Option<&str>) -> bool {
        model.map_or(true, |m| self.supported_models.contains(m))
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WhitelistError {
    #[error("duplicate provider id '{0}'")]
    DuplicateId(String),
    #[error("provider id must not be empty")]
    EmptyId,
}

/// A model and the providers able to serve it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelProviders {
    pub name: String,
    pub providers: Vec<String>,
}

/// One immutable version of the whitelist, entries in insertion order.
#[derive(Debug, Default)]
pub struct WhitelistSnapshot {
    entries: Vec<ProviderEntry>,
}

impl WhitelistSnapshot {
    fn build(entries: Vec<ProviderEntry>) -> Result<Self, WhitelistError> {
        let mut seen = HashSet::new();
        for entry in &entries {
            if entry.id.trim().is_empty() {
                return Err(WhitelistError::EmptyId);
            }
            if !seen.insert(entry.id.as_str()) {
                return Err(WhitelistError::DuplicateId(entry.id.clone()));
            }
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[ProviderEntry] {
        &self.entries
    }

    pub fn get(&self, id: &str) -> Option<&ProviderEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Enabled entries supporting `model`, by priority then insertion order.
    pub fn candidates(&self, model: Option<&str>) -> Vec<ProviderEntry> {
        let mut candidates: Vec<ProviderEntry> = self
            .entries
            .iter()
            .filter(|e| e.enabled && e.supports(model))
            .cloned()
            .collect();
        // Stable sort keeps insertion order among equal priorities.
        candidates.sort_by_key(|e| e.priority);
        candidates
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug)]
pub struct Whitelist {
    current: ArcSwap<WhitelistSnapshot>,
}

impl Whitelist {
    pub fn new(entries: Vec<ProviderEntry>) -> Result<Self, WhitelistError> {
        let snapshot = WhitelistSnapshot::build(entries)?;
        Ok(Self {
            current: ArcSwap::from_pointee(snapshot),
        })
    }

    pub fn empty() -> Self {
        Self {
            current: ArcSwap::from_pointee(WhitelistSnapshot::default()),
        }
    }

    /// The table as of now. Later reloads do not affect the returned value.
    pub fn snapshot(&self) -> Arc<WhitelistSnapshot> {
        self.current.load_full()
    }

    pub fn list_candidates(&self, model: Option<&str>) -> Vec<ProviderEntry> {
        self.current.load().candidates(model)
    }

    pub fn get(&self, id: &str) -> Option<ProviderEntry> {
        self.current.load().get(id).cloned()
    }

    /// Validate and atomically replace the whole table.
    ///
    /// On error the current table is left untouched.
    pub fn reload(&self, entries: Vec<ProviderEntry>) -> Result<usize, WhitelistError> {
        let snapshot = WhitelistSnapshot::build(entries)?;
        let count = snapshot.len();
        self.current.store(Arc::new(snapshot));
        tracing::info!(providers = count, "whitelist reloaded");
        Ok(count)
    }

    /// Models served by enabled entries, sorted by name.
    pub fn models(&self) -> Vec<ModelProviders> {
        let candidates = self.current.load().candidates(None);
        let mut models: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for entry in &candidates {
            for model in &entry.supported_models {
                models
                    .entry(model.as_str())
                    .or_default()
                    .push(entry.id.clone());
            }
        }
        models
            .into_iter()
            .map(|(name, providers)| ModelProviders {
                name: name.to_string(),
                providers,
            })
            .collect()
    }
}

impl Default for Whitelist {
    fn default() -> Self {
        Self::empty()
    }
}
