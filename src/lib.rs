//! nofail - Chat-completion gateway that never gives up on the first provider.
//!
//! Features:
//! - Operator-curated whitelist of providers, ordered by priority
//! - Health cache with exponential cooldown after repeated failures
//! - Sequential or parallel failover across candidates
//! - Background probing of every whitelisted provider
//! - Small JSON HTTP API

pub mod api;
pub mod completion;
pub mod config;
pub mod error;
pub mod health;
pub mod http;
pub mod probe;
pub mod provider;
pub mod router;
pub mod whitelist;
