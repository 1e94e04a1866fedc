//! Shared HTTP client factory.
//!
//! Every provider adapter shares one connection pool. Per-request
//! deadlines come from the whitelist entry, so the client-wide timeout
//! is only an upper bound.

use reqwest::Client;
use std::time::Duration;

/// Upper bound on any single upstream call (120 seconds).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Time allowed to establish a connection (10 seconds).
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Create the shared HTTP client with the default timeout.
pub fn create_client() -> reqwest::Result<Client> {
    create_client_with_timeout(DEFAULT_TIMEOUT)
}

/// Create an HTTP client with a custom overall timeout.
pub fn create_client_with_timeout(timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(CONNECT_TIMEOUT.min(timeout))
        .user_agent(USER_AGENT)
        .build()
}
