//! Scripted adapter used to exercise the router without network access.

use super::{AdapterError, Completion, ProviderAdapter};
use crate::completion::{CompletionOptions, Message};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// What a [`MockAdapter`] does when called.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    Reply(String),
    Fail(AdapterError),
    /// Never resolves; only the caller's deadline ends the call.
    Hang,
    /// Wait, then behave as the inner behavior.
    Delay(Duration, Box<MockBehavior>),
}

#[derive(Debug)]
pub struct MockAdapter {
    id: String,
    behavior: Mutex<MockBehavior>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
}

impl MockAdapter {
    pub fn new(id: impl Into<String>, behavior: MockBehavior) -> Self {
        Self {
            id: id.into(),
            behavior: Mutex::new(behavior),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn replying(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(id, MockBehavior::Reply(content.into()))
    }

    pub fn failing(id: impl Into<String>, error: AdapterError) -> Self {
        Self::new(id, MockBehavior::Fail(error))
    }

    pub fn hanging(id: impl Into<String>) -> Self {
        Self::new(id, MockBehavior::Hang)
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock().unwrap_or_else(PoisonError::into_inner) = behavior;
    }

    /// Number of times `send` was entered.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls currently running; drops back when a call is cancelled.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(
        &self,
        _conversation: &[Message],
        _options: &CompletionOptions,
        model: Option<&str>,
        _deadline: Duration,
    ) -> Result<Completion, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        let mut behavior = self
            .behavior
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        loop {
            match behavior {
                MockBehavior::Reply(content) => {
                    return Ok(Completion {
                        content,
                        model: model.map(str::to_string),
                    })
                }
                MockBehavior::Fail(error) => return Err(error),
                MockBehavior::Hang => std::future::pending::<()>().await,
                MockBehavior::Delay(wait, next) => {
                    tokio::time::sleep(wait).await;
                    behavior = *next;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replies_and_counts_calls() {
        let adapter = MockAdapter::replying("a", "Hello!");

        let completion = adapter
            .send(&[Message::user("Hi")], &CompletionOptions::default(), Some("gpt-4"), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(completion.content, "Hello!");
        assert_eq!(completion.model.as_deref(), Some("gpt-4"));
        assert_eq!(adapter.calls(), 1);
        assert_eq!(adapter.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_then_fail() {
        let adapter = MockAdapter::new(
            "a",
            MockBehavior::Delay(
                Duration::from_secs(2),
                Box::new(MockBehavior::Fail(AdapterError::RateLimited { retry_after: None })),
            ),
        );

        let started = tokio::time::Instant::now();
        let result = adapter
            .send(&[], &CompletionOptions::default(), None, Duration::from_secs(5))
            .await;

        assert_eq!(result, Err(AdapterError::RateLimited { retry_after: None }));
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_hang_releases_in_flight_slot() {
        let adapter = MockAdapter::hanging("a");

        let opts = CompletionOptions::default();
        let call = adapter.send(&[], &opts, None, Duration::from_secs(1));
        let outcome = tokio::time::timeout(Duration::from_millis(50), call).await;

        assert!(outcome.is_err());
        assert_eq!(adapter.calls(), 1);
        assert_eq!(adapter.in_flight(), 0);
    }

    #[test]
    fn hang_stays_pending_until_dropped() {
        let adapter = MockAdapter::hanging("a");
        let options = CompletionOptions::default();

        let mut call = tokio_test::task::spawn(adapter.send(&[], &options, None, Duration::from_secs(1)));
        tokio_test::assert_pending!(call.poll());
        tokio_test::assert_pending!(call.poll());
        assert_eq!(adapter.in_flight(), 1);

        drop(call);
        assert_eq!(adapter.in_flight(), 0);
    }
}
