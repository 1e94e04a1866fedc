//! Tests for candidate selection and failover.

use super::*;
use crate::completion::Message;
use crate::health::{BackoffPolicy, ManualClock};
use crate::provider::{MockAdapter, MockBehavior, ProviderAdapter};
use chrono::TimeZone;
use pretty_assertions::assert_eq;

struct Fixture {
    router: Router,
    clock: ManualClock,
    mocks: Vec<Arc<MockAdapter>>,
}

impl Fixture {
    fn mock(&self, id: &str) -> &MockAdapter {
        self.mocks
            .iter()
            .find(|m| m.id() == id)
            .expect("mock registered")
    }

    fn failures(&self, id: &str) -> u32 {
        self.router
            .health()
            .get(id)
            .map(|r| r.consecutive_failures)
            .unwrap_or(0)
    }
}

fn fixture(providers: Vec<(ProviderEntry, MockBehavior)>, config: RouterConfig) -> Fixture {
    let clock = ManualClock::new(chrono::Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());
    let health = Arc::new(HealthCache::with_clock(
        BackoffPolicy::default(),
        Arc::new(clock.clone()),
    ));
    let registry = Arc::new(AdapterRegistry::new());
    let mut entries = Vec::new();
    let mut mocks = Vec::new();
    for (entry, behavior) in providers {
        let mock = Arc::new(MockAdapter::new(&entry.id, behavior));
        registry.register(mock.clone());
        mocks.push(mock);
        entries.push(entry);
    }
    let whitelist = Arc::new(Whitelist::new(entries).unwrap());

    Fixture {
        router: Router::new(whitelist, health, registry, config),
        clock,
        mocks,
    }
}

fn hi() -> CompletionRequest {
    CompletionRequest::new(vec![Message::user("Hi")])
}

fn upstream(msg: &str) -> MockBehavior {
    MockBehavior::Fail(AdapterError::Upstream(msg.to_string()))
}

fn provider_ids(attempts: &[Attempt]) -> Vec<&str> {
    attempts.iter().map(|a| a.provider_id.as_str()).collect()
}

#[tokio::test(start_paused = true)]
async fn falls_over_from_timing_out_provider() {
    let f = fixture(
        vec![
            (ProviderEntry::new("A", 1).with_timeout(Duration::from_secs(2)), MockBehavior::Hang),
            (ProviderEntry::new("B", 2), MockBehavior::Reply("Hello!".to_string())),
        ],
        RouterConfig::default(),
    );

    let response = f.router.complete(hi()).await.unwrap();

    assert_eq!(response.content, "Hello!");
    assert_eq!(response.provider_id, "B");
    assert_eq!(f.failures("A"), 1);
    assert_eq!(f.mock("A").in_flight(), 0);
    let b = f.router.health().get("B").unwrap();
    assert_eq!(b.consecutive_failures, 0);
    assert!(b.last_success_at.is_some());
}

#[tokio::test]
async fn stops_at_first_success() {
    let f = fixture(
        vec![
            (ProviderEntry::new("first", 1), upstream("boom")),
            (ProviderEntry::new("second", 2), MockBehavior::Reply("ok".to_string())),
            (ProviderEntry::new("third", 3), MockBehavior::Reply("unused".to_string())),
        ],
        RouterConfig::default(),
    );

    let response = f.router.complete(hi()).await.unwrap();

    assert_eq!(response.provider_id, "second");
    assert_eq!(f.mock("first").calls(), 1);
    assert_eq!(f.mock("second").calls(), 1);
    assert_eq!(f.mock("third").calls(), 0);
}

#[tokio::test]
async fn aggregate_failure_lists_each_attempt_once_in_priority_order() {
    let f = fixture(
        vec![
            (ProviderEntry::new("c", 3), upstream("c down")),
            (
                ProviderEntry::new("a", 1),
                MockBehavior::Fail(AdapterError::RateLimited { retry_after: None }),
            ),
            (ProviderEntry::new("b", 2), upstream("b down")),
        ],
        RouterConfig::default(),
    );

    let error = f.router.complete(hi()).await.unwrap_err();

    let RouteError::AggregateFailure { attempts } = &error else {
        panic!("expected aggregate failure, got {:?}", error);
    };
    assert_eq!(provider_ids(attempts), vec!["a", "b", "c"]);
    assert_eq!(attempts[0].outcome, AttemptOutcome::RateLimited);
    assert_eq!(attempts[1].outcome, AttemptOutcome::Error);
    assert!(attempts[2].message.contains("c down"));
}

#[tokio::test]
async fn empty_completion_counts_as_failure() {
    let f = fixture(
        vec![
            (ProviderEntry::new("blank", 1), MockBehavior::Reply("   ".to_string())),
            (ProviderEntry::new("real", 2), MockBehavior::Reply("text".to_string())),
        ],
        RouterConfig::default(),
    );

    let response = f.router.complete(hi()).await.unwrap();

    assert_eq!(response.provider_id, "real");
    assert_eq!(f.failures("blank"), 1);
}

#[tokio::test]
async fn no_candidates_is_unavailable_without_attempts() {
    let f = fixture(
        vec![(ProviderEntry::new("a", 1).with_models(["gpt-4"]), MockBehavior::Reply("x".into()))],
        RouterConfig::default(),
    );

    let error = f.router.complete(hi().with_model("llama-3")).await.unwrap_err();

    assert_eq!(
        error,
        RouteError::AllProvidersUnavailable { model: Some("llama-3".to_string()) }
    );
    assert_eq!(f.mock("a").calls(), 0);
}

#[tokio::test]
async fn provider_in_cooldown_is_skipped_until_it_expires() {
    let f = fixture(
        vec![
            (ProviderEntry::new("flaky", 1), upstream("down")),
            (ProviderEntry::new("backup", 2), MockBehavior::Reply("ok".into())),
        ],
        RouterConfig::default(),
    );

    for _ in 0..3 {
        f.router.complete(hi()).await.unwrap();
    }
    assert_eq!(f.mock("flaky").calls(), 3);

    // Threshold crossed: flaky is no longer a candidate.
    f.router.complete(hi()).await.unwrap();
    assert_eq!(f.mock("flaky").calls(), 3);
    let ids: Vec<String> = f.router.candidates(&hi()).unwrap().into_iter().map(|e| e.id).collect();
    assert_eq!(ids, vec!["backup".to_string()]);

    f.clock.advance(Duration::from_secs(9));
    f.mock("flaky").set_behavior(MockBehavior::Reply("recovered".into()));

    let response = f.router.complete(hi()).await.unwrap();
    assert_eq!(response.provider_id, "flaky");
    assert_eq!(f.failures("flaky"), 0);
}

#[tokio::test]
async fn all_in_cooldown_is_unavailable() {
    let f = fixture(
        vec![(ProviderEntry::new("only", 1), upstream("down"))],
        RouterConfig::default(),
    );

    for _ in 0..3 {
        assert!(matches!(
            f.router.complete(hi()).await,
            Err(RouteError::AggregateFailure { .. })
        ));
    }

    assert_eq!(
        f.router.complete(hi()).await.unwrap_err(),
        RouteError::AllProvidersUnavailable { model: None }
    );
}

#[tokio::test]
async fn repeated_requests_follow_identical_order() {
    let f = fixture(
        vec![
            (ProviderEntry::new("x", 2), upstream("x")),
            (ProviderEntry::new("y", 1), upstream("y")),
            (ProviderEntry::new("z", 2), upstream("z")),
        ],
        RouterConfig::default(),
    );
    // Keep everyone out of cooldown so each request sees the same candidates.
    let selections: Vec<Vec<String>> = (0..2)
        .map(|_| {
            f.router
                .candidates(&hi())
                .unwrap()
                .into_iter()
                .map(|e| e.id)
                .collect()
        })
        .collect();
    assert_eq!(selections[0], vec!["y", "x", "z"]);
    assert_eq!(selections[0], selections[1]);

    let first = f.router.complete(hi()).await.unwrap_err();
    let second = f.router.complete(hi()).await.unwrap_err();
    assert_eq!(provider_ids(first.attempts()), vec!["y", "x", "z"]);
    assert_eq!(provider_ids(first.attempts()), provider_ids(second.attempts()));
}

#[tokio::test]
async fn pinned_provider_is_the_only_candidate() {
    let f = fixture(
        vec![
            (ProviderEntry::new("a", 1), MockBehavior::Reply("from a".into())),
            (ProviderEntry::new("b", 2).with_models(["gpt-4"]), MockBehavior::Reply("from b".into())),
            (ProviderEntry::new("off", 3).disabled(), MockBehavior::Reply("never".into())),
        ],
        RouterConfig::default(),
    );

    let response = f.router.complete(hi().with_provider("b")).await.unwrap();
    assert_eq!(response.content, "from b");
    assert_eq!(f.mock("a").calls(), 0);

    assert_eq!(
        f.router.complete(hi().with_provider("nope")).await.unwrap_err(),
        RouteError::UnknownProvider("nope".to_string())
    );
    assert_eq!(
        f.router.complete(hi().with_provider("off")).await.unwrap_err(),
        RouteError::UnknownProvider("off".to_string())
    );
    assert!(matches!(
        f.router.complete(hi().with_provider("a").with_model("gpt-4")).await,
        Err(RouteError::AllProvidersUnavailable { .. })
    ));
}

#[tokio::test]
async fn whitelisted_provider_without_adapter_is_reported() {
    let f = fixture(
        vec![(ProviderEntry::new("real", 2), MockBehavior::Reply("ok".into()))],
        RouterConfig::default(),
    );
    f.router
        .whitelist()
        .reload(vec![ProviderEntry::new("ghost", 1), ProviderEntry::new("real", 2)])
        .unwrap();

    let response = f.router.complete(hi()).await.unwrap();
    assert_eq!(response.provider_id, "real");
    // Missing adapters are a configuration problem, not provider health.
    assert!(f.router.health().get("ghost").is_none());
}

#[tokio::test(start_paused = true)]
async fn parallel_mode_returns_fastest_success_and_cancels_the_rest() {
    let f = fixture(
        vec![
            (
                ProviderEntry::new("slow", 1),
                MockBehavior::Delay(Duration::from_secs(5), Box::new(MockBehavior::Reply("slow".into()))),
            ),
            (
                ProviderEntry::new("fast", 2),
                MockBehavior::Delay(Duration::from_millis(100), Box::new(MockBehavior::Reply("fast".into()))),
            ),
            (ProviderEntry::new("spare", 3), MockBehavior::Reply("spare".into())),
        ],
        RouterConfig {
            mode: RoutingMode::Parallel { fanout: 2 },
            request_timeout: None,
        },
    );

    let response = f.router.complete(hi()).await.unwrap();

    assert_eq!(response.provider_id, "fast");
    assert_eq!(f.mock("slow").calls(), 1);
    assert_eq!(f.mock("slow").in_flight(), 0);
    assert_eq!(f.mock("spare").calls(), 0);
    // The cancelled attempt never finished, so it leaves no trace.
    assert!(f.router.health().get("slow").is_none());
}

#[tokio::test(start_paused = true)]
async fn parallel_mode_moves_to_next_batch_when_all_fail() {
    let f = fixture(
        vec![
            (ProviderEntry::new("p1", 1), upstream("p1")),
            (
                ProviderEntry::new("p2", 2),
                MockBehavior::Fail(AdapterError::RateLimited { retry_after: None }),
            ),
            (ProviderEntry::new("p3", 3), upstream("p3")),
        ],
        RouterConfig {
            mode: RoutingMode::Parallel { fanout: 2 },
            request_timeout: None,
        },
    );

    let error = f.router.complete(hi()).await.unwrap_err();

    assert_eq!(provider_ids(error.attempts()), vec!["p1", "p2", "p3"]);
    assert!(matches!(error, RouteError::AggregateFailure { .. }));
}

#[tokio::test(start_paused = true)]
async fn request_deadline_cancels_in_flight_attempt() {
    let f = fixture(
        vec![
            (ProviderEntry::new("broken", 1), upstream("broken")),
            (
                ProviderEntry::new("stuck", 2).with_timeout(Duration::from_secs(60)),
                MockBehavior::Hang,
            ),
        ],
        RouterConfig {
            mode: RoutingMode::Sequential,
            request_timeout: Some(Duration::from_secs(3)),
        },
    );

    let error = f.router.complete(hi()).await.unwrap_err();

    let RouteError::DeadlineExceeded { timeout, attempts } = error else {
        panic!("expected deadline error");
    };
    assert_eq!(timeout, Duration::from_secs(3));
    assert_eq!(provider_ids(&attempts), vec!["broken"]);
    assert_eq!(f.mock("stuck").in_flight(), 0);
    assert!(f.router.health().get("stuck").is_none());
}

#[tokio::test(start_paused = true)]
async fn dropping_a_request_does_not_count_against_shared_provider() {
    let f = Arc::new(fixture(
        vec![(
            ProviderEntry::new("shared", 1).with_timeout(Duration::from_secs(10)),
            MockBehavior::Delay(Duration::from_secs(5), Box::new(upstream("late failure"))),
        )],
        RouterConfig::default(),
    ));

    // Client goes away after one second.
    let abandoned = tokio::time::timeout(Duration::from_secs(1), f.router.complete(hi())).await;
    assert!(abandoned.is_err());
    assert_eq!(f.mock("shared").in_flight(), 0);
    assert_eq!(f.failures("shared"), 0);

    // A concurrent pair that both run to completion count exactly twice.
    let (one, two) = tokio::join!(f.router.complete(hi()), f.router.complete(hi()));
    assert!(one.is_err() && two.is_err());
    assert_eq!(f.failures("shared"), 2);
    assert_eq!(f.mock("shared").calls(), 3);
}

#[test]
fn route_error_messages_are_readable() {
    let unavailable = RouteError::AllProvidersUnavailable { model: None };
    assert_eq!(unavailable.to_string(), "no available provider for model (any)");
    assert!(unavailable.attempts().is_empty());

    let aggregate = RouteError::AggregateFailure {
        attempts: vec![Attempt {
            provider_id: "a".into(),
            outcome: AttemptOutcome::Timeout,
            message: "no response".into(),
            latency_ms: 10,
        }],
    };
    assert_eq!(aggregate.to_string(), "all 1 attempted providers failed");
}

#[tokio::test]
async fn request_without_model_uses_entry_default_model() {
    let f = fixture(
        vec![
            (
                ProviderEntry::new("multi", 1).with_models(["zephyr", "llama-3"]),
                MockBehavior::Reply("hi".into()),
            ),
            (ProviderEntry::new("bare", 2), MockBehavior::Reply("hi".into())),
        ],
        RouterConfig::default(),
    );

    let defaulted = f.router.complete(hi()).await.unwrap();
    assert_eq!(defaulted.provider_id, "multi");
    assert_eq!(defaulted.model.as_deref(), Some("llama-3"));

    let explicit = f.router.complete(hi().with_model("zephyr")).await.unwrap();
    assert_eq!(explicit.model.as_deref(), Some("zephyr"));

    let bare = f.router.complete(hi().with_provider("bare")).await.unwrap();
    assert_eq!(bare.model, None);
}
