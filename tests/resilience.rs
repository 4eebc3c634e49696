//! Property and concurrency tests for the resilience primitives.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tower::BoxError;

use tower_agent_runtime::config::{BreakerConfig, BucketConfig};
use tower_agent_runtime::observability::NoopSink;
use tower_agent_runtime::resilience::breaker::{Admission, CallResult};
use tower_agent_runtime::resilience::{
    Backoff, BreakerState, BucketState, CircuitBreaker, CircuitState, InMemoryBreakerStore,
    InMemoryBucketStore, TokenBucket,
};
use tower_agent_runtime::{AgentError, ManualClock};

proptest! {
    #[test]
    fn jitter_stays_within_half_to_one_and_a_half(
        attempt in 0usize..12,
        initial_ms in 1u64..5_000,
        seed in any::<u64>(),
    ) {
        let backoff = Backoff::exponential(
            Duration::from_millis(initial_ms),
            2.0,
            Duration::from_secs(60),
        )
        .with_jitter(true);
        let base = backoff.delay_for_attempt(attempt);
        prop_assert!(base <= Duration::from_secs(60));
        let d = backoff.jittered_with(attempt, &mut StdRng::seed_from_u64(seed));
        prop_assert!(d >= base.mul_f64(0.5));
        prop_assert!(d <= base.mul_f64(1.5));
    }

    #[test]
    fn backoff_never_shrinks(attempt in 0usize..30) {
        let backoff = Backoff::exponential(Duration::from_secs(1), 2.0, Duration::from_secs(60));
        prop_assert!(backoff.delay_for_attempt(attempt) <= backoff.delay_for_attempt(attempt + 1));
    }

    #[test]
    fn bucket_level_stays_in_bounds_and_never_overspends(
        rate in 0.5f64..50.0,
        capacity in 1.0f64..40.0,
        ops in prop::collection::vec((0u64..2_000, 0.1f64..5.0), 1..60),
    ) {
        let config = BucketConfig::new(rate).with_capacity(capacity);
        let start = Utc::now();
        let mut now = start;
        let mut bucket = BucketState::full(&config, now);
        let mut granted = 0.0;
        for (advance_ms, n) in ops {
            now += chrono::Duration::milliseconds(advance_ms as i64);
            if let tower_agent_runtime::resilience::rate_limit::Acquire::Granted =
                bucket.try_consume(&config, n, now)
            {
                granted += n;
            }
            prop_assert!(bucket.tokens >= 0.0);
            prop_assert!(bucket.tokens <= capacity + 1e-9);
        }
        let elapsed = (now - start).num_milliseconds() as f64 / 1000.0;
        prop_assert!(granted <= capacity + rate * elapsed + 1e-6);
    }

    #[test]
    fn breaker_opens_after_threshold_consecutive_failures(
        threshold in 1u32..10,
        outcomes in prop::collection::vec(any::<bool>(), 0..40),
    ) {
        let config = BreakerConfig { failure_threshold: threshold, recovery_timeout: Duration::from_secs(60) };
        let now = Utc::now();
        let mut state = BreakerState::default();
        let mut streak = 0u32;
        for ok in outcomes {
            let (admission, _) = state.admit(&config, now);
            if state.state == CircuitState::Open {
                let rejected = matches!(admission, Admission::Rejected { .. });
                prop_assert!(rejected);
                continue;
            }
            let result = if ok { CallResult::Success } else { CallResult::Failure };
            state.record(&config, admission, result, now);
            streak = if ok { 0 } else { streak + 1 };
            prop_assert_eq!(state.state == CircuitState::Open, streak >= threshold);
        }
    }
}

fn breaker(clock: &ManualClock) -> CircuitBreaker {
    CircuitBreaker::new(
        "dep",
        BreakerConfig {
            failure_threshold: 2,
            recovery_timeout: Duration::from_secs(10),
        },
        Arc::new(InMemoryBreakerStore::new()),
        Arc::new(clock.clone()),
        Arc::new(NoopSink),
    )
}

async fn fail(b: &CircuitBreaker) {
    let _ = b
        .call(|| async { Err::<(), BoxError>(AgentError::transient("dep", "down").into()) })
        .await;
}

#[tokio::test]
async fn half_open_lets_exactly_one_probe_through() {
    let clock = ManualClock::default();
    let b = breaker(&clock);
    fail(&b).await;
    fail(&b).await;
    assert_eq!(b.state().await.unwrap().state, CircuitState::Open);
    clock.advance(Duration::from_secs(10));

    let entered = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(tokio::sync::Notify::new());
    let mut probes = Vec::new();
    for _ in 0..5 {
        let b = b.clone();
        let entered = entered.clone();
        let release = release.clone();
        probes.push(tokio::spawn(async move {
            b.call(|| async move {
                entered.fetch_add(1, Ordering::SeqCst);
                release.notified().await;
                Ok::<_, BoxError>(())
            })
            .await
        }));
    }
    while entered.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }
    // give the other callers a chance to be rejected
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    release.notify_waiters();

    let mut ok = 0;
    let mut rejected = 0;
    for p in probes {
        match p.await.unwrap() {
            Ok(()) => ok += 1,
            Err(e) => {
                assert!(matches!(e.downcast_ref::<AgentError>(), Some(AgentError::CircuitOpen { .. })));
                rejected += 1;
            }
        }
    }
    assert_eq!(entered.load(Ordering::SeqCst), 1);
    assert_eq!((ok, rejected), (1, 4));
    assert_eq!(b.state().await.unwrap().state, CircuitState::Closed);
}

#[tokio::test]
async fn failed_probe_reopens_and_restarts_cooldown() {
    let clock = ManualClock::default();
    let b = breaker(&clock);
    fail(&b).await;
    fail(&b).await;
    clock.advance(Duration::from_secs(10));
    fail(&b).await;
    assert_eq!(b.state().await.unwrap().state, CircuitState::Open);
    clock.advance(Duration::from_secs(9));
    let err = b.call(|| async { Ok::<_, BoxError>(()) }).await.unwrap_err();
    assert!(matches!(err.downcast_ref::<AgentError>(), Some(AgentError::CircuitOpen { .. })));
}

#[tokio::test(start_paused = true)]
async fn blocked_consumer_waits_for_refill() {
    let clock = ManualClock::default();
    let bucket = TokenBucket::new(
        "llm-api",
        BucketConfig::new(1.0).with_capacity(1.0),
        Arc::new(InMemoryBucketStore::new()),
        Arc::new(clock.clone()),
        Arc::new(NoopSink),
    )
    .max_wait(Duration::from_secs(5));

    assert!(bucket.consume(1.0, false).await);
    assert!(!bucket.consume(1.0, false).await);

    let waiter = {
        let bucket = bucket.clone();
        tokio::spawn(async move { bucket.consume(1.0, true).await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    clock.advance(Duration::from_secs(1));
    assert!(waiter.await.unwrap());

    // nothing refills now, so the bounded wait gives up
    assert!(!bucket.consume(1.0, true).await);
    assert!(!bucket.consume(2.0, true).await, "more than capacity is never granted");
}
