use super::*;
use crate::breaker::{BreakerConfig, BreakerState};
use crate::clock::ManualClock;
use crate::shutdown::Shutdown;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::from_config(
        "test",
        &RetryPolicyConfig {
            max_attempts,
            base_delay_ms: 5,
            backoff_multiplier: 2.0,
            max_delay_ms: 20,
            attempt_timeout_ms: 200,
            jitter: 0.0,
        },
    )
}

#[tokio::test]
async fn test_retries_until_exhausted() {
    let executor = RetryExecutor::new(ShutdownSignal::never());
    let calls = AtomicU32::new(0);

    let result: Result<(), _> = executor
        .run(&fast_policy(3), |_| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SyncError::from_status(503, "unavailable"))
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    match result {
        Err(SyncError::RetryExhausted { attempts, last }) => {
            assert_eq!(attempts, 3);
            assert!(matches!(*last, SyncError::ServerError { status: 503, .. }));
        }
        other => panic!("expected RetryExhausted, got {:?}", other),
    }
}

#[tokio::test]
async fn test_succeeds_after_transient_failures() {
    let executor = RetryExecutor::new(ShutdownSignal::never());
    let calls = AtomicU32::new(0);

    let result = executor
        .run(&fast_policy(3), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(SyncError::NetworkUnavailable("no signal".into()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

    assert_eq!(result, Ok(3));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_client_rejection_is_not_retried() {
    let executor = RetryExecutor::new(ShutdownSignal::never());
    let calls = AtomicU32::new(0);

    let result: Result<(), _> = executor
        .run(&fast_policy(5), |_| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SyncError::from_status(404, "case not found"))
        })
        .await;

    assert!(matches!(result, Err(SyncError::ClientRejected { status: 404, .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_attempt_timeout_is_retryable() {
    let executor = RetryExecutor::new(ShutdownSignal::never());
    let mut policy = fast_policy(2);
    policy.attempt_timeout = Duration::from_millis(10);
    let calls = AtomicU32::new(0);

    let result: Result<(), _> = executor
        .run(&policy, |_| async {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    match result {
        Err(SyncError::RetryExhausted { last, .. }) => {
            assert_eq!(*last, SyncError::Timeout(Duration::from_millis(10)));
        }
        other => panic!("expected RetryExhausted, got {:?}", other),
    }
}

#[tokio::test]
async fn test_custom_predicate() {
    let executor = RetryExecutor::new(ShutdownSignal::never());
    let policy = fast_policy(3).with_predicate(|e| matches!(e, SyncError::Timeout(_)));
    let calls = AtomicU32::new(0);

    let result: Result<(), _> = executor
        .run(&policy, |_| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SyncError::from_status(502, "bad gateway"))
        })
        .await;

    assert!(matches!(result, Err(SyncError::ServerError { status: 502, .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_open_breaker_short_circuits_retries() {
    let clock = Arc::new(ManualClock::default());
    let breaker = CircuitBreaker::new(
        "actions",
        BreakerConfig {
            failure_threshold: 2,
            success_threshold: 1,
            open_timeout_secs: 30,
            reset_timeout_secs: 60,
        },
        clock,
    );
    let executor = RetryExecutor::new(ShutdownSignal::never());
    let calls = AtomicU32::new(0);

    let result: Result<(), _> = executor
        .run_guarded(&fast_policy(5), &breaker, |_| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SyncError::NetworkUnavailable("offline".into()))
        })
        .await;

    // Two real attempts trip the breaker; the third is refused and ends the loop
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(matches!(result, Err(SyncError::BreakerOpen { ref group }) if group == "actions"));
    assert_eq!(breaker.state(), BreakerState::Open);
}

#[tokio::test]
async fn test_guarded_timeout_counts_against_breaker() {
    let clock = Arc::new(ManualClock::default());
    let breaker = CircuitBreaker::new(
        "evidence",
        BreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            open_timeout_secs: 30,
            reset_timeout_secs: 60,
        },
        clock,
    );
    let executor = RetryExecutor::new(ShutdownSignal::never());
    let mut policy = fast_policy(1);
    policy.attempt_timeout = Duration::from_millis(10);

    let result: Result<(), _> = executor
        .run_guarded(&policy, &breaker, |_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

    assert!(matches!(result, Err(SyncError::RetryExhausted { attempts: 1, .. })));
    assert!(breaker.is_open());
}

#[tokio::test]
async fn test_shutdown_cancels_backoff() {
    let shutdown = Shutdown::new();
    let executor = RetryExecutor::new(shutdown.signal());
    let mut policy = fast_policy(5);
    policy.base_delay = Duration::from_secs(60);
    policy.max_delay = Duration::from_secs(60);
    let calls = Arc::new(AtomicU32::new(0));

    let task_calls = Arc::clone(&calls);
    let task = tokio::spawn(async move {
        executor
            .run(&policy, |_| {
                task_calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(SyncError::NetworkUnavailable("offline".into())) }
            })
            .await
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    shutdown.trigger();

    let result = tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("executor should stop promptly")
        .unwrap();
    assert_eq!(result, Err(SyncError::Cancelled));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_delay_grows_and_caps() {
    let policy = RetryPolicy::from_config(
        "caps",
        &RetryPolicyConfig {
            max_attempts: 6,
            base_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_delay_ms: 5_000,
            attempt_timeout_ms: 1_000,
            jitter: 0.0,
        },
    );

    assert_eq!(policy.delay_for(1), Duration::from_millis(1_000));
    assert_eq!(policy.delay_for(2), Duration::from_millis(2_000));
    assert_eq!(policy.delay_for(3), Duration::from_millis(4_000));
    assert_eq!(policy.delay_for(4), Duration::from_millis(5_000));
    assert_eq!(policy.delay_for(40), Duration::from_millis(5_000));
}

#[test]
fn test_jitter_stays_within_bound() {
    let mut policy = fast_policy(3);
    policy.base_delay = Duration::from_millis(100);
    policy.max_delay = Duration::from_millis(1_000);
    policy.jitter = 0.5;

    for _ in 0..50 {
        let delay = policy.delay_for(1);
        assert!(delay >= Duration::from_millis(100));
        assert!(delay < Duration::from_millis(150));
    }
}

#[test]
fn test_policy_set_builtins_and_overrides() {
    let defaults = PolicySet::default();
    assert_eq!(defaults.names(), vec![CRITICAL, DEFAULT, FILE_UPLOAD]);
    assert_eq!(defaults.get_or_default(CRITICAL).max_attempts, 3);
    assert_eq!(defaults.get_or_default(FILE_UPLOAD).max_attempts, 2);
    assert_eq!(
        defaults.get_or_default(FILE_UPLOAD).attempt_timeout,
        Duration::from_secs(120)
    );
    assert_eq!(defaults.get_or_default("unknown").name, DEFAULT);

    let mut section = RetrySection::default();
    section.policies.insert(
        DEFAULT.to_string(),
        RetryPolicyConfig {
            max_attempts: 7,
            ..Default::default()
        },
    );
    section.policies.insert(
        "alerts_poll".to_string(),
        RetryPolicyConfig {
            max_attempts: 4,
            ..Default::default()
        },
    );

    let set = PolicySet::from_section(&section);
    assert_eq!(set.get_or_default("alerts_poll").max_attempts, 4);
    assert_eq!(set.get_or_default("missing").max_attempts, 7);
    assert_eq!(set.get(CRITICAL).map(|p| p.max_attempts), Some(3));
    assert!(set.get("missing").is_none());
}
