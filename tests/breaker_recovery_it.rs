mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use common::{StubFetcher, StubResponse};
use mandi::{
    MandiError, MandiResult, Source,
    breaker::{BreakerConfig, BreakerState, CircuitBreaker},
    error::NetworkError,
    retry::RetryPolicy,
};

fn network_error() -> MandiError {
    NetworkError::Transport {
        url: "https://nsearchives.nseindia.com".to_string(),
        msg: "connection reset".to_string(),
    }
    .into()
}

/// Five consecutive network failures trip the breaker; the sixth call
/// raises CircuitOpen without invoking the fetch; after the recovery
/// timeout the probe call flows and a success closes the breaker.
#[tokio::test]
async fn breaker_opens_fails_fast_and_recovers() {
    let breaker = CircuitBreaker::new(
        Source::NseEqBar.as_str(),
        BreakerConfig {
            failure_threshold: 5,
            recovery_timeout: Duration::from_millis(50),
        },
    );
    let policy = RetryPolicy::default()
        .with_max_attempts(1)
        .with_initial_backoff(Duration::from_millis(1));
    let invocations = AtomicU32::new(0);

    for _ in 0..5 {
        let result: MandiResult<()> = policy
            .run("fetch", Some(&breaker), || async {
                invocations.fetch_add(1, Ordering::SeqCst);
                Err(network_error())
            })
            .await;
        assert!(result.is_err());
    }
    assert_eq!(breaker.state(), BreakerState::Open);
    assert_eq!(invocations.load(Ordering::SeqCst), 5);

    // Sixth call: fails fast, fetch not invoked.
    let result: MandiResult<()> = policy
        .run("fetch", Some(&breaker), || async {
            invocations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
    assert!(matches!(result, Err(MandiError::CircuitOpen(_))));
    assert_eq!(invocations.load(Ordering::SeqCst), 5);

    // After the recovery timeout the probe call is admitted.
    tokio::time::sleep(Duration::from_millis(80)).await;
    let result: MandiResult<u32> = policy
        .run("fetch", Some(&breaker), || async {
            invocations.fetch_add(1, Ordering::SeqCst);
            Ok(7)
        })
        .await;
    assert_eq!(result.expect("probe succeeds"), 7);
    assert_eq!(invocations.load(Ordering::SeqCst), 6);
    assert_eq!(breaker.state(), BreakerState::Closed);
    assert_eq!(breaker.failure_count(), 0);
}

/// A breaker keyed to one source never observes another source's
/// failures, even when both are driven through the same stub session.
#[tokio::test]
async fn breakers_are_isolated_per_source() {
    let fetcher = Arc::new(StubFetcher::new());
    for _ in 0..3 {
        fetcher.push(Source::NseEqBar, StubResponse::NetworkError);
    }

    let nse = CircuitBreaker::new(
        Source::NseEqBar.as_str(),
        BreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
        },
    );
    let bse = CircuitBreaker::new(
        Source::BseEqBar.as_str(),
        BreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
        },
    );

    let policy = RetryPolicy::default()
        .with_max_attempts(3)
        .with_initial_backoff(Duration::from_millis(1));

    let result: MandiResult<()> = policy
        .run("fetch", Some(&nse), || {
            let fetcher = fetcher.clone();
            async move {
                use mandi::{FetchParams, Fetcher};
                let params = FetchParams::for_date(
                    chrono::NaiveDate::from_ymd_opt(2024, 1, 15).expect("date"),
                );
                match fetcher.fetch(Source::NseEqBar, &params).await? {
                    mandi::FetchOutcome::Payload(_) => Ok(()),
                    mandi::FetchOutcome::NotFound => Ok(()),
                }
            }
        })
        .await;
    assert!(result.is_err());

    assert_eq!(nse.state(), BreakerState::Open);
    assert_eq!(bse.state(), BreakerState::Closed);
    assert_eq!(fetcher.calls(Source::NseEqBar), 3);
    assert_eq!(fetcher.calls(Source::BseEqBar), 0);
}
