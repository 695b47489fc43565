// Integration tests for the monitoring engine: the full pipeline
// from scheduler tick through rate limiter, circuit breaker, probe
// executor, storage, and observer channel, against a local axum
// fixture server.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use chrono::Utc;

use pulseguard::breaker::BreakerState;
use pulseguard::engine::{Engine, EngineOptions};
use pulseguard::errors::MonitorError;
use pulseguard::notifier::Notifier;
use pulseguard::storage::MemoryStorage;
use pulseguard::types::{
    Backoff, CheckConfig, CheckType, CircuitBreakerConfig, Expected, RateLimitConfig, RetryConfig,
    Status,
};

// ── Fixtures ───────────────────────────────────────────────────

async fn spawn_fixture() -> SocketAddr {
    let app = Router::new()
        .route("/ok", get(|| async { "all good" }))
        .route(
            "/fail",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "maintenance") }),
        )
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                "eventually"
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn check(name: &str, url: String, interval: Duration) -> CheckConfig {
    CheckConfig {
        name: name.to_string(),
        check_type: CheckType::Http,
        url,
        interval,
        timeout: Duration::from_millis(500),
        method: "GET".to_string(),
        headers: HashMap::new(),
        body: None,
        expected: Expected {
            status: Some(200),
            ..Expected::default()
        },
        retry: RetryConfig {
            attempts: 1,
            delay: Duration::from_millis(10),
            backoff: Backoff::None,
            max_delay: Duration::ZERO,
        },
        tags: Vec::new(),
    }
}

fn engine_with(breaker: CircuitBreakerConfig) -> (Arc<Engine>, Arc<MemoryStorage>) {
    let storage = MemoryStorage::new(None);
    let options = EngineOptions {
        rate_limit: RateLimitConfig {
            enabled: false,
            ..RateLimitConfig::default()
        },
        circuit_breaker: breaker,
        ..EngineOptions::default()
    };
    let notifier = Notifier::new(&Default::default()).unwrap();
    let engine = Arc::new(Engine::new(options, storage.clone(), notifier).unwrap());
    (engine, storage)
}

fn breaker_config(max_failures: u32, timeout: Duration, success_threshold: u32) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        enabled: true,
        max_failures,
        timeout,
        success_threshold,
    }
}

fn since_start() -> chrono::DateTime<Utc> {
    Utc::now() - chrono::Duration::minutes(5)
}

// ── Single-probe pipeline ──────────────────────────────────────

#[tokio::test]
async fn healthy_probe_is_stored_and_published() {
    let addr = spawn_fixture().await;
    let (engine, storage) = engine_with(CircuitBreakerConfig::default());
    let mut observer = engine.observer().unwrap();

    let cfg = check("ok", format!("http://{addr}/ok"), Duration::from_secs(1));
    let result = engine.execute_check(&cfg).await.unwrap();
    assert_eq!(result.status, Status::Up);
    assert_eq!(result.status_code, Some(200));
    assert!(result.body_size > 0);

    use pulseguard::storage::Storage;
    let history = storage.get_service_history("ok", since_start(), 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, Status::Up.as_i64());
    assert_eq!(history[0].status_code, Some(200));

    let event = observer.recv().await.unwrap();
    assert_eq!(event.name, "ok");
    assert_eq!(event.status, Status::Up);
}

#[tokio::test]
async fn retry_stores_exactly_one_result_per_round() {
    let addr = spawn_fixture().await;
    let (engine, storage) = engine_with(CircuitBreakerConfig {
        enabled: false,
        ..CircuitBreakerConfig::default()
    });

    let mut cfg = check("flaky", format!("http://{addr}/fail"), Duration::from_secs(1));
    cfg.retry.attempts = 3;

    let result = engine.execute_check(&cfg).await.unwrap();
    assert_eq!(result.status, Status::Down);

    use pulseguard::storage::Storage;
    let history = storage
        .get_service_history("flaky", since_start(), 10)
        .unwrap();
    assert_eq!(history.len(), 1, "one stored result regardless of attempts");

    // All three attempts actually ran.
    assert_eq!(engine.metrics().probes_total, 3);
}

#[tokio::test]
async fn breaker_opens_and_synthesizes_down_results() {
    let addr = spawn_fixture().await;
    let (engine, storage) =
        engine_with(breaker_config(3, Duration::from_secs(60), 1));

    let url = format!("http://{addr}/fail");
    let cfg = check("broken", url.clone(), Duration::from_secs(1));

    for _ in 0..3 {
        let result = engine.execute_check(&cfg).await.unwrap();
        assert_eq!(result.status, Status::Down);
        assert_eq!(result.status_code, Some(503));
    }
    assert_eq!(engine.breaker_metrics(&url).state, BreakerState::Open);

    // Fourth occurrence: rejected by the breaker, no executor call.
    let probes_before = engine.metrics().probes_total;
    let synthetic = engine.execute_check(&cfg).await.unwrap();
    assert_eq!(engine.metrics().probes_total, probes_before);

    assert_eq!(synthetic.status, Status::Down);
    assert_eq!(synthetic.response_time, Duration::ZERO);
    assert!(synthetic.error.unwrap().contains("circuit breaker is OPEN"));

    // The synthetic result is persisted like any other.
    use pulseguard::storage::Storage;
    let history = storage
        .get_service_history("broken", since_start(), 10)
        .unwrap();
    assert_eq!(history.len(), 4);
    assert_eq!(history[0].response_time_ms, 0);
}

#[tokio::test]
async fn breaker_recovers_through_half_open() {
    let addr = spawn_fixture().await;
    let (engine, _storage) =
        engine_with(breaker_config(1, Duration::from_millis(150), 1));

    let fail = check("svc", format!("http://{addr}/fail"), Duration::from_secs(1));
    engine.execute_check(&fail).await.unwrap();
    assert_eq!(
        engine.breaker_metrics(&fail.url).state,
        BreakerState::Open
    );

    tokio::time::sleep(Duration::from_millis(200)).await;

    // Same endpoint key; relaxing the expectation makes the trial
    // probe healthy, which closes the breaker (success_threshold=1).
    let mut trial = fail.clone();
    trial.expected.status = Some(503);

    let result = engine.execute_check(&trial).await.unwrap();
    assert_eq!(result.status, Status::Up);
    assert_eq!(engine.breaker_metrics(&fail.url).state, BreakerState::Closed);
}

// ── Scheduler ──────────────────────────────────────────────────

#[tokio::test]
async fn monitoring_emits_results_at_interval() {
    let addr = spawn_fixture().await;
    let (engine, storage) = engine_with(CircuitBreakerConfig::default());
    let mut observer = engine.observer().unwrap();

    let cfg = check("steady", format!("http://{addr}/ok"), Duration::from_millis(100));
    engine.clone().start_monitoring(vec![cfg]).unwrap();

    tokio::time::sleep(Duration::from_millis(350)).await;
    engine.stop().await;

    use pulseguard::storage::Storage;
    let history = storage
        .get_service_history("steady", since_start(), 100)
        .unwrap();
    assert!(
        history.len() >= 2,
        "expected at least 2 probes, got {}",
        history.len()
    );
    assert!(history.iter().all(|r| r.status == Status::Up.as_i64()));

    // Observer saw the same stream; it ends when the engine stops.
    let mut events = 0;
    while observer.recv().await.is_some() {
        events += 1;
    }
    assert!(events >= 2);
}

#[tokio::test]
async fn slow_probes_skip_ticks_instead_of_overlapping() {
    let addr = spawn_fixture().await;
    let (engine, _storage) = engine_with(CircuitBreakerConfig::default());

    // Probe takes ~200ms, tick every 50ms: most ticks must be
    // skipped while the previous probe is in flight.
    let mut cfg = check("sluggish", format!("http://{addr}/slow"), Duration::from_millis(50));
    cfg.expected.status = Some(200);

    engine.clone().start_monitoring(vec![cfg]).unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    engine.stop().await;

    let metrics = engine.metrics();
    assert!(
        metrics.overlap_skips >= 1,
        "expected skipped ticks, metrics: {metrics:?}"
    );
}

#[tokio::test]
async fn duplicate_check_names_are_rejected() {
    let addr = spawn_fixture().await;
    let (engine, _storage) = engine_with(CircuitBreakerConfig::default());

    let cfg = check("dup", format!("http://{addr}/ok"), Duration::from_secs(1));
    engine.clone().start_monitoring(vec![cfg.clone()]).unwrap();

    let err = engine.clone().start_monitoring(vec![cfg]).unwrap_err();
    assert!(err.to_string().contains("duplicate check name"));
    engine.stop().await;
}

#[tokio::test]
async fn execute_checks_runs_all_concurrently() {
    let addr = spawn_fixture().await;
    let (engine, _storage) = engine_with(CircuitBreakerConfig::default());

    let checks = vec![
        check("a", format!("http://{addr}/ok"), Duration::from_secs(1)),
        check("b", format!("http://{addr}/ok"), Duration::from_secs(1)),
        check("c", format!("http://{addr}/fail"), Duration::from_secs(1)),
    ];

    let results = engine.clone().execute_checks(&checks).await.unwrap();
    assert_eq!(results.len(), 3);

    let by_name: HashMap<_, _> = results.iter().map(|r| (r.name.as_str(), r.status)).collect();
    assert_eq!(by_name["a"], Status::Up);
    assert_eq!(by_name["b"], Status::Up);
    assert_eq!(by_name["c"], Status::Down);
}

#[tokio::test]
async fn execute_checks_rejects_empty_input() {
    let (engine, _storage) = engine_with(CircuitBreakerConfig::default());
    assert!(matches!(
        engine.clone().execute_checks(&[]).await,
        Err(MonitorError::Validation { .. })
    ));
}

// ── Shutdown ───────────────────────────────────────────────────

#[tokio::test]
async fn stop_halts_probing_and_closes_observer() {
    let addr = spawn_fixture().await;
    let (engine, storage) = engine_with(CircuitBreakerConfig::default());
    let mut observer = engine.observer().unwrap();

    let cfg = check("stopper", format!("http://{addr}/ok"), Duration::from_millis(50));
    engine.clone().start_monitoring(vec![cfg]).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    engine.stop().await;

    use pulseguard::storage::Storage;
    let count_after_stop = storage
        .get_service_history("stopper", since_start(), 1000)
        .unwrap()
        .len();
    assert!(count_after_stop >= 1);

    // No further results after stop returns.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let count_later = storage
        .get_service_history("stopper", since_start(), 1000)
        .unwrap()
        .len();
    assert_eq!(count_after_stop, count_later);

    // Observer stream is closed once all tasks have exited.
    while let Some(_event) = observer.recv().await {}
}

#[tokio::test]
async fn execute_check_after_shutdown_is_cancelled() {
    let addr = spawn_fixture().await;
    let (engine, _storage) = engine_with(CircuitBreakerConfig::default());

    engine.shutdown_handle().trigger();
    let cfg = check("late", format!("http://{addr}/ok"), Duration::from_secs(1));
    assert!(matches!(
        engine.execute_check(&cfg).await,
        Err(MonitorError::Cancelled { .. })
    ));
}
