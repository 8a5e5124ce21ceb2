//! End-to-end lifecycle scenarios against real listeners on 127.0.0.1

use pod_lifecycle::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::HealthCheckRequest;

fn free_port() -> u32 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    u32::from(listener.local_addr().unwrap().port())
}

fn http_manager() -> PodManagerBuilder {
    PodManager::builder()
        .with_bind_address([127, 0, 0, 1].into())
        .with_http_port(free_port())
        .with_shutdown_timeout(Duration::from_secs(2))
}

fn grpc_manager() -> PodManagerBuilder {
    PodManager::builder()
        .with_mechanism(CheckMechanism::Grpc)
        .with_bind_address([127, 0, 0, 1].into())
        .with_grpc_port(free_port())
        .with_shutdown_timeout(Duration::from_secs(2))
}

async fn get(manager: &PodManager, path: &str) -> (u16, String) {
    let addr = manager.local_addr().unwrap();
    let response = reqwest::get(format!("http://{addr}{path}")).await.unwrap();
    let status = response.status().as_u16();
    (status, response.text().await.unwrap())
}

async fn grpc_status(manager: &PodManager, service: &str) -> ServingStatus {
    let addr = manager.local_addr().unwrap();
    let mut client = HealthClient::new(
        tonic::transport::Endpoint::new(format!("http://{addr}"))
            .unwrap()
            .connect()
            .await
            .unwrap(),
    );
    client
        .check(HealthCheckRequest {
            service: service.to_string(),
        })
        .await
        .unwrap()
        .into_inner()
        .status()
}

#[tokio::test]
async fn test_invalid_port_never_opens_listener() {
    for port in [0, 70000] {
        let err = PodManager::builder()
            .with_http_port(port)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidPort { name: "http_port", .. }));
        assert!(err.to_string().contains(&port.to_string()));
    }
}

#[tokio::test]
async fn test_ready_flips_after_set_ready_without_body() {
    let manager = http_manager().build().unwrap();
    manager.start().await.unwrap();

    assert_eq!(get(&manager, "/startup").await.0, 200);
    assert_eq!(get(&manager, "/live").await.0, 200);
    assert_eq!(get(&manager, "/ready").await, (503, String::new()));

    manager.set_ready().await;
    assert_eq!(get(&manager, "/ready").await, (200, String::new()));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_failing_checker_body() {
    let manager = http_manager()
        .with_checker("db", checker_fn(|| async { Ok(()) }))
        .with_checker("cache", checker_fn(|| async { Err(CheckError::new("boom")) }))
        .build()
        .unwrap();
    manager.start().await.unwrap();
    manager.set_ready().await;

    let (status, body) = get(&manager, "/ready").await;
    assert_eq!(status, 503);
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(&body).unwrap(),
        serde_json::json!({"db": "ok", "cache": "error: boom"})
    );
    // Liveness never consults checkers
    assert_eq!(get(&manager, "/live").await.0, 200);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_slow_checker_bounded_by_timeout() {
    let manager = http_manager()
        .with_checker_timeout(Duration::from_millis(100))
        .with_checker(
            "slow",
            checker_fn(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            }),
        )
        .build()
        .unwrap();
    manager.start().await.unwrap();
    manager.set_ready().await;

    let started = std::time::Instant::now();
    let (status, body) = get(&manager, "/ready").await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(status, 503);
    assert_eq!(body, r#"{"slow":"error: deadline exceeded"}"#);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_fails_live_and_ready_but_not_startup() {
    let manager = Arc::new(
        http_manager()
            .with_checker("db", checker_fn(|| async { Ok(()) }))
            .build()
            .unwrap(),
    );
    manager.start().await.unwrap();
    manager.set_ready().await;
    assert_eq!(get(&manager, "/ready").await.0, 200);

    // Flip the flags the way shutdown does, and probe before the listener closes
    manager.state().begin_shutdown();
    assert_eq!(get(&manager, "/ready").await, (503, String::new()));
    assert_eq!(get(&manager, "/live").await.0, 503);
    assert_eq!(get(&manager, "/startup").await.0, 200);

    assert_eq!(manager.shutdown().await, DrainOutcome::Graceful);
    assert_eq!(manager.phase(), Phase::Terminated);
}

#[tokio::test]
async fn test_non_get_rejected() {
    let manager = http_manager().build().unwrap();
    manager.start().await.unwrap();
    let addr = manager.local_addr().unwrap();

    let client = reqwest::Client::new();
    for path in ["/startup", "/live", "/ready"] {
        let post = client.post(format!("http://{addr}{path}")).send().await.unwrap();
        assert_eq!(post.status().as_u16(), 405);
        let head = client.head(format!("http://{addr}{path}")).send().await.unwrap();
        assert_eq!(head.status().as_u16(), 405);
    }
    drop(client);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_port_in_use_fails_start() {
    let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = u32::from(held.local_addr().unwrap().port());

    let manager = PodManager::builder()
        .with_bind_address([127, 0, 0, 1].into())
        .with_http_port(port)
        .build()
        .unwrap();
    let err = manager.start().await.unwrap_err();
    assert!(matches!(err, Error::Bind { .. }));
    assert!(!manager.started());
}

#[tokio::test]
async fn test_zero_drain_timeout_returns_promptly() {
    let manager = http_manager()
        .with_shutdown_timeout(Duration::ZERO)
        .build()
        .unwrap();
    manager.start().await.unwrap();

    let started = std::time::Instant::now();
    manager.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(manager.phase(), Phase::Terminated);
}

#[tokio::test]
async fn test_forced_drain_cuts_in_flight_http_request() {
    let manager = http_manager()
        .with_shutdown_timeout(Duration::from_millis(200))
        .with_checker_timeout(Duration::from_secs(5))
        .with_checker(
            "slow",
            checker_fn(|| async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                Ok(())
            }),
        )
        .build()
        .unwrap();
    manager.start().await.unwrap();
    manager.set_ready().await;

    let addr = manager.local_addr().unwrap();
    let request = tokio::spawn(reqwest::get(format!("http://{addr}/ready")));
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(manager.shutdown().await, DrainOutcome::Forced);
    assert_eq!(manager.phase(), Phase::Terminated);

    let result = tokio::time::timeout(Duration::from_secs(1), request)
        .await
        .expect("request still being served after forced drain")
        .unwrap();
    assert!(result.is_err());
}

#[tokio::test]
async fn test_forced_drain_ends_open_grpc_watch() {
    let manager = grpc_manager()
        .with_shutdown_timeout(Duration::from_millis(200))
        .build()
        .unwrap();
    manager.start().await.unwrap();

    let addr = manager.local_addr().unwrap();
    let mut client = HealthClient::new(
        tonic::transport::Endpoint::new(format!("http://{addr}"))
            .unwrap()
            .connect()
            .await
            .unwrap(),
    );
    let mut stream = client
        .watch(HealthCheckRequest {
            service: "live".to_string(),
        })
        .await
        .unwrap()
        .into_inner();
    let first = stream.message().await.unwrap().unwrap();
    assert_eq!(first.status(), ServingStatus::Serving);

    assert_eq!(manager.shutdown().await, DrainOutcome::Forced);

    // Status updates published during the drain may still arrive, then the stream ends
    let ended = tokio::time::timeout(Duration::from_secs(1), async {
        while let Ok(Some(_)) = stream.message().await {}
    })
    .await;
    assert!(ended.is_ok(), "watch stream still open after forced drain");
}

#[tokio::test]
async fn test_grpc_statuses_follow_lifecycle() {
    let manager = grpc_manager().build().unwrap();
    manager.start().await.unwrap();

    assert_eq!(grpc_status(&manager, "startup").await, ServingStatus::Serving);
    assert_eq!(grpc_status(&manager, "live").await, ServingStatus::Serving);
    assert_eq!(grpc_status(&manager, "ready").await, ServingStatus::NotServing);

    manager.set_ready().await;
    assert_eq!(grpc_status(&manager, "ready").await, ServingStatus::Serving);

    manager.set_not_ready().await;
    assert_eq!(grpc_status(&manager, "ready").await, ServingStatus::NotServing);
    assert_eq!(grpc_status(&manager, "live").await, ServingStatus::Serving);

    assert_ne!(manager.shutdown().await, DrainOutcome::NothingToStop);
    assert_eq!(manager.phase(), Phase::Terminated);
}

#[tokio::test]
async fn test_grpc_checker_failure_keeps_ready_not_serving() {
    let healthy = Arc::new(AtomicBool::new(false));
    let flag = healthy.clone();
    let manager = grpc_manager()
        .with_refresh_interval(Duration::from_millis(50))
        .with_checker(
            "db",
            checker_fn(move || {
                let up = flag.load(Ordering::SeqCst);
                async move {
                    if up {
                        Ok(())
                    } else {
                        Err(CheckError::new("down"))
                    }
                }
            }),
        )
        .build()
        .unwrap();
    manager.start().await.unwrap();
    manager.set_ready().await;
    assert_eq!(grpc_status(&manager, "ready").await, ServingStatus::NotServing);

    healthy.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(grpc_status(&manager, "ready").await, ServingStatus::Serving);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_attached_http_merges_into_caller_router() {
    let manager = PodManager::builder()
        .with_binding(Binding::Attached)
        .build()
        .unwrap();
    let app = manager.attach_http(
        axum::Router::new().route("/orders", axum::routing::get(|| async { "[]" })),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move { axum::serve(listener, app).await });

    manager.start().await.unwrap();
    assert!(manager.started());
    assert!(manager.local_addr().is_none());
    manager.set_ready().await;

    let ready = reqwest::get(format!("http://{addr}/ready")).await.unwrap();
    assert_eq!(ready.status().as_u16(), 200);

    assert_eq!(manager.shutdown().await, DrainOutcome::NothingToStop);

    // The caller's server keeps running and now reports not ready
    let ready = reqwest::get(format!("http://{addr}/ready")).await.unwrap();
    assert_eq!(ready.status().as_u16(), 503);
    let orders = reqwest::get(format!("http://{addr}/orders")).await.unwrap();
    assert_eq!(orders.text().await.unwrap(), "[]");

    server.abort();
}

#[tokio::test]
async fn test_attached_grpc_publishes_on_caller_server() {
    let manager = PodManager::builder()
        .with_mechanism(CheckMechanism::Grpc)
        .with_binding(Binding::Attached)
        .build()
        .unwrap();

    let router = manager.attach_grpc(
        tonic::transport::Server::builder().add_routes(tonic::service::Routes::default()),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(router.serve_with_incoming(
        tokio_stream::wrappers::TcpListenerStream::new(listener),
    ));

    manager.start().await.unwrap();
    manager.set_ready().await;

    let mut client = HealthClient::new(
        tonic::transport::Endpoint::new(format!("http://{addr}"))
            .unwrap()
            .connect()
            .await
            .unwrap(),
    );
    let check = |service: &'static str| HealthCheckRequest {
        service: service.to_string(),
    };
    let ready = client.check(check("ready")).await.unwrap().into_inner();
    assert_eq!(ready.status(), ServingStatus::Serving);

    assert_eq!(manager.shutdown().await, DrainOutcome::NothingToStop);

    let ready = client.check(check("ready")).await.unwrap().into_inner();
    assert_eq!(ready.status(), ServingStatus::NotServing);
    let live = client.check(check("live")).await.unwrap().into_inner();
    assert_eq!(live.status(), ServingStatus::NotServing);
    let startup = client.check(check("startup")).await.unwrap().into_inner();
    assert_eq!(startup.status(), ServingStatus::Serving);

    server.abort();
}
