use std::net::SocketAddr;
use std::time::{Duration, Instant};
use storm_core::{FailureClass, RunConfig, RunController, RunState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\ncontent-type: text/plain\r\n\r\nok";

/// Minimal keep-alive HTTP/1.1 responder: answers every bodiless request
/// with `200 ok`.
async fn spawn_responder() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut pending = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    let n = match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    pending.extend_from_slice(&buf[..n]);
                    while let Some(end) = pending.windows(4).position(|w| w == b"\r\n\r\n") {
                        pending.drain(..end + 4);
                        if socket.write_all(RESPONSE).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });

    addr
}

fn unused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fast_target_runs_for_duration_without_failures() {
    let addr = spawn_responder().await;
    let controller = RunController::new();
    let config = RunConfig {
        url: format!("http://{addr}/"),
        workers: 10,
        rate: 0.0,
        duration_secs: Some(2),
        report_interval_ms: 500,
        ..RunConfig::default()
    };

    let started = Instant::now();
    controller.start(config).unwrap();
    let result = controller.wait().await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(controller.state(), RunState::Completed);
    assert!(elapsed >= Duration::from_millis(1_950), "elapsed: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(5), "elapsed: {:?}", elapsed);
    assert!(result.attempts > 0);
    assert_eq!(result.failed(), 0);
    assert_eq!(result.status_codes.get(&200), Some(&result.attempts));
    assert_eq!(result.bytes_received, result.attempts * 2);
    assert!(result.is_consistent());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rate_limit_bounds_attempts_regardless_of_workers() {
    let addr = spawn_responder().await;
    let controller = RunController::new();
    let config = RunConfig {
        url: format!("http://{addr}/"),
        workers: 50,
        rate: 5.0,
        burst: Some(5),
        duration_secs: Some(3),
        ..RunConfig::default()
    };

    controller.start(config).unwrap();
    let result = controller.wait().await.unwrap();

    // 5/s for 3s plus a burst of 5, with one slot of timing slack.
    assert!(result.attempts <= 21, "attempts: {}", result.attempts);
    assert!(result.attempts >= 15, "attempts: {}", result.attempts);
    assert_eq!(result.successes, result.attempts);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unreachable_target_records_connection_failures() {
    let port = unused_port();
    let controller = RunController::new();
    let config = RunConfig {
        url: format!("http://127.0.0.1:{port}/"),
        workers: 4,
        rate: 200.0,
        duration_secs: Some(1),
        timeout_ms: 2_000,
        ..RunConfig::default()
    };

    let started = Instant::now();
    controller.start(config).unwrap();
    let result = controller.wait().await.unwrap();

    // The run ends at its duration boundary, not when the first failure hits.
    assert!(started.elapsed() >= Duration::from_millis(950));
    assert!(result.attempts > 0);
    assert_eq!(result.successes, 0);
    assert_eq!(
        result.failures.get(FailureClass::Connection),
        result.attempts
    );
    assert!(result.status_codes.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_max_requests_stops_at_exact_count() {
    let addr = spawn_responder().await;
    let controller = RunController::new();
    let config = RunConfig {
        url: format!("http://{addr}/"),
        workers: 8,
        max_requests: Some(250),
        ..RunConfig::default()
    };

    controller.start(config).unwrap();
    let result = controller.wait().await.unwrap();

    assert_eq!(controller.state(), RunState::Completed);
    assert_eq!(result.attempts, 250);
    assert_eq!(result.successes, 250);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_independent_runs_do_not_interfere() {
    let addr = spawn_responder().await;
    let config = |max| RunConfig {
        url: format!("http://{addr}/"),
        workers: 4,
        max_requests: Some(max),
        ..RunConfig::default()
    };

    let first = RunController::new();
    let second = RunController::new();
    first.start(config(40)).unwrap();
    second.start(config(70)).unwrap();

    let (a, b) = tokio::join!(first.wait(), second.wait());
    assert_eq!(a.unwrap().attempts, 40);
    assert_eq!(b.unwrap().attempts, 70);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_requests_route_through_configured_proxy() {
    // The target port is closed; only the proxy answers.
    let proxy = spawn_responder().await;
    let controller = RunController::new();
    let mut config = RunConfig {
        url: format!("http://127.0.0.1:{}/", unused_port()),
        workers: 4,
        max_requests: Some(50),
        timeout_ms: 2_000,
        ..RunConfig::default()
    };
    config.proxies.urls = vec![format!("http://{proxy}")];

    controller.start(config).unwrap();
    let result = controller.wait().await.unwrap();

    assert_eq!(result.attempts, 50);
    assert_eq!(result.status_codes.get(&200), Some(&50));
    assert_eq!(result.failed(), 0);
}
