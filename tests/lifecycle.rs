//! End-to-end lifecycle tests over real TCP sockets.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use vigil::pidfile::PidFileError;
use vigil::{LifecycleManager, ServeError, Server, ServerConfig, ServerState, StopError};

// =============================================================================
// Helpers
// =============================================================================

async fn http_get(addr: SocketAddr, path: &str) -> std::io::Result<String> {
    let mut stream = TcpStream::connect(addr).await?;
    let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", path);
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

fn pid_path(dir: &TempDir, name: &str) -> PathBuf {
    dir.path().join(format!("{}.pid", name))
}

fn local_server(dir: &TempDir, name: &str) -> Server {
    Server::new(ServerConfig::new("127.0.0.1:0", pid_path(dir, name)))
}

fn hello() -> Router {
    Router::new().route("/", get(|| async { "hello" }))
}

/// Spawn `serve` and wait until the server is accepting.
async fn spawn_serving(
    server: &Server,
    router: Router,
) -> (SocketAddr, JoinHandle<Result<(), ServeError>>) {
    let task = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(router).await })
    };
    let addr = tokio::time::timeout(Duration::from_secs(5), server.ready())
        .await
        .expect("server never became ready")
        .expect("server failed to start");
    (addr, task)
}

/// Handler that reports entry and then blocks until the gate opens.
fn gated_router(entered: mpsc::UnboundedSender<()>, gate: watch::Receiver<bool>) -> Router {
    Router::new().route(
        "/",
        get(move || {
            let entered = entered.clone();
            let mut gate = gate.clone();
            async move {
                let _ = entered.send(());
                let _ = gate.wait_for(|open| *open).await;
                "drained"
            }
        }),
    )
}

// =============================================================================
// Stop before serve
// =============================================================================

#[tokio::test]
async fn test_stop_before_serve_returns_error_without_blocking() {
    let dir = TempDir::new().unwrap();
    let server = local_server(&dir, "idle");

    let result = tokio::time::timeout(Duration::from_millis(500), server.stop())
        .await
        .expect("stop blocked on an idle server");
    assert!(matches!(result, Err(StopError::NotServing)));
    assert!(!pid_path(&dir, "idle").exists());
}

// =============================================================================
// Serve and stop
// =============================================================================

#[tokio::test]
async fn test_serve_answers_and_stop_removes_pid_file() {
    let dir = TempDir::new().unwrap();
    let server = local_server(&dir, "basic");

    let (addr, task) = spawn_serving(&server, hello()).await;
    let contents = std::fs::read_to_string(pid_path(&dir, "basic")).unwrap();
    assert_eq!(contents, std::process::id().to_string());

    let response = http_get(addr, "/").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
    assert!(response.ends_with("hello"));

    server.stop().await.unwrap();
    task.await.unwrap().unwrap();

    assert_eq!(server.state(), ServerState::Stopped);
    assert!(!pid_path(&dir, "basic").exists());
    assert!(server.local_addr().is_none());
}

#[tokio::test]
async fn test_concurrent_stops_share_one_outcome() {
    let dir = TempDir::new().unwrap();
    let server = local_server(&dir, "twice");
    let runs = Arc::new(AtomicUsize::new(0));
    {
        let runs = runs.clone();
        server.on_stop(move || {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }

    let (_addr, task) = spawn_serving(&server, hello()).await;

    let (a, b) = tokio::join!(server.stop(), server.stop());
    a.unwrap();
    b.unwrap();
    server.stop().await.unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    task.await.unwrap().unwrap();
}

// =============================================================================
// Drain
// =============================================================================

async fn assert_drains(n: usize) {
    let dir = TempDir::new().unwrap();
    let server = local_server(&dir, &format!("drain-{}", n));

    let (entered_tx, mut entered_rx) = mpsc::unbounded_channel();
    let (gate_tx, gate_rx) = watch::channel(false);
    let (addr, task) = spawn_serving(&server, gated_router(entered_tx, gate_rx)).await;

    let clients: Vec<_> = (0..n)
        .map(|_| tokio::spawn(async move { http_get(addr, "/").await }))
        .collect();
    for _ in 0..n {
        entered_rx.recv().await.unwrap();
    }
    assert_eq!(server.in_flight(), n);

    let stopper = {
        let server = server.clone();
        tokio::spawn(async move { server.stop().await })
    };

    // New connections are refused once the listener closes
    let refused = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if TcpStream::connect(addr).await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(refused.is_ok(), "listener still accepting after stop");

    if n > 0 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!stopper.is_finished(), "stop returned with {} requests in flight", n);
        assert_eq!(server.state(), ServerState::Stopping);
    }

    gate_tx.send_replace(true);
    for client in clients {
        let response = client.await.unwrap().unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
        assert!(response.ends_with("drained"));
    }

    tokio::time::timeout(Duration::from_secs(5), stopper)
        .await
        .expect("stop did not finish after drain")
        .unwrap()
        .unwrap();
    assert_eq!(server.in_flight(), 0);
    assert_eq!(server.state(), ServerState::Stopped);
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_drain_with_no_connections() {
    assert_drains(0).await;
}

#[tokio::test]
async fn test_drain_with_one_connection() {
    assert_drains(1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_drain_with_fifty_connections() {
    assert_drains(50).await;
}

#[tokio::test]
async fn test_idle_keep_alive_connection_does_not_block_stop() {
    let dir = TempDir::new().unwrap();
    let server = local_server(&dir, "keepalive");
    let (addr, task) = spawn_serving(&server, hello()).await;

    // One request, then leave the connection open and idle
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let mut buf = [0u8; 512];
    let read = stream.read(&mut buf).await.unwrap();
    assert!(String::from_utf8_lossy(&buf[..read]).starts_with("HTTP/1.1 200 OK"));

    tokio::time::timeout(Duration::from_secs(2), server.stop())
        .await
        .expect("idle connection blocked stop")
        .unwrap();
    task.await.unwrap().unwrap();
}

// =============================================================================
// Shutdown callbacks
// =============================================================================

#[tokio::test]
async fn test_callbacks_all_run_and_report_first_error() {
    let dir = TempDir::new().unwrap();
    let server = local_server(&dir, "callbacks");
    let order = Arc::new(Mutex::new(Vec::new()));

    for name in ["A", "B", "C"] {
        let order = order.clone();
        server.on_stop(move || {
            order.lock().unwrap().push(name);
            if name == "B" {
                Err("B failed".into())
            } else {
                Ok(())
            }
        });
    }

    let (_addr, task) = spawn_serving(&server, hello()).await;

    match server.stop().await {
        Err(StopError::Callback { index: 1, error }) => assert_eq!(error.to_string(), "B failed"),
        other => panic!("expected B's error, got {other:?}"),
    }
    assert_eq!(*order.lock().unwrap(), vec!["A", "B", "C"]);

    // The PID file is released even though a callback failed
    assert!(!pid_path(&dir, "callbacks").exists());
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_pid_file_still_present_while_callbacks_run() {
    let dir = TempDir::new().unwrap();
    let server = local_server(&dir, "ordering");
    let seen = Arc::new(Mutex::new(None));
    {
        let seen = seen.clone();
        let path = pid_path(&dir, "ordering");
        server.on_stop(move || {
            *seen.lock().unwrap() = Some(path.exists());
            Ok(())
        });
    }

    let (_addr, task) = spawn_serving(&server, hello()).await;
    server.stop().await.unwrap();
    task.await.unwrap().unwrap();

    assert_eq!(*seen.lock().unwrap(), Some(true));
}

// =============================================================================
// PID file contention
// =============================================================================

#[tokio::test]
async fn test_second_process_identity_cannot_serve() {
    let dir = TempDir::new().unwrap();
    let first = local_server(&dir, "shared");
    let (_addr, task) = spawn_serving(&first, hello()).await;

    let other = Server::builder(ServerConfig::new("127.0.0.1:0", pid_path(&dir, "shared")))
        .pid(std::process::id() + 1)
        .build();
    let err = other.serve(hello()).await.unwrap_err();
    assert!(matches!(err, ServeError::PidFile(PidFileError::AlreadyRunning { .. })));

    // The losing server must not delete the winner's PID file
    assert!(pid_path(&dir, "shared").exists());

    first.stop().await.unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_bind_failure_is_fatal_and_cleans_up() {
    let dir = TempDir::new().unwrap();
    let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = taken.local_addr().unwrap();

    let server = Server::new(ServerConfig::new(addr.to_string(), pid_path(&dir, "bind")));
    let err = server.serve(hello()).await.unwrap_err();

    assert!(matches!(err, ServeError::Bind { .. }));
    assert!(!pid_path(&dir, "bind").exists());
}

// =============================================================================
// Lifecycle manager
// =============================================================================

#[tokio::test]
async fn test_manager_interrupt_stops_every_server() {
    let dir = TempDir::new().unwrap();
    let manager = LifecycleManager::new();

    let servers: Vec<_> = ["one", "two"]
        .iter()
        .map(|name| {
            Server::builder(ServerConfig::new("127.0.0.1:0", pid_path(&dir, name)))
                .manager(&manager)
                .build()
        })
        .collect();

    let mut tasks = Vec::new();
    let mut addrs = Vec::new();
    for server in &servers {
        let (addr, task) = spawn_serving(server, hello()).await;
        addrs.push(addr);
        tasks.push(task);
    }
    assert_ne!(addrs[0], addrs[1]);
    assert_eq!(manager.len(), 2);

    let results = tokio::time::timeout(Duration::from_secs(5), manager.interrupt())
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, result)| result.is_ok()));

    for (server, name) in servers.iter().zip(["one", "two"]) {
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(!pid_path(&dir, name).exists());
    }
    assert!(manager.is_empty());
    for task in tasks {
        task.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_manager_stops_servers_concurrently() {
    let dir = TempDir::new().unwrap();
    let manager = LifecycleManager::new();
    let (gate_tx, gate_rx) = watch::channel(false);

    let mut servers = Vec::new();
    let mut tasks = Vec::new();
    for name in ["slow-a", "slow-b"] {
        let server = Server::builder(ServerConfig::new("127.0.0.1:0", pid_path(&dir, name)))
            .manager(&manager)
            .build();
        let (entered_tx, mut entered_rx) = mpsc::unbounded_channel();
        let (addr, task) = spawn_serving(&server, gated_router(entered_tx, gate_rx.clone())).await;

        tokio::spawn(async move { http_get(addr, "/").await });
        entered_rx.recv().await.unwrap();

        servers.push(server);
        tasks.push(task);
    }

    let interrupt = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.interrupt().await })
    };

    // Both servers enter Stopping before either drain completes
    tokio::time::timeout(Duration::from_secs(2), async {
        while !servers.iter().all(|s| s.state() == ServerState::Stopping) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("servers were not stopped concurrently");

    gate_tx.send_replace(true);
    let results = interrupt.await.unwrap();
    assert_eq!(results.len(), 2);
    for task in tasks {
        task.await.unwrap().unwrap();
    }
}
