//! Shared harness for bridge integration tests.
//!
//! Starts a host thread, a command queue with a small test handler and a TCP
//! listener on an ephemeral port, all backed by a temporary state directory.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use editor_bridge::config::{ProjectIdentity, TcpConfig};
use editor_bridge::dispatcher::CommandQueue;
use editor_bridge::heartbeat::HeartbeatEmitter;
use editor_bridge::host::HostRuntime;
use editor_bridge::ports::PortRegistry;
use editor_bridge::registry::{CommandError, CommandHandler, ToolDescriptor};
use editor_bridge::transport::{read_frame, write_frame, TcpBridgeServer};

pub const IO_TIMEOUT: Duration = Duration::from_secs(5);
pub const TICK: Duration = Duration::from_millis(5);

// ── Test handler ────────────────────────────────────────────────────

/// `echo`, `thread`, `sleep {ms}`, `block {ms}`, `fail` and `panic`.
///
/// `sleep` honours its cancellation token and counts how often it fired;
/// `block` holds the host thread without yielding.
#[derive(Default)]
pub struct TestHandler {
    pub cancelled: AtomicUsize,
}

impl TestHandler {
    pub fn cancellations(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait(?Send)]
impl CommandHandler for TestHandler {
    async fn execute(
        &self,
        name: &str,
        params: Value,
        cancel: CancellationToken,
    ) -> Result<Value, CommandError> {
        match name {
            "echo" => Ok(params),
            "thread" => {
                let name = std::thread::current().name().map(str::to_owned);
                Ok(json!({ "thread": name }))
            }
            "sleep" => {
                let ms = params.get("ms").and_then(Value::as_u64).unwrap_or(1000);
                tokio::select! {
                    () = cancel.cancelled() => {
                        self.cancelled.fetch_add(1, Ordering::SeqCst);
                        Err(CommandError::Cancelled)
                    }
                    () = tokio::time::sleep(Duration::from_millis(ms)) => Ok(json!({ "slept_ms": ms })),
                }
            }
            "block" => {
                let ms = params.get("ms").and_then(Value::as_u64).unwrap_or(500);
                std::thread::sleep(Duration::from_millis(ms));
                Ok(json!({ "blocked_ms": ms }))
            }
            "fail" => Err(CommandError::Failed("requested failure".into())),
            "panic" => panic!("requested panic"),
            other => Err(CommandError::UnknownCommand(other.into())),
        }
    }

    fn catalogue(&self) -> Vec<ToolDescriptor> {
        ["echo", "thread", "sleep", "block", "fail", "panic"]
            .into_iter()
            .map(|name| ToolDescriptor {
                name: name.into(),
                description: format!("test command {name}"),
                parameters: json!({ "type": "object" }),
            })
            .collect()
    }
}

pub fn project(dir: &TempDir) -> ProjectIdentity {
    ProjectIdentity::new(dir.path().join("game"), None, "test-host-1.0")
}

/// Host thread plus an attached queue running [`TestHandler`].
pub fn host_and_queue(command_timeout: Duration) -> (HostRuntime, CommandQueue) {
    let (host, queue, _handler) = host_queue_and_handler(command_timeout);
    (host, queue)
}

pub fn host_queue_and_handler(
    command_timeout: Duration,
) -> (HostRuntime, CommandQueue, Arc<TestHandler>) {
    let host = HostRuntime::spawn(TICK).unwrap();
    let handler = Arc::new(TestHandler::default());
    let queue = CommandQueue::new(Arc::clone(&handler) as _, command_timeout);
    queue.attach(&host.handle()).unwrap();
    (host, queue, handler)
}

// ── Bridge ──────────────────────────────────────────────────────────

/// A running TCP bridge. Stops on drop.
pub struct Bridge {
    pub server: TcpBridgeServer,
    pub heartbeat: Arc<HeartbeatEmitter>,
    pub ports: Arc<PortRegistry>,
    pub handler: Arc<TestHandler>,
    pub port: u16,
    pub host: HostRuntime,
    pub dir: TempDir,
}

/// Defaults suited to tests: ephemeral port, short timeouts.
pub fn test_tcp_config() -> TcpConfig {
    TcpConfig {
        port: Some(0),
        frame_io_timeout_ms: 5_000,
        command_timeout_ms: 2_000,
        bind_retries: 1,
        bind_retry_delay_ms: 10,
        stop_wait_ms: 1_000,
        ..TcpConfig::default()
    }
}

pub async fn start_bridge(config: TcpConfig) -> Bridge {
    start_bridge_with(config, Duration::from_millis(50)).await
}

pub async fn start_bridge_with(config: TcpConfig, heartbeat_interval: Duration) -> Bridge {
    let dir = tempfile::tempdir().unwrap();
    let project = project(&dir);
    let (host, queue, handler) = host_queue_and_handler(config.command_timeout());

    let heartbeat = Arc::new(HeartbeatEmitter::new(dir.path(), project.clone()));
    let default_port = config.port.filter(|p| *p != 0).unwrap_or(config.default_port);
    let ports = Arc::new(PortRegistry::new(dir.path(), &project, default_port));

    let server = TcpBridgeServer::new(
        config,
        heartbeat_interval,
        queue,
        host.handle(),
        Arc::clone(&heartbeat),
        Arc::clone(&ports) as _,
    );
    let port = server.start().await.unwrap();

    Bridge {
        server,
        heartbeat,
        ports,
        handler,
        port,
        host,
        dir,
    }
}

// ── Client helpers ──────────────────────────────────────────────────

/// Connect and consume the handshake line, returning it.
pub async fn connect(port: u16) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut line = Vec::new();
    loop {
        let byte = tokio::time::timeout(IO_TIMEOUT, stream.read_u8())
            .await
            .expect("handshake timed out")
            .unwrap();
        line.push(byte);
        if byte == b'\n' {
            break;
        }
    }
    (stream, String::from_utf8(line).unwrap())
}

pub async fn send_raw(stream: &mut TcpStream, payload: &[u8]) {
    write_frame(stream, payload, IO_TIMEOUT).await.unwrap();
}

pub async fn recv_json(stream: &mut TcpStream) -> Value {
    let frame = read_frame(stream, IO_TIMEOUT).await.unwrap();
    serde_json::from_slice(&frame).unwrap()
}

/// Send one payload and read its response.
pub async fn request(stream: &mut TcpStream, payload: &str) -> Value {
    send_raw(stream, payload.as_bytes()).await;
    recv_json(stream).await
}

pub async fn command(stream: &mut TcpStream, name: &str, params: Value) -> Value {
    request(stream, &json!({ "type": name, "params": params }).to_string()).await
}

/// Poll `check` until it holds or [`IO_TIMEOUT`] passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + IO_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
