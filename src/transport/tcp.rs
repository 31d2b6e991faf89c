//! Framed TCP listener on loopback.
//!
//! Lifecycle is `Stopped -> Starting -> Running -> Stopped`. Each accepted
//! client gets the handshake line, then a read loop that answers every frame
//! with exactly one response frame.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::protocol::{handshake_line, CommandResponse, PING_PAYLOAD};
use super::{read_frame, write_frame, BridgeTransport, ConnectionPhase, FrameError, TransportState};
use crate::config::TcpConfig;
use crate::dispatcher::{CommandQueue, DispatchError};
use crate::heartbeat::HeartbeatEmitter;
use crate::host::HostHandle;
use crate::ports::PortDiscovery;
use crate::sync::lock;

const TRANSPORT_NAME: &str = "tcp";

/// Pause after a failed `accept()` before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

struct ServerInner {
    config: TcpConfig,
    heartbeat_interval: Duration,
    queue: CommandQueue,
    host: HostHandle,
    heartbeat: Arc<HeartbeatEmitter>,
    ports: Arc<dyn PortDiscovery>,
    state: watch::Sender<TransportState>,
    /// Present while running; cancelled by `stop()`.
    lifecycle: Mutex<Option<CancellationToken>>,
    /// Accept loop and client tasks. Finished tasks are released as they end.
    tasks: TaskTracker,
    next_client: AtomicU64,
    /// Bound port, 0 while stopped.
    port: AtomicU16,
}

/// Loopback listener speaking the framed protocol.
pub struct TcpBridgeServer {
    inner: Arc<ServerInner>,
}

impl TcpBridgeServer {
    pub fn new(
        config: TcpConfig,
        heartbeat_interval: Duration,
        queue: CommandQueue,
        host: HostHandle,
        heartbeat: Arc<HeartbeatEmitter>,
        ports: Arc<dyn PortDiscovery>,
    ) -> Self {
        let (state, _) = watch::channel(TransportState::new(TRANSPORT_NAME, ConnectionPhase::Stopped));
        Self {
            inner: Arc::new(ServerInner {
                config,
                heartbeat_interval,
                queue,
                host,
                heartbeat,
                ports,
                state,
                lifecycle: Mutex::new(None),
                tasks: TaskTracker::new(),
                next_client: AtomicU64::new(1),
                port: AtomicU16::new(0),
            }),
        }
    }

    /// Bind, publish the status file and start accepting. Returns the port.
    pub async fn start(&self) -> Result<u16> {
        let inner = &self.inner;
        let lifecycle = {
            let mut slot = lock(&inner.lifecycle);
            if slot.is_some() {
                bail!("TCP bridge is already running");
            }
            let token = CancellationToken::new();
            *slot = Some(token.clone());
            token
        };
        inner.publish(TransportState::new(TRANSPORT_NAME, ConnectionPhase::Starting));

        let listener = match inner.bind().await {
            Ok(listener) => listener,
            Err(e) => {
                lock(&inner.lifecycle).take();
                inner.publish(TransportState::disconnected(
                    TRANSPORT_NAME,
                    ConnectionPhase::Stopped,
                    Some(format!("{e:#}")),
                ));
                return Err(e);
            }
        };
        let port = listener.local_addr()?.port();
        inner.port.store(port, Ordering::Release);

        if let Err(e) = inner.ports.persist(port) {
            warn!(port, error = %format!("{e:#}"), "Failed to persist listener port");
        }

        inner.heartbeat.activate(port);
        inner.heartbeat.write(false, "ready");
        if let Err(e) = inner.heartbeat.schedule(
            &inner.host,
            inner.heartbeat_interval,
            lifecycle.child_token(),
        ) {
            warn!(error = %e, "Heartbeat not scheduled");
        }

        inner.tasks.reopen();
        inner
            .tasks
            .spawn(accept_loop(Arc::clone(inner), listener, lifecycle));

        inner.publish(TransportState::connected(
            TRANSPORT_NAME,
            ConnectionPhase::Running,
            None,
            Some(format!("127.0.0.1:{port}")),
        ));
        info!(port, status = %inner.heartbeat.path().display(), "TCP bridge listening");
        Ok(port)
    }

    /// Stop accepting, close every client and remove the status file.
    ///
    /// Idempotent. Cancelling the lifecycle also cancels in-flight commands;
    /// background tasks get a bounded wait to finish.
    pub async fn stop(&self) {
        let inner = &self.inner;
        let Some(lifecycle) = lock(&inner.lifecycle).take() else {
            return;
        };
        lifecycle.cancel();

        inner.tasks.close();
        if tokio::time::timeout(inner.config.stop_wait(), inner.tasks.wait())
            .await
            .is_err()
        {
            warn!(remaining = inner.tasks.len(), "Listener tasks did not finish in time");
        }

        inner.heartbeat.clear();
        inner.port.store(0, Ordering::Release);
        inner.publish(TransportState::new(TRANSPORT_NAME, ConnectionPhase::Stopped));
        info!("TCP bridge stopped");
    }

    /// Report a host reload (or its end) in the status file.
    pub fn set_reloading(&self, reloading: bool, reason: &str) {
        self.inner.heartbeat.write(reloading, reason);
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.lifecycle).is_some()
    }

    /// Bound port while running.
    pub fn port(&self) -> Option<u16> {
        match self.inner.port.load(Ordering::Acquire) {
            0 => None,
            port => Some(port),
        }
    }

    /// Live background tasks: the accept loop plus one per connected client.
    pub fn task_count(&self) -> usize {
        self.inner.tasks.len()
    }

    pub fn state(&self) -> TransportState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TransportState> {
        self.inner.state.subscribe()
    }
}

impl Drop for TcpBridgeServer {
    fn drop(&mut self) {
        if let Some(lifecycle) = lock(&self.inner.lifecycle).take() {
            lifecycle.cancel();
            self.inner.heartbeat.clear();
        }
    }
}

#[async_trait]
impl BridgeTransport for TcpBridgeServer {
    fn name(&self) -> &'static str {
        TRANSPORT_NAME
    }

    async fn start(&self) -> Result<()> {
        Self::start(self).await.map(|_| ())
    }

    async fn stop(&self) {
        Self::stop(self).await;
    }

    fn state(&self) -> TransportState {
        Self::state(self)
    }

    fn subscribe(&self) -> watch::Receiver<TransportState> {
        Self::subscribe(self)
    }
}

impl ServerInner {
    fn publish(&self, state: TransportState) {
        self.state.send_replace(state);
    }

    /// Bind the preferred port, retrying while it is in use, then fall back.
    async fn bind(&self) -> Result<TcpListener> {
        let preferred = self
            .config
            .port
            .unwrap_or_else(|| self.ports.preferred_port());

        let mut attempt = 0;
        loop {
            match TcpListener::bind((Ipv4Addr::LOCALHOST, preferred)).await {
                Ok(listener) => return Ok(listener),
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    if attempt >= self.config.bind_retries {
                        break;
                    }
                    attempt += 1;
                    debug!(port = preferred, attempt, "Port in use; retrying bind");
                    tokio::time::sleep(self.config.bind_retry_delay()).await;
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to bind 127.0.0.1:{preferred}"));
                }
            }
        }

        let fallback = self.ports.fallback_port(preferred)?;
        warn!(busy = preferred, port = fallback, "Preferred port unavailable; using fallback");
        TcpListener::bind((Ipv4Addr::LOCALHOST, fallback))
            .await
            .with_context(|| format!("Failed to bind fallback port {fallback}"))
    }

    /// Answer one frame payload. `cancel` scopes any command it enqueues.
    async fn respond(&self, payload: &[u8], cancel: &CancellationToken) -> CommandResponse {
        let text = String::from_utf8_lossy(payload);

        if text.trim() == PING_PAYLOAD {
            return CommandResponse::pong();
        }

        if serde_json::from_str::<serde::de::IgnoredAny>(&text).is_err() {
            return CommandResponse::invalid_json(&text, self.config.invalid_json_preview_chars);
        }

        let timeout = self.config.command_timeout();
        let pending = self
            .queue
            .enqueue_with(text.into_owned(), timeout, cancel.child_token());
        let id = pending.id().to_string();
        match pending.wait(timeout).await {
            Ok(response) => serde_json::from_str(&response)
                .unwrap_or_else(|_| CommandResponse::error("Malformed command response")),
            Err(DispatchError::TimedOut(after)) => {
                warn!(command = %id, "Command timed out waiting for host");
                CommandResponse::timed_out(after)
            }
            Err(e @ (DispatchError::Dropped | DispatchError::Cancelled)) => {
                CommandResponse::error(e.to_string())
            }
        }
    }
}

async fn accept_loop(inner: Arc<ServerInner>, listener: TcpListener, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let client_id = inner.next_client.fetch_add(1, Ordering::Relaxed);
                debug!(client = client_id, peer = %peer, "Client connected");
                let client = serve_client(Arc::clone(&inner), stream, peer, cancel.child_token());
                inner.tasks.spawn(client);
            }
            Err(e) => {
                error!(error = %e, "Accept failed");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
    debug!("Accept loop exited");
}

async fn serve_client(
    inner: Arc<ServerInner>,
    stream: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    let io_timeout = inner.config.frame_io_timeout();
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();

    let hello = handshake_line();
    let greeting = writer.write_all(hello.as_bytes());
    match tokio::time::timeout(io_timeout, greeting).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            debug!(peer = %peer, error = %e, "Handshake write failed");
            return;
        }
        Err(_) => {
            debug!(peer = %peer, "Handshake write timed out");
            return;
        }
    }

    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = read_frame(&mut reader, io_timeout) => frame,
        };

        let (response, keep_open) = match frame {
            Ok(payload) => (inner.respond(&payload, &cancel).await, true),
            Err(FrameError::Empty) => (CommandResponse::error("Empty frame"), true),
            // Payload left unread; the stream cannot be resynchronised
            Err(e @ FrameError::Oversized(_)) => (CommandResponse::error(e.to_string()), false),
            Err(e) if e.is_benign() => {
                debug!(peer = %peer, reason = %e, "Client disconnected");
                break;
            }
            Err(e) => {
                error!(peer = %peer, error = %e, "Client read failed");
                break;
            }
        };

        let body = response.to_json();
        let write = tokio::select! {
            () = cancel.cancelled() => break,
            write = write_frame(&mut writer, body.as_bytes(), io_timeout) => write,
        };
        if let Err(e) = write {
            if e.is_benign() {
                debug!(peer = %peer, reason = %e, "Client went away before response");
            } else {
                error!(peer = %peer, error = %e, "Response write failed");
            }
            break;
        }
        if !keep_open {
            break;
        }
    }

    let _ = writer.shutdown().await;
    debug!(peer = %peer, "Client loop exited");
}
