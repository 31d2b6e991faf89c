//! Outbound WebSocket client to a command hub.
//!
//! On connect the client sends `register`; the hub answers `welcome` and
//! `registered`, after which the client pushes its command catalogue and
//! serves `execute` requests through the shared [`CommandQueue`]. A
//! keep-alive loop sends application-level `pong` frames on the negotiated
//! interval.
//!
//! Any receive or send failure, or a close frame from the hub, moves the
//! client to `Disconnected` and hands off to a single reconnection loop that
//! walks the configured delay schedule until it succeeds or `stop()` is
//! called. There is no retry budget.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, Mutex as AsyncMutex, Notify};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::protocol::{ClientMessage, CommandEnvelope, CommandResponse, ServerMessage};
use super::ws::{self, WsMessage, WsReader, WsWriter};
use super::{BridgeTransport, ConnectionPhase, TransportState};
use crate::config::{ProjectIdentity, WebSocketConfig};
use crate::dispatcher::{CommandQueue, DispatchError};
use crate::host::HostHandle;
use crate::sync::lock;

const TRANSPORT_NAME: &str = "websocket";

/// Bound on pushing the catalogue from the host thread.
const DEFAULT_MARSHAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Persisted session, so a restarted client can report its last session.
#[derive(Debug, Serialize, Deserialize)]
struct SessionFile {
    session_id: String,
    saved_at: String,
}

/// One live socket. Cloned into the tasks that serve it.
#[derive(Clone)]
struct Connection {
    id: u64,
    token: CancellationToken,
    writer: Arc<AsyncMutex<WsWriter>>,
}

struct ClientInner {
    config: WebSocketConfig,
    project: ProjectIdentity,
    queue: CommandQueue,
    host: HostHandle,
    marshal_timeout: Duration,
    session_file: Option<PathBuf>,
    state: watch::Sender<TransportState>,
    /// Present while the owner wants the transport up.
    lifecycle: Mutex<Option<CancellationToken>>,
    connection: Mutex<Option<Connection>>,
    next_connection: AtomicU64,
    reconnecting: AtomicBool,
    session_id: Mutex<Option<String>>,
    keep_alive: Mutex<Duration>,
    server_timeout: Mutex<Duration>,
    /// Wakes keep-alive loops sleeping on a stale interval.
    intervals_changed: Notify,
    /// Connection loops, hub commands and the reconnect loop.
    tasks: TaskTracker,
}

/// WebSocket transport to a remote hub.
pub struct WsBridgeClient {
    inner: Arc<ClientInner>,
}

impl WsBridgeClient {
    pub fn new(
        config: WebSocketConfig,
        project: ProjectIdentity,
        queue: CommandQueue,
        host: HostHandle,
    ) -> Self {
        let (state, _) = watch::channel(TransportState::new(
            TRANSPORT_NAME,
            ConnectionPhase::Disconnected,
        ));
        let keep_alive = config.keep_alive();
        let server_timeout = config.server_timeout();
        Self {
            inner: Arc::new(ClientInner {
                config,
                project,
                queue,
                host,
                marshal_timeout: DEFAULT_MARSHAL_TIMEOUT,
                session_file: None,
                state,
                lifecycle: Mutex::new(None),
                connection: Mutex::new(None),
                next_connection: AtomicU64::new(1),
                reconnecting: AtomicBool::new(false),
                session_id: Mutex::new(None),
                keep_alive: Mutex::new(keep_alive),
                server_timeout: Mutex::new(server_timeout),
                intervals_changed: Notify::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Persist the session id under `state_dir`, loading any previous one.
    ///
    /// Must be called before `start()`.
    #[must_use]
    pub fn with_state_dir(mut self, state_dir: &Path) -> Self {
        let path = state_dir.join(format!("bridge-session-{}.json", self.inner.project.hash()));
        let previous = load_session(&path);
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.session_file = Some(path);
            *lock(&inner.session_id) = previous;
        }
        self
    }

    /// Bound on host-thread calls made by the client. Must be called before `start()`.
    #[must_use]
    pub fn with_marshal_timeout(mut self, timeout: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.marshal_timeout = timeout;
        }
        self
    }

    /// Connect and register.
    ///
    /// A failure here is returned to the caller and not retried; only a
    /// connection lost after a successful start triggers reconnection.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.config.url.is_none() {
            bail!("WebSocket URL is not configured");
        }
        let lifecycle = {
            let mut slot = lock(&inner.lifecycle);
            if slot.is_some() {
                bail!("WebSocket client is already running");
            }
            let token = CancellationToken::new();
            *slot = Some(token.clone());
            token
        };
        inner.tasks.reopen();

        match inner.connect(&lifecycle).await {
            Ok(_) => Ok(()),
            Err(e) => {
                lock(&inner.lifecycle).take();
                lifecycle.cancel();
                inner.publish(TransportState::disconnected(
                    TRANSPORT_NAME,
                    ConnectionPhase::Disconnected,
                    Some(format!("{e:#}")),
                ));
                Err(e)
            }
        }
    }

    /// Cancel everything, then close the socket with a normal closure.
    /// Idempotent.
    pub async fn stop(&self) {
        let inner = &self.inner;
        let Some(lifecycle) = lock(&inner.lifecycle).take() else {
            return;
        };
        lifecycle.cancel();

        let stop_wait = inner.config.stop_wait();
        inner.tasks.close();
        if tokio::time::timeout(stop_wait, inner.tasks.wait()).await.is_err() {
            warn!(remaining = inner.tasks.len(), "Client tasks did not finish in time");
        }

        let connection = lock(&inner.connection).take();
        if let Some(connection) = connection {
            close_socket(&connection.writer, stop_wait).await;
        }

        inner.reconnecting.store(false, Ordering::Release);
        inner.publish(TransportState::new(TRANSPORT_NAME, ConnectionPhase::Disconnected));
        info!("WebSocket client stopped");
    }

    /// Session id from the last `registered` message.
    pub fn session_id(&self) -> Option<String> {
        self.inner.session_id()
    }

    /// Keep-alive interval and server timeout currently in effect.
    pub fn negotiated_intervals(&self) -> (Duration, Duration) {
        (*lock(&self.inner.keep_alive), *lock(&self.inner.server_timeout))
    }

    /// Live background tasks: connection loops, hub commands in flight and
    /// any reconnect loop.
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

impl Drop for WsBridgeClient {
    fn drop(&mut self) {
        if let Some(lifecycle) = lock(&self.inner.lifecycle).take() {
            lifecycle.cancel();
        }
    }
}

#[async_trait]
impl BridgeTransport for WsBridgeClient {
    fn name(&self) -> &'static str {
        TRANSPORT_NAME
    }

    async fn start(&self) -> Result<()> {
        Self::start(self).await
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

impl ClientInner {
    fn publish(&self, state: TransportState) {
        self.state.send_replace(state);
    }

    fn session_id(&self) -> Option<String> {
        lock(&self.session_id).clone()
    }

    fn url(&self) -> Result<String> {
        self.config
            .url
            .clone()
            .context("WebSocket URL is not configured")
    }

    /// Open the socket, start its loops and send `register`.
    async fn connect(self: &Arc<Self>, lifecycle: &CancellationToken) -> Result<Connection> {
        let url = self.url()?;
        self.publish(TransportState::new(TRANSPORT_NAME, ConnectionPhase::Connecting).with_details(&url));

        let bearer = self.config.token.as_ref().map(|t| format!("Bearer {t}"));
        let headers: Vec<(&str, &str)> = bearer
            .as_deref()
            .map(|value| ("Authorization", value))
            .into_iter()
            .collect();

        let connect_timeout = self.config.connect_timeout();
        let (writer, reader) = tokio::time::timeout(connect_timeout, ws::connect(&url, &headers))
            .await
            .map_err(|_| anyhow!("WebSocket connect timed out after {}s", connect_timeout.as_secs()))??;

        let connection = Connection {
            id: self.next_connection.fetch_add(1, Ordering::Relaxed),
            token: lifecycle.child_token(),
            writer: Arc::new(AsyncMutex::new(writer)),
        };

        // Checked under the slot lock: `stop()` cancels before it takes the slot
        let previous = {
            let mut slot = lock(&self.connection);
            if lifecycle.is_cancelled() {
                None
            } else {
                Some(slot.replace(connection.clone()))
            }
        };
        let Some(previous) = previous else {
            close_socket(&connection.writer, self.config.stop_wait()).await;
            bail!("Client stopped while connecting");
        };
        if let Some(previous) = previous {
            previous.token.cancel();
        }

        self.publish(
            TransportState::new(TRANSPORT_NAME, ConnectionPhase::AwaitingRegistration).with_details(&url),
        );

        self.tasks
            .spawn(receive_loop(Arc::clone(self), reader, connection.clone()));
        self.tasks
            .spawn(keep_alive_loop(Arc::clone(self), connection.clone()));

        let register = ClientMessage::Register {
            project_name: self.project.name.clone(),
            project_hash: self.project.hash(),
            host_version: self.project.host_version.clone(),
            project_path: self.project.path_string(),
        };
        if let Err(e) = send(&connection.writer, &register).await {
            connection.token.cancel();
            self.forget_connection(connection.id);
            return Err(e.context("Failed to send register"));
        }

        info!(url = %url, connection = connection.id, "Connected to hub");
        Ok(connection)
    }

    fn forget_connection(&self, id: u64) {
        let mut current = lock(&self.connection);
        if current.as_ref().is_some_and(|c| c.id == id) {
            *current = None;
        }
    }

    async fn handle_text(self: &Arc<Self>, text: &str, connection: &Connection) {
        let message = match serde_json::from_str::<ServerMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Ignoring unrecognised hub message");
                return;
            }
        };

        match message {
            ServerMessage::Welcome {
                keep_alive_interval,
                server_timeout,
            } => self.adopt_intervals(keep_alive_interval, server_timeout),
            ServerMessage::Registered { session_id } => {
                self.on_registered(session_id, connection);
            }
            ServerMessage::Execute {
                id,
                name,
                params,
                timeout,
            } => {
                let inner = Arc::clone(self);
                let connection = connection.clone();
                self.tasks.spawn(async move {
                    inner.execute(connection, id, name, params, timeout).await;
                });
            }
            ServerMessage::Ping => {
                let pong = ClientMessage::Pong {
                    session_id: self.session_id(),
                };
                if let Err(e) = send(&connection.writer, &pong).await {
                    self.handle_disconnect(connection, format!("{e:#}"));
                }
            }
        }
    }

    /// Take the hub's suggested intervals, in seconds. The keep-alive is
    /// kept below the server timeout.
    fn adopt_intervals(&self, keep_alive: Option<u64>, server_timeout: Option<u64>) {
        let server_timeout = server_timeout
            .filter(|secs| *secs > 0)
            .map_or_else(|| self.config.server_timeout(), Duration::from_secs);
        let mut keep_alive = keep_alive
            .filter(|secs| *secs > 0)
            .map_or_else(|| self.config.keep_alive(), Duration::from_secs);
        if keep_alive >= server_timeout {
            keep_alive = (server_timeout / 2).max(Duration::from_secs(1));
        }

        *lock(&self.keep_alive) = keep_alive;
        *lock(&self.server_timeout) = server_timeout;
        self.intervals_changed.notify_waiters();
        debug!(
            keep_alive_secs = keep_alive.as_secs(),
            server_timeout_secs = server_timeout.as_secs(),
            "Adopted hub intervals"
        );
    }

    fn on_registered(self: &Arc<Self>, session_id: String, connection: &Connection) {
        *lock(&self.session_id) = Some(session_id.clone());
        self.persist_session(&session_id);

        let url = self.config.url.clone();
        self.publish(TransportState::connected(
            TRANSPORT_NAME,
            ConnectionPhase::Registered,
            Some(session_id.clone()),
            url,
        ));
        info!(session = %session_id, "Registered with hub");

        // Off the receive loop: the host may be busy for up to the marshal timeout
        let inner = Arc::clone(self);
        let connection = connection.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                () = connection.token.cancelled() => {}
                () = inner.push_catalogue(&connection) => {}
            }
        });
    }

    async fn push_catalogue(self: &Arc<Self>, connection: &Connection) {
        let handler = self.queue.handler();
        let catalogue = match self
            .host
            .run(move || handler.catalogue(), self.marshal_timeout)
            .await
        {
            Ok(catalogue) => catalogue,
            Err(e) => {
                warn!(error = %e, "Could not read command catalogue");
                return;
            }
        };

        let tools: Vec<Value> = catalogue
            .iter()
            .filter_map(|tool| serde_json::to_value(tool).ok())
            .collect();
        let count = tools.len();
        match send(&connection.writer, &ClientMessage::RegisterTools { tools }).await {
            Ok(()) => debug!(count, "Pushed command catalogue"),
            Err(e) => self.handle_disconnect(connection, format!("{e:#}")),
        }
    }

    async fn execute(
        self: Arc<Self>,
        connection: Connection,
        id: String,
        name: String,
        params: Value,
        timeout: Option<f64>,
    ) {
        let deadline = timeout
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .filter(|d| !d.is_zero())
            .unwrap_or_else(|| self.config.command_timeout());

        debug!(request = %id, command = %name, "Executing hub command");
        let pending = self.queue.enqueue_with(
            CommandEnvelope::new(name, params).to_json(),
            deadline,
            connection.token.child_token(),
        );
        let pending_id = pending.id().to_string();

        let outcome = tokio::select! {
            () = connection.token.cancelled() => {
                self.queue.withdraw(&pending_id);
                debug!(request = %id, "Connection gone; dropping command");
                return;
            }
            outcome = pending.wait(deadline) => outcome,
        };

        let result = match outcome {
            Ok(text) => serde_json::from_str(&text)
                .unwrap_or_else(|_| CommandResponse::error("Malformed command response").to_value()),
            Err(DispatchError::TimedOut(after)) => CommandResponse::timed_out(after).to_value(),
            Err(DispatchError::Cancelled) => {
                debug!(request = %id, "Connection gone; dropping command");
                return;
            }
            Err(e @ DispatchError::Dropped) => CommandResponse::error(e.to_string()).to_value(),
        };

        let reply = ClientMessage::CommandResult { id, result };
        if let Err(e) = send(&connection.writer, &reply).await {
            self.handle_disconnect(&connection, format!("{e:#}"));
        }
    }

    fn persist_session(&self, session_id: &str) {
        let Some(path) = &self.session_file else {
            return;
        };
        let record = SessionFile {
            session_id: session_id.to_string(),
            saved_at: chrono::Utc::now().to_rfc3339(),
        };
        let written = serde_json::to_vec_pretty(&record)
            .map_err(anyhow::Error::from)
            .and_then(|bytes| std::fs::write(path, bytes).map_err(anyhow::Error::from));
        if let Err(e) = written {
            debug!(path = %path.display(), error = %format!("{e:#}"), "Failed to persist session");
        }
    }

    /// Tear down `connection` and, if the owner still wants the transport up,
    /// start the reconnection loop unless one is already running.
    fn handle_disconnect(self: &Arc<Self>, connection: &Connection, reason: String) {
        if connection.token.is_cancelled() {
            return;
        }
        connection.token.cancel();
        self.forget_connection(connection.id);

        let lifecycle = lock(&self.lifecycle).clone();
        let Some(lifecycle) = lifecycle.filter(|t| !t.is_cancelled()) else {
            debug!(reason = %reason, "Connection ended during shutdown");
            return;
        };

        warn!(reason = %reason, "Hub connection lost");
        self.publish(TransportState::disconnected(
            TRANSPORT_NAME,
            ConnectionPhase::Disconnected,
            Some(reason),
        ));

        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.tasks.spawn(reconnect_loop(Arc::clone(self), lifecycle));
        }
    }
}

/// Send a normal-closure close frame and shut the sink, bounded by `wait`.
async fn close_socket(writer: &AsyncMutex<WsWriter>, wait: Duration) {
    let close = async {
        let mut writer = writer.lock().await;
        writer.send_close("client stopping").await?;
        writer.close().await
    };
    match tokio::time::timeout(wait, close).await {
        Ok(Ok(())) => debug!("Sent close frame"),
        Ok(Err(e)) => debug!(error = %format!("{e:#}"), "Close handshake failed"),
        Err(_) => debug!("Close handshake timed out"),
    }
}

async fn send(writer: &AsyncMutex<WsWriter>, message: &ClientMessage) -> Result<()> {
    let text = serde_json::to_string(message)?;
    writer.lock().await.send_text(&text).await
}

async fn receive_loop(inner: Arc<ClientInner>, mut reader: WsReader, connection: Connection) {
    let reason = loop {
        let next = tokio::select! {
            () = connection.token.cancelled() => return,
            next = reader.recv() => next,
        };
        match next {
            Some(Ok(WsMessage::Text(text))) => inner.handle_text(&text, &connection).await,
            Some(Ok(WsMessage::Close { code, reason })) => {
                break format!("Hub closed connection ({code}): {reason}");
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => break format!("{e:#}"),
            None => break "Hub connection ended".to_string(),
        }
    };
    inner.handle_disconnect(&connection, reason);
}

async fn keep_alive_loop(inner: Arc<ClientInner>, connection: Connection) {
    loop {
        let interval = *lock(&inner.keep_alive);
        tokio::select! {
            () = connection.token.cancelled() => return,
            () = inner.intervals_changed.notified() => continue,
            () = tokio::time::sleep(interval) => {}
        }

        let pong = ClientMessage::Pong {
            session_id: inner.session_id(),
        };
        if let Err(e) = send(&connection.writer, &pong).await {
            inner.handle_disconnect(&connection, format!("Keep-alive failed: {e:#}"));
            return;
        }
    }
}

/// Walk the delay schedule, reconnecting after each delay, until connected
/// or the lifecycle ends. Past the end of the schedule the last delay repeats.
async fn reconnect_loop(inner: Arc<ClientInner>, lifecycle: CancellationToken) {
    let schedule = inner.config.reconnect_schedule();
    let mut attempt = 0usize;

    loop {
        let delay = schedule
            .get(attempt)
            .or_else(|| schedule.last())
            .copied()
            .unwrap_or(Duration::from_secs(1));
        attempt += 1;

        inner.publish(
            TransportState::new(TRANSPORT_NAME, ConnectionPhase::Reconnecting)
                .with_details(format!("attempt {attempt} in {}ms", delay.as_millis())),
        );
        debug!(attempt, delay_ms = delay.as_millis(), "Scheduling reconnect");

        tokio::select! {
            () = lifecycle.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }

        match inner.connect(&lifecycle).await {
            Ok(connection) => {
                inner.reconnecting.store(false, Ordering::Release);
                if !connection.token.is_cancelled() {
                    info!(attempt, "Reconnected to hub");
                    return;
                }
                // Lost again before the flag cleared; nobody else will retry
                if inner
                    .reconnecting
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                if lifecycle.is_cancelled() {
                    break;
                }
                warn!(attempt, error = %format!("{e:#}"), "Reconnect failed");
                inner.publish(TransportState::disconnected(
                    TRANSPORT_NAME,
                    ConnectionPhase::Reconnecting,
                    Some(format!("{e:#}")),
                ));
            }
        }
    }

    inner.reconnecting.store(false, Ordering::Release);
    debug!("Reconnect loop cancelled");
}

fn load_session(path: &Path) -> Option<String> {
    let text = std::fs::read_to_string(path).ok()?;
    serde_json::from_str::<SessionFile>(&text)
        .ok()
        .map(|record| record.session_id)
        .filter(|id| !id.is_empty())
}
