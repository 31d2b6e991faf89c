//! Transport layer between the external controller and the host.
//!
//! Two transports feed the same command queue:
//! - [`TcpBridgeServer`]: loopback listener speaking length-prefixed JSON
//!   frames (`[8-byte big-endian length][payload]`).
//! - [`WsBridgeClient`]: outbound WebSocket to a hub with registration,
//!   keep-alive and reconnection.
//!
//! Both publish a [`TransportState`] and implement [`BridgeTransport`].

pub mod protocol;
pub mod tcp;
pub mod websocket;
pub mod ws;

pub use protocol::{ClientMessage, CommandEnvelope, CommandResponse, ServerMessage};
pub use tcp::TcpBridgeServer;
pub use websocket::WsBridgeClient;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

/// Maximum frame payload (64 MiB). Safety valve against malformed headers.
pub const MAX_FRAME_BYTES: u64 = 64 * 1024 * 1024;

/// Size of the length prefix.
pub const FRAME_HEADER_LEN: usize = 8;

/// Frame codec failure.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("refusing to send {0} byte frame (limit {MAX_FRAME_BYTES})")]
    TooLarge(usize),

    #[error("received zero-length frame")]
    Empty,

    #[error("frame header announces {0} bytes (limit {MAX_FRAME_BYTES})")]
    Oversized(u64),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("frame I/O timed out after {} ms", .0.as_millis())]
    Timeout(Duration),

    #[error("frame I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// Ordinary ways for a connection to end, logged at low severity.
    pub const fn is_benign(&self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::Timeout(_))
    }
}

/// Write one length-prefixed frame.
///
/// Header and payload are written back to back; callers must not share the
/// writer between concurrent frames. The whole write is bounded by `timeout`.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
    timeout: Duration,
) -> Result<(), FrameError> {
    if payload.len() as u64 > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge(payload.len()));
    }

    let header = (payload.len() as u64).to_be_bytes();
    let write = async {
        writer.write_all(&header).await?;
        writer.write_all(payload).await?;
        writer.flush().await?;
        Ok::<_, std::io::Error>(())
    };

    tokio::time::timeout(timeout, write)
        .await
        .map_err(|_| FrameError::Timeout(timeout))?
        .map_err(FrameError::from)
}

/// Read one length-prefixed frame.
///
/// `timeout` bounds the whole frame, not each underlying read, so a peer
/// trickling bytes cannot hold the reader past the deadline. Zero-length and
/// oversized headers are rejected before any payload byte is consumed.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    timeout: Duration,
) -> Result<Vec<u8>, FrameError> {
    tokio::time::timeout(timeout, read_frame_unbounded(reader))
        .await
        .map_err(|_| FrameError::Timeout(timeout))?
}

async fn read_frame_unbounded<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, FrameError> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    read_exact_or_closed(reader, &mut header).await?;

    let len = u64::from_be_bytes(header);
    if len == 0 {
        return Err(FrameError::Empty);
    }
    if len > MAX_FRAME_BYTES {
        return Err(FrameError::Oversized(len));
    }

    let len = usize::try_from(len).map_err(|_| FrameError::Oversized(len))?;
    let mut payload = vec![0u8; len];
    read_exact_or_closed(reader, &mut payload).await?;
    Ok(payload)
}

async fn read_exact_or_closed<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<(), FrameError> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(FrameError::ConnectionClosed),
        Err(e) => Err(e.into()),
    }
}

/// Where a transport is in its lifecycle.
///
/// The listener moves `Stopped -> Starting -> Running -> Stopped`; the hub
/// client moves `Disconnected -> Connecting -> AwaitingRegistration ->
/// Registered`, detouring through `Reconnecting` after an unexpected close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    Stopped,
    Starting,
    Running,
    Disconnected,
    Connecting,
    AwaitingRegistration,
    Registered,
    Reconnecting,
}

/// Snapshot of a transport's status. Replaced wholesale on every change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransportState {
    pub connected: bool,
    pub transport_name: String,
    pub session_id: Option<String>,
    pub last_error: Option<String>,
    pub details: Option<String>,
    pub phase: ConnectionPhase,
}

impl TransportState {
    pub fn new(transport_name: &str, phase: ConnectionPhase) -> Self {
        Self {
            connected: false,
            transport_name: transport_name.to_string(),
            session_id: None,
            last_error: None,
            details: None,
            phase,
        }
    }

    pub fn connected(
        transport_name: &str,
        phase: ConnectionPhase,
        session_id: Option<String>,
        details: Option<String>,
    ) -> Self {
        Self {
            connected: true,
            session_id,
            details,
            ..Self::new(transport_name, phase)
        }
    }

    pub fn disconnected(
        transport_name: &str,
        phase: ConnectionPhase,
        last_error: Option<String>,
    ) -> Self {
        Self {
            last_error,
            ..Self::new(transport_name, phase)
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Common lifecycle of the bridge transports.
#[async_trait]
pub trait BridgeTransport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Bring the transport up.
    async fn start(&self) -> anyhow::Result<()>;

    /// Tear the transport down. Idempotent.
    async fn stop(&self);

    /// Current state snapshot.
    fn state(&self) -> TransportState;

    /// Receiver notified on every state change.
    fn subscribe(&self) -> watch::Receiver<TransportState>;
}
