//! Bridge configuration.
//!
//! Values come from built-in defaults, an optional JSON file (path from
//! `--config` or the `EDITOR_BRIDGE_CONFIG` environment variable) and a few
//! individual environment overrides. Durations are stored as plain integers
//! and converted on access.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Top-level configuration for the bridge.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeConfig {
    /// Identity of the project the host has open.
    #[serde(default)]
    pub project: ProjectConfig,

    /// Framed TCP listener settings.
    #[serde(default)]
    pub tcp: TcpConfig,

    /// Host cooperative thread settings.
    #[serde(default)]
    pub host: HostConfig,

    /// Status file settings.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// WebSocket hub client settings.
    #[serde(default)]
    pub websocket: WebSocketConfig,

    /// Directory holding status, port and session files.
    /// Defaults to `~/.editor-bridge`.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

/// Project identity as read from configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    /// Path to the open project.
    #[serde(default = "default_project_path")]
    pub path: PathBuf,

    /// Display name. Defaults to the last path component.
    #[serde(default)]
    pub name: Option<String>,

    /// Version string reported for the host application.
    #[serde(default = "default_host_version")]
    pub host_version: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            path: default_project_path(),
            name: None,
            host_version: default_host_version(),
        }
    }
}

/// Framed TCP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TcpConfig {
    /// Port used when no port has been persisted for this project.
    #[serde(default = "default_port")]
    pub default_port: u16,

    /// Explicit port, bypassing the persisted one.
    #[serde(default)]
    pub port: Option<u16>,

    /// Deadline for reading or writing one whole frame.
    #[serde(default = "default_io_timeout_ms")]
    pub frame_io_timeout_ms: u64,

    /// Deadline for one command, from enqueue to result.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Extra bind attempts on "address in use" before falling back.
    #[serde(default = "default_bind_retries")]
    pub bind_retries: u32,

    /// Sleep between bind attempts.
    #[serde(default = "default_bind_retry_delay_ms")]
    pub bind_retry_delay_ms: u64,

    /// Characters of an unparseable payload echoed back in the error.
    #[serde(default = "default_preview_chars")]
    pub invalid_json_preview_chars: usize,

    /// Bound on waiting for background tasks during `stop()`.
    #[serde(default = "default_stop_wait_ms")]
    pub stop_wait_ms: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            default_port: default_port(),
            port: None,
            frame_io_timeout_ms: default_io_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            bind_retries: default_bind_retries(),
            bind_retry_delay_ms: default_bind_retry_delay_ms(),
            invalid_json_preview_chars: default_preview_chars(),
            stop_wait_ms: default_stop_wait_ms(),
        }
    }
}

impl TcpConfig {
    pub const fn frame_io_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_io_timeout_ms)
    }

    pub const fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub const fn bind_retry_delay(&self) -> Duration {
        Duration::from_millis(self.bind_retry_delay_ms)
    }

    pub const fn stop_wait(&self) -> Duration {
        Duration::from_millis(self.stop_wait_ms)
    }
}

/// Host cooperative thread configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    /// Interval between idle ticks.
    #[serde(default = "default_tick_ms")]
    pub tick_interval_ms: u64,

    /// Bound on a single marshaled call.
    #[serde(default = "default_marshal_timeout_ms")]
    pub marshal_timeout_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_ms(),
            marshal_timeout_ms: default_marshal_timeout_ms(),
        }
    }
}

impl HostConfig {
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub const fn marshal_timeout(&self) -> Duration {
        Duration::from_millis(self.marshal_timeout_ms)
    }
}

/// Status file configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    /// How often the status file is rewritten.
    #[serde(default = "default_heartbeat_ms")]
    pub interval_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_ms(),
        }
    }
}

impl HeartbeatConfig {
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// WebSocket hub client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketConfig {
    /// Hub endpoint. The client is disabled when unset.
    #[serde(default)]
    pub url: Option<String>,

    /// Optional bearer token sent in the `Authorization` header.
    #[serde(default)]
    pub token: Option<String>,

    /// Keep-alive interval until the server suggests another.
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    /// Server liveness timeout until the server suggests another.
    #[serde(default = "default_server_timeout_secs")]
    pub server_timeout_secs: u64,

    /// Delays between reconnection attempts, in seconds.
    #[serde(default = "default_reconnect_schedule")]
    pub reconnect_schedule_secs: Vec<u64>,

    /// Bound on opening the socket.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Default bound for `execute` requests that carry no timeout.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Bound on waiting for background tasks during `stop()`.
    #[serde(default = "default_stop_wait_ms")]
    pub stop_wait_ms: u64,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            keep_alive_secs: default_keep_alive_secs(),
            server_timeout_secs: default_server_timeout_secs(),
            reconnect_schedule_secs: default_reconnect_schedule(),
            connect_timeout_secs: default_connect_timeout_secs(),
            command_timeout_ms: default_command_timeout_ms(),
            stop_wait_ms: default_stop_wait_ms(),
        }
    }
}

impl WebSocketConfig {
    pub const fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub const fn server_timeout(&self) -> Duration {
        Duration::from_secs(self.server_timeout_secs)
    }

    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub const fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub const fn stop_wait(&self) -> Duration {
        Duration::from_millis(self.stop_wait_ms)
    }

    /// Reconnection delays as durations.
    pub fn reconnect_schedule(&self) -> Vec<Duration> {
        self.reconnect_schedule_secs
            .iter()
            .copied()
            .map(Duration::from_secs)
            .collect()
    }
}

impl BridgeConfig {
    /// Load configuration from the environment.
    ///
    /// Reads the JSON file named by `EDITOR_BRIDGE_CONFIG` when set, then
    /// applies `EDITOR_BRIDGE_PORT`, `EDITOR_BRIDGE_WS_URL` and
    /// `EDITOR_BRIDGE_WS_TOKEN`.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("EDITOR_BRIDGE_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration for the binary.
    ///
    /// `explicit` (from `--config`) takes precedence over
    /// `EDITOR_BRIDGE_CONFIG`; environment overrides apply either way.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let Some(path) = explicit else {
            return Self::from_env();
        };
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_json(&text)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("EDITOR_BRIDGE_PORT") {
            match port.parse() {
                Ok(port) => self.tcp.port = Some(port),
                Err(e) => warn!(value = %port, error = %e, "Ignoring invalid EDITOR_BRIDGE_PORT"),
            }
        }
        if let Ok(url) = std::env::var("EDITOR_BRIDGE_WS_URL") {
            self.websocket.url = Some(url);
        }
        if let Ok(token) = std::env::var("EDITOR_BRIDGE_WS_TOKEN") {
            self.websocket.token = Some(token);
        }
    }

    /// Resolve the state directory, creating it if needed.
    pub fn resolved_state_dir(&self) -> Result<PathBuf> {
        let dir = match &self.state_dir {
            Some(dir) => dir.clone(),
            None => dirs::home_dir()
                .context("Cannot determine home directory for state files")?
                .join(".editor-bridge"),
        };
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;
        debug!(path = %dir.display(), "Using state directory");
        Ok(dir)
    }

    /// Build the project identity, resolving the path to an absolute one.
    pub fn project_identity(&self) -> ProjectIdentity {
        let path = if self.project.path.is_absolute() {
            self.project.path.clone()
        } else {
            std::env::current_dir()
                .unwrap_or_default()
                .join(&self.project.path)
        };
        ProjectIdentity::new(path, self.project.name.clone(), &self.project.host_version)
    }
}

/// The project a host instance has open.
///
/// The hash keys every file the bridge writes, so two hosts with different
/// projects never collide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectIdentity {
    pub path: PathBuf,
    pub name: String,
    pub host_version: String,
}

impl ProjectIdentity {
    pub fn new(path: PathBuf, name: Option<String>, host_version: &str) -> Self {
        let name = name.unwrap_or_else(|| {
            path.file_name()
                .map_or_else(|| "project".to_string(), |n| n.to_string_lossy().into_owned())
        });
        Self {
            path,
            name,
            host_version: host_version.to_string(),
        }
    }

    /// Stable short hash of the project path (8 hex chars).
    pub fn hash(&self) -> String {
        let digest = Sha256::digest(self.path.to_string_lossy().as_bytes());
        digest.iter().take(4).map(|b| format!("{b:02x}")).collect()
    }

    pub fn path_string(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }
}

fn default_project_path() -> PathBuf {
    ".".into()
}

fn default_host_version() -> String {
    env!("CARGO_PKG_VERSION").into()
}

const fn default_port() -> u16 {
    6400
}

const fn default_io_timeout_ms() -> u64 {
    30_000
}

const fn default_command_timeout_ms() -> u64 {
    30_000
}

const fn default_bind_retries() -> u32 {
    3
}

const fn default_bind_retry_delay_ms() -> u64 {
    75
}

const fn default_preview_chars() -> usize {
    50
}

const fn default_stop_wait_ms() -> u64 {
    2_000
}

const fn default_tick_ms() -> u64 {
    10
}

const fn default_marshal_timeout_ms() -> u64 {
    30_000
}

const fn default_heartbeat_ms() -> u64 {
    500
}

const fn default_keep_alive_secs() -> u64 {
    15
}

const fn default_server_timeout_secs() -> u64 {
    30
}

fn default_reconnect_schedule() -> Vec<u64> {
    vec![0, 1, 3, 5, 10, 30]
}

const fn default_connect_timeout_secs() -> u64 {
    10
}
