//! Status file for out-of-band port discovery.
//!
//! While the TCP listener runs, a small JSON record is rewritten on every
//! heartbeat interval at a path derived from the project hash. A controller
//! that knows only the project path can find the live port there. The file
//! is removed on clean shutdown.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ProjectIdentity;
use crate::host::{HostHandle, IdleControl, MarshalError};
use crate::sync::lock;

/// Contents of the status file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    #[serde(rename = "unity_port")]
    pub port: u16,
    pub reloading: bool,
    pub reason: String,
    #[serde(rename = "seq")]
    pub sequence: u64,
    pub project_path: String,
    pub project_name: String,
    #[serde(rename = "unity_version")]
    pub host_version: String,
    #[serde(rename = "last_heartbeat")]
    pub timestamp_utc: String,
}

impl HeartbeatRecord {
    /// Read a status file, as a controller would.
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read status file: {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse status file: {}", path.display()))
    }
}

#[derive(Debug)]
struct EmitterState {
    port: u16,
    sequence: u64,
    active: bool,
    reloading: bool,
    reason: String,
}

/// Sole writer of the status file.
#[derive(Debug)]
pub struct HeartbeatEmitter {
    path: PathBuf,
    project: ProjectIdentity,
    state: Mutex<EmitterState>,
}

impl HeartbeatEmitter {
    pub fn new(state_dir: &Path, project: ProjectIdentity) -> Self {
        Self {
            path: Self::status_path(state_dir, &project),
            project,
            state: Mutex::new(EmitterState {
                port: 0,
                sequence: 0,
                active: false,
                reloading: false,
                reason: "ready".to_string(),
            }),
        }
    }

    /// Deterministic status file location for a project.
    pub fn status_path(state_dir: &Path, project: &ProjectIdentity) -> PathBuf {
        state_dir.join(format!("bridge-status-{}.json", project.hash()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last sequence number written.
    pub fn sequence(&self) -> u64 {
        lock(&self.state).sequence
    }

    /// Start reporting `port`. Writes are ignored until activated.
    pub fn activate(&self, port: u16) {
        let mut state = lock(&self.state);
        state.port = port;
        state.active = true;
        state.reloading = false;
        state.reason = "ready".to_string();
    }

    /// Record a new status and write it immediately. Best-effort.
    pub fn write(&self, reloading: bool, reason: &str) {
        let mut state = lock(&self.state);
        state.reloading = reloading;
        state.reason = reason.to_string();
        self.write_locked(&mut state);
    }

    /// Rewrite the current status with a fresh sequence and timestamp.
    pub fn beat(&self) {
        let mut state = lock(&self.state);
        self.write_locked(&mut state);
    }

    /// Stop reporting and delete the file.
    pub fn clear(&self) {
        let mut state = lock(&self.state);
        state.active = false;
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed status file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove status file"),
        }
    }

    fn write_locked(&self, state: &mut EmitterState) {
        if !state.active {
            return;
        }
        state.sequence += 1;
        let record = HeartbeatRecord {
            port: state.port,
            reloading: state.reloading,
            reason: state.reason.clone(),
            sequence: state.sequence,
            project_path: self.project.path_string(),
            project_name: self.project.name.clone(),
            host_version: self.project.host_version.clone(),
            timestamp_utc: chrono::Utc::now().to_rfc3339(),
        };
        if let Err(e) = self.persist(&record) {
            debug!(error = %format!("{e:#}"), "Heartbeat write failed");
        }
    }

    /// Write via a temp file and rename, so readers never see a torn record.
    fn persist(&self, record: &HeartbeatRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(record)?;
        std::fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }

    /// Beat from the host's idle tick every `interval` until `stop` fires.
    pub fn schedule(
        self: &Arc<Self>,
        host: &HostHandle,
        interval: Duration,
        stop: CancellationToken,
    ) -> Result<(), MarshalError> {
        let emitter = Arc::clone(self);
        let mut last = Instant::now();
        host.on_idle(move || {
            if stop.is_cancelled() {
                return IdleControl::Remove;
            }
            if last.elapsed() >= interval {
                emitter.beat();
                last = Instant::now();
            }
            IdleControl::Continue
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostRuntime;

    fn emitter(dir: &Path) -> HeartbeatEmitter {
        let project = ProjectIdentity::new("/work/game".into(), None, "2022.3.1f1");
        HeartbeatEmitter::new(dir, project)
    }

    #[test]
    fn path_is_keyed_by_project_hash() {
        let dir = tempfile::tempdir().unwrap();
        let hb = emitter(dir.path());
        let name = hb.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("bridge-status-"));
        assert!(name.ends_with(".json"));
        assert_eq!(
            hb.path(),
            HeartbeatEmitter::status_path(dir.path(), &hb.project)
        );
    }

    #[test]
    fn inactive_emitter_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let hb = emitter(dir.path());
        hb.write(false, "ready");
        assert!(!hb.path().exists());
        assert_eq!(hb.sequence(), 0);
    }

    #[test]
    fn write_produces_wire_format() {
        let dir = tempfile::tempdir().unwrap();
        let hb = emitter(dir.path());
        hb.activate(6401);
        hb.write(false, "ready");

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(hb.path()).unwrap()).unwrap();
        assert_eq!(raw["unity_port"], 6401);
        assert_eq!(raw["reloading"], false);
        assert_eq!(raw["reason"], "ready");
        assert_eq!(raw["seq"], 1);
        assert_eq!(raw["project_path"], "/work/game");
        assert_eq!(raw["project_name"], "game");
        assert_eq!(raw["unity_version"], "2022.3.1f1");
        assert!(chrono::DateTime::parse_from_rfc3339(raw["last_heartbeat"].as_str().unwrap()).is_ok());
    }

    #[test]
    fn sequence_increases_and_status_sticks() {
        let dir = tempfile::tempdir().unwrap();
        let hb = emitter(dir.path());
        hb.activate(7000);
        hb.write(true, "reloading");
        hb.beat();

        let record = HeartbeatRecord::read(hb.path()).unwrap();
        assert_eq!(record.sequence, 2);
        assert!(record.reloading);
        assert_eq!(record.reason, "reloading");
    }

    #[test]
    fn clear_deletes_and_blocks_later_writes() {
        let dir = tempfile::tempdir().unwrap();
        let hb = emitter(dir.path());
        hb.activate(7000);
        hb.beat();
        assert!(hb.path().exists());

        hb.clear();
        hb.clear();
        assert!(!hb.path().exists());

        hb.beat();
        assert!(!hb.path().exists());
    }

    #[tokio::test]
    async fn schedule_beats_from_host_tick_until_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let hb = Arc::new(emitter(dir.path()));
        hb.activate(7100);

        let host = HostRuntime::spawn(Duration::from_millis(5)).unwrap();
        let stop = CancellationToken::new();
        hb.schedule(&host.handle(), Duration::from_millis(20), stop.clone())
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let seen = hb.sequence();
        assert!(seen >= 3, "expected several beats, saw {seen}");

        stop.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let after_stop = hb.sequence();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hb.sequence(), after_stop);
    }
}
