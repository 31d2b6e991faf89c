//! Port selection for the TCP listener.
//!
//! The listener asks a [`PortDiscovery`] for its preferred port and, when
//! that port stays busy, for a fallback, which it then persists so the next
//! launch starts there.

use std::net::{Ipv4Addr, TcpListener};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ProjectIdentity;

/// How many ports above the default are tried before asking the OS.
const SCAN_RANGE: u16 = 100;

/// Source of listener ports.
pub trait PortDiscovery: Send + Sync {
    /// Port to try first.
    fn preferred_port(&self) -> u16;

    /// A port other than `busy` that is free right now.
    fn fallback_port(&self, busy: u16) -> Result<u16>;

    /// Remember `port` for the next launch.
    fn persist(&self, port: u16) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct PortFile {
    unity_port: u16,
    created_date: String,
}

/// File-backed [`PortDiscovery`] keyed by project hash.
#[derive(Debug, Clone)]
pub struct PortRegistry {
    file: PathBuf,
    default_port: u16,
}

impl PortRegistry {
    pub fn new(state_dir: &Path, project: &ProjectIdentity, default_port: u16) -> Self {
        Self {
            file: state_dir.join(format!("bridge-port-{}.json", project.hash())),
            default_port,
        }
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    fn stored_port(&self) -> Option<u16> {
        let text = std::fs::read_to_string(&self.file).ok()?;
        match serde_json::from_str::<PortFile>(&text) {
            Ok(stored) => Some(stored.unity_port),
            Err(e) => {
                debug!(path = %self.file.display(), error = %e, "Ignoring unreadable port file");
                None
            }
        }
    }
}

/// Whether `port` can be bound on loopback right now.
pub fn is_port_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

impl PortDiscovery for PortRegistry {
    fn preferred_port(&self) -> u16 {
        self.stored_port().unwrap_or(self.default_port)
    }

    fn fallback_port(&self, busy: u16) -> Result<u16> {
        let start = self.default_port;
        let end = start.saturating_add(SCAN_RANGE);
        if let Some(port) = (start..=end).filter(|p| *p != busy && *p != 0).find(|p| is_port_free(*p)) {
            return Ok(port);
        }

        // Whole range taken; let the OS pick
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .context("Failed to allocate an ephemeral port")?;
        Ok(listener.local_addr()?.port())
    }

    fn persist(&self, port: u16) -> Result<()> {
        if let Some(parent) = self.file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let record = PortFile {
            unity_port: port,
            created_date: chrono::Utc::now().to_rfc3339(),
        };
        std::fs::write(&self.file, serde_json::to_vec_pretty(&record)?)
            .with_context(|| format!("Failed to write port file: {}", self.file.display()))?;
        info!(port, path = %self.file.display(), "Saved listener port");
        Ok(())
    }
}
