//! Command handler registry.
//!
//! The transports never interpret commands themselves. They hand a command
//! name and its JSON parameters to a [`CommandHandler`], which runs on the
//! host thread and returns a JSON result or a typed failure.

mod builtin;

pub use builtin::BuiltinCommands;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Failure reported by a command handler.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Unknown command: '{0}'")]
    UnknownCommand(String),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Command cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

/// One entry of the catalogue pushed to the hub after registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON schema of the parameters object.
    #[serde(default)]
    pub parameters: Value,
}

/// Executes named commands on the host thread.
///
/// Futures returned by [`Self::execute`] are polled on the host thread's
/// `LocalSet`, so they may hold non-`Send` host state across awaits.
#[async_trait(?Send)]
pub trait CommandHandler: Send + Sync {
    /// Execute `name` with `params`.
    ///
    /// `cancel` fires when the caller stops waiting (timeout or shutdown).
    async fn execute(
        &self,
        name: &str,
        params: Value,
        cancel: CancellationToken,
    ) -> Result<Value, CommandError>;

    /// Commands this handler offers, for clients that want a catalogue.
    fn catalogue(&self) -> Vec<ToolDescriptor> {
        Vec::new()
    }
}
