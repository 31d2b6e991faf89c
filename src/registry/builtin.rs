//! Commands the standalone bridge binary serves.
//!
//! A real host plugs in its own [`CommandHandler`]; these exist so the
//! binary is useful on its own for smoke-testing a controller.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::{CommandError, CommandHandler, ToolDescriptor};
use crate::config::ProjectIdentity;

/// Built-in command set: `echo`, `get_host_info`, `list_commands`, `sleep`.
#[derive(Debug, Clone)]
pub struct BuiltinCommands {
    project: ProjectIdentity,
    started: Instant,
}

impl BuiltinCommands {
    pub fn new(project: ProjectIdentity) -> Self {
        Self {
            project,
            started: Instant::now(),
        }
    }

    fn host_info(&self) -> Value {
        json!({
            "project_name": self.project.name,
            "project_path": self.project.path_string(),
            "project_hash": self.project.hash(),
            "host_version": self.project.host_version,
            "uptime_secs": self.started.elapsed().as_secs(),
            "thread": std::thread::current().name().unwrap_or("unnamed"),
        })
    }

    async fn sleep(params: &Value, cancel: CancellationToken) -> Result<Value, CommandError> {
        let ms = params
            .get("ms")
            .and_then(Value::as_u64)
            .ok_or_else(|| CommandError::InvalidParams("'ms' must be a non-negative integer".into()))?;

        tokio::select! {
            () = cancel.cancelled() => Err(CommandError::Cancelled),
            () = tokio::time::sleep(Duration::from_millis(ms)) => Ok(json!({ "slept_ms": ms })),
        }
    }
}

#[async_trait(?Send)]
impl CommandHandler for BuiltinCommands {
    #[instrument(skip(self, params, cancel))]
    async fn execute(
        &self,
        name: &str,
        params: Value,
        cancel: CancellationToken,
    ) -> Result<Value, CommandError> {
        debug!("Executing built-in command");
        match name {
            "echo" => Ok(params),
            "get_host_info" => Ok(self.host_info()),
            "list_commands" => {
                let names: Vec<String> = self.catalogue().into_iter().map(|t| t.name).collect();
                Ok(json!({ "commands": names }))
            }
            "sleep" => Self::sleep(&params, cancel).await,
            other => Err(CommandError::UnknownCommand(other.to_string())),
        }
    }

    fn catalogue(&self) -> Vec<ToolDescriptor> {
        vec![
            ToolDescriptor {
                name: "echo".into(),
                description: "Return the parameters unchanged".into(),
                parameters: json!({ "type": "object" }),
            },
            ToolDescriptor {
                name: "get_host_info".into(),
                description: "Describe the host and the open project".into(),
                parameters: json!({ "type": "object", "properties": {} }),
            },
            ToolDescriptor {
                name: "list_commands".into(),
                description: "List the commands this host accepts".into(),
                parameters: json!({ "type": "object", "properties": {} }),
            },
            ToolDescriptor {
                name: "sleep".into(),
                description: "Wait on the host thread for the given milliseconds".into(),
                parameters: json!({
                    "type": "object",
                    "properties": { "ms": { "type": "integer", "minimum": 0 } },
                    "required": ["ms"]
                }),
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commands() -> BuiltinCommands {
        BuiltinCommands::new(ProjectIdentity::new("/work/demo".into(), None, "1.2.3"))
    }

    #[tokio::test]
    async fn echo_returns_params() {
        let params = json!({ "a": 1, "b": [true, null] });
        let result = commands()
            .execute("echo", params.clone(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, params);
    }

    #[tokio::test]
    async fn host_info_describes_project() {
        let result = commands()
            .execute("get_host_info", json!({}), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result["project_name"], "demo");
        assert_eq!(result["host_version"], "1.2.3");
        assert_eq!(result["project_hash"].as_str().unwrap().len(), 8);
    }

    #[tokio::test]
    async fn list_commands_matches_catalogue() {
        let result = commands()
            .execute("list_commands", json!({}), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            result["commands"],
            json!(["echo", "get_host_info", "list_commands", "sleep"])
        );
    }

    #[tokio::test]
    async fn unknown_command_is_rejected() {
        let err = commands()
            .execute("delete_everything", json!({}), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::UnknownCommand(ref n) if n == "delete_everything"));
        assert_eq!(err.to_string(), "Unknown command: 'delete_everything'");
    }

    #[tokio::test]
    async fn sleep_validates_and_honours_cancel() {
        let err = commands()
            .execute("sleep", json!({ "ms": "soon" }), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::InvalidParams(_)));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = commands()
            .execute("sleep", json!({ "ms": 60_000 }), cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Cancelled));
    }
}
