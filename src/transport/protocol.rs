//! Wire message types.
//!
//! The TCP channel carries command envelopes and [`CommandResponse`] objects
//! inside length-prefixed frames. The hub WebSocket carries
//! [`ClientMessage`] / [`ServerMessage`] envelopes as JSON text frames,
//! discriminated by their `type` field.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Protocol name announced in the TCP handshake.
pub const PROTOCOL_NAME: &str = "EDITOR-BRIDGE";

/// Protocol version announced in the TCP handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Literal payload answered directly by the listener, bypassing the queue.
pub const PING_PAYLOAD: &str = "ping";

/// Line written to every TCP client before the first frame.
pub fn handshake_line() -> String {
    format!("WELCOME {PROTOCOL_NAME} {PROTOCOL_VERSION} FRAMING=1\n")
}

/// A command as sent by the controller: `{"type": name, "params": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    #[serde(rename = "type", default)]
    pub name: String,
    #[serde(default = "empty_object")]
    pub params: Value,
}

impl CommandEnvelope {
    pub fn new(name: impl Into<String>, params: Value) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }

    pub fn to_json(&self) -> String {
        json!({ "type": self.name, "params": self.params }).to_string()
    }
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// Terminal response to one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(
        rename = "receivedText",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub received_text: Option<String>,
}

impl CommandResponse {
    pub fn success(result: Value) -> Self {
        Self {
            status: ResponseStatus::Success,
            result: Some(result),
            error: None,
            received_text: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            result: None,
            error: Some(message.into()),
            received_text: None,
        }
    }

    /// Fast-path answer to [`PING_PAYLOAD`].
    pub fn pong() -> Self {
        Self::success(json!({ "message": "pong" }))
    }

    /// Rejection of a payload that is not JSON, echoing a short preview.
    pub fn invalid_json(text: &str, preview_chars: usize) -> Self {
        let preview: String = text.chars().take(preview_chars).collect();
        Self {
            received_text: Some(format!("{preview}...")),
            ..Self::error("Invalid JSON format")
        }
    }

    pub fn timed_out(after: Duration) -> Self {
        Self::error(format!(
            "Command processing timed out after {} ms",
            after.as_millis()
        ))
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    pub fn to_value(&self) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert("status".into(), json!(self.status));
        if let Some(result) = &self.result {
            obj.insert("result".into(), result.clone());
        }
        if let Some(error) = &self.error {
            obj.insert("error".into(), json!(error));
        }
        if let Some(text) = &self.received_text {
            obj.insert("receivedText".into(), json!(text));
        }
        Value::Object(obj)
    }

    pub fn to_json(&self) -> String {
        self.to_value().to_string()
    }
}

/// Envelope sent from the bridge to the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Announce the project this host has open.
    Register {
        project_name: String,
        project_hash: String,
        #[serde(rename = "unity_version")]
        host_version: String,
        project_path: String,
    },
    /// Push the command catalogue.
    RegisterTools { tools: Vec<Value> },
    /// Application-level liveness frame.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    /// Result of an `execute` request, correlated by `id`.
    CommandResult { id: String, result: Value },
}

/// Envelope sent from the hub to the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Greeting with optional interval suggestions, in seconds.
    Welcome {
        #[serde(rename = "keepAliveInterval", default)]
        keep_alive_interval: Option<u64>,
        #[serde(rename = "serverTimeout", default)]
        server_timeout: Option<u64>,
    },
    /// Registration accepted.
    Registered { session_id: String },
    /// Run a command and reply with `command_result`.
    Execute {
        id: String,
        name: String,
        #[serde(default = "empty_object")]
        params: Value,
        /// Seconds.
        #[serde(default)]
        timeout: Option<f64>,
    },
    /// Liveness check; answered with `pong`.
    Ping,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_announces_framing() {
        assert_eq!(handshake_line(), "WELCOME EDITOR-BRIDGE 1 FRAMING=1\n");
    }

    #[test]
    fn pong_response_shape() {
        assert_eq!(
            CommandResponse::pong().to_value(),
            json!({ "status": "success", "result": { "message": "pong" } })
        );
    }

    #[test]
    fn invalid_json_preview_is_truncated() {
        let text = "x".repeat(80);
        let resp = CommandResponse::invalid_json(&text, 50);
        let value = resp.to_value();
        assert_eq!(value["status"], "error");
        assert_eq!(value["error"], "Invalid JSON format");
        assert_eq!(value["receivedText"], format!("{}...", "x".repeat(50)));
        assert!(value.get("result").is_none());
    }

    #[test]
    fn invalid_json_preview_respects_char_boundaries() {
        let resp = CommandResponse::invalid_json("héllo wörld", 2);
        assert_eq!(resp.received_text.as_deref(), Some("hé..."));
    }

    #[test]
    fn timeout_message_uses_millis() {
        let resp = CommandResponse::timed_out(Duration::from_secs(30));
        assert_eq!(
            resp.error.as_deref(),
            Some("Command processing timed out after 30000 ms")
        );
    }

    #[test]
    fn response_json_parses_back() {
        let resp = CommandResponse::error("boom");
        let parsed: CommandResponse = serde_json::from_str(&resp.to_json()).unwrap();
        assert_eq!(parsed, resp);
        assert!(!parsed.is_success());
    }

    #[test]
    fn envelope_defaults() {
        let env: CommandEnvelope = serde_json::from_str(r#"{"type":"echo"}"#).unwrap();
        assert_eq!(env.name, "echo");
        assert_eq!(env.params, json!({}));

        let env: CommandEnvelope = serde_json::from_str(r#"{"params":{}}"#).unwrap();
        assert!(env.name.is_empty());
    }

    #[test]
    fn register_uses_host_version_wire_name() {
        let msg = ClientMessage::Register {
            project_name: "game".into(),
            project_hash: "abcd1234".into(),
            host_version: "2022.3".into(),
            project_path: "/work/game".into(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "register");
        assert_eq!(value["unity_version"], "2022.3");
        assert!(value.get("host_version").is_none());
    }

    #[test]
    fn pong_omits_missing_session() {
        let json = serde_json::to_string(&ClientMessage::Pong { session_id: None }).unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);
    }

    #[test]
    fn parse_server_messages() {
        let welcome: ServerMessage =
            serde_json::from_str(r#"{"type":"welcome","keepAliveInterval":5}"#).unwrap();
        assert_eq!(
            welcome,
            ServerMessage::Welcome {
                keep_alive_interval: Some(5),
                server_timeout: None
            }
        );

        let exec: ServerMessage = serde_json::from_str(
            r#"{"type":"execute","id":"42","name":"echo","params":{"x":1},"timeout":2.5}"#,
        )
        .unwrap();
        match exec {
            ServerMessage::Execute { id, name, params, timeout } => {
                assert_eq!(id, "42");
                assert_eq!(name, "echo");
                assert_eq!(params["x"], 1);
                assert_eq!(timeout, Some(2.5));
            }
            other => panic!("Expected Execute, got: {other:?}"),
        }

        let ping: ServerMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(ping, ServerMessage::Ping);

        assert!(serde_json::from_str::<ServerMessage>(r#"{"type":"mystery"}"#).is_err());
    }
}
