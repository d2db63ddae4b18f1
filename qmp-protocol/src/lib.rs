//! Wire-format types for the QEMU Machine Protocol (QMP).
//!
//! The host side of cxl-fleet talks to every VM's monitor socket with these
//! types. QMP is newline-delimited JSON over a unix stream:
//!
//! ```text
//! server: {"QMP": {"version": {...}, "capabilities": [...]}}
//! client: {"execute": "qmp_capabilities"}
//! server: {"return": {}}
//! client: {"execute": "query-cpus-fast"}
//! server: {"return": [{"cpu-index": 0, "thread-id": 4242, ...}]}
//! ```
//!
//! Asynchronous `{"event": ...}` lines may arrive between a command and its
//! reply; readers are expected to skip them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors that can occur while decoding QMP lines.
#[derive(Debug)]
pub enum ProtocolError {
    /// The line is valid JSON but not a QMP message we understand.
    InvalidMessage(String),
    /// The server answered a command with an error object.
    CommandFailed { class: String, desc: String },
    /// JSON (de)serialization failed.
    Json(serde_json::Error),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::InvalidMessage(msg) => write!(f, "Invalid QMP message: {}", msg),
            ProtocolError::CommandFailed { class, desc } => {
                write!(f, "QMP command failed ({}): {}", class, desc)
            }
            ProtocolError::Json(e) => write!(f, "JSON error: {}", e),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Json(e)
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Capability negotiation command; must be the first command on a session.
pub const QMP_CAPABILITIES: &str = "qmp_capabilities";

/// Lists vCPUs without interrupting them.
pub const QUERY_CPUS_FAST: &str = "query-cpus-fast";

/// A command envelope sent by the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Command {
    pub execute: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl Command {
    pub fn new(execute: impl Into<String>) -> Self {
        Self {
            execute: execute.into(),
            arguments: None,
            id: None,
        }
    }

    pub fn with_arguments(mut self, arguments: Value) -> Self {
        self.arguments = Some(arguments);
        self
    }

    /// Encode as a single protocol line, including the trailing newline.
    pub fn to_line(&self) -> Result<String, ProtocolError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

// ---------------------------------------------------------------------------
// Server messages
// ---------------------------------------------------------------------------

/// Greeting banner sent by the server on connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Greeting {
    #[serde(rename = "QMP")]
    pub qmp: GreetingBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GreetingBody {
    #[serde(default)]
    pub version: Value,
    #[serde(default)]
    pub capabilities: Vec<Value>,
}

/// Error object carried by a failed command reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub class: String,
    #[serde(default)]
    pub desc: String,
}

/// Any line the server may send after the greeting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Return {
        #[serde(rename = "return")]
        ret: Value,
        #[serde(default)]
        id: Option<Value>,
    },
    Error {
        error: ErrorBody,
        #[serde(default)]
        id: Option<Value>,
    },
    Event {
        event: String,
        #[serde(default)]
        data: Option<Value>,
        #[serde(default)]
        timestamp: Option<Value>,
    },
    Greeting(Greeting),
}

impl ServerMessage {
    /// Parse one protocol line.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Err(ProtocolError::InvalidMessage("empty line".into()));
        }
        serde_json::from_str(trimmed)
            .map_err(|e| ProtocolError::InvalidMessage(format!("{}: {}", e, trimmed)))
    }

    /// Convert a command reply into its return value.
    ///
    /// Events and greetings are not replies and yield `InvalidMessage`.
    pub fn into_result(self) -> Result<Value, ProtocolError> {
        match self {
            ServerMessage::Return { ret, .. } => Ok(ret),
            ServerMessage::Error { error, .. } => Err(ProtocolError::CommandFailed {
                class: error.class,
                desc: error.desc,
            }),
            ServerMessage::Event { event, .. } => Err(ProtocolError::InvalidMessage(format!(
                "unexpected event {} where a reply was expected",
                event
            ))),
            ServerMessage::Greeting(_) => Err(ProtocolError::InvalidMessage(
                "unexpected greeting where a reply was expected".into(),
            )),
        }
    }

    pub fn is_event(&self) -> bool {
        matches!(self, ServerMessage::Event { .. })
    }
}

// ---------------------------------------------------------------------------
// query-cpus-fast
// ---------------------------------------------------------------------------

/// One entry of the `query-cpus-fast` reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CpuInfoFast {
    /// Guest-visible vCPU index.
    #[serde(rename = "cpu-index")]
    pub cpu_index: u32,
    /// Host thread id of the vCPU thread.
    #[serde(rename = "thread-id")]
    pub thread_id: i64,
    #[serde(rename = "qom-path", default)]
    pub qom_path: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
}

/// Decode the return value of `query-cpus-fast`.
pub fn parse_cpus_fast(ret: Value) -> Result<Vec<CpuInfoFast>, ProtocolError> {
    Ok(serde_json::from_value(ret)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_encoding() {
        let line = Command::new(QUERY_CPUS_FAST).to_line().unwrap();
        assert_eq!(line, "{\"execute\":\"query-cpus-fast\"}\n");
    }

    #[test]
    fn test_parse_greeting() {
        let msg = ServerMessage::parse(
            r#"{"QMP": {"version": {"qemu": {"micro": 0, "minor": 2, "major": 8}}, "capabilities": ["oob"]}}"#,
        )
        .unwrap();
        assert!(matches!(msg, ServerMessage::Greeting(_)));
    }

    #[test]
    fn test_parse_error_reply() {
        let msg = ServerMessage::parse(
            r#"{"error": {"class": "CommandNotFound", "desc": "The command foo has not been found"}}"#,
        )
        .unwrap();
        match msg.into_result() {
            Err(ProtocolError::CommandFailed { class, .. }) => assert_eq!(class, "CommandNotFound"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_event_is_not_a_reply() {
        let msg = ServerMessage::parse(
            r#"{"event": "RTC_CHANGE", "data": {"offset": 0}, "timestamp": {"seconds": 1, "microseconds": 2}}"#,
        )
        .unwrap();
        assert!(msg.is_event());
        assert!(msg.into_result().is_err());
    }

    #[test]
    fn test_parse_cpus_fast() {
        let msg = ServerMessage::parse(
            r#"{"return": [{"cpu-index": 0, "thread-id": 1001, "qom-path": "/machine/unattached/device[0]", "target": "x86_64", "props": {"core-id": 0}},
                           {"cpu-index": 1, "thread-id": 1002, "target": "x86_64"}]}"#,
        )
        .unwrap();
        let cpus = parse_cpus_fast(msg.into_result().unwrap()).unwrap();
        assert_eq!(cpus.len(), 2);
        assert_eq!(cpus[1].cpu_index, 1);
        assert_eq!(cpus[1].thread_id, 1002);
    }

    #[test]
    fn test_empty_line_rejected() {
        assert!(ServerMessage::parse("   ").is_err());
    }
}
