//! Wire protocol types for the control connection.
//!
//! Everything exchanged with the server is a JSON envelope tagged by `type`,
//! except two literal text frames: `"ping"` and `"pong"`, the liveness fast
//! path. Field names are `camelCase` on the wire.
//!
//! Outbound envelope shapes:
//!
//! | Type     | Fields                                              |
//! |----------|-----------------------------------------------------|
//! | `hello`  | `clientId`, `ts`, `payload.{device,platform}`       |
//! | `log`    | `sessionId`, `seq`, `payload.{stream,message}`      |
//! | `status` | `sessionId`, `payload.state`                        |
//!
//! Inbound envelopes are `control`, `ack {id}`, and `ping`; anything
//! unparseable or unrecognized is dropped without closing the connection.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Origin stream of a captured output line.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    /// Child process standard output.
    Stdout,
    /// Child process standard error.
    Stderr,
    /// Client-generated diagnostic line.
    System,
}

impl LogStream {
    /// Lowercase wire name of the stream.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::System => "system",
        }
    }
}

/// Lifecycle state reported to the server for one agent process.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    /// Process spawned and running.
    Running,
    /// Process exited (any exit code).
    Exited,
    /// Process could not be started or failed irrecoverably.
    Error,
}

impl AgentState {
    /// Lowercase wire name of the state.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Error => "error",
        }
    }
}

/// One captured output line, identified and timestamped.
///
/// Ids are assigned from a single monotonically increasing counter and are
/// never reused; insertion order in the [`LogBuffer`](crate::log_buffer::LogBuffer)
/// equals id order. The entry is immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Monotonically increasing id, starting at 1.
    pub id: u64,
    /// Agent session the line belongs to; used as `sessionId` on replay.
    pub agent_id: String,
    /// ISO-8601 creation timestamp.
    pub at: String,
    /// Stream the line was read from.
    pub stream: LogStream,
    /// Line content, including its trailing newline when one was read.
    pub message: String,
}

impl LogEntry {
    /// Create an entry timestamped now.
    #[must_use]
    pub fn new(id: u64, agent_id: impl Into<String>, stream: LogStream, message: impl Into<String>) -> Self {
        Self {
            id,
            agent_id: agent_id.into(),
            at: now_iso(),
            stream,
            message: message.into(),
        }
    }
}

/// Control verb requested by the server.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    /// Start a new agent process (or feed an existing one).
    Spawn,
    /// Alias of `spawn`.
    Start,
    /// Terminate the named agent process.
    Stop,
    /// Feed data to the process standard input.
    Stdin,
    /// Feed a prompt to the process standard input.
    Prompt,
    /// Application-level ping; no action taken.
    Ping,
}

/// Optional structured payload of a control message.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPayload {
    /// Prompt text for spawn/feed actions.
    #[serde(default)]
    pub prompt: Option<String>,
    /// Extra argv entries for the agent CLI.
    #[serde(default)]
    pub args: Option<Vec<String>>,
    /// Target model name; drives backend selection.
    #[serde(default)]
    pub model: Option<String>,
    /// Preferred backend name (`codex`, `gemini`, `claude`).
    #[serde(default)]
    pub name: Option<String>,
}

/// Inbound `control` envelope dispatched to the supervisor.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlMessage {
    /// Requested verb.
    pub action: ControlAction,
    /// Target agent session id. Messages without one are ignored.
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Raw stdin data for `stdin` actions.
    #[serde(default)]
    pub data: Option<String>,
    /// Structured payload.
    #[serde(default)]
    pub payload: Option<ControlPayload>,
}

/// A decoded inbound frame.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    /// Literal `"ping"` or a JSON `ping` envelope; answer with literal `"pong"`.
    Ping,
    /// Literal `"pong"`; absorbed (it already reset the liveness timer).
    Pong,
    /// Server control request.
    Control(ControlMessage),
    /// Acknowledgment of all log entries up to and including `id`.
    Ack(u64),
}

/// Decode one inbound text frame.
///
/// Returns `None` for empty, malformed, or unrecognized frames — the
/// protocol contract is that bad input is dropped silently and must never
/// take the connection down.
#[must_use]
pub fn parse_inbound(raw: &str) -> Option<InboundFrame> {
    // Literal heartbeat fast path, checked before any JSON work.
    if raw == "ping" {
        return Some(InboundFrame::Ping);
    }
    if raw == "pong" {
        return Some(InboundFrame::Pong);
    }
    if raw.trim().is_empty() {
        return None;
    }

    let value: Value = serde_json::from_str(raw).ok()?;
    match value.get("type").and_then(Value::as_str)? {
        "control" => serde_json::from_value(value)
            .ok()
            .map(InboundFrame::Control),
        "ping" => Some(InboundFrame::Ping),
        "ack" => value.get("id").and_then(Value::as_u64).map(InboundFrame::Ack),
        _ => None,
    }
}

/// Encode the `hello` envelope sent once per successful connection.
#[must_use]
pub fn encode_hello(client_id: &str, device: &str, platform: &str) -> String {
    json!({
        "type": "hello",
        "clientId": client_id,
        "ts": now_iso(),
        "payload": { "device": device, "platform": platform },
    })
    .to_string()
}

/// Encode a `log` envelope for one entry.
///
/// `seq` carries the entry id so server acks can advance the buffer
/// watermark.
#[must_use]
pub fn encode_log(entry: &LogEntry) -> String {
    json!({
        "type": "log",
        "sessionId": entry.agent_id,
        "seq": entry.id,
        "payload": { "stream": entry.stream.as_str(), "message": entry.message },
    })
    .to_string()
}

/// Encode a `status` envelope for one agent session.
#[must_use]
pub fn encode_status(agent_id: &str, state: AgentState) -> String {
    json!({
        "type": "status",
        "sessionId": agent_id,
        "payload": { "state": state.as_str() },
    })
    .to_string()
}

/// Current time as an ISO-8601 string with millisecond precision.
#[must_use]
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
