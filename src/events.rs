//! Wire types for the duplex streaming channel.
//!
//! `StreamEvent` is the closed set of per-turn events; `ControlMessage` carries
//! replies that are never part of a turn (pong, history, rejections).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::TranscriptEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolOutcome {
    Ok,
    Error,
}

/// Summary of one capability invocation. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub status: ToolOutcome,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl ToolCallRecord {
    pub fn ok(name: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: ToolOutcome::Ok,
            summary: summary.into(),
            params: None,
            result: None,
            duration_ms: None,
        }
    }

    pub fn error(name: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            status: ToolOutcome::Error,
            ..Self::ok(name, summary)
        }
    }

    #[must_use]
    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = Some(params);
        self
    }

    #[must_use]
    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    #[must_use]
    pub fn with_duration(mut self, duration: std::time::Duration) -> Self {
        self.duration_ms = Some(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn is_error(&self) -> bool {
        self.status == ToolOutcome::Error
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenshotRecord {
    pub action: String,
    /// base64 PNG
    pub image: String,
    pub format: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    SessionInfo {
        session_id: String,
        history: Vec<TranscriptEntry>,
    },
    StreamStart {
        message: String,
    },
    TextDelta {
        content: String,
    },
    TextComplete {
        content: String,
    },
    ToolCall {
        tool: ToolCallRecord,
    },
    Screenshot {
        action: String,
        image: String,
        format: String,
    },
    StreamComplete {
        final_text: String,
        tool_calls: Vec<ToolCallRecord>,
    },
    Error {
        error: String,
    },
}

impl StreamEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionInfo { .. } => "session_info",
            Self::StreamStart { .. } => "stream_start",
            Self::TextDelta { .. } => "text_delta",
            Self::TextComplete { .. } => "text_complete",
            Self::ToolCall { .. } => "tool_call",
            Self::Screenshot { .. } => "screenshot",
            Self::StreamComplete { .. } => "stream_complete",
            Self::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::StreamComplete { .. } | Self::Error { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Pong,
    History { messages: Vec<TranscriptEntry> },
    HistoryCleared,
    Rejected { reason: String },
}

/// Everything the server writes to the socket.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Event(StreamEvent),
    Control(ControlMessage),
}

impl From<StreamEvent> for ServerMessage {
    fn from(event: StreamEvent) -> Self {
        Self::Event(event)
    }
}

impl From<ControlMessage> for ServerMessage {
    fn from(control: ControlMessage) -> Self {
        Self::Control(control)
    }
}

/// Inbound client messages.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Task {
        #[serde(default)]
        task: String,
    },
    Ping,
    GetHistory,
    ClearHistory,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_wire_shape() {
        let event = StreamEvent::TextDelta { content: "hi".into() };
        assert_eq!(serde_json::to_value(&event).unwrap(), json!({"type": "text_delta", "content": "hi"}));

        let done = StreamEvent::StreamComplete {
            final_text: "done".into(),
            tool_calls: vec![ToolCallRecord::ok("WebSearch", "Searched the web")],
        };
        let value = serde_json::to_value(&done).unwrap();
        assert_eq!(value["type"], "stream_complete");
        assert_eq!(value["tool_calls"][0]["status"], "ok");
        assert!(value["tool_calls"][0].get("params").is_none());
    }

    #[test]
    fn test_server_message_is_flat() {
        let msg: ServerMessage = ControlMessage::Pong.into();
        assert_eq!(serde_json::to_string(&msg).unwrap(), r#"{"type":"pong"}"#);
    }

    #[test]
    fn test_parse_client_messages() {
        let task: ClientMessage = serde_json::from_str(r#"{"type":"task","task":"find jackets"}"#).unwrap();
        assert_eq!(task, ClientMessage::Task { task: "find jackets".into() });
        let ping: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(ping, ClientMessage::Ping);
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"dance"}"#).is_err());
    }

    #[test]
    fn test_terminal_kinds() {
        assert!(StreamEvent::Error { error: "x".into() }.is_terminal());
        assert!(!StreamEvent::StreamStart { message: String::new() }.is_terminal());
    }
}
