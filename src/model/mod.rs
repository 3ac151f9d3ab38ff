use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a task's status callback observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// The client-side channel moved to a new state.
    State(ConnectionState),
    /// The server pushed a `connection_status` frame with this value.
    Reported(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Hello {
        task_id: String,
        timestamp: u64,
    },
    Ping {
        timestamp: u64,
        task_id: String,
    },
    Pong {
        timestamp: Value,
        task_id: String,
        client_timestamp: u64,
    },
}

impl OutboundFrame {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a json object")]
    NotAnObject,
}

/// An inbound JSON object frame, kept verbatim.
///
/// Status and progress payloads carry implementation-defined fields, so the
/// map is forwarded as-is and the accessors below only read the common ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskFrame(Map<String, Value>);

const TERMINAL_STATUSES: [&str; 4] = ["complete", "completed", "error", "cancelled"];

impl TaskFrame {
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        match serde_json::from_str::<Value>(text)? {
            Value::Object(map) => Ok(Self(map)),
            _ => Err(FrameError::NotAnObject),
        }
    }

    /// The synthetic frame delivered once when reconnection gives up.
    pub fn connection_error(task_id: &str, message: impl Into<String>, attempts: u32) -> Self {
        let mut map = Map::new();
        map.insert("type".to_string(), Value::from("connection_error"));
        map.insert("task_id".to_string(), Value::from(task_id));
        map.insert("error".to_string(), Value::from(message.into()));
        map.insert("permanent".to_string(), Value::Bool(true));
        map.insert("attempts".to_string(), Value::from(attempts));
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn kind(&self) -> Option<&str> {
        self.0.get("type").and_then(Value::as_str)
    }

    pub fn status(&self) -> Option<&str> {
        self.0.get("status").and_then(Value::as_str)
    }

    pub fn progress(&self) -> Option<f64> {
        self.0.get("progress").and_then(Value::as_f64)
    }

    pub fn error(&self) -> Option<&str> {
        self.0.get("error").and_then(Value::as_str)
    }

    pub fn is_permanent_failure(&self) -> bool {
        self.kind() == Some("connection_error")
            && self.0.get("permanent").and_then(Value::as_bool) == Some(true)
    }

    pub fn is_terminal_status(&self) -> bool {
        self.status().is_some_and(|status| {
            TERMINAL_STATUSES
                .iter()
                .any(|terminal| status.eq_ignore_ascii_case(terminal))
        })
    }
}

impl fmt::Display for TaskFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.0) {
            Ok(text) => f.write_str(&text),
            Err(_) => f.write_str("{}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Processing,
    Complete,
    Error,
    Cancelled,
    #[serde(other)]
    Other,
}

impl DownloadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Processing => "processing",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
            Self::Other => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_frames_carry_type_discriminator() {
        let ping = OutboundFrame::Ping {
            timestamp: 42,
            task_id: "t1".to_string(),
        };
        let json: Value = serde_json::from_str(&ping.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "ping");
        assert_eq!(json["timestamp"], 42);
        assert_eq!(json["task_id"], "t1");

        let pong = OutboundFrame::Pong {
            timestamp: Value::from(1712.5),
            task_id: "t1".to_string(),
            client_timestamp: 99,
        };
        let json: Value = serde_json::from_str(&pong.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "pong");
        assert_eq!(json["timestamp"], 1712.5);
        assert_eq!(json["client_timestamp"], 99);
    }

    #[test]
    fn parse_rejects_non_object_frames() {
        assert!(matches!(TaskFrame::parse("not json"), Err(FrameError::Json(_))));
        assert!(matches!(TaskFrame::parse("[1,2]"), Err(FrameError::NotAnObject)));
        assert!(TaskFrame::parse(r#"{"progress": 12}"#).is_ok());
    }

    #[test]
    fn accessors_read_progress_payload_fields() {
        let frame = TaskFrame::parse(
            r#"{"type":"progress","status":"downloading","progress":41.5,"error":null}"#,
        )
        .unwrap();
        assert_eq!(frame.kind(), Some("progress"));
        assert_eq!(frame.status(), Some("downloading"));
        assert_eq!(frame.progress(), Some(41.5));
        assert_eq!(frame.error(), None);
        assert!(!frame.is_terminal_status());
    }

    #[test]
    fn terminal_status_matching_ignores_case() {
        for status in ["complete", "Completed", "ERROR", "cancelled"] {
            let frame = TaskFrame::parse(&format!(r#"{{"status":"{status}"}}"#)).unwrap();
            assert!(frame.is_terminal_status(), "{status} should be terminal");
        }
    }

    #[test]
    fn connection_error_frame_is_marked_permanent() {
        let frame = TaskFrame::connection_error("t9", "gave up", 10);
        assert!(frame.is_permanent_failure());
        assert_eq!(frame.get("task_id"), Some(&Value::from("t9")));
        assert_eq!(frame.get("attempts"), Some(&Value::from(10)));
    }

    #[test]
    fn unknown_download_status_is_tolerated() {
        let status: DownloadStatus = serde_json::from_str(r#""queued""#).unwrap();
        assert_eq!(status, DownloadStatus::Other);
        let status: DownloadStatus = serde_json::from_str(r#""complete""#).unwrap();
        assert!(status.is_terminal());
    }
}
