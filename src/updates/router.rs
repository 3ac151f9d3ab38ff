use crate::model::{FrameError, OutboundFrame, TaskFrame};
use serde_json::Value;

/// Where an inbound frame goes, decided by its `type` field.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    Ping { timestamp: Value },
    Pong,
    HelloAck,
    ConnectionStatus(String),
    Update(TaskFrame),
}

pub fn classify(text: &str) -> Result<Routed, FrameError> {
    let frame = TaskFrame::parse(text)?;
    let kind = frame.kind().map(str::to_owned);
    let routed = match kind.as_deref() {
        Some("ping") => Routed::Ping {
            timestamp: frame.get("timestamp").cloned().unwrap_or(Value::Null),
        },
        Some("pong") => Routed::Pong,
        Some("hello_ack") => Routed::HelloAck,
        Some("connection_status") => {
            Routed::ConnectionStatus(frame.status().unwrap_or("unknown").to_string())
        }
        _ => Routed::Update(frame),
    };
    Ok(routed)
}

pub fn pong_for(timestamp: Value, task_id: &str, client_timestamp: u64) -> OutboundFrame {
    OutboundFrame::Pong {
        timestamp,
        task_id: task_id.to_string(),
        client_timestamp,
    }
}
