//! ISP ("IoT Sidecar Protocol") message envelope (§3, §6).

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Config,
    Data,
    Response,
    Heartbeat,
    Status,
    MetricsRequest,
}

/// `{type, id, payload}` — one JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IspMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub payload: JsonValue,
}

impl IspMessage {
    pub fn new(kind: MessageType, payload: JsonValue) -> Self {
        Self {
            kind,
            id: None,
            payload,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn heartbeat() -> Self {
        Self::new(MessageType::Heartbeat, JsonValue::Null)
    }

    pub fn response_to(id: impl Into<String>, payload: JsonValue) -> Self {
        Self::new(MessageType::Response, payload).with_id(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_line_json_roundtrip() {
        let msg = IspMessage::new(MessageType::Data, serde_json::json!({"v": 1}))
            .with_id("req-1");
        let line = serde_json::to_string(&msg).unwrap();
        assert!(!line.contains('\n'));
        let back: IspMessage = serde_json::from_str(&line).unwrap();
        assert_eq!(back.id.as_deref(), Some("req-1"));
        assert_eq!(back.kind, MessageType::Data);
    }
}
