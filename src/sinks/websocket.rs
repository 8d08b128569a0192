//! WebSocket sink (§10 supplement): dials a configured `ws://`/`wss://`
//! endpoint and forwards each point as a JSON text frame. No teacher
//! precedent for `tokio-tungstenite`; grounded in the crate's own documented
//! client usage (`connect_async` + split sink/stream).

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::SinkExt;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::sink::{PointBatch, Sink, SinkError};

type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

#[derive(Debug, Deserialize)]
struct WebSocketConfig {
    url: String,
}

pub struct WebSocketSink {
    name: String,
    config: Option<WebSocketConfig>,
    sender: Option<Arc<Mutex<WsSender>>>,
}

impl WebSocketSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: None,
            sender: None,
        }
    }
}

#[async_trait]
impl Sink for WebSocketSink {
    async fn init(&mut self, raw_config: JsonValue) -> Result<(), SinkError> {
        let config: WebSocketConfig = serde_json::from_value(raw_config)
            .map_err(|e| SinkError::Init(format!("invalid websocket sink config: {e}")))?;
        self.config = Some(config);
        Ok(())
    }

    async fn start(&mut self) -> Result<(), SinkError> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| SinkError::Start("websocket sink not initialised".into()))?;
        let (ws, _response) = connect_async(&config.url)
            .await
            .map_err(|e| SinkError::Start(format!("websocket connect to {}: {e}", config.url)))?;
        let (sink, mut stream) = futures_util::StreamExt::split(ws);
        // Drain (and discard) inbound frames so the connection doesn't stall
        // on a full read buffer; this sink is publish-only.
        tokio::spawn(async move {
            while futures_util::StreamExt::next(&mut stream).await.is_some() {}
        });
        self.sender = Some(Arc::new(Mutex::new(sink)));
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), SinkError> {
        if let Some(sender) = self.sender.take() {
            let _ = sender.lock().await.close().await;
        }
        Ok(())
    }

    async fn publish(&self, points: &PointBatch) -> Result<(), SinkError> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| SinkError::Publish("websocket sink not started".into()))?;
        let mut sender = sender.lock().await;
        for point in points {
            let payload = serde_json::to_string(point).map_err(|e| SinkError::Publish(e.to_string()))?;
            sender
                .send(Message::Text(payload))
                .await
                .map_err(|e| SinkError::Publish(e.to_string()))?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_rejects_missing_url() {
        let mut sink = WebSocketSink::new("ws");
        let err = sink.init(serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, SinkError::Init(_)));
    }
}
