//! NATS sink (§10 supplement, feature `nats`): republishes points to an
//! external NATS server, for deployments that bridge the in-process bus out
//! to a real message fabric.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::sink::{PointBatch, Sink, SinkError};

fn default_subject_prefix() -> String {
    "iot.data".into()
}

#[derive(Debug, Deserialize)]
struct NatsConfig {
    url: String,
    #[serde(default = "default_subject_prefix")]
    subject_prefix: String,
}

pub struct NatsSink {
    name: String,
    config: Option<NatsConfig>,
    client: Option<async_nats::Client>,
}

impl NatsSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: None,
            client: None,
        }
    }
}

#[async_trait]
impl Sink for NatsSink {
    async fn init(&mut self, raw_config: JsonValue) -> Result<(), SinkError> {
        let config: NatsConfig = serde_json::from_value(raw_config)
            .map_err(|e| SinkError::Init(format!("invalid nats sink config: {e}")))?;
        self.config = Some(config);
        Ok(())
    }

    async fn start(&mut self) -> Result<(), SinkError> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| SinkError::Start("nats sink not initialised".into()))?;
        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| SinkError::Start(format!("nats connect to {}: {e}", config.url)))?;
        self.client = Some(client);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), SinkError> {
        self.client = None;
        Ok(())
    }

    async fn publish(&self, points: &PointBatch) -> Result<(), SinkError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| SinkError::Publish("nats sink not started".into()))?;
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| SinkError::Publish("nats sink not initialised".into()))?;
        for point in points {
            let subject = format!("{}.{}.{}", config.subject_prefix, point.device_id, point.key);
            let payload = serde_json::to_vec(point).map_err(|e| SinkError::Publish(e.to_string()))?;
            client
                .publish(subject, payload.into())
                .await
                .map_err(|e| SinkError::Publish(e.to_string()))?;
        }
        client
            .flush()
            .await
            .map_err(|e| SinkError::Publish(format!("nats flush: {e}")))?;
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
        let mut sink = NatsSink::new("nats");
        let err = sink.init(serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, SinkError::Init(_)));
    }
}
