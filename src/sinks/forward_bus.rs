//! Forward-to-bus sink (§10 supplement): republishes every point back onto
//! the bus under a configured (or per-point default) subject, letting one
//! north-bound "sink" act as a loopback fan-out for subscribers that don't
//! want to implement the `Sink` trait themselves.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::bus::Bus;
use crate::sink::{PointBatch, SetBus, Sink, SinkError};

#[derive(Debug, Default, Deserialize)]
struct ForwardBusConfig {
    #[serde(default)]
    subject: Option<String>,
}

pub struct ForwardBusSink {
    name: String,
    config: ForwardBusConfig,
    bus: Option<Arc<dyn Bus>>,
}

impl ForwardBusSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: ForwardBusConfig::default(),
            bus: None,
        }
    }
}

impl SetBus for ForwardBusSink {
    fn set_bus(&mut self, bus: Arc<dyn Bus>) {
        self.bus = Some(bus);
    }
}

#[async_trait]
impl Sink for ForwardBusSink {
    async fn init(&mut self, raw_config: JsonValue) -> Result<(), SinkError> {
        if !raw_config.is_null() {
            self.config = serde_json::from_value(raw_config)
                .map_err(|e| SinkError::Init(format!("invalid forward_bus sink config: {e}")))?;
        }
        Ok(())
    }

    async fn start(&mut self) -> Result<(), SinkError> {
        if self.bus.is_none() {
            return Err(SinkError::Start("forward_bus sink has no bus wired in".into()));
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn publish(&self, points: &PointBatch) -> Result<(), SinkError> {
        let bus = self
            .bus
            .as_ref()
            .ok_or_else(|| SinkError::Publish("forward_bus sink has no bus wired in".into()))?;
        for point in points {
            let subject = self.config.subject.clone().unwrap_or_else(|| point.data_subject());
            let payload = serde_json::to_vec(point).map_err(|e| SinkError::Publish(e.to_string()))?;
            bus.publish(&subject, bytes::Bytes::from(payload)).await;
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
    use crate::bus::InMemoryBus;
    use crate::point::{Point, Value};

    #[tokio::test]
    async fn publish_rebroadcasts_to_default_subject() {
        let bus = InMemoryBus::new();
        let mut rx = bus.subscribe("iot.data.>");
        let mut sink = ForwardBusSink::new("loopback");
        sink.set_bus(bus.clone());
        sink.init(JsonValue::Null).await.unwrap();
        sink.start().await.unwrap();

        let point = Point::new("d1", "temp", Value::Float(1.0));
        sink.publish(&vec![point]).await.unwrap();

        let got = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.subject, "iot.data.d1.temp");
    }
}
