//! MQTT sink (§10 supplement): publishes each point as a retained-off JSON
//! message under `<topic_prefix>/<device>/<key>`. `rumqttc` has no direct
//! precedent in the teacher repo; the client/eventloop split below follows
//! `rumqttc`'s own documented usage (a background task must keep polling the
//! `EventLoop` for publishes to actually flush over the wire).

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::sink::{PointBatch, Sink, SinkError};

fn default_port() -> u16 {
    1883
}

fn default_topic_prefix() -> String {
    "iot".into()
}

fn default_qos() -> u8 {
    0
}

#[derive(Debug, Deserialize)]
struct MqttConfig {
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_topic_prefix")]
    topic_prefix: String,
    #[serde(default = "default_qos")]
    qos: u8,
}

fn qos_from(value: u8) -> QoS {
    match value {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

pub struct MqttSink {
    name: String,
    config: Option<MqttConfig>,
    client: Option<AsyncClient>,
}

impl MqttSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: None,
            client: None,
        }
    }
}

#[async_trait]
impl Sink for MqttSink {
    async fn init(&mut self, raw_config: JsonValue) -> Result<(), SinkError> {
        let config: MqttConfig = serde_json::from_value(raw_config)
            .map_err(|e| SinkError::Init(format!("invalid mqtt sink config: {e}")))?;
        self.config = Some(config);
        Ok(())
    }

    async fn start(&mut self) -> Result<(), SinkError> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| SinkError::Start("mqtt sink not initialised".into()))?;

        let client_id = format!("iot-gateway-{}-{}", self.name, Uuid::new_v4());
        let mut opts = MqttOptions::new(client_id, config.host.clone(), config.port);
        opts.set_keep_alive(Duration::from_secs(30));

        let (client, eventloop) = AsyncClient::new(opts, 64);
        spawn_eventloop_driver(self.name.clone(), eventloop);
        self.client = Some(client);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), SinkError> {
        if let Some(client) = self.client.take() {
            let _ = client.disconnect().await;
        }
        Ok(())
    }

    async fn publish(&self, points: &PointBatch) -> Result<(), SinkError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| SinkError::Publish("mqtt sink not started".into()))?;
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| SinkError::Publish("mqtt sink not initialised".into()))?;
        for point in points {
            let topic = format!("{}/{}/{}", config.topic_prefix, point.device_id, point.key);
            let payload = serde_json::to_vec(point).map_err(|e| SinkError::Publish(e.to_string()))?;
            client
                .publish(topic, qos_from(config.qos), false, payload)
                .await
                .map_err(|e| SinkError::Publish(e.to_string()))?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn spawn_eventloop_driver(sink_name: String, mut eventloop: EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(sink = %sink_name, error = %e, "mqtt eventloop error, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_maps_known_levels() {
        assert_eq!(qos_from(0), QoS::AtMostOnce);
        assert_eq!(qos_from(1), QoS::AtLeastOnce);
        assert_eq!(qos_from(2), QoS::ExactlyOnce);
        assert_eq!(qos_from(9), QoS::AtMostOnce);
    }

    #[tokio::test]
    async fn init_rejects_missing_host() {
        let mut sink = MqttSink::new("mqtt");
        let err = sink.init(serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, SinkError::Init(_)));
    }
}
