//! Console sink (§10 supplement): logs each published batch via `tracing`,
//! optionally pretty-printed — the simplest possible north-bound consumer,
//! useful for local runs and integration tests.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::sink::{PointBatch, Sink, SinkError};

#[derive(Debug, Default, Deserialize)]
struct ConsoleConfig {
    #[serde(default)]
    pretty: bool,
}

pub struct ConsoleSink {
    name: String,
    config: ConsoleConfig,
}

impl ConsoleSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: ConsoleConfig::default(),
        }
    }
}

#[async_trait]
impl Sink for ConsoleSink {
    async fn init(&mut self, raw_config: JsonValue) -> Result<(), SinkError> {
        if !raw_config.is_null() {
            self.config = serde_json::from_value(raw_config)
                .map_err(|e| SinkError::Init(format!("invalid console sink config: {e}")))?;
        }
        Ok(())
    }

    async fn start(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn publish(&self, points: &PointBatch) -> Result<(), SinkError> {
        for point in points {
            if self.config.pretty {
                match serde_json::to_string_pretty(point) {
                    Ok(json) => println!("{json}"),
                    Err(e) => return Err(SinkError::Publish(e.to_string())),
                }
            } else {
                tracing::info!(sink = %self.name, device = %point.device_id, key = %point.key, "point");
            }
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
    use crate::point::{Point, Value};

    #[tokio::test]
    async fn publish_accepts_empty_and_nonempty_batches() {
        let mut sink = ConsoleSink::new("console");
        sink.init(JsonValue::Null).await.unwrap();
        sink.start().await.unwrap();
        sink.publish(&vec![]).await.unwrap();
        sink.publish(&vec![Point::new("d1", "k", Value::Int(1))])
            .await
            .unwrap();
    }
}
