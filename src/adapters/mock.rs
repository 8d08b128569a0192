//! Mock adapter (§10 supplement): a synthetic south-bound source used by the
//! builtin plugin registry and by integration tests in lieu of real field
//! hardware (modelled on the teacher's WITS simulation generator, reduced to
//! a single noisy sine wave per configured key).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::adapter::{Adapter, AdapterError, BaseAdapter};
use crate::point::{Point, Value};

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_amplitude() -> f64 {
    5.0
}

fn default_center() -> f64 {
    20.0
}

#[derive(Debug, Clone, Deserialize)]
struct MockConfig {
    #[serde(default = "default_device_id")]
    device_id: String,
    #[serde(default = "default_key")]
    key: String,
    #[serde(default = "default_poll_interval_ms")]
    poll_interval_ms: u64,
    #[serde(default = "default_amplitude")]
    amplitude: f64,
    #[serde(default = "default_center")]
    center: f64,
}

fn default_device_id() -> String {
    "mock-1".into()
}

fn default_key() -> String {
    "value".into()
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            key: default_key(),
            poll_interval_ms: default_poll_interval_ms(),
            amplitude: default_amplitude(),
            center: default_center(),
        }
    }
}

/// Generates a noisy sine wave `Point` every `poll_interval_ms`.
pub struct MockAdapter {
    base: BaseAdapter,
    config: MockConfig,
    tick: AtomicU64,
}

impl MockAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            base: BaseAdapter::new(name, "mock"),
            config: MockConfig::default(),
            tick: AtomicU64::new(0),
        }
    }

    fn next_value(&self) -> f64 {
        let t = self.tick.fetch_add(1, Ordering::Relaxed) as f64;
        let noise = rand::thread_rng().gen_range(-0.5..0.5);
        self.config.center + self.config.amplitude * (t / 10.0).sin() + noise
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    async fn init(&mut self, raw_config: JsonValue) -> Result<(), AdapterError> {
        self.config = if raw_config.is_null() {
            MockConfig::default()
        } else {
            serde_json::from_value(raw_config)
                .map_err(|e| AdapterError::Init(format!("invalid mock adapter config: {e}")))?
        };
        Ok(())
    }

    async fn start(
        &mut self,
        cancel: CancellationToken,
        out: mpsc::Sender<Point>,
    ) -> Result<(), AdapterError> {
        let config = self.config.clone();
        let name = self.base.name().to_string();
        let interval = std::time::Duration::from_millis(config.poll_interval_ms.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut tick: u64 = 0;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!(adapter = %name, "mock adapter stopping");
                        return;
                    }
                    _ = ticker.tick() => {
                        tick += 1;
                        let noise = rand::thread_rng().gen_range(-0.5..0.5);
                        let v = config.center + config.amplitude * (tick as f64 / 10.0).sin() + noise;
                        let point = Point::new(config.device_id.clone(), config.key.clone(), Value::Float(v));
                        let poll_start = Instant::now();
                        match out.try_send(point) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                tracing::warn!(adapter = %name, elapsed_ms = poll_start.elapsed().as_millis(), "mock adapter output channel full, dropping point");
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => return,
                        }
                    }
                }
            }
        });
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), AdapterError> {
        Ok(())
    }

    fn status(&self) -> HashMap<String, JsonValue> {
        self.base.status()
    }

    fn name(&self) -> &str {
        self.base.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emits_points_at_configured_interval() {
        let mut adapter = MockAdapter::new("mock-test");
        adapter
            .init(serde_json::json!({"device_id": "d1", "key": "v", "poll_interval_ms": 5}))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        adapter.start(cancel.clone(), tx).await.unwrap();

        let point = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(point.device_id, "d1");
        assert_eq!(point.key, "v");
        cancel.cancel();
    }
}
