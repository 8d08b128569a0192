//! Adapter contract (§4.C): uniform lifecycle for south-bound ingress.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::point::Point;

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("init failed: {0}")]
    Init(String),
    #[error("start failed: {0}")]
    Start(String),
    #[error("stop failed: {0}")]
    Stop(String),
}

/// South-bound source of `Point`s.
#[async_trait]
pub trait Adapter: Send + Sync {
    async fn init(&mut self, raw_config: JsonValue) -> Result<(), AdapterError>;

    /// Must not block — launches background tasks that write to `out` and
    /// honour `cancel`.
    async fn start(
        &mut self,
        cancel: CancellationToken,
        out: mpsc::Sender<Point>,
    ) -> Result<(), AdapterError>;

    async fn stop(&mut self) -> Result<(), AdapterError>;

    fn status(&self) -> HashMap<String, JsonValue>;

    fn name(&self) -> &str;
}

/// Shared bookkeeping every concrete adapter embeds, mirroring the
/// teacher's base-adapter helpers (`SetHealthStatus`, `SetLastError`,
/// `IncrementDataPoints`, `SafeSendDataPoint`).
pub struct BaseAdapter {
    name: String,
    adapter_type: String,
    healthy: RwLock<bool>,
    last_error: RwLock<Option<String>>,
    data_points: AtomicU64,
}

impl BaseAdapter {
    pub fn new(name: impl Into<String>, adapter_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            adapter_type: adapter_type.into(),
            healthy: RwLock::new(true),
            last_error: RwLock::new(None),
            data_points: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn adapter_type(&self) -> &str {
        &self.adapter_type
    }

    pub fn set_health_status(&self, healthy: bool) {
        *self.healthy.write() = healthy;
    }

    pub fn set_last_error(&self, error: impl Into<String>) {
        *self.last_error.write() = Some(error.into());
        self.set_health_status(false);
    }

    pub fn clear_error(&self) {
        *self.last_error.write() = None;
        self.set_health_status(true);
    }

    pub fn increment_data_points(&self) {
        self.data_points.fetch_add(1, Ordering::Relaxed);
    }

    pub fn status(&self) -> HashMap<String, JsonValue> {
        let mut map = HashMap::new();
        map.insert("name".into(), JsonValue::String(self.name.clone()));
        map.insert("type".into(), JsonValue::String(self.adapter_type.clone()));
        map.insert("healthy".into(), JsonValue::Bool(*self.healthy.read()));
        map.insert(
            "data_points".into(),
            JsonValue::from(self.data_points.load(Ordering::Relaxed)),
        );
        if let Some(err) = self.last_error.read().clone() {
            map.insert("last_error".into(), JsonValue::String(err));
        }
        map
    }

    /// Non-blocking send with drop-oldest warning on a full channel. Returns
    /// `true` if the point was accepted.
    pub fn safe_send_data_point(
        &self,
        out: &mpsc::Sender<Point>,
        point: Point,
        poll_start: std::time::Instant,
    ) -> bool {
        match out.try_send(point) {
            Ok(()) => {
                self.increment_data_points();
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    adapter = %self.name,
                    elapsed_ms = poll_start.elapsed().as_millis(),
                    "adapter output channel full, dropping point"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!(adapter = %self.name, "adapter output channel closed");
                false
            }
        }
    }
}

/// Process-global south-bound type -> factory table (§4.C).
pub type AdapterFactory = Arc<dyn Fn() -> Box<dyn Adapter> + Send + Sync>;

#[derive(Default)]
pub struct AdapterRegistry {
    factories: RwLock<HashMap<String, AdapterFactory>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: impl Into<String>, factory: AdapterFactory) {
        self.factories.write().insert(kind.into(), factory);
    }

    pub fn create(&self, kind: &str) -> Option<Box<dyn Adapter>> {
        self.factories.read().get(kind).map(|f| f())
    }

    pub fn kinds(&self) -> Vec<String> {
        self.factories.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_adapter_tracks_health_and_errors() {
        let base = BaseAdapter::new("sim-1", "mock");
        base.increment_data_points();
        base.set_last_error("boom");
        let status = base.status();
        assert_eq!(status["healthy"], JsonValue::Bool(false));
        assert_eq!(status["last_error"], JsonValue::String("boom".into()));
        base.clear_error();
        assert_eq!(base.status()["healthy"], JsonValue::Bool(true));
    }

    #[test]
    fn safe_send_drops_on_full_channel() {
        let (tx, _rx) = mpsc::channel(1);
        let base = BaseAdapter::new("a", "mock");
        let p1 = Point::new("d", "k", crate::point::Value::Int(1));
        let p2 = Point::new("d", "k", crate::point::Value::Int(2));
        assert!(base.safe_send_data_point(&tx, p1, std::time::Instant::now()));
        assert!(!base.safe_send_data_point(&tx, p2, std::time::Instant::now()));
    }
}
