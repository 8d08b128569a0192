//! Sink contract (§4.C): uniform lifecycle for north-bound egress.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::bus::Bus;
use crate::point::Point;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("init failed: {0}")]
    Init(String),
    #[error("start failed: {0}")]
    Start(String),
    #[error("stop failed: {0}")]
    Stop(String),
    #[error("publish failed: {0}")]
    Publish(String),
}

pub type PointBatch = Vec<Point>;

/// North-bound consumer of `Point`s.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn init(&mut self, raw_config: JsonValue) -> Result<(), SinkError>;
    async fn start(&mut self) -> Result<(), SinkError>;
    async fn stop(&mut self) -> Result<(), SinkError>;
    async fn publish(&self, points: &PointBatch) -> Result<(), SinkError>;
    fn name(&self) -> &str;
}

/// Capability interfaces the plugin manager recognises and wires in when a
/// sink implements them (§4.D).
pub trait SetBus {
    fn set_bus(&mut self, bus: Arc<dyn Bus>);
}

pub trait SetName {
    fn set_name(&mut self, name: String);
}

/// Process-global north-bound type -> factory table.
pub type SinkFactory = Arc<dyn Fn() -> Box<dyn Sink> + Send + Sync>;

#[derive(Default)]
pub struct SinkRegistry {
    factories: RwLock<HashMap<String, SinkFactory>>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: impl Into<String>, factory: SinkFactory) {
        self.factories.write().insert(kind.into(), factory);
    }

    pub fn create(&self, kind: &str) -> Option<Box<dyn Sink>> {
        self.factories.read().get(kind).map(|f| f())
    }

    pub fn kinds(&self) -> Vec<String> {
        self.factories.read().keys().cloned().collect()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SinkStatus {
    pub name: String,
    pub healthy: bool,
}
