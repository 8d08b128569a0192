//! ISP sidecar adapter (§4.D): wraps an [`IspAdapterProxy`] as a south-bound
//! `Adapter`, translating `data` frames into `Point`s and forwarding them to
//! the plugin manager's central channel.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::adapter::{Adapter, AdapterError, BaseAdapter};
use crate::isp::{IspAdapterProxy, MessageType};
use crate::point::{Point, Value};

#[derive(Debug, Deserialize)]
struct SidecarPointPayload {
    key: String,
    source: String,
    value: JsonValue,
    #[serde(rename = "type")]
    point_type: String,
    #[serde(default)]
    timestamp: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct SidecarDataPayload {
    #[serde(default)]
    points: Vec<SidecarPointPayload>,
}

fn to_value(point_type: &str, raw: &JsonValue) -> Option<Value> {
    match point_type {
        "int" => raw.as_i64().map(Value::Int),
        "float" => raw.as_f64().map(Value::Float),
        "bool" => raw.as_bool().map(Value::Bool),
        "string" => raw.as_str().map(|s| Value::String(s.to_string())),
        _ => None,
    }
}

fn timestamp_from_nanos(nanos: Option<i64>) -> DateTime<Utc> {
    match nanos {
        Some(ns) => Utc.timestamp_nanos(ns),
        None => Utc::now(),
    }
}

/// Connects to an already-spawned sidecar subprocess over ISP and bridges its
/// `data` frames into the adapter output channel. Construction is handled by
/// the plugin manager, which owns the subprocess lifecycle; this type only
/// owns the protocol connection.
pub struct IspSidecarAdapter {
    base: BaseAdapter,
    host: String,
    port: u16,
    proxy: Option<Arc<IspAdapterProxy>>,
}

impl IspSidecarAdapter {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            base: BaseAdapter::new(name, "isp-sidecar"),
            host: host.into(),
            port,
            proxy: None,
        }
    }
}

#[async_trait]
impl Adapter for IspSidecarAdapter {
    async fn init(&mut self, _raw_config: JsonValue) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn start(
        &mut self,
        cancel: CancellationToken,
        out: mpsc::Sender<Point>,
    ) -> Result<(), AdapterError> {
        let (data_tx, mut data_rx) = mpsc::channel(1024);
        let proxy = IspAdapterProxy::connect(self.host.clone(), self.port, data_tx)
            .await
            .map_err(|e| AdapterError::Start(format!("isp sidecar connect: {e}")))?;
        let proxy = Arc::new(proxy);
        proxy.spawn_supervisor(cancel.clone());

        let name = self.base.name().to_string();
        let base_name = name.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    maybe_msg = data_rx.recv() => {
                        let Some(msg) = maybe_msg else { return };
                        if msg.kind != MessageType::Data {
                            continue;
                        }
                        let payload: SidecarDataPayload = match serde_json::from_value(msg.payload) {
                            Ok(p) => p,
                            Err(e) => {
                                tracing::warn!(adapter = %base_name, error = %e, "malformed sidecar data payload");
                                continue;
                            }
                        };
                        for raw_point in payload.points {
                            let Some(value) = to_value(&raw_point.point_type, &raw_point.value) else {
                                tracing::warn!(adapter = %base_name, point_type = %raw_point.point_type, "unsupported sidecar point type");
                                continue;
                            };
                            let point = Point::new(raw_point.source, raw_point.key, value)
                                .with_timestamp(timestamp_from_nanos(raw_point.timestamp));
                            if out.try_send(point).is_err() {
                                tracing::warn!(adapter = %base_name, "sidecar adapter output channel full or closed, dropping point");
                            }
                        }
                    }
                }
            }
        });

        self.proxy = Some(proxy);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), AdapterError> {
        self.proxy = None;
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
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn translates_data_frame_into_int_point() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = tokio::io::split(socket);
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            let _ = reader.read_line(&mut line).await;
            let msg = crate::isp::IspMessage::new(
                MessageType::Data,
                serde_json::json!({"points": [{"key": "v", "source": "d1", "value": 42, "type": "int", "timestamp": 0}]}),
            );
            let mut out = serde_json::to_string(&msg).unwrap();
            out.push('\n');
            let _ = write_half.write_all(out.as_bytes()).await;
        });

        let mut adapter = IspSidecarAdapter::new("sc-1", addr.ip().to_string(), addr.port());
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        adapter.init(JsonValue::Null).await.unwrap();
        adapter.start(cancel.clone(), tx).await.unwrap();

        let point = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(point.device_id, "d1");
        assert_eq!(point.value, Value::Int(42));
        cancel.cancel();
    }
}
