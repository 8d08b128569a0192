//! SQLite sink (§10 supplement, feature `database-sink`): appends each point
//! to a single `points` table. `rusqlite` is synchronous, so the connection
//! is driven from `spawn_blocking`, matching the crate's own convention of
//! never blocking an async task on a synchronous call.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::sink::{PointBatch, Sink, SinkError};

fn default_path() -> String {
    "iot_gateway.sqlite".into()
}

#[derive(Debug, Deserialize)]
struct DatabaseConfig {
    #[serde(default = "default_path")]
    path: String,
}

pub struct DatabaseSink {
    name: String,
    config: DatabaseConfig,
    conn: Option<Arc<Mutex<Connection>>>,
}

impl DatabaseSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: DatabaseConfig { path: default_path() },
            conn: None,
        }
    }
}

#[async_trait]
impl Sink for DatabaseSink {
    async fn init(&mut self, raw_config: JsonValue) -> Result<(), SinkError> {
        if !raw_config.is_null() {
            self.config = serde_json::from_value(raw_config)
                .map_err(|e| SinkError::Init(format!("invalid database sink config: {e}")))?;
        }
        Ok(())
    }

    async fn start(&mut self) -> Result<(), SinkError> {
        let path = self.config.path.clone();
        let conn = tokio::task::spawn_blocking(move || -> rusqlite::Result<Connection> {
            let conn = Connection::open(path)?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS points (
                    device_id TEXT NOT NULL,
                    key TEXT NOT NULL,
                    value_json TEXT NOT NULL,
                    timestamp TEXT NOT NULL
                )",
                [],
            )?;
            Ok(conn)
        })
        .await
        .map_err(|e| SinkError::Start(format!("database sink init task panicked: {e}")))?
        .map_err(|e| SinkError::Start(format!("database sink open/migrate: {e}")))?;
        self.conn = Some(Arc::new(Mutex::new(conn)));
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), SinkError> {
        self.conn = None;
        Ok(())
    }

    async fn publish(&self, points: &PointBatch) -> Result<(), SinkError> {
        let conn = self
            .conn
            .clone()
            .ok_or_else(|| SinkError::Publish("database sink not started".into()))?;
        let rows: Vec<(String, String, String, String)> = points
            .iter()
            .map(|p| {
                (
                    p.device_id.clone(),
                    p.key.clone(),
                    serde_json::to_string(&p.value).unwrap_or_default(),
                    p.timestamp.to_rfc3339(),
                )
            })
            .collect();
        tokio::task::spawn_blocking(move || -> rusqlite::Result<()> {
            let conn = conn.lock();
            for (device_id, key, value_json, timestamp) in rows {
                conn.execute(
                    "INSERT INTO points (device_id, key, value_json, timestamp) VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![device_id, key, value_json, timestamp],
                )?;
            }
            Ok(())
        })
        .await
        .map_err(|e| SinkError::Publish(format!("database sink write task panicked: {e}")))?
        .map_err(|e| SinkError::Publish(e.to_string()))?;
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
    async fn publish_inserts_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.sqlite");
        let mut sink = DatabaseSink::new("db");
        sink.init(serde_json::json!({"path": path.to_str().unwrap()}))
            .await
            .unwrap();
        sink.start().await.unwrap();
        sink.publish(&vec![Point::new("d1", "temp", Value::Float(1.0))])
            .await
            .unwrap();

        let conn = sink.conn.clone().unwrap();
        let count: i64 = tokio::task::spawn_blocking(move || {
            conn.lock()
                .query_row("SELECT COUNT(*) FROM points", [], |row| row.get(0))
                .unwrap()
        })
        .await
        .unwrap();
        assert_eq!(count, 1);
    }
}
