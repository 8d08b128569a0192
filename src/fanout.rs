//! Data-plane fan-out (§4.E): the single consumer of the plugin manager's
//! central point channel. Batches points, republishes each one onto the bus
//! for the rule engine, and hands the batch to every loaded sink with
//! per-sink failure isolation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::Bus;
use crate::point::Point;
use crate::sink::Sink;

const BATCH_SIZE: usize = 10;
const BATCH_TIMEOUT: Duration = Duration::from_millis(100);
const STATS_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Default)]
struct Stats {
    per_device: HashMap<String, u64>,
    bytes: u64,
}

/// Spawns the fan-out loop and returns its join handle. `sinks`/`sink_names`
/// are parallel lists: each sink is addressed by its index into both.
pub fn spawn(
    mut rx: mpsc::Receiver<Point>,
    sinks: Vec<Arc<Mutex<Box<dyn Sink>>>>,
    sink_names: Vec<String>,
    bus: Arc<dyn Bus>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // A reused batch buffer stands in for the object pool the teacher's
        // hot paths use elsewhere: one allocation, cleared rather than
        // reallocated between flushes.
        let mut batch: Vec<Point> = Vec::with_capacity(BATCH_SIZE * 2);
        let mut stats = Stats::default();
        let mut timer = tokio::time::interval(BATCH_TIMEOUT);
        let mut stats_ticker = tokio::time::interval(STATS_INTERVAL);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    drain_remaining(&mut rx, &mut batch);
                    flush(&mut batch, &sinks, &sink_names, &bus, &mut stats).await;
                    return;
                }
                maybe_point = rx.recv() => {
                    match maybe_point {
                        Some(point) => {
                            batch.push(point);
                            if batch.len() >= BATCH_SIZE {
                                flush(&mut batch, &sinks, &sink_names, &bus, &mut stats).await;
                            }
                        }
                        None => {
                            flush(&mut batch, &sinks, &sink_names, &bus, &mut stats).await;
                            return;
                        }
                    }
                }
                _ = timer.tick() => {
                    flush(&mut batch, &sinks, &sink_names, &bus, &mut stats).await;
                }
                _ = stats_ticker.tick() => {
                    log_stats(&stats);
                }
            }
        }
    })
}

fn drain_remaining(rx: &mut mpsc::Receiver<Point>, batch: &mut Vec<Point>) {
    while let Ok(point) = rx.try_recv() {
        batch.push(point);
    }
}

async fn flush(
    batch: &mut Vec<Point>,
    sinks: &[Arc<Mutex<Box<dyn Sink>>>],
    sink_names: &[String],
    bus: &Arc<dyn Bus>,
    stats: &mut Stats,
) {
    if batch.is_empty() {
        return;
    }

    for point in batch.iter() {
        let subject = point.data_subject();
        match serde_json::to_vec(point) {
            Ok(payload) => {
                let payload = bytes::Bytes::from(payload);
                stats.bytes += payload.len() as u64;
                *stats.per_device.entry(point.device_id.clone()).or_insert(0) += 1;
                bus.publish(&subject, payload.clone()).await;
                for name in sink_names.iter() {
                    bus.publish(&format!("data.{name}"), payload.clone()).await;
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialise point for bus publish"),
        }
    }

    for (sink, name) in sinks.iter().zip(sink_names.iter()) {
        let sink = sink.lock().await;
        if let Err(e) = sink.publish(batch).await {
            tracing::error!(sink = %name, error = %e, "sink publish failed, skipping");
        }
    }

    batch.clear();
}

fn log_stats(stats: &Stats) {
    tracing::info!(
        total_bytes = stats.bytes,
        devices = stats.per_device.len(),
        "fan-out stats"
    );
    for (device, count) in stats.per_device.iter() {
        tracing::debug!(device = %device, points = count, "fan-out device stats");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::point::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Sink for CountingSink {
        async fn init(&mut self, _: serde_json::Value) -> Result<(), crate::sink::SinkError> {
            Ok(())
        }
        async fn start(&mut self) -> Result<(), crate::sink::SinkError> {
            Ok(())
        }
        async fn stop(&mut self) -> Result<(), crate::sink::SinkError> {
            Ok(())
        }
        async fn publish(&self, points: &crate::sink::PointBatch) -> Result<(), crate::sink::SinkError> {
            self.calls.fetch_add(points.len(), Ordering::SeqCst);
            Ok(())
        }
        fn name(&self) -> &str {
            "counting"
        }
    }

    #[tokio::test]
    async fn flush_on_timeout_reaches_sink_and_bus() {
        let (tx, rx) = mpsc::channel(16);
        let bus = InMemoryBus::new();
        let mut bus_rx = bus.subscribe("iot.data.>");
        let calls = Arc::new(AtomicUsize::new(0));
        let sink: Arc<Mutex<Box<dyn Sink>>> = Arc::new(Mutex::new(Box::new(CountingSink { calls: calls.clone() })));
        let cancel = CancellationToken::new();

        let handle = spawn(rx, vec![sink], vec!["counting".into()], bus, cancel.clone());

        tx.send(Point::new("d1", "temp", Value::Float(1.0))).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), bus_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.subject, "iot.data.d1.temp");

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cancel.cancel();
        drop(tx);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn flush_also_publishes_per_sink_subject() {
        let (tx, rx) = mpsc::channel(16);
        let bus = InMemoryBus::new();
        let mut per_sink_rx = bus.subscribe("data.counting");
        let calls = Arc::new(AtomicUsize::new(0));
        let sink: Arc<Mutex<Box<dyn Sink>>> = Arc::new(Mutex::new(Box::new(CountingSink { calls: calls.clone() })));
        let cancel = CancellationToken::new();

        let handle = spawn(rx, vec![sink], vec!["counting".into()], bus, cancel.clone());

        tx.send(Point::new("d1", "temp", Value::Float(1.0))).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), per_sink_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.subject, "data.counting");

        cancel.cancel();
        drop(tx);
        let _ = handle.await;
    }
}
