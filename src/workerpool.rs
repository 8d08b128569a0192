//! Sharded batching worker pool (§4.I): one bounded queue per worker,
//! round-robin dispatch with busy-aware fallback, back-pressure escalation,
//! and small time/size-bounded batches handed to a caller-supplied sink.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, timeout};
use tokio_util::sync::CancellationToken;

const MIN_BATCH: usize = 10;
const MAX_BATCH: usize = 20;
const MIN_BATCH_DELAY: Duration = Duration::from_millis(5);
const MAX_BATCH_DELAY: Duration = Duration::from_millis(10);
const RETRY_DELAY: Duration = Duration::from_millis(50);
const ESCALATION_TIMEOUT: Duration = Duration::from_millis(20);
const STATS_INTERVAL: Duration = Duration::from_secs(30);
const EMA_ALPHA: f64 = 0.3;

#[derive(Error, Debug)]
pub enum WorkerPoolError {
    #[error("all workers saturated, item dropped")]
    Saturated,
    #[error("pool is shutting down")]
    ShuttingDown,
}

/// Work handed to a worker's batch processor. Callers supply their own item
/// type `T` (rule-evaluation jobs, in this gateway's case).
pub type Batch<T> = Vec<T>;

/// Implemented by the consumer of flushed batches (e.g. the rule engine
/// dispatch loop). Panics inside `process` are caught by the worker loop and
/// reported to the monitor rather than taking the whole pool down.
#[async_trait]
pub trait BatchProcessor<T>: Send + Sync {
    async fn process(&self, batch: Batch<T>);
}

#[derive(Debug, Default)]
struct WorkerStats {
    processed: AtomicU64,
    failures: AtomicU64,
    queue_len: AtomicUsize,
    ema_latency_micros: AtomicU64,
}

impl WorkerStats {
    fn record_latency(&self, elapsed: Duration) {
        let sample = elapsed.as_micros() as u64;
        let prev = self.ema_latency_micros.load(Ordering::Relaxed);
        let next = if prev == 0 {
            sample
        } else {
            ((EMA_ALPHA * sample as f64) + ((1.0 - EMA_ALPHA) * prev as f64)) as u64
        };
        self.ema_latency_micros.store(next, Ordering::Relaxed);
    }

    fn snapshot(&self, worker: usize) -> WorkerStatSnapshot {
        WorkerStatSnapshot {
            worker,
            processed: self.processed.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            queue_len: self.queue_len.load(Ordering::Relaxed),
            ema_latency_micros: self.ema_latency_micros.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerStatSnapshot {
    pub worker: usize,
    pub processed: u64,
    pub failures: u64,
    pub queue_len: usize,
    pub ema_latency_micros: u64,
}

struct WorkerHandle<T> {
    tx: mpsc::Sender<T>,
    priority_tx: mpsc::Sender<T>,
    busy: Arc<AtomicUsize>,
    stats: Arc<WorkerStats>,
}

/// A fixed-size fleet of independent worker tasks, each batching its own
/// input stream before handing batches to a shared `BatchProcessor`.
pub struct WorkerPool<T> {
    workers: Vec<WorkerHandle<T>>,
    next: AtomicUsize,
    cancel: CancellationToken,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// `num_workers` defaults to `2 * num_cpus` at the call site (§4.I); each
    /// worker's queue is sized `queue_size / num_workers`.
    pub fn spawn<P>(num_workers: usize, queue_size: usize, processor: Arc<P>, cancel: CancellationToken) -> Arc<Self>
    where
        P: BatchProcessor<T> + 'static,
    {
        let per_worker_capacity = (queue_size / num_workers.max(1)).max(1);
        let mut workers = Vec::with_capacity(num_workers);

        for id in 0..num_workers {
            let (tx, rx) = mpsc::channel::<T>(per_worker_capacity);
            let (priority_tx, priority_rx) = mpsc::channel::<T>(per_worker_capacity);
            let busy = Arc::new(AtomicUsize::new(0));
            let stats = Arc::new(WorkerStats::default());

            tokio::spawn(worker_loop(
                id,
                rx,
                priority_rx,
                processor.clone(),
                busy.clone(),
                stats.clone(),
                cancel.clone(),
            ));

            workers.push(WorkerHandle {
                tx,
                priority_tx,
                busy,
                stats,
            });
        }

        let pool = Arc::new(Self {
            workers,
            next: AtomicUsize::new(0),
            cancel: cancel.clone(),
        });

        tokio::spawn(stats_loop(Arc::downgrade(&pool), cancel));
        pool
    }

    /// Dispatches `item` to a worker, escalating through the back-pressure
    /// ladder described in §4.I: round-robin try_send, then a short retry
    /// wait, then — for `high_priority` items only — a direct priority push
    /// to the least-busy worker, then drop. Non-high-priority items that
    /// fail the retry are dropped immediately rather than rescued, so the
    /// rescue slot stays available for the tasks that need the guarantee.
    pub async fn dispatch(&self, item: T, high_priority: bool) -> Result<(), WorkerPoolError> {
        if self.cancel.is_cancelled() {
            return Err(WorkerPoolError::ShuttingDown);
        }

        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let worker = &self.workers[idx];

        match worker.tx.try_send(item) {
            Ok(()) => {
                worker.stats.queue_len.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return Err(WorkerPoolError::ShuttingDown),
            Err(mpsc::error::TrySendError::Full(item)) => {
                tokio::time::sleep(RETRY_DELAY).await;
                match worker.tx.try_send(item) {
                    Ok(()) => {
                        worker.stats.queue_len.fetch_add(1, Ordering::Relaxed);
                        return Ok(());
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return Err(WorkerPoolError::ShuttingDown),
                    Err(mpsc::error::TrySendError::Full(item)) => {
                        if !high_priority {
                            tracing::warn!(worker = idx, "worker pool saturated, dropping low-priority item");
                            return Err(WorkerPoolError::Saturated);
                        }
                        let least_busy = self.least_busy_index();
                        let fallback = &self.workers[least_busy];
                        match timeout(ESCALATION_TIMEOUT, fallback.priority_tx.send(item)).await {
                            Ok(Ok(())) => Ok(()),
                            _ => {
                                tracing::warn!(worker = idx, "worker pool saturated, dropping high-priority item");
                                Err(WorkerPoolError::Saturated)
                            }
                        }
                    }
                }
            }
        }
    }

    fn least_busy_index(&self) -> usize {
        self.workers
            .iter()
            .enumerate()
            .min_by_key(|(_, w)| w.busy.load(Ordering::Relaxed))
            .map(|(i, _)| i)
            .unwrap_or(0)
    }

    pub fn stats(&self) -> Vec<WorkerStatSnapshot> {
        self.workers.iter().enumerate().map(|(i, w)| w.stats.snapshot(i)).collect()
    }
}

async fn worker_loop<T, P>(
    id: usize,
    mut rx: mpsc::Receiver<T>,
    mut priority_rx: mpsc::Receiver<T>,
    processor: Arc<P>,
    busy: Arc<AtomicUsize>,
    stats: Arc<WorkerStats>,
    cancel: CancellationToken,
) where
    T: Send + 'static,
    P: BatchProcessor<T> + 'static,
{
    let mut batch: Batch<T> = Vec::with_capacity(MAX_BATCH);
    let mut flush_timer = interval(MIN_BATCH_DELAY);
    let batch_deadline = Arc::new(Mutex::new(Instant::now() + MAX_BATCH_DELAY));

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                drain_remaining(&mut rx, &mut priority_rx, &mut batch);
                if !batch.is_empty() {
                    run_batch(id, &processor, std::mem::take(&mut batch), &stats).await;
                }
                return;
            }

            Some(item) = priority_rx.recv() => {
                busy.fetch_add(1, Ordering::Relaxed);
                batch.push(item);
                if batch.len() >= MAX_BATCH {
                    run_batch(id, &processor, std::mem::take(&mut batch), &stats).await;
                    *batch_deadline.lock().await = Instant::now() + MAX_BATCH_DELAY;
                }
                busy.fetch_sub(1, Ordering::Relaxed);
            }

            Some(item) = rx.recv() => {
                busy.fetch_add(1, Ordering::Relaxed);
                stats.queue_len.fetch_sub(1, Ordering::Relaxed);
                batch.push(item);
                if batch.len() >= MAX_BATCH || (batch.len() >= MIN_BATCH && Instant::now() >= *batch_deadline.lock().await) {
                    run_batch(id, &processor, std::mem::take(&mut batch), &stats).await;
                    *batch_deadline.lock().await = Instant::now() + MAX_BATCH_DELAY;
                }
                busy.fetch_sub(1, Ordering::Relaxed);
            }

            _ = flush_timer.tick() => {
                if !batch.is_empty() && Instant::now() >= *batch_deadline.lock().await {
                    run_batch(id, &processor, std::mem::take(&mut batch), &stats).await;
                    *batch_deadline.lock().await = Instant::now() + MAX_BATCH_DELAY;
                }
            }
        }
    }
}

fn drain_remaining<T>(rx: &mut mpsc::Receiver<T>, priority_rx: &mut mpsc::Receiver<T>, batch: &mut Batch<T>) {
    while let Ok(item) = rx.try_recv() {
        batch.push(item);
    }
    while let Ok(item) = priority_rx.try_recv() {
        batch.push(item);
    }
}

async fn run_batch<T, P>(id: usize, processor: &Arc<P>, batch: Batch<T>, stats: &Arc<WorkerStats>)
where
    T: Send + 'static,
    P: BatchProcessor<T> + 'static,
{
    let len = batch.len() as u64;
    let started = Instant::now();

    let processor = processor.clone();
    let result = std::panic::AssertUnwindSafe(async move { processor.process(batch).await })
        .catch_unwind()
        .await;

    stats.record_latency(started.elapsed());
    match result {
        Ok(()) => {
            stats.processed.fetch_add(len, Ordering::Relaxed);
        }
        Err(_) => {
            stats.failures.fetch_add(len, Ordering::Relaxed);
            tracing::error!(worker = id, batch_size = len, "worker panicked while processing batch");
        }
    }
}

async fn stats_loop<T: Send + 'static>(pool: std::sync::Weak<WorkerPool<T>>, cancel: CancellationToken) {
    let mut ticker = interval(STATS_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let Some(pool) = pool.upgrade() else { return };
                for snapshot in pool.stats() {
                    tracing::debug!(
                        worker = snapshot.worker,
                        processed = snapshot.processed,
                        failures = snapshot.failures,
                        queue_len = snapshot.queue_len,
                        ema_latency_micros = snapshot.ema_latency_micros,
                        "worker pool stats"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64 as TestCounter;

    struct CountingProcessor {
        count: Arc<TestCounter>,
    }

    #[async_trait]
    impl BatchProcessor<u32> for CountingProcessor {
        async fn process(&self, batch: Batch<u32>) {
            self.count.fetch_add(batch.len() as u64, Ordering::Relaxed);
        }
    }

    #[tokio::test]
    async fn dispatches_and_flushes_batches() {
        let count = Arc::new(TestCounter::new(0));
        let cancel = CancellationToken::new();
        let pool = WorkerPool::spawn(2, 100, Arc::new(CountingProcessor { count: count.clone() }), cancel.clone());

        for i in 0..25u32 {
            pool.dispatch(i, false).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(count.load(Ordering::Relaxed) > 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn drains_partial_batch_on_cancellation() {
        let count = Arc::new(TestCounter::new(0));
        let cancel = CancellationToken::new();
        let pool = WorkerPool::spawn(1, 50, Arc::new(CountingProcessor { count: count.clone() }), cancel.clone());

        pool.dispatch(1u32, false).await.unwrap();
        pool.dispatch(2u32, false).await.unwrap();
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::Relaxed), 2);
    }
}
