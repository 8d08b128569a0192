//! Process-global monitor (§4.K): atomic counters, per-rule/per-action
//! latency, a capped error ring buffer, pluggable health checks, and a JSON
//! snapshot for observability.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;

use crate::error::{ErrorLevel, ErrorType};

const DEFAULT_RING_SIZE: usize = 1000;
const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const EMA_ALPHA: f64 = 0.3;

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEntry {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub error_type: ErrorType,
    pub level: ErrorLevel,
    pub context: String,
    pub retryable: bool,
}

#[derive(Debug, Default)]
struct LatencyStats {
    ema_micros: AtomicU64,
    min_micros: AtomicU64,
    max_micros: AtomicU64,
}

impl LatencyStats {
    fn record(&self, elapsed: Duration) {
        let sample = elapsed.as_micros() as u64;
        let prev_ema = self.ema_micros.load(Ordering::Relaxed);
        let next_ema = if prev_ema == 0 {
            sample
        } else {
            ((EMA_ALPHA * sample as f64) + ((1.0 - EMA_ALPHA) * prev_ema as f64)) as u64
        };
        self.ema_micros.store(next_ema, Ordering::Relaxed);

        self.min_micros
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |m| Some(if m == 0 { sample } else { m.min(sample) }))
            .ok();
        self.max_micros.fetch_max(sample, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LatencySnapshot {
        LatencySnapshot {
            ema_micros: self.ema_micros.load(Ordering::Relaxed),
            min_micros: self.min_micros.load(Ordering::Relaxed),
            max_micros: self.max_micros.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencySnapshot {
    pub ema_micros: u64,
    pub min_micros: u64,
    pub max_micros: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResult {
    pub name: String,
    pub state: HealthState,
    pub message: String,
}

/// Implemented by pluggable health checkers registered with the monitor.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;
    async fn check(&self) -> HealthResult;
}

/// Alert thresholds logged as warnings when exceeded (§4.K).
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub max_error_rate: f64,
    pub max_queue_length: usize,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            max_error_rate: 0.1,
            max_queue_length: 10_000,
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct Counters {
    pub points_processed: u64,
    pub rules_matched: u64,
    pub actions_executed: u64,
    pub actions_succeeded: u64,
    pub actions_failed: u64,
}

struct AtomicCounters {
    points_processed: AtomicU64,
    rules_matched: AtomicU64,
    actions_executed: AtomicU64,
    actions_succeeded: AtomicU64,
    actions_failed: AtomicU64,
}

impl Default for AtomicCounters {
    fn default() -> Self {
        Self {
            points_processed: AtomicU64::new(0),
            rules_matched: AtomicU64::new(0),
            actions_executed: AtomicU64::new(0),
            actions_succeeded: AtomicU64::new(0),
            actions_failed: AtomicU64::new(0),
        }
    }
}

impl AtomicCounters {
    fn snapshot(&self) -> Counters {
        Counters {
            points_processed: self.points_processed.load(Ordering::Relaxed),
            rules_matched: self.rules_matched.load(Ordering::Relaxed),
            actions_executed: self.actions_executed.load(Ordering::Relaxed),
            actions_succeeded: self.actions_succeeded.load(Ordering::Relaxed),
            actions_failed: self.actions_failed.load(Ordering::Relaxed),
        }
    }
}

pub struct Monitor {
    counters: AtomicCounters,
    rule_latency: RwLock<HashMap<String, Arc<LatencyStats>>>,
    action_latency: RwLock<HashMap<String, Arc<LatencyStats>>>,
    errors: Mutex<VecDeque<ErrorEntry>>,
    next_error_id: AtomicU64,
    ring_size: usize,
    health_checks: RwLock<Vec<Arc<dyn HealthCheck>>>,
    last_health: RwLock<Vec<HealthResult>>,
    thresholds: Thresholds,
}

impl Monitor {
    pub fn new(ring_size: usize, thresholds: Thresholds) -> Arc<Self> {
        Arc::new(Self {
            counters: AtomicCounters::default(),
            rule_latency: RwLock::new(HashMap::new()),
            action_latency: RwLock::new(HashMap::new()),
            errors: Mutex::new(VecDeque::with_capacity(ring_size)),
            next_error_id: AtomicU64::new(1),
            ring_size: ring_size.max(1),
            health_checks: RwLock::new(Vec::new()),
            last_health: RwLock::new(Vec::new()),
            thresholds,
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(DEFAULT_RING_SIZE, Thresholds::default())
    }

    pub fn record_point_processed(&self) {
        self.counters.points_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rule_matched(&self, rule_id: &str, elapsed: Duration) {
        self.counters.rules_matched.fetch_add(1, Ordering::Relaxed);
        self.latency_for(&self.rule_latency, rule_id).record(elapsed);
    }

    pub fn record_action(&self, action_type: &str, succeeded: bool, elapsed: Duration) {
        self.counters.actions_executed.fetch_add(1, Ordering::Relaxed);
        if succeeded {
            self.counters.actions_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.actions_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.latency_for(&self.action_latency, action_type).record(elapsed);
    }

    fn latency_for(&self, map: &RwLock<HashMap<String, Arc<LatencyStats>>>, key: &str) -> Arc<LatencyStats> {
        if let Some(existing) = map.read().get(key) {
            return existing.clone();
        }
        let mut write_guard = map.write();
        write_guard.entry(key.to_string()).or_insert_with(|| Arc::new(LatencyStats::default())).clone()
    }

    /// Appends an error to the ring buffer, evicting the oldest entry once
    /// `ring_size` is exceeded. Also logs through `tracing` at a level
    /// matching `level`.
    pub fn record_error(&self, error_type: ErrorType, level: ErrorLevel, context: impl Into<String>) {
        let context = context.into();
        let entry = ErrorEntry {
            id: self.next_error_id.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
            error_type,
            level,
            context: context.clone(),
            retryable: error_type.retryable(),
        };

        match level {
            ErrorLevel::Info => tracing::info!(error_type = ?error_type, %context, "monitor recorded error"),
            ErrorLevel::Warning => tracing::warn!(error_type = ?error_type, %context, "monitor recorded error"),
            ErrorLevel::Error | ErrorLevel::Critical => {
                tracing::error!(error_type = ?error_type, level = ?level, %context, "monitor recorded error")
            }
        }

        let mut errors = self.errors.lock();
        if errors.len() >= self.ring_size {
            errors.pop_front();
        }
        errors.push_back(entry);
    }

    pub fn register_health_check(&self, check: Arc<dyn HealthCheck>) {
        self.health_checks.write().push(check);
    }

    /// Runs every registered health check with a bounded timeout and
    /// records the aggregate result; called periodically by
    /// [`spawn_health_loop`].
    pub async fn run_health_checks(&self) {
        let checks: Vec<_> = self.health_checks.read().iter().cloned().collect();
        let mut results = Vec::with_capacity(checks.len());
        for check in checks {
            let result = match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, check.check()).await {
                Ok(r) => r,
                Err(_) => HealthResult {
                    name: check.name().to_string(),
                    state: HealthState::Unhealthy,
                    message: "health check timed out".to_string(),
                },
            };
            results.push(result);
        }
        *self.last_health.write() = results;
    }

    pub fn aggregate_health(&self) -> HealthState {
        let results = self.last_health.read();
        if results.iter().any(|r| r.state == HealthState::Unhealthy) {
            HealthState::Unhealthy
        } else if results.iter().any(|r| r.state == HealthState::Degraded) {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        }
    }

    /// Compares current counters against configured thresholds and logs a
    /// warning for each exceeded one.
    pub fn check_thresholds(&self, queue_length: usize) {
        let counters = self.counters.snapshot();
        if counters.actions_executed > 0 {
            let error_rate = counters.actions_failed as f64 / counters.actions_executed as f64;
            if error_rate > self.thresholds.max_error_rate {
                tracing::warn!(error_rate, threshold = self.thresholds.max_error_rate, "action error rate threshold exceeded");
            }
        }
        if queue_length > self.thresholds.max_queue_length {
            tracing::warn!(queue_length, threshold = self.thresholds.max_queue_length, "queue length threshold exceeded");
        }
    }

    /// JSON snapshot with metrics, health, per-rule/action stats, and the
    /// most recent `recent_errors` ring entries (newest last).
    pub fn snapshot(&self, recent_errors: usize) -> serde_json::Value {
        let errors = self.errors.lock();
        let recent: Vec<_> = errors.iter().rev().take(recent_errors).rev().cloned().collect();

        let rule_stats: HashMap<String, LatencySnapshot> =
            self.rule_latency.read().iter().map(|(k, v)| (k.clone(), v.snapshot())).collect();
        let action_stats: HashMap<String, LatencySnapshot> =
            self.action_latency.read().iter().map(|(k, v)| (k.clone(), v.snapshot())).collect();

        json!({
            "metrics": self.counters.snapshot(),
            "health": {
                "aggregate": self.aggregate_health(),
                "checks": self.last_health.read().clone(),
            },
            "stats": {
                "rules": rule_stats,
                "actions": action_stats,
            },
            "recent_errors": recent,
        })
    }
}

/// Spawns the periodic health-check loop at `interval` (default 30 s,
/// §4.K).
pub fn spawn_health_loop(monitor: Arc<Monitor>, interval: Duration, cancel: tokio_util::sync::CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(if interval.is_zero() { DEFAULT_HEALTH_INTERVAL } else { interval });
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => monitor.run_health_checks().await,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysHealthy;

    #[async_trait]
    impl HealthCheck for AlwaysHealthy {
        fn name(&self) -> &str {
            "always-healthy"
        }
        async fn check(&self) -> HealthResult {
            HealthResult {
                name: self.name().to_string(),
                state: HealthState::Healthy,
                message: "ok".into(),
            }
        }
    }

    struct AlwaysUnhealthy;

    #[async_trait]
    impl HealthCheck for AlwaysUnhealthy {
        fn name(&self) -> &str {
            "always-unhealthy"
        }
        async fn check(&self) -> HealthResult {
            HealthResult {
                name: self.name().to_string(),
                state: HealthState::Unhealthy,
                message: "boom".into(),
            }
        }
    }

    #[test]
    fn counters_increment_on_action_outcomes() {
        let monitor = Monitor::with_defaults();
        monitor.record_action("forward", true, Duration::from_millis(5));
        monitor.record_action("forward", false, Duration::from_millis(5));
        let snapshot = monitor.counters.snapshot();
        assert_eq!(snapshot.actions_executed, 2);
        assert_eq!(snapshot.actions_succeeded, 1);
        assert_eq!(snapshot.actions_failed, 1);
    }

    #[test]
    fn error_ring_evicts_oldest_when_full() {
        let monitor = Monitor::new(2, Thresholds::default());
        monitor.record_error(ErrorType::System, ErrorLevel::Warning, "first");
        monitor.record_error(ErrorType::System, ErrorLevel::Warning, "second");
        monitor.record_error(ErrorType::System, ErrorLevel::Warning, "third");
        let snapshot = monitor.snapshot(10);
        let errors = snapshot["recent_errors"].as_array().unwrap();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0]["context"], "second");
        assert_eq!(errors[1]["context"], "third");
    }

    #[tokio::test]
    async fn aggregate_health_reflects_worst_checker() {
        let monitor = Monitor::with_defaults();
        monitor.register_health_check(Arc::new(AlwaysHealthy));
        monitor.register_health_check(Arc::new(AlwaysUnhealthy));
        monitor.run_health_checks().await;
        assert_eq!(monitor.aggregate_health(), HealthState::Unhealthy);
    }
}
