//! Rule engine pipeline: the consumer that ties the rule store/index
//! (§4.F/§4.H), the condition/expression evaluator (§4.G), the sharded
//! worker pool (§4.I), and the action handlers (§4.L) into one running
//! loop. Subscribes `iot.data.>` on the bus — the subject the fan-out loop
//! (§4.E) publishes every point to — and keeps the index in sync with the
//! rule store's hot-reload change stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::actions::{default_handlers, ActionContext, ActionHandler};
use crate::bus::Bus;
use crate::engine::eval::evaluate_checked;
use crate::engine::functions::FunctionRegistry;
use crate::error::{ErrorLevel, ErrorType};
use crate::index::RuleIndex;
use crate::monitor::Monitor;
use crate::point::Point;
use crate::rules::model::{ChangeKind, Rule, RuleChangeEvent};
use crate::sink::Sink;
use crate::workerpool::{BatchProcessor, WorkerPool};

/// One rule matched against one point, queued for action execution.
struct DispatchJob {
    point: Point,
    rule: Arc<Rule>,
}

/// A rule earns the worker pool's priority-rescue guarantee (§4.I step 2)
/// when its priority is 90 or above, or any of its actions is an `alert` —
/// alert delivery must survive saturation that ordinary dispatch work does
/// not.
fn is_high_priority(rule: &Rule) -> bool {
    rule.priority >= 90 || rule.actions.iter().any(|a| a.action_type == "alert")
}

struct ActionBatchProcessor {
    ctx: Arc<ActionContext>,
    handlers: HashMap<&'static str, Arc<dyn ActionHandler>>,
    monitor: Arc<Monitor>,
}

#[async_trait]
impl BatchProcessor<DispatchJob> for ActionBatchProcessor {
    async fn process(&self, batch: Vec<DispatchJob>) {
        for job in batch {
            for action in &job.rule.actions {
                let Some(handler) = self.handlers.get(action.action_type.as_str()) else {
                    self.monitor.record_error(
                        ErrorType::Action,
                        ErrorLevel::Warning,
                        format!("unknown action type {}", action.action_type),
                    );
                    continue;
                };
                let started = Instant::now();
                let result = handler.execute(&job.point, &job.rule, &action.config, &self.ctx).await;
                self.monitor.record_action(handler.action_type(), result.success, started.elapsed());
                if !result.success {
                    self.monitor.record_error(
                        ErrorType::Action,
                        ErrorLevel::Error,
                        format!(
                            "action {} failed for rule {}: {}",
                            handler.action_type(),
                            job.rule.id,
                            result.error.unwrap_or_default()
                        ),
                    );
                }
            }
        }
    }
}

/// Sizing knobs for the worker pool backing the pipeline (§4.I).
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub num_workers: usize,
    pub queue_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            num_workers: 2 * num_cpus::get(),
            queue_size: 1000,
        }
    }
}

/// Spawns the rule engine's main loop. Returns a handle that completes once
/// `cancel` fires and both the bus subscription and change-event stream have
/// drained.
#[allow(clippy::too_many_arguments)]
pub fn spawn(
    config: PipelineConfig,
    bus: Arc<dyn Bus>,
    index: Arc<RuleIndex>,
    rule_changes: mpsc::Receiver<RuleChangeEvent>,
    aggregates: Arc<crate::aggregate::ShardedAggregateStates>,
    sinks: Vec<(String, Arc<tokio::sync::Mutex<Box<dyn Sink>>>)>,
    monitor: Arc<Monitor>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let ctx = Arc::new(ActionContext::new(bus.clone(), aggregates, sinks));
    let processor = Arc::new(ActionBatchProcessor {
        ctx,
        handlers: default_handlers(),
        monitor: monitor.clone(),
    });
    let pool = WorkerPool::spawn(config.num_workers.max(1), config.queue_size, processor, cancel.clone());
    let functions = FunctionRegistry::new();

    tokio::spawn(run(bus, index, rule_changes, pool, functions, monitor, cancel))
}

async fn run(
    bus: Arc<dyn Bus>,
    index: Arc<RuleIndex>,
    mut rule_changes: mpsc::Receiver<RuleChangeEvent>,
    pool: Arc<WorkerPool<DispatchJob>>,
    functions: FunctionRegistry,
    monitor: Arc<Monitor>,
    cancel: CancellationToken,
) {
    let mut data_rx = bus.subscribe("iot.data.>");
    let mut stats_ticker = tokio::time::interval(Duration::from_secs(30));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,

            maybe_event = rule_changes.recv() => {
                match maybe_event {
                    Some(event) => apply_change(&index, event),
                    None => {}
                }
            }

            maybe_msg = data_rx.recv() => {
                let Some(msg) = maybe_msg else { continue };
                let point: Point = match serde_json::from_slice(&msg.payload) {
                    Ok(p) => p,
                    Err(e) => {
                        monitor.record_error(ErrorType::System, ErrorLevel::Warning, format!("malformed point on {}: {e}", msg.subject));
                        continue;
                    }
                };
                monitor.record_point_processed();

                for rule in index.candidates(&point) {
                    let started = Instant::now();
                    let matched = match evaluate_checked(&rule.conditions, &point, &functions) {
                        Ok(m) => m,
                        Err(e) => {
                            monitor.record_error(ErrorType::Condition, ErrorLevel::Warning, format!("rule {} condition error: {e}", rule.id));
                            continue;
                        }
                    };
                    if !matched {
                        continue;
                    }
                    monitor.record_rule_matched(&rule.id, started.elapsed());
                    let high_priority = is_high_priority(&rule);
                    let job = DispatchJob { point: point.clone(), rule: rule.clone() };
                    if pool.dispatch(job, high_priority).await.is_err() {
                        monitor.record_error(ErrorType::System, ErrorLevel::Warning, format!("worker pool saturated, dropped match for rule {}", rule.id));
                    }
                }
            }

            _ = stats_ticker.tick() => {
                monitor.check_thresholds(0);
            }
        }
    }
}

fn apply_change(index: &RuleIndex, event: RuleChangeEvent) {
    match event.kind {
        ChangeKind::Create | ChangeKind::Update => {
            if let Some(rule) = event.rule {
                index.upsert(rule);
            }
        }
        ChangeKind::Delete => index.remove(&event.id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::point::Value;
    use crate::rules::model::{Action, Condition, Operator};

    fn rule(id: &str, threshold: f64) -> Rule {
        Rule {
            id: id.into(),
            name: id.into(),
            description: String::new(),
            enabled: true,
            priority: 0,
            version: 1,
            data_type: None,
            conditions: Condition::Simple {
                field: "value".into(),
                operator: Operator::Gt,
                value: serde_json::json!(threshold),
            },
            actions: vec![Action {
                action_type: "forward".into(),
                config: serde_json::json!({"subject": "iot.matched"}),
                async_exec: false,
                timeout: None,
                retry: None,
            }],
            tags: HashMap::new(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn matching_point_triggers_forward_action() {
        let bus = InMemoryBus::new();
        let mut matched_rx = bus.subscribe("iot.matched");

        let index = Arc::new(RuleIndex::new());
        index.rebuild(vec![rule("hot", 30.0)]);

        let (_tx, rx) = mpsc::channel(1);
        let monitor = Monitor::with_defaults();
        let aggregates = Arc::new(crate::aggregate::ShardedAggregateStates::new(4));
        let cancel = CancellationToken::new();

        let handle = spawn(
            PipelineConfig { num_workers: 1, queue_size: 16 },
            bus.clone(),
            index,
            rx,
            aggregates,
            Vec::new(),
            monitor,
            cancel.clone(),
        );

        bus.publish(
            "iot.data.d1.temp",
            bytes::Bytes::from(serde_json::to_vec(&Point::new("d1", "temp", Value::Float(42.0))).unwrap()),
        )
        .await;

        let msg = tokio::time::timeout(Duration::from_secs(2), matched_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.subject, "iot.matched");

        cancel.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn non_matching_point_triggers_no_action() {
        let bus = InMemoryBus::new();
        let mut matched_rx = bus.subscribe("iot.matched");

        let index = Arc::new(RuleIndex::new());
        index.rebuild(vec![rule("hot", 100.0)]);

        let (_tx, rx) = mpsc::channel(1);
        let monitor = Monitor::with_defaults();
        let aggregates = Arc::new(crate::aggregate::ShardedAggregateStates::new(4));
        let cancel = CancellationToken::new();

        let handle = spawn(
            PipelineConfig { num_workers: 1, queue_size: 16 },
            bus.clone(),
            index,
            rx,
            aggregates,
            Vec::new(),
            monitor,
            cancel.clone(),
        );

        bus.publish(
            "iot.data.d1.temp",
            bytes::Bytes::from(serde_json::to_vec(&Point::new("d1", "temp", Value::Float(1.0))).unwrap()),
        )
        .await;

        let got = tokio::time::timeout(Duration::from_millis(200), matched_rx.recv()).await;
        assert!(got.is_err(), "no action should have fired for a non-matching point");

        cancel.cancel();
        let _ = handle.await;
    }
}
