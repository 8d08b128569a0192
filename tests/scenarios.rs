//! Black-box scenarios exercising the rule engine pipeline, action
//! handlers, worker pool back-pressure, and the ISP wire protocol
//! end to end, against real TCP sockets and the in-memory bus.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use iot_gateway::actions::{ActionContext, ActionHandler, AggregateHandler, AlertHandler, ForwardHandler};
use iot_gateway::aggregate::ShardedAggregateStates;
use iot_gateway::bus::InMemoryBus;
use iot_gateway::engine::{evaluate_checked, FunctionRegistry};
use iot_gateway::index::RuleIndex;
use iot_gateway::isp::{IspAdapterProxy, IspMessage, MessageType};
use iot_gateway::point::{Point, Value};
use iot_gateway::rules::model::{Action, Condition, Operator, Rule};
use iot_gateway::workerpool::{BatchProcessor, WorkerPool};

fn rule_with(id: &str, op: Operator, value: serde_json::Value, action: Action) -> Rule {
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
            operator: op,
            value,
        },
        actions: vec![action],
        tags: HashMap::new(),
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    }
}

fn forward_action(subject: &str) -> Action {
    Action {
        action_type: "forward".into(),
        config: serde_json::json!({"subject": subject}),
        async_exec: false,
        timeout: None,
        retry: None,
    }
}

// S1 — a matching point dispatches a forward action to the configured subject,
// carrying the rule id in its payload.
#[tokio::test]
async fn s1_simple_forward() {
    let bus = InMemoryBus::new();
    let aggregates = Arc::new(ShardedAggregateStates::new(4));
    let ctx = ActionContext::new(bus.clone(), aggregates, Vec::new());

    let mut rx = bus.subscribe("iot.transformed.d1.temperature");
    let rule = rule_with("r1", Operator::Gt, serde_json::json!(30.0), forward_action("iot.transformed.d1.temperature"));
    let point = Point::new("d1", "temperature", Value::Float(35.0));

    let functions = FunctionRegistry::new();
    assert!(evaluate_checked(&rule.conditions, &point, &functions).unwrap());

    let result = ForwardHandler.execute(&point, &rule, &rule.actions[0].config, &ctx).await;
    assert!(result.success);

    let msg = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    let payload: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
    assert_eq!(payload["rule_id"], "r1");
    assert_eq!(payload["value"], serde_json::json!({"type": "float", "value": 35.0}));
}

// S2 — an aggregate action only emits once its window fills, and the emitted
// point carries the averaged value.
#[tokio::test]
async fn s2_windowed_average() {
    let bus = InMemoryBus::new();
    let aggregates = Arc::new(ShardedAggregateStates::new(4));
    let ctx = ActionContext::new(bus.clone(), aggregates, Vec::new());

    let rule = rule_with(
        "r2",
        Operator::Gt,
        serde_json::json!(0.0),
        Action {
            action_type: "aggregate".into(),
            config: serde_json::json!({"window_size": 3, "functions": ["avg"], "group_by": ["device_id"]}),
            async_exec: false,
            timeout: None,
            retry: None,
        },
    );

    let mut last = None;
    for v in [10.0, 20.0, 30.0] {
        let point = Point::new("d1", "temp", Value::Float(v));
        last = Some(
            AggregateHandler
                .execute(&point, &rule, &rule.actions[0].config, &ctx)
                .await,
        );
    }
    let result = last.unwrap();
    assert_eq!(result.output["window_ready"], serde_json::json!(true));
    assert_eq!(result.output["functions"]["avg"], serde_json::json!(20.0));
}

// S3 — alert throttling suppresses repeat fires within the window and lets
// a fire through once the window has elapsed.
#[tokio::test]
async fn s3_alert_throttling() {
    let bus = InMemoryBus::new();
    let aggregates = Arc::new(ShardedAggregateStates::new(4));
    let ctx = ActionContext::new(bus, aggregates, Vec::new());

    let rule = rule_with(
        "r3",
        Operator::Gt,
        serde_json::json!(100.0),
        Action {
            action_type: "alert".into(),
            config: serde_json::json!({"message": "hot", "channels": ["console"], "throttle": 0.05}),
            async_exec: false,
            timeout: None,
            retry: None,
        },
    );
    let point = Point::new("d1", "temp", Value::Float(120.0));

    let first = AlertHandler.execute(&point, &rule, &rule.actions[0].config, &ctx).await;
    assert!(first.success);
    assert!(first.output.get("throttled").is_none());

    let second = AlertHandler.execute(&point, &rule, &rule.actions[0].config, &ctx).await;
    assert_eq!(second.output["throttled"], serde_json::json!(true));

    tokio::time::sleep(Duration::from_millis(80)).await;
    let third = AlertHandler.execute(&point, &rule, &rule.actions[0].config, &ctx).await;
    assert!(third.output.get("throttled").is_none());
}

// S4 — a NaN value never matches a numeric comparison and never errors.
#[tokio::test]
async fn s4_nan_safety() {
    let rule = rule_with("r4", Operator::Gt, serde_json::json!(0.0), forward_action("iot.out"));
    let point = Point::new("d1", "temp", Value::Float(f64::NAN));
    let functions = FunctionRegistry::new();

    let matched = evaluate_checked(&rule.conditions, &point, &functions).unwrap();
    assert!(!matched);

    let index = Arc::new(RuleIndex::new());
    index.rebuild(vec![rule]);
    assert_eq!(index.candidates(&point).len(), 1, "index matching is field-based, not value-based");
}

// S5 — the sidecar adapter proxy translates a `data` frame from a sidecar
// into an int-valued point on its output channel.
#[tokio::test]
async fn s5_sidecar_data_frame() {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = tokio::io::split(socket);
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        let _ = reader.read_line(&mut line).await;

        let msg = IspMessage::new(
            MessageType::Data,
            serde_json::json!({"points": [{"key": "v", "source": "d1", "value": 42, "type": "int", "timestamp": 0}]}),
        );
        let mut out = serde_json::to_string(&msg).unwrap();
        out.push('\n');
        let _ = write_half.write_all(out.as_bytes()).await;
    });

    let (tx, mut rx) = mpsc::channel(8);
    let proxy = IspAdapterProxy::connect(addr.ip().to_string(), addr.port(), tx).await.unwrap();
    proxy
        .send_config(IspMessage::new(MessageType::Config, serde_json::json!({})))
        .await
        .unwrap();

    let msg = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(msg.kind, MessageType::Data);
    assert_eq!(msg.payload["points"][0]["value"], serde_json::json!(42));
}

// S6 — submitting far more work than the pool can absorb produces dropped
// items rather than unbounded queueing or a panic.
#[tokio::test]
async fn s6_worker_pool_back_pressure() {
    struct SlowProcessor;

    #[async_trait]
    impl BatchProcessor<u32> for SlowProcessor {
        async fn process(&self, batch: Vec<u32>) {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = batch;
        }
    }

    let cancel = CancellationToken::new();
    let queue_size = 4;
    let pool = WorkerPool::spawn(1, queue_size, Arc::new(SlowProcessor), cancel.clone());

    let mut dropped = 0;
    for i in 0..(10 * queue_size) as u32 {
        if pool.dispatch(i, false).await.is_err() {
            dropped += 1;
        }
    }

    assert!(dropped > 0, "expected back-pressure to drop at least one item under sustained overload");
    cancel.cancel();
}

// S6 (alert) — a high-priority task (standing in for an `alert` action)
// dispatched concurrently with a flood of ordinary ones must never be
// dropped, while the flood itself still takes losses.
#[tokio::test]
async fn s6_alert_task_survives_concurrent_flood() {
    struct SlowProcessor;

    #[async_trait]
    impl BatchProcessor<u32> for SlowProcessor {
        async fn process(&self, batch: Vec<u32>) {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = batch;
        }
    }

    let cancel = CancellationToken::new();
    let queue_size = 4;
    let pool = WorkerPool::spawn(1, queue_size, Arc::new(SlowProcessor), cancel.clone());

    let mut flood = tokio::task::JoinSet::new();
    for i in 0..40u32 {
        let pool = pool.clone();
        flood.spawn(async move { pool.dispatch(i, false).await });
    }

    let alert_result = pool.dispatch(9999, true).await;
    assert!(
        alert_result.is_ok(),
        "a high-priority (alert) task must never be dropped under concurrent saturation"
    );

    while flood.join_next().await.is_some() {}
    cancel.cancel();
}
