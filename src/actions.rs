//! Action handlers (§4.L): `alert`, `forward`, `transform`, `aggregate`.

use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

use crate::aggregate::{build_group_key, render_output_key, ShardedAggregateStates};
use crate::bus::Bus;
use crate::point::{Point, Value};
use crate::rules::model::Rule;
use crate::sink::Sink;

#[derive(Error, Debug)]
pub enum ActionError {
    #[error("unknown action type: {0}")]
    UnknownType(String),
    #[error("invalid action config: {0}")]
    InvalidConfig(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionResult {
    #[serde(rename = "type")]
    pub action_type: String,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub output: JsonValue,
}

impl ActionResult {
    fn ok(action_type: &str, started: Instant, output: JsonValue) -> Self {
        Self {
            action_type: action_type.to_string(),
            success: true,
            error: None,
            duration_ms: started.elapsed().as_millis() as u64,
            output,
        }
    }

    fn err(action_type: &str, started: Instant, error: impl Into<String>) -> Self {
        Self {
            action_type: action_type.to_string(),
            success: false,
            error: Some(error.into()),
            duration_ms: started.elapsed().as_millis() as u64,
            output: JsonValue::Null,
        }
    }
}

/// Shared collaborators every action handler may need. Constructed once by
/// the rule engine and handed to every dispatched action.
pub struct ActionContext {
    pub bus: Arc<dyn Bus>,
    pub sinks: RwLock<Vec<(String, Arc<AsyncMutex<Box<dyn Sink>>>)>>,
    pub aggregates: Arc<ShardedAggregateStates>,
    pub http: reqwest::Client,
    throttle: Mutex<HashMap<(String, String, String), Instant>>,
}

impl ActionContext {
    pub fn new(
        bus: Arc<dyn Bus>,
        aggregates: Arc<ShardedAggregateStates>,
        sinks: Vec<(String, Arc<AsyncMutex<Box<dyn Sink>>>)>,
    ) -> Self {
        Self {
            bus,
            sinks: RwLock::new(sinks),
            aggregates,
            http: reqwest::Client::new(),
            throttle: Mutex::new(HashMap::new()),
        }
    }

    /// Atomic check-and-record: returns `true` (and records now) only if
    /// the key has not fired within `window`.
    fn should_fire(&self, key: (String, String, String), window: Duration) -> bool {
        let mut throttle = self.throttle.lock();
        match throttle.get(&key) {
            Some(last) if last.elapsed() < window => false,
            _ => {
                throttle.insert(key, Instant::now());
                true
            }
        }
    }
}

/// Universal contract every action type implements (§4.L).
#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn action_type(&self) -> &'static str;
    async fn execute(&self, point: &Point, rule: &Rule, config: &JsonValue, ctx: &ActionContext) -> ActionResult;
}

fn optimized_aggregate_enabled() -> bool {
    env::var("IOT_GATEWAY_ENABLE_OPTIMIZED_AGGREGATE")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes"))
        .unwrap_or(false)
}

// ─── alert ──────────────────────────────────────────────────────────────────

pub struct AlertHandler;

#[derive(Debug, serde::Deserialize)]
struct AlertConfig {
    message: String,
    #[serde(default)]
    level: String,
    #[serde(default)]
    channels: Vec<String>,
    #[serde(default, with = "humantime_secs")]
    throttle: Option<Duration>,
    #[serde(default)]
    webhook_url: Option<String>,
    #[serde(default)]
    webhook_bearer: Option<String>,
    #[serde(default)]
    retry_delay_ms: Option<u64>,
    #[serde(default)]
    retry_count: Option<u32>,
}

mod humantime_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(d)?;
        Ok(secs.map(Duration::from_secs_f64))
    }
}

/// Renders `{{.Field}}`-style placeholders against the point and rule,
/// falling back to the literal placeholder text when a field is unknown —
/// mirroring the template engine's documented fallback behaviour.
fn render_template(template: &str, point: &Point, rule: &Rule) -> String {
    let mut out = template.to_string();
    let value_str = match &point.value {
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::String(s) => s.clone(),
        other => format!("{other:?}"),
    };
    let substitutions: [(&str, &str); 5] = [
        ("{{.DeviceID}}", point.device_id.as_str()),
        ("{{.Key}}", point.key.as_str()),
        ("{{.Value}}", value_str.as_str()),
        ("{{.RuleName}}", rule.name.as_str()),
        ("{{.RuleID}}", rule.id.as_str()),
    ];
    for (placeholder, value) in substitutions {
        out = out.replace(placeholder, value);
    }
    out
}

#[async_trait]
impl ActionHandler for AlertHandler {
    fn action_type(&self) -> &'static str {
        "alert"
    }

    async fn execute(&self, point: &Point, rule: &Rule, config: &JsonValue, ctx: &ActionContext) -> ActionResult {
        let started = Instant::now();
        let cfg: AlertConfig = match serde_json::from_value(config.clone()) {
            Ok(c) => c,
            Err(e) => return ActionResult::err(self.action_type(), started, format!("invalid alert config: {e}")),
        };

        let level = if cfg.level.is_empty() { "warning".to_string() } else { cfg.level.clone() };
        let throttle_key = (rule.id.clone(), point.device_id.clone(), point.key.clone());
        if let Some(window) = cfg.throttle {
            if !ctx.should_fire(throttle_key, window) {
                return ActionResult::ok(self.action_type(), started, json!({"throttled": true}));
            }
        }

        let message = render_template(&cfg.message, point, rule);
        let retry_count = cfg.retry_count.unwrap_or(0);
        let retry_delay = Duration::from_millis(cfg.retry_delay_ms.unwrap_or(0));

        let mut channel_results = Vec::new();
        for channel in &cfg.channels {
            let outcome = self
                .dispatch_channel(channel, &message, &level, &cfg, ctx, retry_count, retry_delay)
                .await;
            channel_results.push(json!({"channel": channel, "ok": outcome.is_ok()}));
        }

        ctx.bus
            .publish(
                "iot.alerts.triggered",
                bytes::Bytes::from(message.clone().into_bytes()),
            )
            .await;
        ctx.bus
            .publish(
                &format!("iot.alerts.triggered.{level}"),
                bytes::Bytes::from(message.into_bytes()),
            )
            .await;

        ActionResult::ok(self.action_type(), started, json!({"channels": channel_results}))
    }
}

impl AlertHandler {
    #[allow(clippy::too_many_arguments)]
    async fn dispatch_channel(
        &self,
        channel: &str,
        message: &str,
        level: &str,
        cfg: &AlertConfig,
        ctx: &ActionContext,
        retry_count: u32,
        retry_delay: Duration,
    ) -> Result<(), ActionError> {
        let mut attempts_left = retry_count + 1;
        loop {
            let result = match channel {
                "console" => {
                    tracing::info!(level, message, "alert");
                    Ok(())
                }
                "nats" | "bus" => {
                    ctx.bus
                        .publish(&format!("iot.alerts.{level}"), bytes::Bytes::from(message.to_string().into_bytes()))
                        .await;
                    Ok(())
                }
                "webhook" => self.send_webhook(message, level, cfg, ctx).await,
                "email" | "sms" => Ok(()),
                other => Err(ActionError::UnknownType(other.to_string())),
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempts_left > 1 => {
                    attempts_left -= 1;
                    tokio::time::sleep(retry_delay).await;
                    tracing::warn!(channel, error = %e, "alert channel dispatch failed, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_webhook(&self, message: &str, level: &str, cfg: &AlertConfig, ctx: &ActionContext) -> Result<(), ActionError> {
        let url = cfg.webhook_url.as_deref().ok_or_else(|| ActionError::InvalidConfig("webhook_url missing".into()))?;
        let mut req = ctx
            .http
            .post(url)
            .timeout(Duration::from_secs(10))
            .json(&json!({"message": message, "level": level}));
        if let Some(bearer) = &cfg.webhook_bearer {
            req = req.bearer_auth(bearer);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(ActionError::InvalidConfig(format!("webhook returned {}", resp.status())));
        }
        Ok(())
    }
}

// ─── forward ────────────────────────────────────────────────────────────────

pub struct ForwardHandler;

#[derive(Debug, Default, serde::Deserialize)]
struct ForwardConfig {
    #[serde(default)]
    subject: Option<String>,
}

#[async_trait]
impl ActionHandler for ForwardHandler {
    fn action_type(&self) -> &'static str {
        "forward"
    }

    async fn execute(&self, point: &Point, rule: &Rule, config: &JsonValue, ctx: &ActionContext) -> ActionResult {
        let started = Instant::now();
        let cfg: ForwardConfig = serde_json::from_value(config.clone()).unwrap_or_default();
        let subject = cfg.subject.unwrap_or_else(|| point.data_subject());

        let payload = json!({
            "device_id": point.device_id,
            "key": point.key,
            "value": point.value,
            "timestamp": point.timestamp,
            "quality": point.quality,
            "tags": point.tags.copy(),
            "rule_id": rule.id,
            "rule_name": rule.name,
        });

        let bytes = match serde_json::to_vec(&payload) {
            Ok(b) => b,
            Err(e) => return ActionResult::err(self.action_type(), started, format!("serialize failed: {e}")),
        };
        ctx.bus.publish(&subject, bytes::Bytes::from(bytes)).await;
        ActionResult::ok(self.action_type(), started, json!({"subject": subject}))
    }
}

// ─── transform ──────────────────────────────────────────────────────────────

pub struct TransformHandler;

#[derive(Debug, Default, serde::Deserialize)]
struct TransformConfig {
    #[serde(default)]
    scale: Option<f64>,
    #[serde(default)]
    offset: Option<f64>,
    #[serde(default)]
    subject: Option<String>,
}

#[async_trait]
impl ActionHandler for TransformHandler {
    fn action_type(&self) -> &'static str {
        "transform"
    }

    async fn execute(&self, point: &Point, rule: &Rule, config: &JsonValue, ctx: &ActionContext) -> ActionResult {
        let started = Instant::now();
        let cfg: TransformConfig = serde_json::from_value(config.clone()).unwrap_or_default();

        let Some(input) = point.value.as_f64() else {
            return ActionResult::err(self.action_type(), started, "transform requires a numeric value");
        };
        let scale = cfg.scale.unwrap_or(1.0);
        let offset = cfg.offset.unwrap_or(0.0);
        let transformed = input * scale + offset;

        let mut out = point.clone();
        out.value = Value::Float(transformed);

        let subject = cfg
            .subject
            .unwrap_or_else(|| format!("transformed.{}.{}", point.device_id, point.key));

        let payload = json!({
            "device_id": out.device_id,
            "key": out.key,
            "value": out.value,
            "timestamp": out.timestamp,
            "rule_id": rule.id,
        });
        let bytes = match serde_json::to_vec(&payload) {
            Ok(b) => b,
            Err(e) => return ActionResult::err(self.action_type(), started, format!("serialize failed: {e}")),
        };
        ctx.bus.publish(&subject, bytes::Bytes::from(bytes)).await;
        ActionResult::ok(self.action_type(), started, json!({"subject": subject, "value": transformed}))
    }
}

// ─── aggregate ──────────────────────────────────────────────────────────────

pub struct AggregateHandler;

#[derive(Debug, Default, serde::Deserialize)]
struct AggregateConfig {
    #[serde(default)]
    window_size: Option<usize>,
    #[serde(default)]
    functions: Vec<String>,
    #[serde(default)]
    group_by: Vec<String>,
    #[serde(default)]
    output_key: Option<String>,
    #[serde(default)]
    upper_limit: Option<f64>,
    #[serde(default)]
    lower_limit: Option<f64>,
    #[serde(default)]
    outlier_threshold: Option<f64>,
}

fn compute_function(name: &str, values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return match name {
            "count" => Some(0.0),
            _ => None,
        };
    }
    let sum: f64 = values.iter().sum();
    let mean = sum / values.len() as f64;
    match name {
        "count" => Some(values.len() as f64),
        "sum" => Some(sum),
        "avg" | "mean" | "average" => Some(mean),
        "min" => values.iter().cloned().fold(f64::INFINITY, f64::min).into(),
        "max" => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max).into(),
        "stddev" | "std" => Some(stddev(values, mean)),
        "variance" => Some(variance(values, mean)),
        "median" => Some(median(values)),
        "first" => values.first().copied(),
        "last" => values.last().copied(),
        "null_rate" => Some(0.0),
        "completeness" => Some(1.0),
        "change" => Some(values.last().copied().unwrap_or(0.0) - values.first().copied().unwrap_or(0.0)),
        "change_rate" => {
            let first = values.first().copied().unwrap_or(0.0);
            if first == 0.0 {
                None
            } else {
                Some((values.last().copied().unwrap_or(0.0) - first) / first)
            }
        }
        "volatility" => Some(stddev(values, mean)),
        "coefficient_of_variation" => {
            if mean == 0.0 {
                None
            } else {
                Some(stddev(values, mean) / mean)
            }
        }
        _ => None,
    }
}

fn variance(values: &[f64], mean: f64) -> f64 {
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64
}

fn stddev(values: &[f64], mean: f64) -> f64 {
    variance(values, mean).sqrt()
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

#[async_trait]
impl ActionHandler for AggregateHandler {
    fn action_type(&self) -> &'static str {
        "aggregate"
    }

    async fn execute(&self, point: &Point, rule: &Rule, config: &JsonValue, ctx: &ActionContext) -> ActionResult {
        let started = Instant::now();
        let cfg: AggregateConfig = match serde_json::from_value(config.clone()) {
            Ok(c) => c,
            Err(e) => return ActionResult::err(self.action_type(), started, format!("invalid aggregate config: {e}")),
        };
        let window_size = cfg.window_size.unwrap_or(10).max(1);
        let group_key = build_group_key(&cfg.group_by, point);
        let state_key = format!("{}:{}", rule.id, group_key);

        let (buffer, window_ready) = ctx.aggregates.update_state(&state_key, point.clone(), window_size);
        if !window_ready {
            return ActionResult::ok(self.action_type(), started, json!({"window_ready": false}));
        }

        let values: Vec<f64> = buffer.iter().filter_map(|p| p.value.as_f64()).collect();
        let mut results = serde_json::Map::new();
        let functions = if cfg.functions.is_empty() {
            vec!["avg".to_string()]
        } else {
            cfg.functions.clone()
        };
        for f in &functions {
            if let Some(v) = compute_function(f, &values) {
                results.insert(f.clone(), json!(v));
            }
        }

        let output_key = render_output_key(cfg.output_key.as_deref().unwrap_or(""), &point.key);
        let primary_value = functions
            .first()
            .and_then(|f| compute_function(f, &values))
            .unwrap_or(0.0);

        let mut synthetic = Point::new(point.device_id.clone(), output_key.clone(), Value::Float(primary_value))
            .with_quality(point.quality);
        synthetic.tags.add_tag("aggregated", "true");
        synthetic.tags.add_tag("window_size", window_size.to_string());
        synthetic.tags.add_tag("source_rule", rule.id.clone());

        ctx.aggregates.clear_state_buffer(&state_key);

        if optimized_aggregate_enabled() {
            self.check_thresholds(&values, &cfg, rule);
            let payload = serde_json::to_vec(&synthetic).unwrap_or_default();
            ctx.bus.publish(&synthetic.data_subject(), bytes::Bytes::from(payload)).await;
        } else {
            let payload = serde_json::to_vec(&synthetic).unwrap_or_default();
            ctx.bus.publish(&synthetic.data_subject(), bytes::Bytes::from(payload)).await;
            let sinks = ctx.sinks.read().clone();
            for (name, sink) in sinks.iter() {
                let sink = sink.lock().await;
                if let Err(e) = sink.publish(&vec![synthetic.clone()]).await {
                    tracing::warn!(sink = %name, error = %e, "aggregate sink publish failed");
                }
            }
        }

        ActionResult::ok(
            self.action_type(),
            started,
            json!({"window_ready": true, "output_key": output_key, "functions": results}),
        )
    }
}

impl AggregateHandler {
    fn check_thresholds(&self, values: &[f64], cfg: &AggregateConfig, rule: &Rule) {
        if values.is_empty() {
            return;
        }
        let last = values[values.len() - 1];
        if let Some(upper) = cfg.upper_limit {
            if last > upper {
                tracing::warn!(rule = rule.id, value = last, upper, "aggregate value above upper limit");
            }
        }
        if let Some(lower) = cfg.lower_limit {
            if last < lower {
                tracing::warn!(rule = rule.id, value = last, lower, "aggregate value below lower limit");
            }
        }
        if let Some(threshold) = cfg.outlier_threshold {
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            let sd = stddev(values, mean);
            if sd > 0.0 && ((last - mean) / sd).abs() > threshold {
                tracing::warn!(rule = rule.id, value = last, "aggregate value flagged as outlier");
            }
        }
    }
}

/// Builds the default registry of action handlers (§4.L), keyed by type.
pub fn default_handlers() -> HashMap<&'static str, Arc<dyn ActionHandler>> {
    let mut map: HashMap<&'static str, Arc<dyn ActionHandler>> = HashMap::new();
    map.insert("alert", Arc::new(AlertHandler));
    map.insert("forward", Arc::new(ForwardHandler));
    map.insert("transform", Arc::new(TransformHandler));
    map.insert("aggregate", Arc::new(AggregateHandler));
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::rules::model::{Action, Condition};
    use chrono::Utc;
    use std::collections::HashMap as Map;

    fn rule() -> Rule {
        Rule {
            id: "r1".into(),
            name: "test".into(),
            description: String::new(),
            enabled: true,
            priority: 0,
            version: 1,
            data_type: None,
            conditions: Condition::Expression { expression: "true".into() },
            actions: vec![Action {
                action_type: "forward".into(),
                config: json!({}),
                async_exec: false,
                timeout: None,
                retry: None,
            }],
            tags: Map::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn context() -> ActionContext {
        ActionContext::new(InMemoryBus::new(), Arc::new(ShardedAggregateStates::new(4)), Vec::new())
    }

    #[tokio::test]
    async fn forward_publishes_to_default_subject() {
        let ctx = context();
        let mut rx = ctx.bus.subscribe("iot.data.>");
        let point = Point::new("d1", "temp", Value::Float(1.0));
        let result = ForwardHandler.execute(&point, &rule(), &json!({}), &ctx).await;
        assert!(result.success);
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.subject, "iot.data.d1.temp");
    }

    #[tokio::test]
    async fn transform_applies_scale_and_offset() {
        let ctx = context();
        let point = Point::new("d1", "temp", Value::Float(10.0));
        let result = TransformHandler
            .execute(&point, &rule(), &json!({"scale": 2.0, "offset": 1.0}), &ctx)
            .await;
        assert!(result.success);
        assert_eq!(result.output["value"], json!(21.0));
    }

    #[tokio::test]
    async fn aggregate_emits_only_when_window_ready() {
        let ctx = context();
        let r = rule();
        let cfg = json!({"window_size": 2, "functions": ["avg"]});
        let p1 = Point::new("d1", "temp", Value::Float(10.0));
        let p2 = Point::new("d1", "temp", Value::Float(20.0));

        let first = AggregateHandler.execute(&p1, &r, &cfg, &ctx).await;
        assert_eq!(first.output["window_ready"], json!(false));

        let second = AggregateHandler.execute(&p2, &r, &cfg, &ctx).await;
        assert_eq!(second.output["window_ready"], json!(true));
        assert_eq!(second.output["functions"]["avg"], json!(15.0));
    }

    struct CountingSink {
        calls: Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait]
    impl Sink for CountingSink {
        async fn init(&mut self, _: JsonValue) -> Result<(), crate::sink::SinkError> {
            Ok(())
        }
        async fn start(&mut self) -> Result<(), crate::sink::SinkError> {
            Ok(())
        }
        async fn stop(&mut self) -> Result<(), crate::sink::SinkError> {
            Ok(())
        }
        async fn publish(&self, points: &crate::sink::PointBatch) -> Result<(), crate::sink::SinkError> {
            self.calls.fetch_add(points.len(), std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
        fn name(&self) -> &str {
            "counting"
        }
    }

    #[tokio::test]
    async fn legacy_aggregate_path_reaches_registered_sinks() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let sink: Arc<AsyncMutex<Box<dyn Sink>>> = Arc::new(AsyncMutex::new(Box::new(CountingSink { calls: calls.clone() })));
        let ctx = ActionContext::new(
            InMemoryBus::new(),
            Arc::new(ShardedAggregateStates::new(4)),
            vec![("counting".to_string(), sink)],
        );
        let r = rule();
        let cfg = json!({"window_size": 1, "functions": ["avg"]});
        let point = Point::new("d1", "temp", Value::Float(10.0));

        let result = AggregateHandler.execute(&point, &r, &cfg, &ctx).await;
        assert_eq!(result.output["window_ready"], json!(true));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn alert_throttle_suppresses_repeat_fires() {
        let ctx = context();
        let point = Point::new("d1", "temp", Value::Float(1.0));
        let cfg = json!({"message": "hot", "channels": ["console"], "throttle": 60.0});
        let first = AlertHandler.execute(&point, &rule(), &cfg, &ctx).await;
        assert!(first.success);
        let second = AlertHandler.execute(&point, &rule(), &cfg, &ctx).await;
        assert_eq!(second.output["throttled"], json!(true));
    }
}
