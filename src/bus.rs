//! The embedded pub/sub bus (§1, §6): explicitly out of scope as an
//! implementation target — "assumed to provide subject-based
//! publish/subscribe with at-most-once delivery and wildcard
//! subscriptions." This module defines that contract as a trait plus the
//! one concrete, in-memory implementation the rest of the crate (and its
//! tests) run against.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;

/// A single bus message: subject plus raw bytes (callers decide the
/// encoding; the engine publishes serialised `Point`s).
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub payload: bytes::Bytes,
}

/// Subject-based publish/subscribe with at-most-once delivery and NATS-style
/// wildcard subscriptions (`*` matches one token, `>` matches one-or-more
/// trailing tokens).
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, subject: &str, payload: bytes::Bytes);

    /// Subscribe to `pattern`; returns a receiver that yields matching
    /// messages. Delivery is at-most-once: a receiver that falls behind (a
    /// full channel) misses messages rather than blocking the publisher.
    fn subscribe(&self, pattern: &str) -> mpsc::Receiver<BusMessage>;
}

struct Subscription {
    pattern: Vec<Token>,
    tx: mpsc::Sender<BusMessage>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
enum Token {
    Literal(String),
    Star,
    GreaterThan,
}

fn parse_pattern(pattern: &str) -> Vec<Token> {
    pattern
        .split('.')
        .map(|t| match t {
            "*" => Token::Star,
            ">" => Token::GreaterThan,
            lit => Token::Literal(lit.to_string()),
        })
        .collect()
}

fn matches(pattern: &[Token], subject_tokens: &[&str]) -> bool {
    let mut pi = 0;
    let mut si = 0;
    while pi < pattern.len() {
        match &pattern[pi] {
            Token::GreaterThan => return si <= subject_tokens.len(),
            Token::Star => {
                if si >= subject_tokens.len() {
                    return false;
                }
                pi += 1;
                si += 1;
            }
            Token::Literal(lit) => {
                if si >= subject_tokens.len() || subject_tokens[si] != lit {
                    return false;
                }
                pi += 1;
                si += 1;
            }
        }
    }
    si == subject_tokens.len()
}

const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

/// In-memory bus: every publish is matched synchronously against all live
/// subscriptions and fanned out with a non-blocking `try_send` per
/// subscriber (drop-on-full, matching at-most-once delivery).
pub struct InMemoryBus {
    subscriptions: RwLock<Vec<Subscription>>,
}

impl InMemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscriptions: RwLock::new(Vec::new()),
        })
    }

    /// Drop subscriptions whose receiver has gone away, so the list doesn't
    /// grow unbounded across long-lived processes.
    fn prune(&self) {
        self.subscriptions.write().retain(|s| !s.tx.is_closed());
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Bus for InMemoryBus {
    async fn publish(&self, subject: &str, payload: bytes::Bytes) {
        let tokens: Vec<&str> = subject.split('.').collect();
        let subs = self.subscriptions.read();
        for sub in subs.iter() {
            if matches(&sub.pattern, &tokens) {
                let msg = BusMessage {
                    subject: subject.to_string(),
                    payload: payload.clone(),
                };
                if sub.tx.try_send(msg).is_err() {
                    tracing::trace!(subject, "bus subscriber dropped message (full or closed)");
                }
            }
        }
        drop(subs);
        self.prune();
    }

    fn subscribe(&self, pattern: &str) -> mpsc::Receiver<BusMessage> {
        let (tx, rx) = mpsc::channel(DEFAULT_SUBSCRIBER_CAPACITY);
        self.subscriptions.write().push(Subscription {
            pattern: parse_pattern(pattern),
            tx,
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wildcard_star_matches_one_token() {
        let bus = InMemoryBus::new();
        let mut rx = bus.subscribe("data.*");
        bus.publish("data.mqtt", bytes::Bytes::from_static(b"x")).await;
        bus.publish("data.mqtt.extra", bytes::Bytes::from_static(b"y")).await;
        let got = rx.recv().await.unwrap();
        assert_eq!(got.subject, "data.mqtt");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn wildcard_greater_than_matches_trailing_tokens() {
        let bus = InMemoryBus::new();
        let mut rx = bus.subscribe("iot.data.>");
        bus.publish("iot.data.d1.temperature", bytes::Bytes::from_static(b"x")).await;
        bus.publish("iot.alerts.triggered", bytes::Bytes::from_static(b"y")).await;
        let got = rx.recv().await.unwrap();
        assert_eq!(got.subject, "iot.data.d1.temperature");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn at_most_once_drops_when_subscriber_full() {
        let bus = InMemoryBus::new();
        let (tx, _rx) = mpsc::channel(1);
        bus.subscriptions.write().push(Subscription {
            pattern: parse_pattern("x"),
            tx,
        });
        // Fill the channel, then publish again — the second publish must not
        // block or panic.
        bus.publish("x", bytes::Bytes::new()).await;
        bus.publish("x", bytes::Bytes::new()).await;
    }
}
