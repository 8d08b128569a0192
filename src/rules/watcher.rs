//! Hot reload (§4.F): a directory watcher that debounces write/create/delete
//! events 100 ms before reloading the affected file, emitting
//! [`RuleChangeEvent`]s on a bounded, drop-newest channel.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::model::RuleChangeEvent;
use super::store::SharedRuleStore;

const CHANGE_CHANNEL_DEPTH: usize = 100;

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub enabled: bool,
    /// If the watcher fails to start, continue running without hot reload
    /// instead of treating it as a hard startup failure.
    pub graceful_fallback: bool,
    pub retry_interval: Duration,
    pub max_retries: u32,
    pub debounce_delay: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            graceful_fallback: true,
            retry_interval: Duration::from_secs(2),
            max_retries: 3,
            debounce_delay: Duration::from_millis(100),
        }
    }
}

/// Spawns the hot-reload watcher; returns a receiver of [`RuleChangeEvent`]s.
/// If `config.enabled` is false, or the watcher cannot be started and
/// `graceful_fallback` is set, the returned channel simply never yields
/// anything and the task exits quietly.
pub fn spawn(
    store: SharedRuleStore,
    config: WatcherConfig,
    cancel: CancellationToken,
) -> (tokio::task::JoinHandle<()>, mpsc::Receiver<RuleChangeEvent>) {
    let (tx, rx) = mpsc::channel(CHANGE_CHANNEL_DEPTH);
    let handle = tokio::spawn(async move {
        if !config.enabled {
            return;
        }

        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<PathBuf>();
        let watcher = match start_watcher(store.dir().to_path_buf(), raw_tx, &config).await {
            Some(w) => w,
            None => {
                if config.graceful_fallback {
                    tracing::warn!("rule hot-reload watcher unavailable, continuing without hot reload");
                    return;
                } else {
                    tracing::error!("rule hot-reload watcher unavailable and graceful_fallback is disabled");
                    return;
                }
            }
        };
        // Keep the watcher alive for the duration of this task.
        let _watcher = watcher;

        let mut pending: HashMap<PathBuf, Instant> = HashMap::new();
        let mut tick = tokio::time::interval(Duration::from_millis(20));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                maybe_path = raw_rx.recv() => {
                    match maybe_path {
                        Some(path) => { pending.insert(path, Instant::now()); }
                        None => return,
                    }
                }
                _ = tick.tick() => {
                    let now = Instant::now();
                    let ready: Vec<PathBuf> = pending
                        .iter()
                        .filter(|(_, t)| now.duration_since(**t) >= config.debounce_delay)
                        .map(|(p, _)| p.clone())
                        .collect();
                    for path in ready {
                        pending.remove(&path);
                        for event in store.reload_file(&path) {
                            if tx.try_send(event).is_err() {
                                tracing::warn!(path = %path.display(), "rule change channel full, dropping event");
                            }
                        }
                    }
                }
            }
        }
    });
    (handle, rx)
}

async fn start_watcher(
    dir: PathBuf,
    raw_tx: mpsc::UnboundedSender<PathBuf>,
    config: &WatcherConfig,
) -> Option<RecommendedWatcher> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        match build_watcher(dir.clone(), raw_tx.clone()) {
            Ok(w) => return Some(w),
            Err(e) => {
                tracing::warn!(error = %e, attempt = attempts, "failed to start rule directory watcher");
                if attempts > config.max_retries {
                    return None;
                }
                tokio::time::sleep(config.retry_interval).await;
            }
        }
    }
}

fn build_watcher(
    dir: PathBuf,
    raw_tx: mpsc::UnboundedSender<PathBuf>,
) -> notify::Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let Ok(event) = res else { return };
        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        ) {
            return;
        }
        for path in event.paths {
            let _ = raw_tx.send(path);
        }
    })?;
    watcher.watch(&dir, RecursiveMode::Recursive)?;
    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::model::{Action, Condition, Operator, Rule};
    use crate::rules::store::RuleStore;
    use std::sync::Arc;

    fn rule(id: &str) -> Rule {
        Rule {
            id: id.into(),
            name: "r".into(),
            description: String::new(),
            enabled: true,
            priority: 0,
            version: 0,
            data_type: None,
            conditions: Condition::Simple {
                field: "value".into(),
                operator: Operator::Gt,
                value: serde_json::json!(1),
            },
            actions: vec![Action {
                action_type: "forward".into(),
                config: serde_json::json!({}),
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
    async fn watcher_reports_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RuleStore::new(dir.path()));
        let cancel = CancellationToken::new();
        let (handle, mut rx) = spawn(
            store.clone(),
            WatcherConfig {
                debounce_delay: Duration::from_millis(50),
                ..Default::default()
            },
            cancel.clone(),
        );

        // Let the watcher get established before writing.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let path = dir.path().join("r1.json");
        std::fs::write(&path, serde_json::to_string(&rule("r1")).unwrap()).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("watcher should emit a change event")
            .unwrap();
        assert!(matches!(event.kind, super::super::model::ChangeKind::Create));

        cancel.cancel();
        let _ = handle.await;
    }
}
