//! Binary entry point: wires the rule store, rule index, hot-reload
//! watcher, rule engine pipeline, and plugin manager together and runs
//! them under a single supervisor loop until ctrl-c/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use iot_gateway::bus::InMemoryBus;
use iot_gateway::config::{self, GatewayConfig};
use iot_gateway::index::RuleIndex;
use iot_gateway::monitor::{spawn_health_loop, Monitor};
use iot_gateway::pipeline;
use iot_gateway::plugin::PluginManager;
use iot_gateway::rules;

#[derive(Parser, Debug)]
#[command(name = "iot-gateway")]
#[command(about = "IoT data gateway with an embedded rules engine")]
#[command(version)]
struct CliArgs {
    /// Path to a TOML config file. Overrides IOT_GATEWAY_CONFIG.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory rules are loaded from and hot-reloaded out of.
    #[arg(long)]
    rules_dir: Option<PathBuf>,

    /// Directory plugin descriptors are discovered from.
    #[arg(long)]
    plugins_dir: Option<PathBuf>,

    /// Clear any retained aggregate/monitor state before starting.
    ///
    /// No state currently survives a restart, so this is a no-op kept
    /// for operational symmetry with deployments that expect the flag.
    #[arg(long)]
    reset_state: bool,
}

#[derive(Debug)]
enum TaskName {
    Pipeline,
    HealthLoop,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::Pipeline => write!(f, "pipeline"),
            TaskName::HealthLoop => write!(f, "health-loop"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();

    if args.reset_state {
        warn!("--reset-state requested, but no gateway state is retained across restarts; nothing to do");
    }

    let mut gateway_config = match &args.config {
        Some(path) => GatewayConfig::load_from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => GatewayConfig::load()?,
    };
    if let Some(dir) = args.rules_dir {
        gateway_config.rules_dir = dir;
    }
    if let Some(dir) = args.plugins_dir {
        gateway_config.plugins_dir = dir;
    }
    config::init(gateway_config);
    let cfg = config::get();

    let cancel = CancellationToken::new();
    let shutdown_token = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal, stopping");
        shutdown_token.cancel();
    });

    let bus = InMemoryBus::new();

    let monitor = Monitor::new(cfg.monitor.ring_size, cfg.monitor.thresholds());
    let aggregates = Arc::new(iot_gateway::aggregate::ShardedAggregateStates::new(cfg.aggregate_shards));

    let rule_store = Arc::new(rules::RuleStore::new(cfg.rules_dir.clone()));
    let loaded = rule_store
        .load_all()
        .with_context(|| format!("loading rules from {}", cfg.rules_dir.display()))?;
    info!(count = loaded, dir = %cfg.rules_dir.display(), "loaded rules");

    let rule_index = Arc::new(RuleIndex::new());
    rule_index.rebuild(rule_store.all());

    let (watcher_handle, rule_changes) =
        rules::spawn_watcher(rule_store.clone(), cfg.watcher_config(), cancel.clone());

    let plugin_manager = PluginManager::new(cfg.plugin_manager_config(), bus.clone());
    plugin_manager.init().await.context("initializing plugin manager")?;
    plugin_manager.start().await.context("starting plugin manager")?;
    let sinks = plugin_manager.sinks();

    let health_handle = spawn_health_loop(monitor.clone(), cfg.monitor.health_interval(), cancel.clone());

    let mut tasks: JoinSet<(TaskName, ())> = JoinSet::new();
    let pipeline_handle = pipeline::spawn(
        cfg.pipeline.into(),
        bus.clone(),
        rule_index,
        rule_changes,
        aggregates,
        sinks,
        monitor.clone(),
        cancel.clone(),
    );
    tasks.spawn(async move { (TaskName::Pipeline, pipeline_handle.await.unwrap_or(())) });
    tasks.spawn(async move { (TaskName::HealthLoop, health_handle.await.unwrap_or(())) });

    info!("iot-gateway running, ctrl-c to stop");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("shutdown requested, draining tasks");
                break;
            }
            result = tasks.join_next() => {
                match result {
                    Some(Ok((name, ()))) => info!(task = %name, "task exited"),
                    Some(Err(e)) => error!(error = %e, "task panicked"),
                    None => break,
                }
            }
        }
    }

    cancel.cancel();
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "task panicked during shutdown");
        }
    }
    let _ = watcher_handle.await;

    if let Err(e) = plugin_manager.stop().await {
        error!(error = %e, "error stopping plugin manager");
    }

    if let Err(e) = dump_snapshot(&monitor) {
        warn!(error = %e, "failed to write shutdown monitor snapshot");
    }

    info!("shutdown complete");
    Ok(())
}

fn dump_snapshot(monitor: &Monitor) -> Result<()> {
    let snapshot = monitor.snapshot(100);
    let path = "monitor_snapshot.json";
    std::fs::write(path, serde_json::to_string_pretty(&snapshot)?)
        .with_context(|| format!("writing {path}"))?;
    info!(path, "wrote monitor snapshot");
    Ok(())
}
