//! Plugin manager lifecycle (§4.D): construction from descriptors, the
//! `Init`/`Start`/`Stop` sequence, and per-instance `Start/Stop/Restart`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock as SyncRwLock;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::adapter::{Adapter, AdapterRegistry};
use crate::adapters::{IspSidecarAdapter, MockAdapter};
use crate::bus::Bus;
use crate::point::Point;
use crate::sink::{SetBus, Sink, SinkRegistry};
use crate::sinks::{ConsoleSink, ForwardBusSink};

use super::descriptor::{discover, resolve_config, type_aliases, PluginDescriptor, PluginKind, PluginMode};
use super::PluginError;

const DEFAULT_ISP_GRACE: Duration = Duration::from_millis(500);
const DEFAULT_RESCAN_INTERVAL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);
const DEFAULT_POINT_CHANNEL_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
pub struct PluginManagerConfig {
    pub plugins_dir: PathBuf,
    pub isp_grace: Duration,
    pub rescan_interval: Duration,
    pub cache_ttl: Duration,
    pub point_channel_capacity: usize,
}

impl PluginManagerConfig {
    pub fn new(plugins_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugins_dir: plugins_dir.into(),
            isp_grace: DEFAULT_ISP_GRACE,
            rescan_interval: DEFAULT_RESCAN_INTERVAL,
            cache_ttl: DEFAULT_CACHE_TTL,
            point_channel_capacity: DEFAULT_POINT_CHANNEL_CAPACITY,
        }
    }
}

struct LoadedAdapter {
    descriptor: PluginDescriptor,
    config: serde_json::Value,
    adapter: Arc<AsyncMutex<Box<dyn Adapter>>>,
    child: Option<tokio::process::Child>,
}

struct LoadedSink {
    descriptor: PluginDescriptor,
    config: serde_json::Value,
    sink: Arc<AsyncMutex<Box<dyn Sink>>>,
}

/// Owns discovery, loading, and the running lifecycle of every adapter/sink
/// instance described under `plugins_dir`.
pub struct PluginManager {
    config: PluginManagerConfig,
    adapter_registry: Arc<AdapterRegistry>,
    sink_registry: Arc<SinkRegistry>,
    bus: Arc<dyn Bus>,
    adapters: SyncRwLock<HashMap<String, LoadedAdapter>>,
    sinks: SyncRwLock<HashMap<String, LoadedSink>>,
    /// Maps every alias `type_aliases` computes (stem-adapter/stem-sidecar
    /// wildcards, §4.D) back to the instance's canonical descriptor name, so
    /// `start_plugin`/`stop_plugin` can be addressed by alias as well as the
    /// exact name the descriptor declared.
    alias_index: SyncRwLock<HashMap<String, String>>,
    descriptor_cache: SyncRwLock<Option<(Instant, Vec<String>)>>,
    cancel: CancellationToken,
    point_tx: mpsc::Sender<Point>,
    point_rx: AsyncMutex<Option<mpsc::Receiver<Point>>>,
    tasks: AsyncMutex<Vec<JoinHandle<()>>>,
    watcher: SyncRwLock<Option<RecommendedWatcher>>,
}

impl PluginManager {
    pub fn new(config: PluginManagerConfig, bus: Arc<dyn Bus>) -> Arc<Self> {
        let (point_tx, point_rx) = mpsc::channel(config.point_channel_capacity);
        let manager = Arc::new(Self {
            config,
            adapter_registry: Arc::new(default_adapter_registry()),
            sink_registry: Arc::new(default_sink_registry()),
            bus,
            adapters: SyncRwLock::new(HashMap::new()),
            sinks: SyncRwLock::new(HashMap::new()),
            alias_index: SyncRwLock::new(HashMap::new()),
            descriptor_cache: SyncRwLock::new(None),
            cancel: CancellationToken::new(),
            point_tx,
            point_rx: AsyncMutex::new(Some(point_rx)),
            tasks: AsyncMutex::new(Vec::new()),
            watcher: SyncRwLock::new(None),
        });
        manager
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Snapshot of every currently loaded sink, keyed by instance name. Used
    /// to wire the same sink handles `fanout::spawn` publishes through into
    /// the rule engine's action context, so aggregate emission can reach
    /// sinks directly in addition to the bus.
    pub fn sinks(&self) -> Vec<(String, Arc<AsyncMutex<Box<dyn Sink>>>)> {
        self.sinks
            .read()
            .iter()
            .map(|(name, loaded)| (name.clone(), loaded.sink.clone()))
            .collect()
    }

    /// `Init`: scan the plugin directory, load every enabled instance, and
    /// run each one's `init`.
    pub async fn init(&self) -> Result<(), PluginError> {
        let descriptors = discover(&self.config.plugins_dir)?;
        for descriptor in descriptors {
            if !descriptor.is_enabled() {
                tracing::debug!(name = %descriptor.name, "plugin descriptor disabled, skipping");
                continue;
            }
            if let Err(e) = self.load_one(descriptor).await {
                tracing::warn!(error = %e, "failed to load plugin instance");
            }
        }
        self.invalidate_cache();
        Ok(())
    }

    async fn load_one(&self, descriptor: PluginDescriptor) -> Result<(), PluginError> {
        let config = resolve_config(&descriptor.raw);
        match descriptor.kind {
            PluginKind::Adapter => self.load_adapter(descriptor, config).await,
            PluginKind::Sink => self.load_sink(descriptor, config).await,
        }
    }

    async fn load_adapter(
        &self,
        descriptor: PluginDescriptor,
        config: serde_json::Value,
    ) -> Result<(), PluginError> {
        let name = descriptor.name.clone();
        let (mut adapter, child): (Box<dyn Adapter>, Option<tokio::process::Child>) =
            match descriptor.mode {
                PluginMode::Builtin => {
                    let kind = builtin_kind(&descriptor.entry)?;
                    let adapter = self
                        .adapter_registry
                        .create(kind)
                        .ok_or_else(|| PluginError::UnknownBuiltin(kind.to_string()))?;
                    (adapter, None)
                }
                PluginMode::NativePlugin => (load_native_adapter(&descriptor.entry)?, None),
                PluginMode::IspSidecar => {
                    let child = spawn_sidecar(&descriptor.entry, &name)?;
                    tokio::time::sleep(self.config.isp_grace).await;
                    let adapter: Box<dyn Adapter> = Box::new(IspSidecarAdapter::new(
                        name.clone(),
                        "127.0.0.1",
                        descriptor.isp_port(),
                    ));
                    (adapter, Some(child))
                }
            };
        adapter.init(config.clone()).await?;
        self.register_aliases(&descriptor, &name);
        self.adapters.write().insert(
            name,
            LoadedAdapter {
                descriptor,
                config,
                adapter: Arc::new(AsyncMutex::new(adapter)),
                child,
            },
        );
        Ok(())
    }

    async fn load_sink(
        &self,
        descriptor: PluginDescriptor,
        config: serde_json::Value,
    ) -> Result<(), PluginError> {
        let name = descriptor.name.clone();
        let mut sink: Box<dyn Sink> = match descriptor.mode {
            PluginMode::Builtin => {
                let kind = builtin_kind(&descriptor.entry)?;
                // `forward_bus` is the only builtin that needs the shared bus
                // wired in; a trait-object `Sink` can't be downcast to
                // `SetBus` generically, so it's constructed directly here
                // instead of going through the registry.
                if kind == "forward_bus" {
                    let mut sink = crate::sinks::ForwardBusSink::new(descriptor.name.clone());
                    sink.set_bus(self.bus.clone());
                    Box::new(sink) as Box<dyn Sink>
                } else {
                    self.sink_registry
                        .create(kind)
                        .ok_or_else(|| PluginError::UnknownBuiltin(kind.to_string()))?
                }
            }
            PluginMode::NativePlugin => load_native_sink(&descriptor.entry)?,
            PluginMode::IspSidecar => {
                return Err(PluginError::UnknownBuiltin(format!(
                    "sink {name} cannot use isp-sidecar mode"
                )))
            }
        };
        sink.init(config.clone()).await?;
        self.register_aliases(&descriptor, &name);
        self.sinks.write().insert(
            name,
            LoadedSink {
                descriptor,
                config,
                sink: Arc::new(AsyncMutex::new(sink)),
            },
        );
        Ok(())
    }

    /// `Start`: subscribes the directory watcher, starts sinks then
    /// adapters, and spawns the fan-out loop.
    pub async fn start(self: &Arc<Self>) -> Result<(), PluginError> {
        for (name, loaded) in self.sinks.read().iter() {
            if let Err(e) = loaded.sink.lock().await.start().await {
                tracing::error!(sink = %name, error = %e, "failed to start sink");
            }
        }

        for (name, loaded) in self.adapters.read().iter() {
            let tx = self.point_tx.clone();
            if let Err(e) = loaded
                .adapter
                .lock()
                .await
                .start(self.cancel.clone(), tx)
                .await
            {
                tracing::error!(adapter = %name, error = %e, "failed to start adapter");
            }
        }

        let rx = self
            .point_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| PluginError::Io(std::io::Error::new(std::io::ErrorKind::Other, "fanout already started")))?;
        let sinks: Vec<Arc<AsyncMutex<Box<dyn Sink>>>> =
            self.sinks.read().values().map(|s| s.sink.clone()).collect();
        let sink_names: Vec<String> = self.sinks.read().keys().cloned().collect();
        let fanout_handle = crate::fanout::spawn(rx, sinks, sink_names, self.bus.clone(), self.cancel.clone());

        let watcher_handle = self.spawn_watcher();
        let rescan_handle = self.spawn_periodic_rescan();

        let mut tasks = self.tasks.lock().await;
        tasks.push(fanout_handle);
        if let Some(h) = watcher_handle {
            tasks.push(h);
        }
        tasks.push(rescan_handle);
        Ok(())
    }

    fn spawn_watcher(&self) -> Option<JoinHandle<()>> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<PathBuf>();
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let Ok(event) = res else { return };
            for path in event.paths {
                let _ = raw_tx.send(path);
            }
        });
        let mut watcher = match watcher {
            Ok(w) => w,
            Err(e) => {
                tracing::warn!(error = %e, "plugin directory watcher unavailable, continuing without hot reload");
                return None;
            }
        };
        if let Err(e) = watcher.watch(&self.config.plugins_dir, RecursiveMode::NonRecursive) {
            tracing::warn!(error = %e, "failed to watch plugin directory");
            return None;
        }
        *self.watcher.write() = Some(watcher);

        let dir = self.config.plugins_dir.clone();
        let cancel = self.cancel.clone();
        Some(tokio::spawn(async move {
            let mut pending = false;
            let mut debounce = tokio::time::interval(Duration::from_millis(100));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    maybe_path = raw_rx.recv() => {
                        if maybe_path.is_none() { return; }
                        pending = true;
                    }
                    _ = debounce.tick() => {
                        if pending {
                            pending = false;
                            tracing::debug!(dir = %dir.display(), "plugin directory change detected");
                        }
                    }
                }
            }
        }))
    }

    fn spawn_periodic_rescan(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let interval = self.config.rescan_interval;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = this.init().await {
                            tracing::warn!(error = %e, "periodic plugin rescan failed");
                        }
                    }
                }
            }
        })
    }

    /// `Stop`: stops sinks then adapters, closes the watcher, then kills any
    /// surviving sidecar subprocesses.
    pub async fn stop(&self) -> Result<(), PluginError> {
        self.cancel.cancel();
        for task in self.tasks.lock().await.drain(..) {
            let _ = task.await;
        }
        for (name, loaded) in self.sinks.read().iter() {
            if let Err(e) = loaded.sink.lock().await.stop().await {
                tracing::warn!(sink = %name, error = %e, "error stopping sink");
            }
        }
        for (name, loaded) in self.adapters.read().iter() {
            if let Err(e) = loaded.adapter.lock().await.stop().await {
                tracing::warn!(adapter = %name, error = %e, "error stopping adapter");
            }
        }
        *self.watcher.write() = None;
        for (_, loaded) in self.adapters.write().iter_mut() {
            if let Some(child) = loaded.child.as_mut() {
                let _ = child.kill().await;
            }
        }
        Ok(())
    }

    pub async fn start_plugin(&self, name: &str) -> Result<(), PluginError> {
        let name = self.resolve_name(name);
        if let Some(loaded) = self.adapters.read().get(&name) {
            let tx = self.point_tx.clone();
            loaded
                .adapter
                .lock()
                .await
                .start(self.cancel.clone(), tx)
                .await?;
            self.invalidate_cache();
            return Ok(());
        }
        if let Some(loaded) = self.sinks.read().get(&name) {
            loaded.sink.lock().await.start().await?;
            self.invalidate_cache();
            return Ok(());
        }
        Err(PluginError::NotFound(name))
    }

    pub async fn stop_plugin(&self, name: &str) -> Result<(), PluginError> {
        let name = self.resolve_name(name);
        if let Some(loaded) = self.adapters.read().get(&name) {
            loaded.adapter.lock().await.stop().await?;
            self.invalidate_cache();
            return Ok(());
        }
        if let Some(loaded) = self.sinks.read().get(&name) {
            loaded.sink.lock().await.stop().await?;
            self.invalidate_cache();
            return Ok(());
        }
        Err(PluginError::NotFound(name))
    }

    /// Records every alias `type_aliases` computes for `descriptor` as
    /// pointing back to its canonical `name`, so a later lookup by any of
    /// those aliases (§4.D wildcard discovery) resolves to this instance.
    fn register_aliases(&self, descriptor: &PluginDescriptor, name: &str) {
        let mut aliases = self.alias_index.write();
        for alias in type_aliases(descriptor) {
            if alias != name {
                aliases.insert(alias, name.to_string());
            }
        }
    }

    /// Resolves `name` to a canonical instance name: itself if it already
    /// names a loaded instance, otherwise its alias target if one is
    /// registered, otherwise itself unchanged (the subsequent lookup then
    /// fails with `NotFound` as before).
    fn resolve_name(&self, name: &str) -> String {
        if self.adapters.read().contains_key(name) || self.sinks.read().contains_key(name) {
            return name.to_string();
        }
        self.alias_index
            .read()
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    pub async fn restart_plugin(&self, name: &str) -> Result<(), PluginError> {
        self.stop_plugin(name).await?;
        self.start_plugin(name).await?;
        Ok(())
    }

    fn invalidate_cache(&self) {
        *self.descriptor_cache.write() = None;
    }

    /// Names of every loaded instance, cached for `cache_ttl` (§4.D: "the
    /// cached plugin list is invalidated (cache lives 30 s)").
    pub fn instance_names(&self) -> Vec<String> {
        if let Some((fetched, names)) = self.descriptor_cache.read().as_ref() {
            if fetched.elapsed() < self.config.cache_ttl {
                return names.clone();
            }
        }
        let names: Vec<String> = self
            .adapters
            .read()
            .keys()
            .chain(self.sinks.read().keys())
            .cloned()
            .collect();
        *self.descriptor_cache.write() = Some((Instant::now(), names.clone()));
        names
    }
}

fn builtin_kind(entry: &str) -> Result<&str, PluginError> {
    entry
        .strip_prefix("builtin://")
        .ok_or_else(|| PluginError::UnknownBuiltin(entry.to_string()))
}

fn spawn_sidecar(entry: &str, name: &str) -> Result<tokio::process::Child, PluginError> {
    tokio::process::Command::new(entry)
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| PluginError::Spawn {
            name: name.to_string(),
            entry: entry.to_string(),
            source,
        })
}

fn default_adapter_registry() -> AdapterRegistry {
    let registry = AdapterRegistry::new();
    registry.register(
        "mock",
        Arc::new(|| Box::new(MockAdapter::new("mock")) as Box<dyn Adapter>),
    );
    registry
}

fn default_sink_registry() -> SinkRegistry {
    let registry = SinkRegistry::new();
    registry.register(
        "console",
        Arc::new(|| Box::new(ConsoleSink::new("console")) as Box<dyn Sink>),
    );
    registry.register(
        "forward_bus",
        Arc::new(|| Box::new(ForwardBusSink::new("forward_bus")) as Box<dyn Sink>),
    );
    registry.register(
        "mqtt",
        Arc::new(|| Box::new(crate::sinks::MqttSink::new("mqtt")) as Box<dyn Sink>),
    );
    registry.register(
        "websocket",
        Arc::new(|| Box::new(crate::sinks::WebSocketSink::new("websocket")) as Box<dyn Sink>),
    );
    #[cfg(feature = "database-sink")]
    registry.register(
        "database",
        Arc::new(|| Box::new(crate::sinks::DatabaseSink::new("database")) as Box<dyn Sink>),
    );
    #[cfg(feature = "nats")]
    registry.register(
        "nats",
        Arc::new(|| Box::new(crate::sinks::NatsSink::new("nats")) as Box<dyn Sink>),
    );
    registry
}

#[cfg(feature = "native-plugins")]
fn load_native_adapter(path: &str) -> Result<Box<dyn Adapter>, PluginError> {
    type NewAdapterFn = unsafe fn() -> Box<dyn Adapter>;
    unsafe {
        let lib = libloading::Library::new(path).map_err(|e| PluginError::Native {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        let constructor: libloading::Symbol<NewAdapterFn> =
            lib.get(b"new_adapter").map_err(|e| PluginError::Native {
                path: path.to_string(),
                reason: format!("missing `new_adapter` symbol: {e}"),
            })?;
        let adapter = constructor();
        // Leak the library handle: the adapter's vtable lives inside it and
        // must stay mapped for the remainder of the process.
        std::mem::forget(lib);
        Ok(adapter)
    }
}

#[cfg(not(feature = "native-plugins"))]
fn load_native_adapter(path: &str) -> Result<Box<dyn Adapter>, PluginError> {
    Err(PluginError::Native {
        path: path.to_string(),
        reason: "native-plugins feature disabled".to_string(),
    })
}

#[cfg(feature = "native-plugins")]
fn load_native_sink(path: &str) -> Result<Box<dyn Sink>, PluginError> {
    type NewSinkFn = unsafe fn() -> Box<dyn Sink>;
    unsafe {
        let lib = libloading::Library::new(path).map_err(|e| PluginError::Native {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        let constructor: libloading::Symbol<NewSinkFn> =
            lib.get(b"new_sink").map_err(|e| PluginError::Native {
                path: path.to_string(),
                reason: format!("missing `new_sink` symbol: {e}"),
            })?;
        let sink = constructor();
        std::mem::forget(lib);
        Ok(sink)
    }
}

#[cfg(not(feature = "native-plugins"))]
fn load_native_sink(path: &str) -> Result<Box<dyn Sink>, PluginError> {
    Err(PluginError::Native {
        path: path.to_string(),
        reason: "native-plugins feature disabled".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;

    fn write_descriptor(dir: &std::path::Path, file: &str, body: serde_json::Value) {
        std::fs::write(dir.join(file), serde_json::to_string(&body).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn init_loads_builtin_adapter_and_sink() {
        let dir = tempfile::tempdir().unwrap();
        write_descriptor(
            dir.path(),
            "mock.json",
            serde_json::json!({
                "name": "mock-temp",
                "version": "1.0",
                "type": "adapter",
                "mode": "builtin",
                "entry": "builtin://mock",
                "config": {"device_id": "d1", "key": "temp", "poll_interval_ms": 5},
            }),
        );
        write_descriptor(
            dir.path(),
            "console.json",
            serde_json::json!({
                "name": "console-out",
                "version": "1.0",
                "type": "sink",
                "mode": "builtin",
                "entry": "builtin://console",
            }),
        );

        let bus = InMemoryBus::new();
        let manager = PluginManager::new(PluginManagerConfig::new(dir.path()), bus);
        manager.init().await.unwrap();

        assert_eq!(manager.adapters.read().len(), 1);
        assert_eq!(manager.sinks.read().len(), 1);
    }

    #[tokio::test]
    async fn start_plugin_rejects_unknown_name() {
        let dir = tempfile::tempdir().unwrap();
        let bus = InMemoryBus::new();
        let manager = PluginManager::new(PluginManagerConfig::new(dir.path()), bus);
        manager.init().await.unwrap();
        let err = manager.start_plugin("nope").await.unwrap_err();
        assert!(matches!(err, PluginError::NotFound(_)));
    }

    #[tokio::test]
    async fn start_plugin_resolves_via_type_alias() {
        let dir = tempfile::tempdir().unwrap();
        write_descriptor(
            dir.path(),
            "mock.json",
            serde_json::json!({
                "name": "mock-temp",
                "version": "1.0",
                "type": "adapter",
                "mode": "builtin",
                "entry": "builtin://mock",
                "config": {"device_id": "d1", "key": "temp", "poll_interval_ms": 5},
            }),
        );

        let bus = InMemoryBus::new();
        let manager = PluginManager::new(PluginManagerConfig::new(dir.path()), bus);
        manager.init().await.unwrap();

        // "mock-temp" is discoverable under its stem-derived wildcard alias
        // too, not just its exact descriptor name.
        manager.start_plugin("mock-adapter").await.unwrap();
        manager.stop_plugin("mock-adapter").await.unwrap();
    }

    #[tokio::test]
    async fn end_to_end_start_routes_mock_points_to_sink() {
        let dir = tempfile::tempdir().unwrap();
        write_descriptor(
            dir.path(),
            "mock.json",
            serde_json::json!({
                "name": "mock-temp",
                "version": "1.0",
                "type": "adapter",
                "mode": "builtin",
                "entry": "builtin://mock",
                "config": {"device_id": "d1", "key": "temp", "poll_interval_ms": 5},
            }),
        );
        write_descriptor(
            dir.path(),
            "console.json",
            serde_json::json!({
                "name": "console-out",
                "version": "1.0",
                "type": "sink",
                "mode": "builtin",
                "entry": "builtin://console",
            }),
        );

        let bus = InMemoryBus::new();
        let mut rx = bus.subscribe("iot.data.>");
        let manager = PluginManager::new(PluginManagerConfig::new(dir.path()), bus);
        manager.init().await.unwrap();
        manager.start().await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.subject, "iot.data.d1.temp");

        manager.stop().await.unwrap();
    }
}
