//! Plugin descriptor schema and directory discovery (§4.D, §6).

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};

use super::PluginError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    Adapter,
    Sink,
}

impl PluginKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginKind::Adapter => "adapter",
            PluginKind::Sink => "sink",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PluginMode {
    Builtin,
    NativePlugin,
    IspSidecar,
}

/// A parsed `*.json` descriptor file (§4.D). `name`/`version`/`type`/`mode`/
/// `entry` are the schema's required fields; everything else in the file
/// (including a nested `config` object, if present) is preserved in `raw`
/// for [`resolve_config`].
#[derive(Debug, Clone, Deserialize)]
pub struct PluginDescriptor {
    pub name: String,
    pub version: String,
    #[serde(rename = "type")]
    pub kind: PluginKind,
    pub mode: PluginMode,
    pub entry: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub isp_port: Option<u16>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub extra: Map<String, JsonValue>,

    #[serde(skip)]
    pub path: PathBuf,
    #[serde(skip)]
    pub raw: JsonValue,
}

impl PluginDescriptor {
    /// Enabled unless the descriptor explicitly says `"enabled": false`.
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// Default ISP port for sidecar entries (§4.D: "dials
    /// `127.0.0.1:<isp_port>` (default 50052)").
    pub fn isp_port(&self) -> u16 {
        self.isp_port.unwrap_or(50052)
    }

    /// First segment of `name` (split on `-`/`_`), used to build the
    /// wildcard type aliases below.
    fn name_stem(&self) -> &str {
        self.name
            .split(|c| c == '-' || c == '_')
            .next()
            .unwrap_or(&self.name)
    }
}

/// Computes the adapter/sink type aliases a descriptor is discoverable
/// under: its own name, plus `<stem>-adapter`/`<stem>-sidecar` (§4.D: "adapter
/// type aliases are computed ... to support wildcard discovery").
pub fn type_aliases(descriptor: &PluginDescriptor) -> Vec<String> {
    let stem = descriptor.name_stem();
    let suffix = match descriptor.kind {
        PluginKind::Adapter => "adapter",
        PluginKind::Sink => "sidecar",
    };
    vec![
        descriptor.name.clone(),
        format!("{stem}-adapter"),
        format!("{stem}-{suffix}"),
    ]
}

/// Resolves the instance config from the raw descriptor JSON (§4.D):
/// - legacy nested layout: a top-level `config` object is used verbatim.
/// - flat layout: every field except `enabled` forms the config, with
///   `name` and `type` re-injected so handlers can always find them.
pub fn resolve_config(raw: &JsonValue) -> JsonValue {
    let Some(obj) = raw.as_object() else {
        return JsonValue::Object(Map::new());
    };
    if let Some(config) = obj.get("config") {
        return config.clone();
    }
    let mut flat = obj.clone();
    flat.remove("enabled");
    if let Some(name) = obj.get("name") {
        flat.insert("name".to_string(), name.clone());
    }
    if let Some(kind) = obj.get("type") {
        flat.insert("type".to_string(), kind.clone());
    }
    JsonValue::Object(flat)
}

/// Scans `dir` for `*.json` descriptor files (non-recursive — descriptors
/// live flat in the plugin directory). Files that fail to parse are logged
/// and skipped rather than aborting discovery for the whole directory.
pub fn discover(dir: &Path) -> Result<Vec<PluginDescriptor>, PluginError> {
    let mut out = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match load_one(&path) {
            Ok(descriptor) => out.push(descriptor),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping invalid plugin descriptor"),
        }
    }
    Ok(out)
}

fn load_one(path: &Path) -> Result<PluginDescriptor, PluginError> {
    let text = std::fs::read_to_string(path)?;
    let raw: JsonValue = serde_json::from_str(&text).map_err(|source| PluginError::Descriptor {
        path: path.display().to_string(),
        source,
    })?;
    let mut descriptor: PluginDescriptor =
        serde_json::from_value(raw.clone()).map_err(|source| PluginError::Descriptor {
            path: path.display().to_string(),
            source,
        })?;
    descriptor.path = path.to_path_buf();
    descriptor.raw = raw;
    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, body: &str) {
        std::fs::write(dir.join(name), body).unwrap();
    }

    #[test]
    fn discovers_flat_and_nested_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "mock.json",
            r#"{"name":"mock-temp","version":"1.0","type":"adapter","mode":"builtin","entry":"builtin://mock","poll_interval_ms":500}"#,
        );
        write(
            dir.path(),
            "console.json",
            r#"{"name":"console-sink","version":"1.0","type":"sink","mode":"builtin","entry":"builtin://console","config":{"pretty":true}}"#,
        );
        write(dir.path(), "notes.txt", "ignore me");

        let found = discover(dir.path()).unwrap();
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn missing_directory_yields_empty_list() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        assert!(discover(&missing).unwrap().is_empty());
    }

    #[test]
    fn flat_config_strips_enabled_and_reinjects_name_type() {
        let raw = serde_json::json!({
            "name": "mock-temp",
            "type": "adapter",
            "enabled": false,
            "poll_interval_ms": 500,
        });
        let config = resolve_config(&raw);
        assert_eq!(config["name"], "mock-temp");
        assert_eq!(config["type"], "adapter");
        assert_eq!(config["poll_interval_ms"], 500);
        assert!(config.get("enabled").is_none());
    }

    #[test]
    fn nested_config_used_verbatim() {
        let raw = serde_json::json!({
            "name": "console-sink",
            "type": "sink",
            "config": {"pretty": true},
        });
        let config = resolve_config(&raw);
        assert_eq!(config, serde_json::json!({"pretty": true}));
    }

    #[test]
    fn type_aliases_include_stem_suffixes() {
        let descriptor = PluginDescriptor {
            name: "modbus-01".into(),
            version: "1.0".into(),
            kind: PluginKind::Adapter,
            mode: PluginMode::Builtin,
            entry: "builtin://modbus".into(),
            description: None,
            isp_port: None,
            enabled: None,
            extra: Map::new(),
            path: PathBuf::new(),
            raw: JsonValue::Null,
        };
        let aliases = type_aliases(&descriptor);
        assert!(aliases.contains(&"modbus-01".to_string()));
        assert!(aliases.contains(&"modbus-adapter".to_string()));
    }
}
