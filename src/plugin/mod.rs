//! Plugin manager (§4.D): descriptor discovery, three loading modes, and the
//! lifecycle that wires loaded adapters/sinks into the data plane.

pub mod descriptor;
pub mod manager;

pub use descriptor::{
    discover, resolve_config, type_aliases, PluginDescriptor, PluginKind, PluginMode,
};
pub use manager::{PluginManager, PluginManagerConfig};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("descriptor {path}: {source}")]
    Descriptor {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("no instance named {0}")]
    NotFound(String),

    #[error("unknown builtin kind {0}")]
    UnknownBuiltin(String),

    #[error("native plugin {path}: {reason}")]
    Native { path: String, reason: String },

    #[error("sidecar {name}: {source}")]
    Sidecar {
        name: String,
        #[source]
        source: crate::isp::IspError,
    },

    #[error("sidecar {name}: failed to spawn {entry}: {source}")]
    Spawn {
        name: String,
        entry: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Adapter(#[from] crate::adapter::AdapterError),

    #[error(transparent)]
    Sink(#[from] crate::sink::SinkError),

    #[error("io error scanning plugin directory: {0}")]
    Io(#[from] std::io::Error),
}
