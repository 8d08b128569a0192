//! Crate-wide error taxonomy.
//!
//! Each subsystem gets its own `thiserror` enum at its boundary; `GatewayError`
//! is the top-level error the binary and cross-module call sites converge on.
//! Library code propagates with `?`; `anyhow::Context` is reserved for
//! `main.rs` and tests.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Isp(#[from] crate::isp::IspError),

    #[error(transparent)]
    Rule(#[from] crate::rules::model::RuleError),

    #[error(transparent)]
    Plugin(#[from] crate::plugin::PluginError),

    #[error(transparent)]
    Action(#[from] crate::actions::ActionError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// The monitor's error taxonomy (§4.K / §7). Distinct from `GatewayError`:
/// this one is data, recorded into the error ring rather than propagated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Rule,
    Condition,
    Action,
    Validation,
    System,
    Network,
    Timeout,
    Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorLevel {
    Info,
    Warning,
    Error,
    Critical,
}

impl ErrorType {
    /// §7: "retryable error types are `timeout` and `system`
    /// (network treated as retryable in alert dispatch)."
    pub fn retryable(self) -> bool {
        matches!(self, ErrorType::Timeout | ErrorType::System)
    }
}
