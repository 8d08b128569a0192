//! iot-gateway: a south-bound/north-bound data gateway with an embedded
//! rules engine.
//!
//! ## Architecture
//!
//! - **Adapters** (south-bound): pull points in from devices — mock
//!   generators, Modbus-ish registers, or an ISP sidecar process.
//! - **Sinks** (north-bound): push points out — console, MQTT, a
//!   WebSocket broadcast, SQLite, NATS, or back onto the in-memory bus.
//! - **Plugin manager**: discovers, loads, and supervises adapters/sinks
//!   from on-disk descriptors, including hot reload and sidecar restarts.
//! - **Fan-out**: the single consumer of the plugin manager's point
//!   channel; batches, republishes to the bus, and feeds every sink.
//! - **Rule engine**: subscribes to the bus, matches points against an
//!   indexed rule set, and dispatches matched rules through a sharded
//!   worker pool to the action handlers.

pub mod actions;
pub mod adapter;
pub mod adapters;
pub mod aggregate;
pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod index;
pub mod isp;
pub mod monitor;
pub mod pipeline;
pub mod plugin;
pub mod point;
pub mod rules;
pub mod sink;
pub mod sinks;
pub mod tagmap;
pub mod workerpool;

pub use bus::{Bus, BusMessage, InMemoryBus};
pub use error::GatewayError;
pub use point::{Point, Value};
pub use rules::model::{Condition, Rule};
