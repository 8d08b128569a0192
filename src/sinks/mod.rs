//! Built-in north-bound sink implementations.

pub mod console;
pub mod forward_bus;
pub mod mqtt;
pub mod websocket;

#[cfg(feature = "database-sink")]
pub mod database;

#[cfg(feature = "nats")]
pub mod nats;

pub use console::ConsoleSink;
pub use forward_bus::ForwardBusSink;
pub use mqtt::MqttSink;
pub use websocket::WebSocketSink;

#[cfg(feature = "database-sink")]
pub use database::DatabaseSink;

#[cfg(feature = "nats")]
pub use nats::NatsSink;
