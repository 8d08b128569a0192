//! ISP ("IoT Sidecar Protocol") transport (§4.B, §6).
//!
//! Newline-delimited JSON frames, correlated by `id`, with bidirectional
//! heartbeats and a supervising proxy that reconnects with back-off.

mod client;
mod message;
mod proxy;

pub use client::{IspClient, IspError};
pub use message::{IspMessage, MessageType};
pub use proxy::IspAdapterProxy;
