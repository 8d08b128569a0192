//! Built-in south-bound adapter implementations.

pub mod isp_sidecar;
pub mod mock;

pub use isp_sidecar::IspSidecarAdapter;
pub use mock::MockAdapter;
