//! patchbridge library
//!
//! Graph store, snapshot engine and relay daemon used by the
//! `patchbridge-daemon` and `patchbridge-client` binaries.

pub mod config;
pub mod daemon;
pub mod graph;
pub mod snapshot;

pub use config::{BridgeConfig, Routing};
pub use daemon::{BridgeError, BridgeHandle, BridgeServer};
pub use graph::{GraphStore, Patcher};
