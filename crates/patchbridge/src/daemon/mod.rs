//! Relay daemon: websocket server, host task and command dispatch.

pub mod host;
pub mod server;
pub mod service;

pub use server::{BridgeError, BridgeHandle, BridgeServer};
pub use service::{Outcome, PatchService, ServiceOptions};
