//! Relay configuration.

use std::fmt;
use std::str::FromStr;

use patchbridge_core::codec::{ChunkOptions, Whitespace, DEFAULT_MAX_CHUNK_LEN};

use crate::daemon::service::ServiceOptions;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5002;
pub const DEFAULT_PATH: &str = "/mcp";

/// Who receives replies and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Routing {
    /// Only the connection that sent the command
    #[default]
    Origin,
    /// Every connected client
    Broadcast,
}

impl FromStr for Routing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "origin" => Ok(Routing::Origin),
            "broadcast" => Ok(Routing::Broadcast),
            other => Err(format!("unknown routing mode '{}' (expected origin or broadcast)", other)),
        }
    }
}

impl fmt::Display for Routing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Routing::Origin => "origin",
            Routing::Broadcast => "broadcast",
        })
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub host: String,
    /// 0 picks a free port at startup
    pub port: u16,
    /// Websocket path clients must connect to
    pub path: String,
    pub max_chunk_len: usize,
    /// Applied to text-free replies only
    pub whitespace: Whitespace,
    pub routing: Routing,
    pub include_attributes: bool,
    pub box_text: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            path: DEFAULT_PATH.to_string(),
            max_chunk_len: DEFAULT_MAX_CHUNK_LEN,
            whitespace: Whitespace::Preserve,
            routing: Routing::Origin,
            include_attributes: false,
            box_text: true,
        }
    }
}

impl BridgeConfig {
    pub fn chunk_options(&self) -> ChunkOptions {
        ChunkOptions {
            max_chunk_len: self.max_chunk_len,
            whitespace: self.whitespace,
        }
    }

    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            include_attributes: self.include_attributes,
            box_text: self.box_text,
        }
    }
}
