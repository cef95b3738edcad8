//! patchbridge-daemon - websocket relay in front of an in-memory patcher.
//!
//! # Usage
//!
//! ```bash
//! patchbridge-daemon --port 5002
//! PATCHBRIDGE_ROUTING=broadcast patchbridge-daemon --demo
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use patchbridge::config::{BridgeConfig, Routing, DEFAULT_HOST, DEFAULT_PATH, DEFAULT_PORT};
use patchbridge::graph::{GraphStore, Patcher};
use patchbridge::BridgeServer;
use patchbridge_core::codec::{Whitespace, DEFAULT_MAX_CHUNK_LEN};
use patchbridge_core::protocol::Atom;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "patchbridge-daemon")]
#[command(version, about = "Websocket relay for remote patcher control")]
struct Args {
    /// Host to bind to
    #[arg(long, env = "PATCHBRIDGE_HOST", default_value = DEFAULT_HOST)]
    host: String,

    /// Port to listen on
    #[arg(short, long, env = "PATCHBRIDGE_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Websocket path
    #[arg(long, env = "PATCHBRIDGE_PATH", default_value = DEFAULT_PATH)]
    path: String,

    /// Maximum characters per response chunk
    #[arg(long, env = "PATCHBRIDGE_MAX_CHUNK_LEN", default_value_t = DEFAULT_MAX_CHUNK_LEN, value_parser = parse_chunk_len)]
    max_chunk_len: usize,

    /// Reply routing: origin or broadcast
    #[arg(long, env = "PATCHBRIDGE_ROUTING", default_value_t = Routing::Origin)]
    routing: Routing,

    /// Strip whitespace from replies that carry no box text or attribute values
    #[arg(long, env = "PATCHBRIDGE_STRIP_WHITESPACE")]
    strip_whitespace: bool,

    /// Include full attribute maps in snapshots
    #[arg(long, env = "PATCHBRIDGE_INCLUDE_ATTRIBUTES")]
    include_attributes: bool,

    /// Skip the box text pass on snapshots
    #[arg(long)]
    no_box_text: bool,

    /// Start with a small example patch loaded
    #[arg(long)]
    demo: bool,
}

fn parse_chunk_len(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(0) => Err("chunk length must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("patchbridge=info".parse()?)
                .add_directive("patchbridge_core=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = BridgeConfig {
        host: args.host,
        port: args.port,
        path: args.path,
        max_chunk_len: args.max_chunk_len,
        whitespace: if args.strip_whitespace {
            Whitespace::Strip
        } else {
            Whitespace::Preserve
        },
        routing: args.routing,
        include_attributes: args.include_attributes,
        box_text: !args.no_box_text,
    };

    let mut patcher = Patcher::new();
    if args.demo {
        load_demo(&mut patcher);
        info!(boxes = patcher.len(), "Loaded demo patch");
    }

    let server = BridgeServer::bind(config)
        .await
        .context("Failed to start relay")?;
    let handle = server.spawn(patcher);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("Shutting down");
    handle.shutdown().await;
    Ok(())
}

/// Oscillator into a gain stage into the DAC, with a toggle and a comment.
fn load_demo(patcher: &mut Patcher) {
    let osc = patcher.add_with_args("cycle~", &[Atom::Int(440)], 40.0, 60.0, Some("osc"));
    let gain = patcher.add_with_args("*~", &[Atom::Float(0.2)], 40.0, 110.0, Some("gain"));
    let dac = patcher.add("ezdac~", 40.0, 160.0, Some("dac"));
    patcher.add("toggle", 200.0, 60.0, Some("power"));
    patcher.add_with_args(
        "comment",
        &[Atom::Symbol("demo".into()), Atom::Symbol("patch".into())],
        40.0,
        20.0,
        None,
    );

    patcher.connect(osc, 0, gain, 0);
    patcher.connect(gain, 0, dac, 0);
    patcher.connect(gain, 0, dac, 1);
}
