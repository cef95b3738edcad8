//! Websocket relay server.
//!
//! Listens on one TCP port, upgrades connections on the configured path and
//! gives each one a session task. Commands go to the host task; frames from
//! the host arrive on the session's own outbound queue. The listener can be
//! moved to another port while sessions stay connected.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use patchbridge_core::protocol::{
    codes, ClientFrame, ServerFrame, StatusInfo, PROTOCOL_VERSION,
};
use serde_json::Value;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::daemon::host::{self, ConnectionId, Connections, Inbound};
use crate::daemon::service::PatchService;
use crate::graph::GraphStore;

const INBOUND_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Invalid port {0}: must be between 1 and 65535")]
    InvalidPort(i64),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Relay is not running")]
    Stopped,
}

impl BridgeError {
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::InvalidPort(_) => codes::INVALID_PORT,
            BridgeError::Bind { .. } | BridgeError::Stopped => codes::TRANSPORT,
        }
    }
}

/// Check a requested port against 1..=65535.
pub fn validate_port(port: i64) -> Result<u16, BridgeError> {
    match u16::try_from(port) {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(BridgeError::InvalidPort(port)),
    }
}

async fn bind(host: &str, port: u16) -> Result<TcpListener, BridgeError> {
    let addr = format!("{}:{}", host, port);
    TcpListener::bind(&addr)
        .await
        .map_err(|source| BridgeError::Bind { addr, source })
}

/// Shared relay state.
struct RelayState {
    port: AtomicU16,
    connections: Connections,
    started_at: String,
}

impl RelayState {
    fn status(&self) -> StatusInfo {
        StatusInfo {
            pid: std::process::id(),
            started_at: self.started_at.clone(),
            port: self.port.load(Ordering::SeqCst),
            clients: self.connections.len(),
            protocol_v: PROTOCOL_VERSION,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

enum Control {
    SetPort {
        port: i64,
        reply: oneshot::Sender<Result<u16, BridgeError>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Everything a session task needs.
#[derive(Clone)]
struct SessionContext {
    path: String,
    state: Arc<RelayState>,
    inbound: mpsc::Sender<Inbound>,
    control: mpsc::Sender<Control>,
    shutdown: watch::Receiver<bool>,
}

/// A bound relay, not yet serving.
pub struct BridgeServer {
    config: BridgeConfig,
    listener: TcpListener,
}

impl BridgeServer {
    /// Bind the configured address.
    pub async fn bind(config: BridgeConfig) -> Result<Self, BridgeError> {
        let listener = bind(&config.host, config.port).await?;
        Ok(Self { config, listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Start the host task and the accept loop for `graph`.
    pub fn spawn<G>(self, graph: G) -> BridgeHandle
    where
        G: GraphStore + Send + 'static,
    {
        let port = self
            .listener
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(self.config.port);
        let state = Arc::new(RelayState {
            port: AtomicU16::new(port),
            connections: Connections::new(),
            started_at: chrono::Utc::now().to_rfc3339(),
        });

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (control_tx, control_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let service = PatchService::new(graph, self.config.service_options());
        tokio::spawn(host::run(
            service,
            inbound_rx,
            state.connections.clone(),
            self.config.chunk_options(),
            self.config.routing,
        ));

        let ctx = SessionContext {
            path: self.config.path.clone(),
            state: state.clone(),
            inbound: inbound_tx,
            control: control_tx.clone(),
            shutdown: shutdown_rx,
        };
        tokio::spawn(accept_loop(
            self.listener,
            self.config.host.clone(),
            ctx,
            control_rx,
            shutdown_tx,
        ));

        info!(
            port,
            path = %self.config.path,
            routing = %self.config.routing,
            "Relay listening on ws://{}:{}{}",
            self.config.host,
            port,
            self.config.path
        );

        BridgeHandle {
            host: self.config.host,
            path: self.config.path,
            state,
            control: control_tx,
        }
    }
}

/// Control surface of a running relay.
#[derive(Clone)]
pub struct BridgeHandle {
    host: String,
    path: String,
    state: Arc<RelayState>,
    control: mpsc::Sender<Control>,
}

impl BridgeHandle {
    pub fn port(&self) -> u16 {
        self.state.port.load(Ordering::SeqCst)
    }

    /// Websocket URL clients should use right now.
    pub fn url(&self) -> String {
        format!("ws://{}:{}{}", self.host, self.port(), self.path)
    }

    pub fn status(&self) -> StatusInfo {
        self.state.status()
    }

    /// Move the listener to `port`.
    ///
    /// The new port is bound before the old listener closes; on any error
    /// the relay keeps listening where it was.
    pub async fn set_port(&self, port: i64) -> Result<u16, BridgeError> {
        request_port(&self.control, port).await
    }

    /// Stop accepting and close every session.
    pub async fn shutdown(&self) {
        let (done, wait) = oneshot::channel();
        if self.control.send(Control::Shutdown { done }).await.is_ok() {
            let _ = wait.await;
        }
    }
}

async fn request_port(control: &mpsc::Sender<Control>, port: i64) -> Result<u16, BridgeError> {
    let port = validate_port(port)?;
    let (reply, wait) = oneshot::channel();
    control
        .send(Control::SetPort {
            port: port as i64,
            reply,
        })
        .await
        .map_err(|_| BridgeError::Stopped)?;
    wait.await.map_err(|_| BridgeError::Stopped)?
}

// ============================================================================
// Accept loop
// ============================================================================

async fn accept_loop(
    mut listener: TcpListener,
    host: String,
    ctx: SessionContext,
    mut control: mpsc::Receiver<Control>,
    shutdown: watch::Sender<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(%addr, "Accepted connection");
                    tokio::spawn(handle_connection(stream, addr, ctx.clone()));
                }
                Err(e) => warn!("Accept error: {}", e),
            },

            cmd = control.recv() => match cmd {
                Some(Control::SetPort { port, reply }) => {
                    let result = rebind(&mut listener, &host, port, &ctx).await;
                    let _ = reply.send(result);
                }
                Some(Control::Shutdown { done }) => {
                    let _ = shutdown.send(true);
                    let _ = done.send(());
                    break;
                }
                None => break,
            },
        }
    }
    info!("Relay stopped accepting");
}

async fn rebind(
    listener: &mut TcpListener,
    host: &str,
    port: i64,
    ctx: &SessionContext,
) -> Result<u16, BridgeError> {
    let port = validate_port(port)?;
    let fresh = bind(host, port).await?;
    let bound = fresh.local_addr().map(|a| a.port()).unwrap_or(port);

    let old = std::mem::replace(listener, fresh);
    drop(old);
    ctx.state.port.store(bound, Ordering::SeqCst);
    info!(port = bound, "Relay moved");

    ctx.state
        .connections
        .deliver(None, &[ServerFrame::PortChanged { port: bound }]);
    Ok(bound)
}

// ============================================================================
// Sessions
// ============================================================================

async fn handle_connection(stream: TcpStream, addr: SocketAddr, ctx: SessionContext) {
    let path = ctx.path.clone();
    let check_path = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        if req.uri().path() == path {
            Ok(resp)
        } else {
            let mut refusal = ErrorResponse::new(Some(format!("no endpoint at {}", req.uri().path())));
            *refusal.status_mut() = StatusCode::NOT_FOUND;
            Err(refusal)
        }
    };

    let ws = match accept_hdr_async(stream, check_path).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%addr, "WebSocket handshake failed: {}", e);
            return;
        }
    };

    let mut session = Session::new(ws, ctx);
    info!(conn = %session.id, %addr, "Client connected");
    session.run().await;
    info!(conn = %session.id, "Client disconnected");
}

struct Session {
    id: ConnectionId,
    ws: WebSocketStream<TcpStream>,
    ctx: SessionContext,
}

impl Session {
    fn new(ws: WebSocketStream<TcpStream>, ctx: SessionContext) -> Self {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: format!("conn_{}", &uuid[..8]),
            ws,
            ctx,
        }
    }

    async fn run(&mut self) {
        let mut outbound = self.ctx.state.connections.register(self.id.clone());
        let mut shutdown = self.ctx.shutdown.clone();

        loop {
            tokio::select! {
                msg = self.ws.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = self.handle_text(&text).await {
                            error!(conn = %self.id, "Failed to answer frame: {}", e);
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = self.ws.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(conn = %self.id, "WebSocket error: {}", e);
                        break;
                    }
                    Some(Ok(_)) => {}
                },

                out = outbound.recv() => match out {
                    Some(frame) => {
                        if self.send(&frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },

                _ = shutdown.changed() => {
                    let _ = self.ws.send(Message::Close(None)).await;
                    break;
                }
            }
        }

        self.ctx.state.connections.unregister(&self.id);
    }

    async fn handle_text(&mut self, text: &str) -> anyhow::Result<()> {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(conn = %self.id, "Invalid JSON frame");
                let frame = ServerFrame::error(None, codes::INVALID_PAYLOAD, format!("Invalid JSON: {}", e));
                return self.send(&frame).await;
            }
        };

        // Bare command objects are accepted without the frame wrapper.
        if value.get("type").is_none() {
            return self.forward(value).await;
        }

        let frame: ClientFrame = match serde_json::from_value(value) {
            Ok(f) => f,
            Err(e) => {
                let frame = ServerFrame::error(None, codes::INVALID_PAYLOAD, format!("Invalid frame: {}", e));
                return self.send(&frame).await;
            }
        };

        match frame {
            ClientFrame::Command { data } => self.forward(data).await,
            ClientFrame::SetPort { port } => {
                if let Err(e) = request_port(&self.ctx.control, port).await {
                    warn!(conn = %self.id, port, "Port change refused: {}", e);
                    self.send(&ServerFrame::error(None, e.code(), e.to_string())).await?;
                }
                Ok(())
            }
            ClientFrame::Ping => self.send(&ServerFrame::Pong).await,
            ClientFrame::Status => {
                let status = self.ctx.state.status();
                self.send(&ServerFrame::Status(status)).await
            }
        }
    }

    async fn forward(&mut self, data: Value) -> anyhow::Result<()> {
        let inbound = Inbound {
            conn: self.id.clone(),
            data,
        };
        if self.ctx.inbound.send(inbound).await.is_err() {
            let frame = ServerFrame::error(None, codes::TRANSPORT, "Patcher host is not running");
            self.send(&frame).await?;
        }
        Ok(())
    }

    async fn send(&mut self, frame: &ServerFrame) -> anyhow::Result<()> {
        let json = serde_json::to_string(frame)?;
        self.ws.send(Message::Text(json)).await?;
        Ok(())
    }
}
