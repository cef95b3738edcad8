//! Host task: the single owner of the patch service.
//!
//! Commands arrive over an mpsc channel tagged with their connection; every
//! reply or error is chunked by the codec and queued on the outbound queue of
//! the connection it is routed to. Each session has its own queue, so one
//! slow reader never costs another session frames.

use std::sync::Arc;

use dashmap::DashMap;
use patchbridge_core::codec::{self, ChunkOptions, Whitespace};
use patchbridge_core::protocol::{codes, ResponseEnvelope, ServerFrame};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Routing;
use crate::daemon::service::{Outcome, PatchService};
use crate::graph::GraphStore;

/// Connection identifier (`conn_<uuid prefix>`).
pub type ConnectionId = String;

/// A command frame received by some connection.
#[derive(Debug)]
pub struct Inbound {
    pub conn: ConnectionId,
    pub data: Value,
}

/// Outbound queues of every live session, keyed by connection id.
///
/// Queues are unbounded: a reply is either queued whole, in order, or the
/// session is gone and the frames are dropped with it.
#[derive(Debug, Clone, Default)]
pub struct Connections {
    queues: Arc<DashMap<ConnectionId, mpsc::UnboundedSender<ServerFrame>>>,
}

impl Connections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session. Frames routed to it arrive on the returned receiver.
    pub fn register(&self, conn: ConnectionId) -> mpsc::UnboundedReceiver<ServerFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.queues.insert(conn, tx);
        rx
    }

    pub fn unregister(&self, conn: &str) {
        self.queues.remove(conn);
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Queue `frames` for `target`, or for every session when `target` is
    /// `None`. Returns how many sessions took the frames.
    pub fn deliver(&self, target: Option<&str>, frames: &[ServerFrame]) -> usize {
        if frames.is_empty() {
            return 0;
        }

        // Clone the senders out so no map shard is held while sending.
        let queues: Vec<(ConnectionId, mpsc::UnboundedSender<ServerFrame>)> = match target {
            Some(conn) => self
                .queues
                .get(conn)
                .map(|q| (conn.to_string(), q.value().clone()))
                .into_iter()
                .collect(),
            None => self
                .queues
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        };

        let mut delivered = 0;
        for (conn, queue) in queues {
            if frames.iter().all(|f| queue.send(f.clone()).is_ok()) {
                delivered += 1;
            } else {
                debug!(conn = %conn, "Session gone; dropping its queue");
                self.queues.remove(&conn);
            }
        }
        delivered
    }
}

/// Run commands until every inbound sender is gone.
pub async fn run<G: GraphStore>(
    mut service: PatchService<G>,
    mut inbound: mpsc::Receiver<Inbound>,
    connections: Connections,
    chunking: ChunkOptions,
    routing: Routing,
) {
    info!("Host task started");
    while let Some(Inbound { conn, data }) = inbound.recv().await {
        // Older controllers send the command as a JSON string.
        let outcome = match data {
            Value::String(raw) => service.dispatch(&raw),
            other => service.dispatch_value(other),
        };

        let frames = frames_for(outcome, chunking);
        let target = match routing {
            Routing::Origin => Some(conn.as_str()),
            Routing::Broadcast => None,
        };
        if !frames.is_empty() && connections.deliver(target, &frames) == 0 {
            warn!(conn = %conn, "No connection left to receive reply");
        }
    }
    info!("Host task stopped");
}

/// Turn a dispatch outcome into outbound frames.
///
/// Whitespace stripping only applies to replies without free text; box text
/// and attribute values always go out as-is.
pub fn frames_for(outcome: Outcome, chunking: ChunkOptions) -> Vec<ServerFrame> {
    match outcome {
        Outcome::Silent => Vec::new(),
        Outcome::Rejected(failure) => vec![ServerFrame::from(failure)],
        Outcome::Reply {
            request_id,
            results,
            has_text,
        } => {
            let options = if has_text {
                ChunkOptions {
                    whitespace: Whitespace::Preserve,
                    ..chunking
                }
            } else {
                chunking
            };
            let envelope = ResponseEnvelope {
                request_id: request_id.clone(),
                results,
            };
            match codec::encode(&envelope, options) {
                Ok(chunks) => {
                    let last_seq = chunks.len().saturating_sub(1);
                    chunks
                        .into_iter()
                        .enumerate()
                        .map(|(seq, chunk)| ServerFrame::Response {
                            request_id: request_id.clone(),
                            seq: seq as u32,
                            last: seq == last_seq,
                            chunk,
                        })
                        .collect()
                }
                Err(e) => {
                    warn!(request_id = %request_id, error = %e, "Failed to encode reply");
                    vec![ServerFrame::error(
                        Some(request_id),
                        codes::TRANSPORT,
                        e.to_string(),
                    )]
                }
            }
        }
    }
}
