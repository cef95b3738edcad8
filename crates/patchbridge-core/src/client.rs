//! Websocket client for the patchbridge relay.
//!
//! Queries go through the [`Correlator`]; chunked replies are reassembled by
//! a reader task before the pending request is resolved. Frames that are not
//! responses (status, pong, port changes, uncorrelated errors) are published
//! on a broadcast channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::codec::{self, ChunkAssembler, CodecError};
use crate::correlator::{CommandSink, Correlator, DEFAULT_REQUEST_TIMEOUT};
use crate::protocol::{
    codes, Action, Bounds, ClientFrame, Command, CommandFailure, ResponseEnvelope, ServerFrame,
    Snapshot, StatusInfo,
};

/// Default timeout for the websocket handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default relay URL.
pub const DEFAULT_URL: &str = "ws://127.0.0.1:5002/mcp";

/// Errors that can occur when talking to the relay.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Timeout connecting to {0}")]
    ConnectTimeout(String),

    #[error("JSON serialization error: {0}")]
    SerializeError(#[source] serde_json::Error),

    #[error("JSON parse error: {0}")]
    ParseError(#[source] serde_json::Error),

    #[error("Malformed response: {0}")]
    Malformed(#[from] CodecError),

    #[error("Invalid command: {0}")]
    InvalidCommand(#[from] CommandFailure),

    #[error("{code}: {message}")]
    Rejected { code: String, message: String },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout waiting for response")]
    Timeout,
}

impl ClientError {
    /// Stable code for the error, in the relay's error-code style.
    pub fn code(&self) -> &str {
        match self {
            ClientError::ConnectionFailed(_) => "CONNECT_FAILED",
            ClientError::ConnectTimeout(_) => "CONNECT_TIMEOUT",
            ClientError::SerializeError(_) => "SERIALIZE_ERROR",
            ClientError::ParseError(_) => "PARSE_ERROR",
            ClientError::Malformed(_) => codes::MALFORMED_RESPONSE,
            ClientError::InvalidCommand(f) => f.error.code(),
            ClientError::Rejected { code, .. } => code.as_str(),
            ClientError::ConnectionClosed => "CONNECTION_CLOSED",
            ClientError::Timeout => "TIMEOUT",
        }
    }

    /// Format a client-side error as a relay-style error object.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "ok": false,
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        })
    }
}

/// Connection settings.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Write half of the websocket, shared by the client and the correlator.
struct FrameWriter {
    sink: Mutex<SplitSink<WsStream, Message>>,
}

impl FrameWriter {
    async fn send_frame(&self, frame: &ClientFrame) -> Result<(), ClientError> {
        let text = serde_json::to_string(frame).map_err(ClientError::SerializeError)?;
        self.sink.lock().await.send(Message::Text(text)).await?;
        Ok(())
    }
}

#[async_trait]
impl CommandSink for FrameWriter {
    async fn send_command(&self, command: Value) -> Result<(), ClientError> {
        self.send_frame(&ClientFrame::Command { data: command }).await
    }
}

/// A connected relay client.
pub struct BridgeClient {
    url: String,
    writer: Arc<FrameWriter>,
    correlator: Arc<Correlator>,
    events: broadcast::Sender<ServerFrame>,
    reader: JoinHandle<()>,
}

impl BridgeClient {
    /// Connect to `url` (e.g. `ws://127.0.0.1:5002/mcp`).
    pub async fn connect(url: &str, options: ClientOptions) -> Result<Self, ClientError> {
        let (stream, _response) = tokio::time::timeout(options.connect_timeout, connect_async(url))
            .await
            .map_err(|_| ClientError::ConnectTimeout(url.to_string()))??;
        let (sink, stream) = stream.split();

        let writer = Arc::new(FrameWriter {
            sink: Mutex::new(sink),
        });
        let correlator = Arc::new(Correlator::new(options.request_timeout));
        let (events, _) = broadcast::channel(64);

        let reader = tokio::spawn(read_loop(stream, correlator.clone(), events.clone()));

        Ok(Self {
            url: url.to_string(),
            writer,
            correlator,
            events,
            reader,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Receive non-response frames (status, pong, port changes, errors).
    pub fn subscribe(&self) -> broadcast::Receiver<ServerFrame> {
        self.events.subscribe()
    }

    /// Issue a query and wait for its `results`.
    pub async fn request(&self, action: Action) -> Result<Value, ClientError> {
        self.correlator.issue(self.writer.as_ref(), action).await
    }

    /// Issue an untyped command object and wait for its `results`.
    pub async fn request_object(&self, object: Map<String, Value>) -> Result<Value, ClientError> {
        self.correlator
            .issue_object(self.writer.as_ref(), object)
            .await
    }

    /// Send a mutation. No reply is expected.
    pub async fn notify(&self, action: Action) -> Result<(), ClientError> {
        self.writer
            .send_command(Command::new(action).to_value())
            .await
    }

    pub async fn objects_in_patch(&self) -> Result<Snapshot, ClientError> {
        let value = self.request(Action::GetObjectsInPatch {}).await?;
        serde_json::from_value(value).map_err(ClientError::ParseError)
    }

    pub async fn objects_in_selected(&self) -> Result<Snapshot, ClientError> {
        let value = self.request(Action::GetObjectsInSelected {}).await?;
        serde_json::from_value(value).map_err(ClientError::ParseError)
    }

    pub async fn object_attributes(&self, varname: &str) -> Result<Map<String, Value>, ClientError> {
        let value = self
            .request(Action::GetObjectAttributes {
                varname: varname.to_string(),
            })
            .await?;
        serde_json::from_value(value).map_err(ClientError::ParseError)
    }

    /// Bounding rectangle of all objects, `None` for an empty patcher.
    pub async fn avoid_rect(&self) -> Result<Option<Bounds>, ClientError> {
        let value = self.request(Action::GetAvoidRectPosition {}).await?;
        serde_json::from_value(value).map_err(ClientError::ParseError)
    }

    /// Ask the relay to move to `port`. Resolves with the new port.
    pub async fn set_port(&self, port: i64) -> Result<u16, ClientError> {
        let mut rx = self.events.subscribe();
        self.writer.send_frame(&ClientFrame::SetPort { port }).await?;
        self.await_frame(&mut rx, |frame| match frame {
            ServerFrame::PortChanged { port } => Some(Ok(*port)),
            ServerFrame::Error {
                request_id: None,
                code,
                message,
            } if code == codes::INVALID_PORT || code == codes::TRANSPORT => {
                Some(Err(ClientError::Rejected {
                    code: code.clone(),
                    message: message.clone(),
                }))
            }
            _ => None,
        })
        .await
    }

    pub async fn status(&self) -> Result<StatusInfo, ClientError> {
        let mut rx = self.events.subscribe();
        self.writer.send_frame(&ClientFrame::Status).await?;
        self.await_frame(&mut rx, |frame| match frame {
            ServerFrame::Status(info) => Some(Ok(info.clone())),
            _ => None,
        })
        .await
    }

    /// Round-trip a ping; returns the elapsed time.
    pub async fn ping(&self) -> Result<Duration, ClientError> {
        let mut rx = self.events.subscribe();
        let started = tokio::time::Instant::now();
        self.writer.send_frame(&ClientFrame::Ping).await?;
        self.await_frame(&mut rx, |frame| match frame {
            ServerFrame::Pong => Some(Ok(())),
            _ => None,
        })
        .await?;
        Ok(started.elapsed())
    }

    async fn await_frame<T>(
        &self,
        rx: &mut broadcast::Receiver<ServerFrame>,
        mut pick: impl FnMut(&ServerFrame) -> Option<Result<T, ClientError>>,
    ) -> Result<T, ClientError> {
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(frame) => {
                        if let Some(result) = pick(&frame) {
                            return result;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(ClientError::ConnectionClosed)
                    }
                }
            }
        };
        tokio::time::timeout(self.correlator.timeout(), wait)
            .await
            .map_err(|_| ClientError::Timeout)?
    }

    /// Close the websocket and fail anything still pending.
    pub async fn close(self) -> Result<(), ClientError> {
        let result = self.writer.sink.lock().await.send(Message::Close(None)).await;
        self.reader.abort();
        self.correlator.fail_all();
        result.map_err(ClientError::from)
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    correlator: Arc<Correlator>,
    events: broadcast::Sender<ServerFrame>,
) {
    let mut assembler = ChunkAssembler::new();

    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(frame)) => {
                debug!(?frame, "Relay closed the connection");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, "Websocket read error");
                break;
            }
        };

        let frame: ServerFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Ignoring unparseable frame");
                continue;
            }
        };

        match frame {
            ServerFrame::Response {
                request_id,
                seq,
                last,
                chunk,
            } => on_chunk(&mut assembler, &correlator, &request_id, seq, last, &chunk),
            ServerFrame::Error {
                request_id: Some(id),
                code,
                message,
            } => {
                assembler.discard(&id);
                correlator.reject(&id, ClientError::Rejected { code, message });
            }
            other => {
                let _ = events.send(other);
            }
        }
    }

    correlator.fail_all();
}

/// Feed one response chunk; resolve or reject the request once it completes.
fn on_chunk(
    assembler: &mut ChunkAssembler,
    correlator: &Correlator,
    request_id: &str,
    seq: u32,
    last: bool,
    chunk: &str,
) {
    // Buffers of timed-out or foreign requests would never complete.
    assembler.retain(|id| correlator.is_pending(id));
    if !correlator.is_pending(request_id) {
        debug!(request_id, seq, "Dropping chunk for unknown request");
        return;
    }

    match assembler.push(request_id, seq, last, chunk) {
        Ok(Some(payload)) => match codec::decode::<ResponseEnvelope, _>(&[payload]) {
            Ok(envelope) => {
                correlator.resolve(&envelope.request_id, envelope.results);
            }
            Err(e) => {
                correlator.reject(request_id, ClientError::Malformed(e));
            }
        },
        Ok(None) => {}
        Err(e) => {
            correlator.reject(request_id, ClientError::Malformed(e));
        }
    }
}

/// Render a result value for stdout.
pub fn emit_result(result: &Value, pretty: bool) -> String {
    if pretty {
        serde_json::to_string_pretty(result).unwrap_or_else(|_| "null".to_string())
    } else {
        serde_json::to_string(result).unwrap_or_else(|_| "null".to_string())
    }
}
