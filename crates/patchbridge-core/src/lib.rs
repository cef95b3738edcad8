//! Shared core library for patchbridge relay clients and the relay itself.
//!
//! This crate provides the command/snapshot protocol types, the chunked
//! transport codec, the request correlator, and the async websocket client.

pub mod client;
pub mod codec;
pub mod correlator;
pub mod protocol;

// Re-export commonly used types
pub use client::{emit_result, BridgeClient, ClientError, ClientOptions};
pub use codec::{ChunkAssembler, ChunkOptions, CodecError, Whitespace};
pub use correlator::{CommandSink, Correlator};
pub use protocol::{
    Action, Atom, Bounds, BoxRecord, ClientFrame, Command, CommandError, CommandFailure, Endpoint,
    MessageBody, Patchline, Rect, ResponseEnvelope, ServerFrame, Snapshot, StatusInfo,
};
