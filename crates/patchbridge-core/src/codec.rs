//! Chunked transport codec.
//!
//! A payload is serialized to one JSON string and cut into contiguous pieces
//! of at most `max_chunk_len` characters. Chunks travel in order on one
//! connection, so concatenation alone restores the original string; the
//! relay frame around each chunk carries its sequence number and a `last`
//! flag so the receiver knows when to parse.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Default chunk ceiling, below the transport's single-message limit.
pub const DEFAULT_MAX_CHUNK_LEN: usize = 2500;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Chunk length must be at least 1")]
    InvalidChunkLength,

    #[error("JSON serialization error: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Malformed payload: {0}")]
    MalformedPayload(#[source] serde_json::Error),

    #[error("Chunk {got} of request {request_id} arrived out of order (expected {expected})")]
    OutOfOrder {
        request_id: String,
        expected: u32,
        got: u32,
    },
}

/// Whitespace handling before chunking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Whitespace {
    /// Send the serialized string as-is
    #[default]
    Preserve,
    /// Remove every whitespace character, including inside strings.
    /// Only for discovery dumps where box text does not matter.
    Strip,
}

/// Per-call encoding options.
#[derive(Debug, Clone, Copy)]
pub struct ChunkOptions {
    pub max_chunk_len: usize,
    pub whitespace: Whitespace,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            max_chunk_len: DEFAULT_MAX_CHUNK_LEN,
            whitespace: Whitespace::Preserve,
        }
    }
}

impl ChunkOptions {
    pub fn new(max_chunk_len: usize) -> Self {
        Self {
            max_chunk_len,
            ..Self::default()
        }
    }

    pub fn strip_whitespace(mut self) -> Self {
        self.whitespace = Whitespace::Strip;
        self
    }
}

/// Split `text` into pieces of at most `max_len` characters.
///
/// An empty string yields one empty chunk so every payload has a final frame.
pub fn split_chunks(text: &str, max_len: usize) -> Result<Vec<String>, CodecError> {
    if max_len == 0 {
        return Err(CodecError::InvalidChunkLength);
    }
    if text.is_empty() {
        return Ok(vec![String::new()]);
    }

    let mut chunks = Vec::with_capacity(text.len() / max_len + 1);
    let mut start = 0;
    let mut count = 0;
    for (idx, _) in text.char_indices() {
        if count == max_len {
            chunks.push(text[start..idx].to_string());
            start = idx;
            count = 0;
        }
        count += 1;
    }
    chunks.push(text[start..].to_string());
    Ok(chunks)
}

/// Concatenate chunks in arrival order.
pub fn join_chunks<S: AsRef<str>>(chunks: &[S]) -> String {
    let mut out = String::with_capacity(chunks.iter().map(|c| c.as_ref().len()).sum());
    for chunk in chunks {
        out.push_str(chunk.as_ref());
    }
    out
}

/// Serialize `payload` compactly and split it.
pub fn encode<T: Serialize + ?Sized>(
    payload: &T,
    options: ChunkOptions,
) -> Result<Vec<String>, CodecError> {
    let json = serde_json::to_string(payload).map_err(CodecError::Serialize)?;
    let json = match options.whitespace {
        Whitespace::Preserve => json,
        Whitespace::Strip => json.chars().filter(|c| !c.is_whitespace()).collect(),
    };
    split_chunks(&json, options.max_chunk_len)
}

/// Concatenate and parse.
pub fn decode<T: DeserializeOwned, S: AsRef<str>>(chunks: &[S]) -> Result<T, CodecError> {
    serde_json::from_str(&join_chunks(chunks)).map_err(CodecError::MalformedPayload)
}

#[derive(Debug, Default)]
struct Partial {
    next_seq: u32,
    buffer: String,
}

/// Reassembles chunk frames per request id.
///
/// Partial buffers are never exposed; only the `last` frame releases the
/// concatenated string.
#[derive(Debug, Default)]
pub struct ChunkAssembler {
    partial: HashMap<String, Partial>,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk. Returns the full payload once `last` is seen.
    ///
    /// An out-of-order sequence number discards what was buffered for that
    /// request.
    pub fn push(
        &mut self,
        request_id: &str,
        seq: u32,
        last: bool,
        chunk: &str,
    ) -> Result<Option<String>, CodecError> {
        let entry = self.partial.entry(request_id.to_string()).or_default();
        if seq != entry.next_seq {
            let expected = entry.next_seq;
            self.partial.remove(request_id);
            return Err(CodecError::OutOfOrder {
                request_id: request_id.to_string(),
                expected,
                got: seq,
            });
        }

        entry.buffer.push_str(chunk);
        entry.next_seq += 1;

        if last {
            Ok(self.partial.remove(request_id).map(|p| p.buffer))
        } else {
            Ok(None)
        }
    }

    /// Drop any buffered chunks for `request_id`.
    pub fn discard(&mut self, request_id: &str) {
        self.partial.remove(request_id);
    }

    /// Keep only the buffers whose request id passes `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.partial.retain(|id, _| keep(id));
    }

    /// Number of requests with buffered, incomplete payloads.
    pub fn pending(&self) -> usize {
        self.partial.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_six_thousand_chars_split_into_three() {
        let text: String = "a".repeat(6000);
        let chunks = split_chunks(&text, 2500).unwrap();
        let lengths: Vec<usize> = chunks.iter().map(|c| c.len()).collect();
        assert_eq!(lengths, vec![2500, 2500, 1000]);
        assert_eq!(join_chunks(&chunks), text);
    }

    #[test]
    fn test_zero_chunk_length_rejected() {
        assert!(matches!(
            split_chunks("abc", 0),
            Err(CodecError::InvalidChunkLength)
        ));
    }

    #[test]
    fn test_split_respects_char_boundaries() {
        let text = "añb€c";
        let chunks = split_chunks(text, 2).unwrap();
        assert_eq!(chunks, vec!["añ", "b€", "c"]);
        assert_eq!(join_chunks(&chunks), text);
    }

    #[test]
    fn test_round_trip_for_many_chunk_sizes() {
        let payload = json!({
            "request_id": "r1",
            "results": {"boxes": [{"box": {"text": "cycle~  440", "varname": "osc"}}], "lines": []}
        });
        for k in [1, 2, 7, 64, 2500] {
            let chunks = encode(&payload, ChunkOptions::new(k)).unwrap();
            assert!(chunks.iter().all(|c| c.chars().count() <= k));
            let back: Value = decode(&chunks).unwrap();
            assert_eq!(back, payload);
        }
    }

    #[test]
    fn test_empty_string_is_one_chunk() {
        assert_eq!(split_chunks("", 10).unwrap(), vec![String::new()]);
    }

    #[test]
    fn test_strip_whitespace_is_opt_in() {
        let payload = json!({"text": "set 1 2"});
        let kept: Value = decode(&encode(&payload, ChunkOptions::new(100)).unwrap()).unwrap();
        assert_eq!(kept["text"], "set 1 2");

        let stripped: Value =
            decode(&encode(&payload, ChunkOptions::new(100).strip_whitespace()).unwrap()).unwrap();
        assert_eq!(stripped["text"], "set12");
    }

    #[test]
    fn test_decode_partial_concatenation_is_malformed() {
        let chunks = encode(&json!({"a": [1, 2, 3]}), ChunkOptions::new(4)).unwrap();
        let partial = &chunks[..chunks.len() - 1];
        let err = decode::<Value, _>(partial).unwrap_err();
        assert!(matches!(err, CodecError::MalformedPayload(_)));
    }

    #[test]
    fn test_assembler_completes_on_last() {
        let mut asm = ChunkAssembler::new();
        assert_eq!(asm.push("r1", 0, false, "{\"a\"").unwrap(), None);
        assert_eq!(asm.push("r2", 0, true, "[]").unwrap(), Some("[]".to_string()));
        assert_eq!(asm.pending(), 1);
        assert_eq!(asm.push("r1", 1, true, ":1}").unwrap(), Some("{\"a\":1}".to_string()));
        assert_eq!(asm.pending(), 0);
    }

    #[test]
    fn test_assembler_rejects_out_of_order() {
        let mut asm = ChunkAssembler::new();
        asm.push("r1", 0, false, "ab").unwrap();
        let err = asm.push("r1", 2, true, "cd").unwrap_err();
        assert!(matches!(
            err,
            CodecError::OutOfOrder { expected: 1, got: 2, .. }
        ));
        assert_eq!(asm.pending(), 0);
    }

    #[test]
    fn test_assembler_retain_drops_unwanted_buffers() {
        let mut asm = ChunkAssembler::new();
        asm.push("keep", 0, false, "{").unwrap();
        asm.push("stale", 0, false, "[").unwrap();
        asm.retain(|id| id == "keep");
        assert_eq!(asm.pending(), 1);
        assert_eq!(asm.push("keep", 1, true, "}").unwrap(), Some("{}".to_string()));
    }
}
