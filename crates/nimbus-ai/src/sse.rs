//! Incremental decoder for server-sent-event completion streams.
//!
//! Chunk boundaries coming off the wire are arbitrary: one event may be split
//! across several chunks and one chunk may carry several events. The decoder
//! keeps whatever trails the last complete event in a buffer and only decodes
//! an event once its terminating blank line has arrived.

use serde::Deserialize;

use crate::error::{Error, Result};

/// Blank line separating two events
const EVENT_SEPARATOR: &str = "\n\n";

/// Field prefix of every payload line
const DATA_PREFIX: &str = "data:";

/// Payload that marks the end of a completion stream
pub const DONE_SENTINEL: &str = "[DONE]";

/// One decoded unit of a completion stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    /// An incremental piece of completion text
    Text(String),
    /// The sentinel arrived; nothing follows
    Done,
    /// A payload that is not valid chunk JSON (carries the parser error)
    Malformed(String),
    /// The backend reported an error in place of a delta
    Failed { error_type: String, message: String },
}

/// Push-driven SSE decoder. Feed it chunks, collect the decoded units.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    pending_bytes: Vec<u8>,
    finished: bool,
}

impl SseDecoder {
    /// Create a new decoder with empty buffers
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the sentinel, an error or a malformed payload has been seen
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed raw bytes. A multi-byte character split across two chunks is
    /// held back until its remaining bytes arrive.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<Vec<StreamChunk>> {
        self.pending_bytes.extend_from_slice(bytes);
        let valid_up_to = match std::str::from_utf8(&self.pending_bytes) {
            Ok(_) => self.pending_bytes.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(e) => return Err(Error::Decode(format!("invalid UTF-8 in stream: {}", e))),
        };

        let rest = self.pending_bytes.split_off(valid_up_to);
        let complete = std::mem::replace(&mut self.pending_bytes, rest);
        let text = String::from_utf8(complete)
            .map_err(|e| Error::Decode(format!("invalid UTF-8 in stream: {}", e)))?;
        Ok(self.push(&text))
    }

    /// Feed a text chunk and return every unit completed by it, in order.
    pub fn push(&mut self, chunk: &str) -> Vec<StreamChunk> {
        if self.finished {
            return Vec::new();
        }

        self.buffer.push_str(chunk);
        if self.buffer.contains('\r') {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }

        let mut out = Vec::new();
        while let Some(pos) = self.buffer.find(EVENT_SEPARATOR) {
            let event: String = self.buffer.drain(..pos + EVENT_SEPARATOR.len()).collect();
            if self.decode_event(&event[..pos], &mut out) {
                break;
            }
        }
        out
    }

    /// Flush a trailing event that was never followed by a blank line.
    /// Call once the underlying transport has closed.
    pub fn finish(&mut self) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        let event = std::mem::take(&mut self.buffer);
        let event = event.trim_end_matches(['\r', '\n']);
        if !event.is_empty() {
            self.decode_event(event, &mut out);
        }
        out
    }

    /// Decode one complete event into `out`. Returns true when the stream is over.
    fn decode_event(&mut self, event: &str, out: &mut Vec<StreamChunk>) -> bool {
        let Some(payload) = event_payload(event) else {
            return false;
        };
        if payload.is_empty() {
            return false;
        }

        if payload == DONE_SENTINEL {
            out.push(StreamChunk::Done);
            self.finish_early();
            return true;
        }

        match serde_json::from_str::<ChunkPayload>(&payload) {
            Ok(ChunkPayload {
                error: Some(error), ..
            }) => {
                tracing::debug!("Backend error in stream: {}", error.message);
                out.push(StreamChunk::Failed {
                    error_type: error.error_type.unwrap_or_else(|| "stream_error".to_string()),
                    message: error.message,
                });
                self.finish_early();
                true
            }
            Ok(chunk) => {
                out.extend(
                    chunk
                        .choices
                        .into_iter()
                        .filter_map(|c| c.delta.content)
                        .filter(|text| !text.is_empty())
                        .map(StreamChunk::Text),
                );
                false
            }
            Err(e) => {
                tracing::debug!("Malformed stream payload {:?}: {}", payload, e);
                out.push(StreamChunk::Malformed(format!("{}: {}", e, payload)));
                self.finish_early();
                true
            }
        }
    }

    fn finish_early(&mut self) {
        self.finished = true;
        self.buffer.clear();
        self.pending_bytes.clear();
    }
}

/// Collect the `data:` lines of an event into one trimmed payload.
/// Returns `None` for events without any data line (comments, keep-alives).
fn event_payload(event: &str) -> Option<String> {
    let lines: Vec<&str> = event
        .lines()
        .filter_map(|line| line.strip_prefix(DATA_PREFIX))
        .map(str::trim)
        .collect();

    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n").trim().to_string())
    }
}

// Wire types. Only the delta text is of interest.

#[derive(Debug, Deserialize)]
struct ChunkPayload {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<ChunkError>,
}

#[derive(Debug, Deserialize)]
struct ChunkError {
    #[serde(default)]
    message: String,
    #[serde(default, rename = "type")]
    error_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}
