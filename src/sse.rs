//! Server-Sent Events framing and the client-facing stream sink.
//!
//! Every normalized [`StreamEvent`] is framed as `data: <json>\n\n` and
//! pushed through a bounded channel whose receiver feeds the response body.
//! Only the active provider adapter writes, so writes are single-threaded by
//! construction.
//!
//! [`SseSink::first_byte_emitted`] is the invariant that separates retryable
//! from terminal provider failures: once any frame (including `start`) has
//! gone out, the fallback orchestrator may not switch candidates.

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;

/// Sentinel opening a thinking segment in the text stream.
pub const THINK_OPEN: &str = "◁think▷";
/// Sentinel closing a thinking segment.
pub const THINK_CLOSE: &str = "◁/think▷";

/// Normalized event emitted by provider adapters.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Start { display_name: String },
    Chunk { text: String, is_thinking: bool },
    End { timestamp: DateTime<Utc> },
    Error { message: String },
}

impl StreamEvent {
    pub fn chunk(text: impl Into<String>) -> Self {
        Self::Chunk {
            text: text.into(),
            is_thinking: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn end_now() -> Self {
        Self::End {
            timestamp: Utc::now(),
        }
    }

    /// Wire shape sent to the client.
    fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Start { display_name } => json!({ "type": "start", "model": display_name }),
            Self::Chunk { text, .. } => json!({ "type": "chunk", "message": text }),
            Self::End { timestamp } => json!({
                "type": "end",
                "timestamp": timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            }),
            Self::Error { message } => json!({ "type": "error", "message": message }),
        }
    }

    /// Frame as an SSE `data:` record.
    pub fn frame(&self) -> Bytes {
        Bytes::from(format!("data: {}\n\n", self.to_json()))
    }
}

/// The client went away (response body dropped).
#[derive(Debug, Error)]
#[error("client disconnected")]
pub struct SinkClosed;

/// Write side of the client SSE stream.
pub struct SseSink {
    tx: mpsc::Sender<Bytes>,
    first_byte_emitted: bool,
}

impl SseSink {
    /// Frames buffered before backpressure stalls the adapter read loop.
    pub const CHANNEL_CAPACITY: usize = 32;

    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            tx,
            first_byte_emitted: false,
        }
    }

    /// Channel pair for wiring a sink to a response body stream.
    pub fn channel() -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(Self::CHANNEL_CAPACITY);
        (Self::new(tx), rx)
    }

    /// Frame, enqueue, and mark the stream dirty.
    pub async fn send(&mut self, event: &StreamEvent) -> Result<(), SinkClosed> {
        self.tx.send(event.frame()).await.map_err(|_| SinkClosed)?;
        self.first_byte_emitted = true;
        Ok(())
    }

    /// True once any frame has been handed to the client connection.
    pub fn first_byte_emitted(&self) -> bool {
        self.first_byte_emitted
    }

    /// Resolves when the client side is gone; used by adapters to stop
    /// reading promptly on disconnect.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Decode a `data: <json>\n\n` frame back into JSON (test support).
#[cfg(test)]
pub(crate) fn parse_frame(frame: &[u8]) -> serde_json::Value {
    let text = std::str::from_utf8(frame).expect("frame is UTF-8");
    let payload = text
        .strip_prefix("data: ")
        .and_then(|t| t.strip_suffix("\n\n"))
        .expect("well-formed SSE frame");
    serde_json::from_str(payload).expect("frame payload is JSON")
}
