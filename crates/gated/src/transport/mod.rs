//! Transport seams shared by the TCP and WebSocket listeners.
//!
//! A session owns one `FrameSink` behind its writer lock and is driven by
//! one `FrameStream` from its reader task. Both listeners reduce the wire to
//! the same two inbound shapes: a typed binary frame or a text line.

use async_trait::async_trait;
use bytes::Bytes;

use gated_core::error::Result;
use gated_core::protocol::types::MsgType;

pub mod tcp;
pub mod ws;

/// One outbound unit. `Raw` bytes are pre-encoded by a back-end service and
/// pass through untouched.
#[derive(Debug, Clone)]
pub enum Outbound {
    Frame { typ: MsgType, body: Bytes },
    Line(Bytes),
    Raw(Bytes),
}

impl Outbound {
    /// Bytes this unit puts on the wire (header excluded for frames; the
    /// counter tracks payload volume).
    pub fn len(&self) -> usize {
        match self {
            Outbound::Frame { body, .. } => 4 + body.len(),
            Outbound::Line(b) | Outbound::Raw(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Write half of a session's transport. Calls are serialized by the
/// session's writer lock.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, out: Outbound) -> Result<()>;
    /// Close the underlying transport. Idempotent.
    async fn shutdown(&mut self) -> Result<()>;
}

/// One inbound unit surfaced by a reader.
#[derive(Debug)]
pub enum RawFrame {
    Binary { typ: MsgType, body: Bytes },
    Line(String),
}

/// Read half of a session's transport.
#[async_trait]
pub trait FrameStream: Send {
    /// Next frame; `None` on clean end-of-stream, `Some(Err(_))` on a fatal
    /// framing or transport error.
    async fn next(&mut self) -> Option<Result<RawFrame>>;
}
