//! TCP listener: one-byte content-type handshake, length-prefixed binary
//! frames or CRLF command lines.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use gated_core::error::{GateError, Result};
use gated_core::protocol::frame::{
    self, ContentType, BINARY_HANDSHAKE, MAX_FRAME_BYTES,
};

use crate::frontend::session::{self, SessionHandler};
use crate::frontend::FrontendModule;
use crate::transport::{FrameSink, FrameStream, Outbound, RawFrame};

/// Accept loop. Each connection runs in its own task until the listener is
/// cancelled.
pub async fn serve(
    listener: TcpListener,
    frontend: Arc<FrontendModule>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let frontend = frontend.clone();
                    tokio::spawn(async move {
                        handle_conn(stream, peer.ip().to_string(), frontend).await;
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
    tracing::debug!("tcp listener stopped");
}

/// Kernel-level keepalive so half-open peers die even without traffic.
fn configure_keepalive(stream: &TcpStream, period: Duration) {
    let sock_ref = socket2::SockRef::from(stream);
    let ka = socket2::TcpKeepalive::new()
        .with_time(period)
        .with_interval(period / 3);
    if let Err(e) = sock_ref.set_tcp_keepalive(&ka) {
        tracing::debug!(error = %e, "set_tcp_keepalive failed");
    }
}

async fn handle_conn(stream: TcpStream, ip: String, frontend: Arc<FrontendModule>) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "set_nodelay failed");
    }
    let tcp_keepalive = frontend.config().net.keepalive;
    if tcp_keepalive > 0 {
        configure_keepalive(&stream, Duration::from_secs(tcp_keepalive));
    }
    let read_timeout = Duration::from_secs(frontend.config().net.read_timeout);
    let (mut reader, writer) = stream.into_split();

    // The first byte commits the framing for the whole session.
    let mut first = [0u8; 1];
    let handshake = read_one(&mut reader, &mut first, read_timeout).await;
    let content_type = match handshake {
        Ok(true) if first[0] == BINARY_HANDSHAKE => ContentType::Binary,
        Ok(true) => ContentType::Text,
        Ok(false) => return,
        Err(e) => {
            tracing::debug!(ip = %ip, error = %e, "handshake read error");
            return;
        }
    };

    let mut buf = BytesMut::with_capacity(4096);
    if content_type == ContentType::Text {
        buf.extend_from_slice(&first);
    }

    let sink = TcpSink { writer };
    let session = frontend.new_session(ip, content_type, Box::new(sink));
    let stream = TcpFrameStream { reader, buf, content_type, read_timeout };
    let handler: Arc<dyn SessionHandler> = frontend;
    session::pump(session, handler, stream).await;
}

async fn read_one(
    reader: &mut OwnedReadHalf,
    byte: &mut [u8; 1],
    read_timeout: Duration,
) -> Result<bool> {
    let read = reader.read(byte.as_mut_slice());
    let n = if read_timeout.is_zero() {
        read.await?
    } else {
        tokio::time::timeout(read_timeout, read)
            .await
            .map_err(|_| GateError::Transient("handshake timed out".into()))??
    };
    Ok(n == 1)
}

struct TcpFrameStream {
    reader: OwnedReadHalf,
    buf: BytesMut,
    content_type: ContentType,
    read_timeout: Duration,
}

impl TcpFrameStream {
    fn extract(&mut self) -> Result<Option<RawFrame>> {
        match self.content_type {
            ContentType::Binary => Ok(frame::try_split_frame(&mut self.buf)?
                .map(|(typ, body)| RawFrame::Binary { typ, body })),
            ContentType::Text => {
                let Some(pos) = self.buf.iter().position(|&b| b == b'\n') else {
                    if self.buf.len() > MAX_FRAME_BYTES {
                        return Err(GateError::Protocol("command line too long".into()));
                    }
                    return Ok(None);
                };
                let line = self.buf.split_to(pos + 1);
                let mut end = line.len() - 1;
                if end > 0 && line[end - 1] == b'\r' {
                    end -= 1;
                }
                let text = std::str::from_utf8(&line[..end])
                    .map_err(|e| GateError::Protocol(format!("invalid utf8 line: {e}")))?
                    .to_string();
                Ok(Some(RawFrame::Line(text)))
            }
        }
    }
}

#[async_trait]
impl FrameStream for TcpFrameStream {
    async fn next(&mut self) -> Option<Result<RawFrame>> {
        loop {
            match self.extract() {
                Ok(Some(frame)) => return Some(Ok(frame)),
                Ok(None) => {}
                Err(e) => return Some(Err(e)),
            }
            let read = self.reader.read_buf(&mut self.buf);
            let n = if self.read_timeout.is_zero() {
                read.await
            } else {
                match tokio::time::timeout(self.read_timeout, read).await {
                    Ok(n) => n,
                    Err(_) => {
                        return Some(Err(GateError::Transient("read timed out".into())))
                    }
                }
            };
            match n {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

struct TcpSink {
    writer: OwnedWriteHalf,
}

#[async_trait]
impl FrameSink for TcpSink {
    async fn send(&mut self, out: Outbound) -> Result<()> {
        match out {
            Outbound::Frame { typ, body } => {
                let mut buf = BytesMut::with_capacity(8 + body.len());
                frame::put_frame(&mut buf, typ, &body);
                self.writer.write_all(&buf).await?;
            }
            Outbound::Line(b) | Outbound::Raw(b) => {
                self.writer.write_all(&b).await?;
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        let _ = self.writer.shutdown().await;
        Ok(())
    }
}

/// Encode a typed frame the way the TCP wire carries it (test helper used by
/// loopback clients as well).
pub fn wire_frame(typ: u32, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + body.len());
    frame::put_frame(&mut buf, typ, body);
    buf.freeze()
}
