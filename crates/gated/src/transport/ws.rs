//! WebSocket listener on `/`.
//!
//! A WS message boundary replaces the length prefix: Binary messages carry
//! `typ` + body, Text messages carry one command line. The first data
//! message commits the session's content type.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};

use gated_core::error::{GateError, Result};
use gated_core::protocol::frame::{self, ContentType};

use crate::frontend::session::{self, SessionHandler};
use crate::frontend::FrontendModule;
use crate::transport::{FrameSink, FrameStream, Outbound, RawFrame};

#[derive(Clone)]
pub struct WsState {
    frontend: Arc<FrontendModule>,
}

pub fn app(frontend: Arc<FrontendModule>) -> Router {
    Router::new()
        .route("/", get(ws_upgrade))
        .with_state(WsState { frontend })
}

async fn ws_upgrade(
    State(state): State<WsState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, addr, socket))
}

fn trim_line(s: &str) -> String {
    s.trim_end_matches(['\r', '\n']).to_string()
}

async fn handle_socket(state: WsState, addr: SocketAddr, mut socket: WebSocket) {
    // The first data message fixes the content type; control frames before
    // it are ignored.
    let (content_type, pending) = loop {
        match socket.recv().await {
            Some(Ok(Message::Binary(b))) => match frame::split_message(Bytes::from(b)) {
                Ok((typ, body)) => {
                    break (ContentType::Binary, RawFrame::Binary { typ, body })
                }
                Err(e) => {
                    tracing::warn!(ip = %addr.ip(), error = %e, "bad first frame");
                    let _ = socket.send(Message::Close(None)).await;
                    return;
                }
            },
            Some(Ok(Message::Text(t))) => break (ContentType::Text, RawFrame::Line(trim_line(&t))),
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::debug!(ip = %addr.ip(), error = %e, "socket error before handshake");
                return;
            }
        }
    };

    let (tx, rx) = socket.split();
    let sink = WsSink { tx };
    let session = state
        .frontend
        .new_session(addr.ip().to_string(), content_type, Box::new(sink));
    let stream = WsFrameStream { rx, pending: Some(pending) };
    let handler: Arc<dyn SessionHandler> = state.frontend;
    session::pump(session, handler, stream).await;
}

struct WsFrameStream {
    rx: SplitStream<WebSocket>,
    pending: Option<RawFrame>,
}

#[async_trait]
impl FrameStream for WsFrameStream {
    async fn next(&mut self) -> Option<Result<RawFrame>> {
        if let Some(first) = self.pending.take() {
            return Some(Ok(first));
        }
        loop {
            match self.rx.next().await {
                Some(Ok(Message::Binary(b))) => {
                    return Some(
                        frame::split_message(Bytes::from(b))
                            .map(|(typ, body)| RawFrame::Binary { typ, body }),
                    )
                }
                Some(Ok(Message::Text(t))) => return Some(Ok(RawFrame::Line(trim_line(&t)))),
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Some(Err(GateError::Transient(format!("socket read: {e}"))))
                }
            }
        }
    }
}

struct WsSink {
    tx: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, out: Outbound) -> Result<()> {
        let msg = match out {
            Outbound::Frame { typ, body } => {
                Message::Binary(frame::encode_message(typ, &body).to_vec())
            }
            Outbound::Line(b) => Message::Text(String::from_utf8_lossy(&b).into_owned()),
            Outbound::Raw(b) => Message::Binary(b.to_vec()),
        };
        self.tx
            .send(msg)
            .await
            .map_err(|e| GateError::Transient(format!("socket write: {e}")))
    }

    async fn shutdown(&mut self) -> Result<()> {
        let _ = self.tx.send(Message::Close(None)).await;
        let _ = self.tx.close().await;
        Ok(())
    }
}
