//! Per-connection session: framing state machine and bookkeeping.
//!
//! A session is exclusively owned by the registry; its reader task is the
//! only inbound path and the writer lock serializes every outbound frame.
//! Scalar state uses atomics, compound transitions (user refresh) use a CAS
//! on the timestamp.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use gated_core::error::{GateError, Result};
use gated_core::protocol::frame::ContentType;
use gated_core::protocol::message::{encode_client, ClientMessage};
use gated_core::protocol::resp;
use gated_core::protocol::types::MsgType;

use crate::auth::Claims;
use crate::clock;
use crate::frontend::limiter::MsgLimiter;
use crate::transport::{FrameSink, FrameStream, Outbound, RawFrame};

/// Session lifecycle. `Overflow` is terminal: the session is kept in the
/// registry until it closes but every login is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created = 0,
    Ready = 1,
    PendingLogin = 2,
    Logged = 3,
    Closing = 4,
    Closed = 5,
    Overflow = 6,
}

impl SessionState {
    fn from_i32(v: i32) -> SessionState {
        match v {
            1 => SessionState::Ready,
            2 => SessionState::PendingLogin,
            3 => SessionState::Logged,
            4 => SessionState::Closing,
            5 => SessionState::Closed,
            6 => SessionState::Overflow,
            _ => SessionState::Created,
        }
    }
}

/// Session event handler, implemented by the frontend module. The session
/// holds a non-owning reference to it.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    async fn on_ready(&self, session: &Arc<Session>);
    async fn on_close(&self, session: &Arc<Session>);
    async fn on_message(&self, session: &Arc<Session>, typ: MsgType, body: Bytes) -> Result<()>;
    async fn on_command(&self, session: &Arc<Session>, args: Vec<String>) -> Result<()>;
}

#[derive(Default)]
struct Stats {
    recv: AtomicU64,
    send: AtomicU64,
}

pub struct Session {
    pub sid: i64,
    pub created_at: i64,
    content_type: ContentType,

    ip: StdMutex<String>,
    ip_recorded: AtomicBool,
    state: AtomicI32,
    uid: AtomicI64,
    user: StdMutex<Option<Claims>>,
    last_keepalive_at: AtomicI64,
    last_user_refresh_at: AtomicI64,
    stats: Stats,
    limiter: MsgLimiter,

    closed: CancellationToken,
    writer: Mutex<Box<dyn FrameSink>>,
}

impl Session {
    pub fn new(
        sid: i64,
        ip: String,
        content_type: ContentType,
        limiter: MsgLimiter,
        sink: Box<dyn FrameSink>,
    ) -> Self {
        let now = clock::now_ms();
        Self {
            sid,
            created_at: now,
            content_type,
            ip: StdMutex::new(ip),
            ip_recorded: AtomicBool::new(false),
            state: AtomicI32::new(SessionState::Created as i32),
            uid: AtomicI64::new(0),
            user: StdMutex::new(None),
            last_keepalive_at: AtomicI64::new(now),
            last_user_refresh_at: AtomicI64::new(0),
            stats: Stats::default(),
            limiter,
            closed: CancellationToken::new(),
            writer: Mutex::new(sink),
        }
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_i32(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: SessionState) {
        self.state.store(state as i32, Ordering::Release);
    }

    pub fn uid(&self) -> i64 {
        self.uid.load(Ordering::Acquire)
    }

    pub fn user(&self) -> Option<Claims> {
        self.user.lock().ok().and_then(|u| u.clone())
    }

    pub fn set_user(&self, claims: Claims) {
        let uid = claims.uid;
        if let Ok(mut user) = self.user.lock() {
            *user = Some(claims);
        }
        self.uid.store(uid, Ordering::Release);
    }

    pub fn ip(&self) -> String {
        self.ip.lock().map(|ip| ip.clone()).unwrap_or_default()
    }

    pub fn set_ip(&self, ip: String) {
        if let Ok(mut slot) = self.ip.lock() {
            *slot = ip;
        }
    }

    /// Whether this session holds a slot in the per-IP counter.
    pub fn ip_recorded(&self) -> bool {
        self.ip_recorded.load(Ordering::Acquire)
    }

    pub fn mark_ip_recorded(&self) {
        self.ip_recorded.store(true, Ordering::Release);
    }

    pub fn keepalive(&self, now: i64) {
        self.last_keepalive_at.store(now, Ordering::Release);
    }

    pub fn last_keepalive_at(&self) -> i64 {
        self.last_keepalive_at.load(Ordering::Acquire)
    }

    /// Claim the user-refresh slot if the last refresh is older than
    /// `stale_after_ms`. At most one caller wins per window.
    pub fn try_refresh_user(&self, stale_after_ms: i64, now: i64) -> bool {
        let last = self.last_user_refresh_at.load(Ordering::Acquire);
        if now - last <= stale_after_ms {
            return false;
        }
        self.last_user_refresh_at
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn stats_recv(&self) -> u64 {
        self.stats.recv.load(Ordering::Relaxed)
    }

    pub fn stats_send(&self) -> u64 {
        self.stats.send.load(Ordering::Relaxed)
    }

    /// Write one outbound unit under the writer lock.
    pub async fn write(&self, out: Outbound) -> Result<()> {
        self.stats.send.fetch_add(out.len() as u64, Ordering::Relaxed);
        let mut writer = self.writer.lock().await;
        writer.send(out).await
    }

    /// Pre-encoded bytes from a back-end service, passed through untouched.
    pub async fn write_raw(&self, msg: Bytes) -> Result<()> {
        self.write(Outbound::Raw(msg)).await
    }

    /// Text-lane reply line.
    pub async fn write_line(&self, line: Bytes) -> Result<()> {
        self.write(Outbound::Line(line)).await
    }

    /// Encode and send one typed message for this session's content type.
    pub async fn send_msg<M: ClientMessage>(&self, m: &M) -> Result<()> {
        let body = encode_client(m, self.content_type)?;
        let out = match self.content_type {
            ContentType::Binary => Outbound::Frame { typ: M::TYPE, body },
            ContentType::Text => Outbound::Line(resp::typed_line(M::TYPE, &body)),
        };
        self.write(out).await
    }

    /// Close the session: move to `Closing`, shut the transport, and let the
    /// reader task run `on_close`. Idempotent.
    pub async fn close(&self) {
        match self.state() {
            SessionState::Closing | SessionState::Closed => return,
            _ => {}
        }
        self.set_state(SessionState::Closing);
        self.closed.cancel();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(sid = self.sid, error = %e, "transport shutdown");
        }
    }

    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    fn on_inbound(&self, size: usize) -> Result<()> {
        let now = clock::now_ms();
        self.stats.recv.fetch_add(size as u64, Ordering::Relaxed);
        self.keepalive(now);
        if !self.limiter.allow(now) {
            return Err(GateError::Protocol("message rate exceeded".into()));
        }
        Ok(())
    }
}

/// Drive one session: announce readiness, pump inbound frames through the
/// handler, and deliver exactly one `on_close` when the reader ends.
pub async fn pump<S: FrameStream>(
    session: Arc<Session>,
    handler: Arc<dyn SessionHandler>,
    mut stream: S,
) {
    handler.on_ready(&session).await;
    let closed = session.closed_token();

    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(RawFrame::Binary { typ, body })) => {
                if session.content_type() != ContentType::Binary {
                    tracing::warn!(sid = session.sid, "binary frame on text session");
                    session.close().await;
                    break;
                }
                tracing::trace!(sid = session.sid, typ, size = body.len(), "typed message");
                if let Err(e) = session.on_inbound(4 + body.len()) {
                    tracing::warn!(sid = session.sid, error = %e, "inbound rejected");
                    session.close().await;
                    break;
                }
                if let Err(e) = handler.on_message(&session, typ, body).await {
                    if !report(&session, typ, e).await {
                        break;
                    }
                }
            }
            Some(Ok(RawFrame::Line(line))) => {
                if session.content_type() != ContentType::Text {
                    tracing::warn!(sid = session.sid, "text line on binary session");
                    session.close().await;
                    break;
                }
                if let Err(e) = session.on_inbound(line.len()) {
                    tracing::warn!(sid = session.sid, error = %e, "inbound rejected");
                    session.close().await;
                    break;
                }
                if let Err(e) = handle_line(&session, &handler, line).await {
                    if !report_line(&session, e).await {
                        break;
                    }
                }
            }
            Some(Err(e)) => {
                tracing::warn!(sid = session.sid, error = %e, "session read error");
                session.close().await;
                break;
            }
            None => break,
        }
    }

    session.close().await;
    handler.on_close(&session).await;
    session.set_state(SessionState::Closed);
}

async fn handle_line(
    session: &Arc<Session>,
    handler: &Arc<dyn SessionHandler>,
    line: String,
) -> Result<()> {
    let Some(rest) = line.strip_prefix('.') else {
        let hint = resp::error_line(&["command should starts with '.', e.g. .echo hello"]);
        return session.write_line(hint).await;
    };
    let args = resp::lex(rest)?;
    if args.is_empty() {
        return Ok(());
    }
    handler.on_command(session, args).await
}

/// Surface a handler error to the client. Protocol errors are fatal; the
/// session closes and `false` is returned.
async fn report(session: &Arc<Session>, typ: MsgType, e: GateError) -> bool {
    tracing::warn!(sid = session.sid, typ, error = %e, "handle message error");
    let fatal = matches!(e, GateError::Protocol(_));
    let frame = gated_core::protocol::message::ErrorMsg {
        errno: e.code().errno(),
        description: e.to_string(),
    };
    if let Err(e) = session.send_msg(&frame).await {
        tracing::debug!(sid = session.sid, error = %e, "error reply failed");
    }
    if fatal {
        session.close().await;
    }
    !fatal
}

async fn report_line(session: &Arc<Session>, e: GateError) -> bool {
    tracing::warn!(sid = session.sid, error = %e, "handle command error");
    let fatal = matches!(e, GateError::Protocol(_));
    let text = e.to_string();
    let line = resp::error_line(&[e.code().as_str(), text.as_str()]);
    if let Err(e) = session.write_line(line).await {
        tracing::debug!(sid = session.sid, error = %e, "error reply failed");
    }
    if fatal {
        session.close().await;
    }
    !fatal
}
