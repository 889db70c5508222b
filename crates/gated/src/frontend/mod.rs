//! Frontend module: client sessions, login coordination, fan-out delivery.
//!
//! Owns the session registry and the pending-login table. Implements the
//! session handler seam, so sessions never hold an owning reference back
//! into the module.

pub mod command;
pub mod limiter;
pub mod registry;
pub mod session;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use gated_core::error::{GateError, Result};
use gated_core::protocol::frame::ContentType;
use gated_core::protocol::message::{
    decode_client, ClientMessage, Kickout, LoginReq, LogoutRes, Ping, Pong,
};
use gated_core::protocol::types::{client, KickoutReason, MsgType};

use crate::auth::TokenVerifier;
use crate::backend::BackendModule;
use crate::clock;
use crate::cluster::Discovery;
use crate::config::Config;
use crate::frontend::limiter::{BroadcastLimiter, MsgLimiter};
use crate::frontend::registry::SessionRegistry;
use crate::frontend::session::{Session, SessionHandler, SessionState};
use crate::transport::FrameSink;

/// Discovery table holding `<project>/gated/users/<uid> → "<gid>,<sid>"`.
pub const USERS_TABLE: &str = "gated/users";

/// How long a login may stay pending before the session is kicked.
const MAX_PENDING_MS: i64 = 5_000;

/// Budget for one discovery round-trip on the login path.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
struct PendingLogin {
    uid: i64,
    started_at: i64,
}

pub struct FrontendModule {
    cfg: Arc<Config>,
    verifier: Arc<dyn TokenVerifier>,
    discovery: Arc<dyn Discovery>,
    backend: OnceLock<Arc<BackendModule>>,
    sessions: SessionRegistry,
    pending: DashMap<i64, PendingLogin>,
    broadcast_limiter: BroadcastLimiter,
    stopping: AtomicBool,
}

impl FrontendModule {
    pub fn new(
        cfg: Arc<Config>,
        verifier: Arc<dyn TokenVerifier>,
        discovery: Arc<dyn Discovery>,
    ) -> Self {
        let sessions = SessionRegistry::new(cfg.max_conns, cfg.max_conns_per_ip);
        let broadcast_limiter = BroadcastLimiter::new(cfg.limiter.broadcast_interval);
        Self {
            cfg,
            verifier,
            discovery,
            backend: OnceLock::new(),
            sessions,
            pending: DashMap::new(),
            broadcast_limiter,
            stopping: AtomicBool::new(false),
        }
    }

    /// Wire the backend edge once during assembly.
    pub fn set_backend(&self, backend: Arc<BackendModule>) {
        let _ = self.backend.set(backend);
    }

    fn backend(&self) -> Result<&Arc<BackendModule>> {
        self.backend
            .get()
            .ok_or_else(|| GateError::Internal("backend not wired".into()))
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Build a session for a freshly accepted connection.
    pub fn new_session(
        &self,
        ip: String,
        content_type: ContentType,
        sink: Box<dyn FrameSink>,
    ) -> Arc<Session> {
        let sid = self.sessions.alloc_sid();
        tracing::debug!(sid, ip = %ip, "session connected");
        let limiter = MsgLimiter::new(self.cfg.limiter.msg_interval, self.cfg.limiter.msg_count);
        Arc::new(Session::new(sid, ip, content_type, limiter, sink))
    }

    /// True while any session remains registered.
    pub fn busy(&self) -> bool {
        self.sessions.size() > 0
    }

    fn user_key(&self, uid: i64) -> String {
        format!("{}/{}/{}", self.cfg.core.project, USERS_TABLE, uid)
    }

    /// Bind `uid` to this gateway/session in discovery. `Ok(false)` means
    /// another session holds the binding.
    async fn set_user_logged(&self, uid: i64, sid: i64, exclusive: bool) -> Result<bool> {
        let value = format!("{},{}", self.cfg.core.id, sid);
        let ttl = Duration::from_secs(self.cfg.user_ttl);
        let key = self.user_key(uid);
        let register = self.discovery.register(&key, &value, exclusive, ttl);
        match tokio::time::timeout(DISCOVERY_TIMEOUT, register).await {
            Ok(Ok(ok)) => Ok(ok),
            Ok(Err(e)) => {
                tracing::warn!(uid, error = %e, "register user error");
                Err(e)
            }
            Err(_) => Err(GateError::Transient("discovery register timed out".into())),
        }
    }

    async fn ping(&self, s: &Arc<Session>, body: Bytes) -> Result<()> {
        if self.cfg.forward_ping {
            return self.forward(s, client::PING, body).await;
        }
        let req: Ping = decode_client(body, s.content_type())?;
        let uid = s.uid();
        if uid > 0 {
            let half_ttl = (self.cfg.user_ttl * 1000 / 2) as i64;
            if s.try_refresh_user(half_ttl, clock::now_ms()) {
                self.set_user_logged(uid, s.sid, false).await?;
            }
        }
        tracing::debug!(sid = s.sid, content = %req.content, "received ping message");
        s.send_msg(&Pong { content: req.content }).await
    }

    async fn login(&self, s: &Arc<Session>, req: LoginReq) -> Result<()> {
        if s.state() == SessionState::Overflow {
            let kick = Kickout { reason: KickoutReason::Overflow as i32 };
            if let Err(e) = s.send_msg(&kick).await {
                tracing::debug!(sid = s.sid, error = %e, "overflow kick failed");
            }
            s.close().await;
            return Ok(());
        }

        let claims = match self.verifier.verify(&self.cfg.jwt.issuer, &req.token) {
            Ok(claims) => claims,
            Err(e) => {
                tracing::warn!(sid = s.sid, error = %e, "verify token error");
                return Err(GateError::Unauthorized);
            }
        };
        tracing::debug!(sid = s.sid, uid = claims.uid, ip = ?claims.ip, "user logging");

        if let Some(ip) = claims.ip.clone() {
            if !ip.is_empty() {
                s.set_ip(ip);
            }
        }
        if !s.ip_recorded() {
            if !self.sessions.record_ip(&s.ip()) {
                tracing::warn!(sid = s.sid, uid = claims.uid, ip = %s.ip(), "login denied, ip limited");
                return Err(GateError::CapacityExceeded("too many connections from ip".into()));
            }
            s.mark_ip_recorded();
        }

        s.set_user(claims.clone());

        if self.set_user_logged(claims.uid, s.sid, true).await? {
            self.after_login(s).await
        } else {
            self.pending.insert(
                s.sid,
                PendingLogin { uid: claims.uid, started_at: clock::now_ms() },
            );
            s.set_state(SessionState::PendingLogin);
            self.backend()?.login(&claims, true).await
        }
    }

    async fn after_login(&self, s: &Arc<Session>) -> Result<()> {
        let uid = s.uid();
        if !self.sessions.mapping(uid, s.sid) {
            tracing::warn!(uid, sid = s.sid, "duplicated login");
            return Err(GateError::DuplicateLogin);
        }
        s.set_state(SessionState::Logged);
        let claims = s.user().unwrap_or_default();
        self.backend()?.login(&claims, false).await
    }

    /// Retry one pending login. Returns true when the entry is finished.
    async fn retry_login(&self, sid: i64, ps: &PendingLogin, now: i64) -> bool {
        let Some(s) = self.sessions.get(sid) else {
            tracing::debug!(sid, uid = ps.uid, "session not found when retry login");
            return true;
        };
        if s.state() != SessionState::PendingLogin {
            tracing::debug!(sid, uid = ps.uid, state = ?s.state(), "session no longer pending");
            return true;
        }
        match self.set_user_logged(ps.uid, sid, true).await {
            Ok(true) => {
                if let Err(e) = self.after_login(&s).await {
                    tracing::warn!(sid, uid = ps.uid, error = %e, "finalize pending login error");
                }
                return true;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::debug!(sid, uid = ps.uid, error = %e, "retry register error");
            }
        }
        if now - ps.started_at > MAX_PENDING_MS {
            tracing::debug!(sid, uid = ps.uid, "pending login expired");
            let kick = Kickout { reason: KickoutReason::LoginAnotherDevice as i32 };
            if let Err(e) = s.send_msg(&kick).await {
                tracing::debug!(sid, error = %e, "pending kick failed");
            }
            s.close().await;
            return true;
        }
        false
    }

    /// One pass over the pending-login table, driven by the service tick.
    pub async fn retry_pending(&self, now: i64) {
        let snapshot: Vec<(i64, PendingLogin)> = self
            .pending
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        for (sid, ps) in snapshot {
            if self.retry_login(sid, &ps, now).await {
                self.pending.remove(&sid);
            }
        }
    }

    /// One inactivity-clean pass (one bucket per call).
    pub async fn clean(&self, now: i64) {
        let ttl = (self.cfg.keepalive * 1000 * 2) as i64;
        let unauth_ttl = (self.cfg.timeout_for_unauthorized_conn * 1000) as i64;
        for s in self.sessions.clean(ttl, unauth_ttl, now) {
            tracing::debug!(sid = s.sid, "clean dead session");
            s.close().await;
        }
    }

    async fn logout(&self, s: &Arc<Session>) -> Result<()> {
        let res = LogoutRes { reason: KickoutReason::UserLogout as i32 };
        if let Err(e) = s.send_msg(&res).await {
            tracing::debug!(sid = s.sid, error = %e, "logout reply failed");
        }
        s.close().await;
        Ok(())
    }

    async fn forward(&self, s: &Arc<Session>, typ: MsgType, body: Bytes) -> Result<()> {
        // uid may still be 0 here; the back-end authorizes.
        self.backend()?.forward(s.uid(), typ, body).await
    }

    /// Deliver raw bytes to the session logged in as `uid`. A miss is a
    /// debug-level no-op.
    pub async fn unicast(&self, uid: i64, msg: Bytes) -> Result<()> {
        let Some(s) = self.sessions.find(uid) else {
            tracing::debug!(uid, "unicast failed, session not found by uid");
            return Ok(());
        };
        tracing::trace!(uid, sid = s.sid, size = msg.len(), "send to user session");
        s.write_raw(msg).await
    }

    /// Per-recipient unicast; individual failures do not fail the call.
    pub async fn multicast(&self, uids: &[i64], msg: Bytes) -> Result<()> {
        for &uid in uids {
            if let Err(e) = self.unicast(uid, msg.clone()).await {
                tracing::warn!(uid, error = %e, "multicast recipient error");
            }
        }
        Ok(())
    }

    /// Write to every fresh session; expired sessions found during the scan
    /// are closed instead of buffered.
    pub async fn broadcast(&self, msg: Bytes) -> Result<()> {
        let now = clock::now_ms();
        if !self.broadcast_limiter.allow(now) {
            tracing::warn!("broadcast dropped, interval limited");
            return Ok(());
        }
        let ttl = (self.cfg.keepalive * 1000 * 2) as i64;
        let scan = self.sessions.scan(ttl, now);
        for s in scan.stale {
            tracing::debug!(sid = s.sid, "closing stale session during broadcast");
            s.close().await;
        }
        for s in scan.fresh {
            if let Err(e) = s.write_raw(msg.clone()).await {
                tracing::warn!(sid = s.sid, size = msg.len(), error = %e, "broadcast write error");
            }
        }
        Ok(())
    }

    /// Encode and deliver one typed message to `uid`.
    pub async fn send_to<M: ClientMessage>(&self, uid: i64, m: &M) -> Result<()> {
        let Some(s) = self.sessions.find(uid) else {
            tracing::debug!(uid, "send failed, session not found by uid");
            return Ok(());
        };
        tracing::trace!(uid, sid = s.sid, name = M::NAME, "send to user session");
        s.send_msg(m).await
    }

    /// Typed kick followed by close.
    pub async fn kickout(&self, uid: i64, reason: KickoutReason) -> Result<()> {
        let Some(s) = self.sessions.find(uid) else {
            tracing::debug!(uid, "kickout failed, session not found by uid");
            return Ok(());
        };
        tracing::debug!(uid, sid = s.sid, reason = reason.as_str(), "kickout user");
        let kick = Kickout { reason: reason as i32 };
        if let Err(e) = s.send_msg(&kick).await {
            tracing::debug!(sid = s.sid, error = %e, "kickout frame failed");
        }
        s.close().await;
        Ok(())
    }

    /// Kick every live session with `ServiceClosed` and stop handling ticks.
    pub async fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        for s in self.sessions.shutdown_targets() {
            let kick = Kickout { reason: KickoutReason::ServiceClosed as i32 };
            if let Err(e) = s.send_msg(&kick).await {
                tracing::debug!(sid = s.sid, error = %e, "shutdown kick failed");
            }
            s.close().await;
        }
    }

    pub fn stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }
}

#[async_trait]
impl SessionHandler for FrontendModule {
    async fn on_ready(&self, s: &Arc<Session>) {
        let cloned = s.clone();
        let (n, ok) = self.sessions.add(cloned);
        if !ok {
            tracing::warn!(sid = s.sid, sessions = n, "add session failed");
        } else {
            s.set_state(SessionState::Ready);
            tracing::debug!(sid = s.sid, sessions = n, "session ready");
        }
    }

    async fn on_close(&self, s: &Arc<Session>) {
        tracing::debug!(sid = s.sid, recv = s.stats_recv(), send = s.stats_send(), "session closed");
        self.pending.remove(&s.sid);
        self.sessions.remove(s.sid);
        let uid = s.uid();
        if uid > 0 {
            match self.backend() {
                Ok(backend) => {
                    if let Err(e) = backend.logout(uid).await {
                        tracing::warn!(uid, error = %e, "notify logout error");
                    }
                }
                Err(e) => tracing::warn!(uid, error = %e, "notify logout error"),
            }
        }
    }

    async fn on_message(&self, s: &Arc<Session>, typ: MsgType, body: Bytes) -> Result<()> {
        match typ {
            client::PING => self.ping(s, body).await,
            client::LOGIN_REQ => {
                let req: LoginReq = decode_client(body, s.content_type())?;
                self.login(s, req).await
            }
            client::LOGOUT_REQ => self.logout(s).await,
            _ => self.forward(s, typ, body).await,
        }
    }

    async fn on_command(&self, s: &Arc<Session>, args: Vec<String>) -> Result<()> {
        command::dispatch(self, s, args).await
    }
}
