//! Backend module: the gateway's broker side.
//!
//! Subscribes to the per-instance topic and fans deliveries out through the
//! frontend; publishes forwards, logins, and logouts to whichever topic the
//! router cache resolves for the carried type. A decode error drops one
//! payload and nothing else.

use std::net::IpAddr;
use std::sync::Arc;

use bytes::{BufMut, Bytes};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use gated_core::error::{GateError, Result};
use gated_core::protocol::arena::{BufferPool, ForwardPool, POOL_BODY_LIMIT};
use gated_core::protocol::frame;
use gated_core::protocol::message::{
    decode_control, ClusterMessage, Control, UserLogin, UserLogout,
};
use gated_core::protocol::types::{module_of, KickoutReason, MsgType};

use crate::auth::Claims;
use crate::cluster::{Broker, Discovery};
use crate::config::Config;
use crate::frontend::FrontendModule;
use crate::router::RouterCache;

pub struct BackendModule {
    gid: i64,
    topic: String,
    project: String,
    broker: Arc<dyn Broker>,
    discovery: Arc<dyn Discovery>,
    frontend: Arc<FrontendModule>,
    routers: RouterCache,
    buffers: BufferPool,
    forwards: ForwardPool,
}

impl BackendModule {
    pub fn new(
        cfg: &Config,
        broker: Arc<dyn Broker>,
        discovery: Arc<dyn Discovery>,
        frontend: Arc<FrontendModule>,
    ) -> Self {
        Self {
            gid: cfg.core.id,
            topic: format!("{}/{}", cfg.core.name, cfg.core.id),
            project: cfg.core.project.clone(),
            broker,
            discovery,
            frontend,
            routers: RouterCache::new(),
            buffers: BufferPool::new(),
            forwards: ForwardPool::new(),
        }
    }

    /// Warm the router cache from discovery.
    pub async fn init(&self) -> Result<()> {
        self.routers.init(self.discovery.as_ref(), &self.project).await
    }

    /// Subscribe the per-instance topic and spawn the consumer task.
    pub async fn run(self: &Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let mut sub = self.broker.subscribe(&self.topic).await?;
        tracing::info!(topic = %self.topic, "broker subscribed");
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    payload = sub.next() => match payload {
                        Some(payload) => this.consume(payload).await,
                        None => {
                            tracing::warn!(topic = %this.topic, "broker subscription ended");
                            break;
                        }
                    },
                }
            }
        });
        Ok(())
    }

    /// Handle one delivery. Never fails the subscription.
    async fn consume(&self, payload: Bytes) {
        let size = payload.len();
        let (typ, body) = match frame::split_message(payload) {
            Ok(parts) => parts,
            Err(e) => {
                tracing::error!(size, error = %e, "broker payload framing error");
                return;
            }
        };
        tracing::debug!(size, typ, "received a message from broker");

        let ctl = match decode_control(typ, body) {
            Ok(Some(ctl)) => ctl,
            Ok(None) => {
                tracing::warn!(typ, "unknown broker message, dropped");
                return;
            }
            Err(e) => {
                tracing::error!(typ, size, error = %e, "broker payload decode error");
                return;
            }
        };

        let res = match ctl {
            Control::Unicast(m) => self.frontend.unicast(m.uid, m.msg).await,
            Control::Multicast(m) => self.frontend.multicast(&m.uids, m.msg).await,
            Control::Broadcast(m) => self.frontend.broadcast(m.msg).await,
            Control::Kickout(m) => match KickoutReason::from_i32(m.reason) {
                Some(reason) => self.frontend.kickout(m.uid, reason).await,
                None => {
                    tracing::warn!(uid = m.uid, reason = m.reason, "unknown kickout reason");
                    Ok(())
                }
            },
            Control::Router(m) => {
                if m.addr.is_empty() {
                    self.routers.remove(&m.module);
                } else {
                    self.routers.add(&m.module, &m.addr);
                }
                Ok(())
            }
        };
        if let Err(e) = res {
            tracing::warn!(typ, error = %e, "handle broker message error");
        }
    }

    /// Forward a client message to the back-end owning its type.
    pub async fn forward(&self, uid: i64, typ: MsgType, content: Bytes) -> Result<()> {
        let mut f = if content.len() <= POOL_BODY_LIMIT {
            self.forwards.get()
        } else {
            Default::default()
        };
        f.gid = self.gid;
        f.uid = uid;
        f.typ = typ;
        f.content = content;
        let res = self.send(typ, &f).await;
        self.forwards.put(f);
        res
    }

    /// Announce a login to the user module. `race` requests takeover of a
    /// session held by another gateway.
    pub async fn login(&self, claims: &Claims, race: bool) -> Result<()> {
        let userdata = serde_json::to_vec(&claims.values)
            .map_err(|e| GateError::Internal(format!("encode userdata: {e}")))?;
        let m = UserLogin {
            gid: self.gid,
            uid: claims.uid,
            ip: ip_bytes(claims.ip.as_deref()),
            userdata: Bytes::from(userdata),
            race,
        };
        self.send(UserLogin::TYPE, &m).await
    }

    pub async fn logout(&self, uid: i64) -> Result<()> {
        self.send(UserLogout::TYPE, &UserLogout { uid }).await
    }

    /// Resolve the topic for `route_typ` and publish `m` there.
    ///
    /// `route_typ` is not always `M::TYPE`: a `Forward` routes by the
    /// application type it carries.
    async fn send<M: ClusterMessage>(&self, route_typ: MsgType, m: &M) -> Result<()> {
        let Some(module) = module_of(route_typ) else {
            tracing::warn!(typ = route_typ, "module not found");
            return Err(GateError::UnrecognizedType(route_typ));
        };
        let topic = match self.routers.lookup(module) {
            Ok(topic) => topic,
            Err(e) => {
                tracing::warn!(typ = route_typ, module, "router not found");
                return Err(e);
            }
        };
        let mut buf = self.buffers.get();
        buf.put_u32(M::TYPE);
        m.encode_body(&mut buf);
        let payload = Bytes::copy_from_slice(&buf);
        self.buffers.put(buf);
        self.broker.publish(&topic, payload).await
    }

    pub fn routers(&self) -> &RouterCache {
        &self.routers
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

fn ip_bytes(ip: Option<&str>) -> Bytes {
    match ip.and_then(|s| s.parse::<IpAddr>().ok()) {
        Some(IpAddr::V4(v4)) => Bytes::copy_from_slice(&v4.octets()),
        Some(IpAddr::V6(v6)) => Bytes::copy_from_slice(&v6.octets()),
        None => Bytes::new(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn ip_bytes_handles_both_families_and_garbage() {
        assert_eq!(ip_bytes(Some("203.0.113.7"))[..], [203, 0, 113, 7]);
        assert_eq!(ip_bytes(Some("::1")).len(), 16);
        assert!(ip_bytes(Some("not an ip")).is_empty());
        assert!(ip_bytes(None).is_empty());
    }
}
