//! Typed messages: the closed control set plus opaque forwardables.
//!
//! Client-facing messages carry two codecs: a binary one (little-endian
//! integers, `u32 LE` length-prefixed strings) and serde JSON for the text
//! lane. Cluster payloads only ever cross the broker, so they are binary
//! only. Types outside the control set are never decoded here; the gateway
//! treats them as opaque bodies to forward.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{GateError, Result};
use crate::protocol::frame::ContentType;
use crate::protocol::types::{client, cluster, MsgType};

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn put_bytes(buf: &mut BytesMut, b: &[u8]) {
    buf.put_u32_le(b.len() as u32);
    buf.put_slice(b);
}

fn get_len(buf: &mut Bytes) -> Result<usize> {
    if buf.remaining() < 4 {
        return Err(GateError::Protocol("truncated length".into()));
    }
    let n = buf.get_u32_le() as usize;
    if n > buf.remaining() {
        return Err(GateError::Protocol("length exceeds body".into()));
    }
    Ok(n)
}

fn get_bytes(buf: &mut Bytes) -> Result<Bytes> {
    let n = get_len(buf)?;
    Ok(buf.split_to(n))
}

fn get_str(buf: &mut Bytes) -> Result<String> {
    let raw = get_bytes(buf)?;
    String::from_utf8(raw.to_vec()).map_err(|e| GateError::Protocol(format!("invalid utf8: {e}")))
}

fn get_i32(buf: &mut Bytes) -> Result<i32> {
    if buf.remaining() < 4 {
        return Err(GateError::Protocol("truncated i32".into()));
    }
    Ok(buf.get_i32_le())
}

fn get_u32(buf: &mut Bytes) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(GateError::Protocol("truncated u32".into()));
    }
    Ok(buf.get_u32_le())
}

fn get_i64(buf: &mut Bytes) -> Result<i64> {
    if buf.remaining() < 8 {
        return Err(GateError::Protocol("truncated i64".into()));
    }
    Ok(buf.get_i64_le())
}

/// A typed message the gateway exchanges with clients.
pub trait ClientMessage: Serialize + DeserializeOwned + Default {
    const TYPE: MsgType;
    const NAME: &'static str;

    fn encode_body(&self, buf: &mut BytesMut);
    fn decode_body(body: Bytes) -> Result<Self>;
}

/// Encode a client message body for the session's content type.
pub fn encode_client<M: ClientMessage>(m: &M, content_type: ContentType) -> Result<Bytes> {
    match content_type {
        ContentType::Binary => {
            let mut buf = BytesMut::new();
            m.encode_body(&mut buf);
            Ok(buf.freeze())
        }
        ContentType::Text => {
            let json = serde_json::to_vec(m)
                .map_err(|e| GateError::Internal(format!("json encode {}: {e}", M::NAME)))?;
            Ok(Bytes::from(json))
        }
    }
}

/// Decode a client message body. An empty body decodes to the default value.
pub fn decode_client<M: ClientMessage>(body: Bytes, content_type: ContentType) -> Result<M> {
    if body.is_empty() {
        return Ok(M::default());
    }
    match content_type {
        ContentType::Binary => M::decode_body(body),
        ContentType::Text => serde_json::from_slice(&body)
            .map_err(|e| GateError::Protocol(format!("json decode {}: {e}", M::NAME))),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorMsg {
    pub errno: i32,
    pub description: String,
}

impl ClientMessage for ErrorMsg {
    const TYPE: MsgType = client::ERROR;
    const NAME: &'static str = "Error";

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.errno);
        put_str(buf, &self.description);
    }

    fn decode_body(mut body: Bytes) -> Result<Self> {
        Ok(Self {
            errno: get_i32(&mut body)?,
            description: get_str(&mut body)?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ping {
    pub content: String,
}

impl ClientMessage for Ping {
    const TYPE: MsgType = client::PING;
    const NAME: &'static str = "Ping";

    fn encode_body(&self, buf: &mut BytesMut) {
        put_str(buf, &self.content);
    }

    fn decode_body(mut body: Bytes) -> Result<Self> {
        Ok(Self { content: get_str(&mut body)? })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pong {
    pub content: String,
}

impl ClientMessage for Pong {
    const TYPE: MsgType = client::PONG;
    const NAME: &'static str = "Pong";

    fn encode_body(&self, buf: &mut BytesMut) {
        put_str(buf, &self.content);
    }

    fn decode_body(mut body: Bytes) -> Result<Self> {
        Ok(Self { content: get_str(&mut body)? })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginReq {
    pub token: String,
}

impl ClientMessage for LoginReq {
    const TYPE: MsgType = client::LOGIN_REQ;
    const NAME: &'static str = "LoginReq";

    fn encode_body(&self, buf: &mut BytesMut) {
        put_str(buf, &self.token);
    }

    fn decode_body(mut body: Bytes) -> Result<Self> {
        Ok(Self { token: get_str(&mut body)? })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogoutReq {}

impl ClientMessage for LogoutReq {
    const TYPE: MsgType = client::LOGOUT_REQ;
    const NAME: &'static str = "LogoutReq";

    fn encode_body(&self, _buf: &mut BytesMut) {}

    fn decode_body(_body: Bytes) -> Result<Self> {
        Ok(Self {})
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogoutRes {
    pub reason: i32,
}

impl ClientMessage for LogoutRes {
    const TYPE: MsgType = client::LOGOUT_RES;
    const NAME: &'static str = "LogoutRes";

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.reason);
    }

    fn decode_body(mut body: Bytes) -> Result<Self> {
        Ok(Self { reason: get_i32(&mut body)? })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Kickout {
    pub reason: i32,
}

impl ClientMessage for Kickout {
    const TYPE: MsgType = client::KICKOUT;
    const NAME: &'static str = "Kickout";

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.reason);
    }

    fn decode_body(mut body: Bytes) -> Result<Self> {
        Ok(Self { reason: get_i32(&mut body)? })
    }
}

/// A payload crossing the broker between gateway and back-end shards.
pub trait ClusterMessage: Sized {
    const TYPE: MsgType;
    const NAME: &'static str;

    fn encode_body(&self, buf: &mut BytesMut);
    fn decode_body(body: Bytes) -> Result<Self>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Unicast {
    pub uid: i64,
    pub msg: Bytes,
}

impl ClusterMessage for Unicast {
    const TYPE: MsgType = cluster::UNICAST;
    const NAME: &'static str = "Unicast";

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_i64_le(self.uid);
        put_bytes(buf, &self.msg);
    }

    fn decode_body(mut body: Bytes) -> Result<Self> {
        Ok(Self {
            uid: get_i64(&mut body)?,
            msg: get_bytes(&mut body)?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Multicast {
    pub uids: Vec<i64>,
    pub msg: Bytes,
}

impl ClusterMessage for Multicast {
    const TYPE: MsgType = cluster::MULTICAST;
    const NAME: &'static str = "Multicast";

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.uids.len() as u32);
        for uid in &self.uids {
            buf.put_i64_le(*uid);
        }
        put_bytes(buf, &self.msg);
    }

    fn decode_body(mut body: Bytes) -> Result<Self> {
        let n = get_u32(&mut body)? as usize;
        if n > body.remaining() / 8 {
            return Err(GateError::Protocol("uid count exceeds body".into()));
        }
        let mut uids = Vec::with_capacity(n);
        for _ in 0..n {
            uids.push(get_i64(&mut body)?);
        }
        Ok(Self { uids, msg: get_bytes(&mut body)? })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Broadcast {
    pub msg: Bytes,
}

impl ClusterMessage for Broadcast {
    const TYPE: MsgType = cluster::BROADCAST;
    const NAME: &'static str = "Broadcast";

    fn encode_body(&self, buf: &mut BytesMut) {
        put_bytes(buf, &self.msg);
    }

    fn decode_body(mut body: Bytes) -> Result<Self> {
        Ok(Self { msg: get_bytes(&mut body)? })
    }
}

/// Broker-initiated kick of one user, distinct from the client-facing
/// `Kickout` frame it results in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KickoutUser {
    pub uid: i64,
    pub reason: i32,
}

impl ClusterMessage for KickoutUser {
    const TYPE: MsgType = cluster::KICKOUT;
    const NAME: &'static str = "KickoutUser";

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_i64_le(self.uid);
        buf.put_i32_le(self.reason);
    }

    fn decode_body(mut body: Bytes) -> Result<Self> {
        Ok(Self {
            uid: get_i64(&mut body)?,
            reason: get_i32(&mut body)?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Router {
    pub module: String,
    /// Topic receiving the module's messages; empty means "remove".
    pub addr: String,
}

impl ClusterMessage for Router {
    const TYPE: MsgType = cluster::ROUTER;
    const NAME: &'static str = "Router";

    fn encode_body(&self, buf: &mut BytesMut) {
        put_str(buf, &self.module);
        put_str(buf, &self.addr);
    }

    fn decode_body(mut body: Bytes) -> Result<Self> {
        Ok(Self {
            module: get_str(&mut body)?,
            addr: get_str(&mut body)?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserLogin {
    pub gid: i64,
    pub uid: i64,
    /// Source IP as raw bytes (empty when the claim carried none).
    pub ip: Bytes,
    /// Extra claims as JSON.
    pub userdata: Bytes,
    /// True when this login must take over a session held elsewhere.
    pub race: bool,
}

impl ClusterMessage for UserLogin {
    const TYPE: MsgType = cluster::USER_LOGIN;
    const NAME: &'static str = "UserLogin";

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_i64_le(self.gid);
        buf.put_i64_le(self.uid);
        put_bytes(buf, &self.ip);
        put_bytes(buf, &self.userdata);
        buf.put_u8(self.race as u8);
    }

    fn decode_body(mut body: Bytes) -> Result<Self> {
        let gid = get_i64(&mut body)?;
        let uid = get_i64(&mut body)?;
        let ip = get_bytes(&mut body)?;
        let userdata = get_bytes(&mut body)?;
        if body.remaining() < 1 {
            return Err(GateError::Protocol("truncated race flag".into()));
        }
        let race = body.get_u8() != 0;
        Ok(Self { gid, uid, ip, userdata, race })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserLogout {
    pub uid: i64,
}

impl ClusterMessage for UserLogout {
    const TYPE: MsgType = cluster::USER_LOGOUT;
    const NAME: &'static str = "UserLogout";

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_i64_le(self.uid);
    }

    fn decode_body(mut body: Bytes) -> Result<Self> {
        Ok(Self { uid: get_i64(&mut body)? })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Forward {
    pub gid: i64,
    pub uid: i64,
    /// Application type carried inside; decides the routed module.
    pub typ: MsgType,
    pub content: Bytes,
}

impl Forward {
    /// Reset for pool reuse.
    pub fn clear(&mut self) {
        self.gid = 0;
        self.uid = 0;
        self.typ = 0;
        self.content = Bytes::new();
    }
}

impl ClusterMessage for Forward {
    const TYPE: MsgType = cluster::FORWARD;
    const NAME: &'static str = "Forward";

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_i64_le(self.gid);
        buf.put_i64_le(self.uid);
        buf.put_u32_le(self.typ);
        put_bytes(buf, &self.content);
    }

    fn decode_body(mut body: Bytes) -> Result<Self> {
        Ok(Self {
            gid: get_i64(&mut body)?,
            uid: get_i64(&mut body)?,
            typ: get_u32(&mut body)?,
            content: get_bytes(&mut body)?,
        })
    }
}

/// The control subset the gateway consumes from its inbound topic.
#[derive(Debug, Clone)]
pub enum Control {
    Unicast(Unicast),
    Multicast(Multicast),
    Broadcast(Broadcast),
    Kickout(KickoutUser),
    Router(Router),
}

/// Decode a control payload by type. `Ok(None)` means the type is outside
/// the control set (callers log and drop).
pub fn decode_control(typ: MsgType, body: Bytes) -> Result<Option<Control>> {
    let ctl = match typ {
        cluster::UNICAST => Control::Unicast(Unicast::decode_body(body)?),
        cluster::MULTICAST => Control::Multicast(Multicast::decode_body(body)?),
        cluster::BROADCAST => Control::Broadcast(Broadcast::decode_body(body)?),
        cluster::KICKOUT => Control::Kickout(KickoutUser::decode_body(body)?),
        cluster::ROUTER => Control::Router(Router::decode_body(body)?),
        _ => return Ok(None),
    };
    Ok(Some(ctl))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn binary_round_trip<M>(m: &M) -> M
    where
        M: ClusterMessage + Clone,
    {
        let mut buf = BytesMut::new();
        m.encode_body(&mut buf);
        M::decode_body(buf.freeze()).unwrap()
    }

    #[test]
    fn ping_binary_and_json_round_trip() {
        let m = Ping { content: "x".into() };

        let bin = encode_client(&m, ContentType::Binary).unwrap();
        assert_eq!(decode_client::<Ping>(bin, ContentType::Binary).unwrap(), m);

        let json = encode_client(&m, ContentType::Text).unwrap();
        assert_eq!(decode_client::<Ping>(json, ContentType::Text).unwrap(), m);
    }

    #[test]
    fn empty_body_decodes_to_default() {
        let m: Ping = decode_client(Bytes::new(), ContentType::Binary).unwrap();
        assert_eq!(m, Ping::default());
        let m: LoginReq = decode_client(Bytes::new(), ContentType::Text).unwrap();
        assert_eq!(m, LoginReq::default());
    }

    #[test]
    fn error_msg_binary_round_trip() {
        let m = ErrorMsg { errno: 4, description: "capacity exceeded".into() };
        let bin = encode_client(&m, ContentType::Binary).unwrap();
        assert_eq!(decode_client::<ErrorMsg>(bin, ContentType::Binary).unwrap(), m);
    }

    #[test]
    fn truncated_body_is_protocol_error() {
        let mut buf = BytesMut::new();
        put_str(&mut buf, "hello");
        let mut short = buf.freeze();
        short.truncate(6);
        assert!(Ping::decode_body(short).is_err());
    }

    #[test]
    fn multicast_round_trip_and_hostile_count() {
        let m = Multicast { uids: vec![1, 2, 42], msg: Bytes::from_static(b"m") };
        assert_eq!(binary_round_trip(&m), m);

        // Claimed count far beyond the actual body must not allocate.
        let mut buf = BytesMut::new();
        buf.put_u32_le(u32::MAX);
        assert!(Multicast::decode_body(buf.freeze()).is_err());
    }

    #[test]
    fn user_login_round_trip() {
        let m = UserLogin {
            gid: 3,
            uid: 42,
            ip: Bytes::from_static(&[203, 0, 113, 7]),
            userdata: Bytes::from_static(b"{\"device\":\"ios\"}"),
            race: true,
        };
        assert_eq!(binary_round_trip(&m), m);
    }

    #[test]
    fn forward_round_trip() {
        let m = Forward { gid: 1, uid: 42, typ: 0x200, content: Bytes::from_static(b"body") };
        assert_eq!(binary_round_trip(&m), m);
    }

    #[test]
    fn decode_control_unknown_type_is_none() {
        assert!(decode_control(0x200, Bytes::new()).unwrap().is_none());
        assert!(decode_control(cluster::USER_LOGIN, Bytes::new()).unwrap().is_none());
    }

    #[test]
    fn decode_control_router() {
        let mut buf = BytesMut::new();
        Router { module: "chat".into(), addr: "svc/chat/3".into() }.encode_body(&mut buf);
        match decode_control(cluster::ROUTER, buf.freeze()).unwrap() {
            Some(Control::Router(r)) => {
                assert_eq!(r.module, "chat");
                assert_eq!(r.addr, "svc/chat/3");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
