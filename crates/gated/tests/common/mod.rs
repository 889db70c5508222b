//! Loopback test harness: in-memory cluster seams plus a minimal TCP client.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use gated::auth::{Claims, StaticVerifier};
use gated::cluster::{Broker as _, Discovery as _, MemoryBroker, MemoryDiscovery, Subscription};
use gated::config::{self, Config};
use gated::server::Gate;
use gated_core::protocol::frame::{self, ContentType};
use gated_core::protocol::message::{decode_client, encode_client, ClientMessage, ClusterMessage};

// Generous: the pending-login scenario legitimately waits out a 5 s
// deadline before its kick arrives.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(8);

/// Shared in-memory cluster: discovery, broker, token resolver.
pub struct TestCluster {
    pub discovery: Arc<MemoryDiscovery>,
    pub broker: Arc<MemoryBroker>,
    pub verifier: Arc<StaticVerifier>,
}

impl TestCluster {
    pub fn new() -> Self {
        Self {
            discovery: Arc::new(MemoryDiscovery::new()),
            broker: Arc::new(MemoryBroker::new()),
            verifier: Arc::new(StaticVerifier::new()),
        }
    }

    /// Register the standard route table the gateways publish through.
    pub async fn seed_routes(&self) {
        for (module, topic) in [("user", "svc/user/1"), ("chat", "svc/chat/3")] {
            self.discovery
                .register(
                    &format!("proj/gated/routes/{module}"),
                    topic,
                    false,
                    Duration::ZERO,
                )
                .await
                .unwrap();
        }
    }

    pub fn token(&self, token: &str, uid: i64, ip: Option<&str>) {
        self.verifier.insert(
            token,
            Claims { uid, ip: ip.map(str::to_string), ..Default::default() },
        );
    }

    pub async fn subscribe(&self, topic: &str) -> Subscription {
        self.broker.subscribe(topic).await.unwrap()
    }

    pub async fn start_gate(&self, cfg: Config) -> Arc<Gate> {
        let gate = Gate::new(
            cfg,
            self.verifier.clone(),
            self.discovery.clone(),
            self.broker.clone(),
        );
        gate.start().await.unwrap();
        gate
    }
}

/// Base config for one gateway instance; callers tweak the knobs they test.
pub fn test_config(gid: i64) -> Config {
    let mut cfg = config::load_from_str(&format!(
        r#"
core:
  project: "proj"
  name: "gated"
  id: {gid}
net:
  protocol: tcp
  bind: "127.0.0.1"
  port: 1
keepalive: 60
user_ttl: 60
jwt:
  filename: "unused"
  issuer: "gateway"
"#
    ))
    .unwrap();
    // Ephemeral port for loopback tests.
    cfg.net.port = 0;
    cfg
}

/// Next payload from a broker subscription, decoded as a cluster message.
pub async fn recv_cluster<M: ClusterMessage>(sub: &mut Subscription) -> M {
    use futures_util::StreamExt;
    let payload = tokio::time::timeout(RECV_TIMEOUT, sub.next())
        .await
        .expect("broker recv timed out")
        .expect("subscription ended");
    let (typ, body) = frame::split_message(payload).unwrap();
    assert_eq!(typ, M::TYPE, "unexpected cluster message type");
    M::decode_body(body).unwrap()
}

/// Minimal binary-framing TCP client.
pub struct BinClient {
    stream: TcpStream,
    buf: BytesMut,
}

impl BinClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&[frame::BINARY_HANDSHAKE]).await.unwrap();
        Self { stream, buf: BytesMut::new() }
    }

    pub async fn send<M: ClientMessage>(&mut self, m: &M) {
        let body = encode_client(m, ContentType::Binary).unwrap();
        self.send_raw(M::TYPE, &body).await;
    }

    pub async fn send_raw(&mut self, typ: u32, body: &[u8]) {
        let mut out = BytesMut::new();
        frame::put_frame(&mut out, typ, body);
        self.stream.write_all(&out).await.unwrap();
    }

    /// Next frame, or `None` once the server closed the connection.
    pub async fn recv_frame(&mut self) -> Option<(u32, Bytes)> {
        loop {
            if let Some(frame) = frame::try_split_frame(&mut self.buf).unwrap() {
                return Some(frame);
            }
            let n = tokio::time::timeout(RECV_TIMEOUT, self.stream.read_buf(&mut self.buf))
                .await
                .expect("client recv timed out")
                .unwrap();
            if n == 0 {
                return None;
            }
        }
    }

    pub async fn recv<M: ClientMessage>(&mut self) -> M {
        let (typ, body) = self.recv_frame().await.expect("connection closed");
        assert_eq!(typ, M::TYPE, "unexpected frame type");
        decode_client(body, ContentType::Binary).unwrap()
    }

    /// Wait for the server to close the connection.
    pub async fn expect_close(&mut self) {
        loop {
            if self.recv_frame().await.is_none() {
                return;
            }
        }
    }

    /// Raw access for tests that write hostile bytes.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}

/// Minimal text-lane TCP client.
pub struct TextClient {
    stream: TcpStream,
    buf: BytesMut,
}

impl TextClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            buf: BytesMut::new(),
        }
    }

    pub async fn send_line(&mut self, line: &str) {
        self.stream.write_all(line.as_bytes()).await.unwrap();
        self.stream.write_all(b"\r\n").await.unwrap();
    }

    /// Next CRLF-terminated line, without the terminator.
    pub async fn recv_line(&mut self) -> String {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line = self.buf.split_to(pos + 1);
                let mut end = line.len() - 1;
                if end > 0 && line[end - 1] == b'\r' {
                    end -= 1;
                }
                return String::from_utf8(line[..end].to_vec()).unwrap();
            }
            let n = tokio::time::timeout(RECV_TIMEOUT, self.stream.read_buf(&mut self.buf))
                .await
                .expect("client recv timed out")
                .unwrap();
            assert!(n > 0, "connection closed");
        }
    }
}
