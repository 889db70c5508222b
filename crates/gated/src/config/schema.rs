//! Config schema with strict parsing.
//!
//! `deny_unknown_fields` prevents silent misconfiguration.

use serde::Deserialize;

use gated_core::error::{GateError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub core: CoreSection,
    pub net: NetSection,
    /// Client inactivity base in seconds; sessions die after twice this.
    #[serde(default = "default_keepalive")]
    pub keepalive: u64,
    /// Forward Ping frames to the back-end instead of answering locally.
    #[serde(default)]
    pub forward_ping: bool,
    /// TTL of the per-user discovery entry, seconds.
    #[serde(default = "default_user_ttl")]
    pub user_ttl: u64,
    /// Total session cap; 0 means unlimited.
    #[serde(default)]
    pub max_conns: usize,
    /// Logged-in sessions allowed per source IP; 0 means unlimited.
    #[serde(default)]
    pub max_conns_per_ip: usize,
    /// Seconds an unauthenticated session may idle before it is cleaned.
    #[serde(default = "default_unauth_timeout")]
    pub timeout_for_unauthorized_conn: u64,
    pub jwt: JwtSection,
    #[serde(default)]
    pub limiter: LimiterSection,
    #[serde(default)]
    pub broker: BrokerSection,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.net.port == 0 {
            return Err(GateError::Protocol(format!("invalid port: {}", self.net.port)));
        }
        if self.keepalive == 0 {
            return Err(GateError::Protocol("keepalive must be positive".into()));
        }
        if self.user_ttl == 0 {
            return Err(GateError::Protocol("user_ttl must be positive".into()));
        }
        if self.core.project.is_empty() {
            return Err(GateError::Protocol("core.project must not be empty".into()));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.net.bind, self.net.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoreSection {
    /// Namespace prefix for discovery keys.
    pub project: String,
    /// Service name; the inbound broker topic is `<name>/<id>`.
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Gateway instance id (gid), unique within the cluster.
    pub id: i64,
}

fn default_service_name() -> String {
    "gated".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetSection {
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default = "default_bind")]
    pub bind: String,
    pub port: u16,
    /// TCP keepalive in seconds (0 disables).
    #[serde(default)]
    pub keepalive: u64,
    /// Per-read timeout in seconds (0 disables).
    #[serde(default)]
    pub read_timeout: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Websocket,
}

fn default_bind() -> String {
    "0.0.0.0".into()
}

fn default_keepalive() -> u64 {
    60
}

fn default_user_ttl() -> u64 {
    60
}

fn default_unauth_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JwtSection {
    /// File holding the HS256 key bytes.
    pub filename: String,
    pub issuer: String,
    #[serde(default)]
    pub key_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimiterSection {
    /// Inbound window length in milliseconds; 0 disables the limiter.
    #[serde(default)]
    pub msg_interval: u64,
    /// Frames allowed per window.
    #[serde(default)]
    pub msg_count: u32,
    /// Minimum spacing between registry-wide broadcasts, milliseconds.
    #[serde(default)]
    pub broadcast_interval: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerSection {
    /// NATS server URL; empty selects the in-process broker.
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
}
