//! gated: stateful client-facing gateway.
//!
//! One long-lived connection per client (TCP or WebSocket), token login with
//! cluster-wide single-session enforcement, forwarding to back-end shards
//! over the broker, and unicast/multicast/broadcast delivery back.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use gated::auth::HmacVerifier;
use gated::cluster::{Broker, MemoryBroker, MemoryDiscovery, NatsBroker};
use gated::config;
use gated::server::Gate;

#[derive(Debug, Parser)]
#[command(name = "gated", about = "stateful client-facing gateway")]
struct Args {
    /// Path to the YAML config file.
    #[arg(short, long, default_value = "gated.yaml", env = "GATED_CONFIG")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let args = Args::parse();

    let cfg = config::load_from_file(&args.config).expect("config load failed");
    let verifier =
        HmacVerifier::from_file(&cfg.jwt.filename, &cfg.jwt.key_id).expect("jwt key load failed");

    // Single-process coordinator; a clustered deployment plugs an
    // etcd-backed Discovery in here.
    let discovery = Arc::new(MemoryDiscovery::new());

    let broker: Arc<dyn Broker> = if cfg.broker.url.is_empty() {
        Arc::new(MemoryBroker::new())
    } else {
        Arc::new(
            NatsBroker::connect(&cfg.broker.url, cfg.broker.token.as_deref())
                .await
                .expect("broker connect failed"),
        )
    };

    let gate = Gate::new(cfg, Arc::new(verifier), discovery, broker);
    gate.start().await.expect("gateway start failed");

    tokio::signal::ctrl_c().await.expect("signal wait failed");
    gate.shutdown().await;
}
