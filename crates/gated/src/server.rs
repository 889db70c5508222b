//! Service assembly: module wiring, listeners, and the tick task.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use gated_core::error::Result;

use crate::auth::TokenVerifier;
use crate::backend::BackendModule;
use crate::clock;
use crate::cluster::{Broker, Discovery};
use crate::config::{Config, Protocol};
use crate::frontend::FrontendModule;
use crate::transport::{tcp, ws};

/// Service tick period. Pending logins retry every tenth tick (~1 s).
const TICK: Duration = Duration::from_millis(100);
const PENDING_RETRY_TICKS: u64 = 10;

/// How long shutdown waits for sessions to drain.
const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

pub struct Gate {
    cfg: Arc<Config>,
    frontend: Arc<FrontendModule>,
    backend: Arc<BackendModule>,
    cancel: CancellationToken,
    local_addr: OnceLock<SocketAddr>,
}

impl Gate {
    pub fn new(
        cfg: Config,
        verifier: Arc<dyn TokenVerifier>,
        discovery: Arc<dyn Discovery>,
        broker: Arc<dyn Broker>,
    ) -> Arc<Self> {
        let cfg = Arc::new(cfg);
        let frontend = Arc::new(FrontendModule::new(cfg.clone(), verifier, discovery.clone()));
        let backend = Arc::new(BackendModule::new(&cfg, broker, discovery, frontend.clone()));
        frontend.set_backend(backend.clone());
        Arc::new(Self {
            cfg,
            frontend,
            backend,
            cancel: CancellationToken::new(),
            local_addr: OnceLock::new(),
        })
    }

    /// Bring the service up: router cache, broker consumer, listener, tick.
    pub async fn start(&self) -> Result<()> {
        self.backend.init().await?;
        self.backend.run(self.cancel.clone()).await?;

        let listener = TcpListener::bind(self.cfg.listen_addr()).await?;
        let addr = listener.local_addr()?;
        let _ = self.local_addr.set(addr);

        match self.cfg.net.protocol {
            Protocol::Tcp => {
                tokio::spawn(tcp::serve(
                    listener,
                    self.frontend.clone(),
                    self.cancel.clone(),
                ));
            }
            Protocol::Websocket => {
                let app = ws::app(self.frontend.clone())
                    .into_make_service_with_connect_info::<SocketAddr>();
                let cancel = self.cancel.clone();
                tokio::spawn(async move {
                    let shutdown = async move { cancel.cancelled().await };
                    if let Err(e) = axum::serve(listener, app)
                        .with_graceful_shutdown(shutdown)
                        .await
                    {
                        tracing::error!(error = %e, "websocket server failed");
                    }
                });
            }
        }

        self.spawn_tick();
        tracing::info!(protocol = ?self.cfg.net.protocol, addr = %addr, "listening");
        Ok(())
    }

    fn spawn_tick(&self) {
        let frontend = self.frontend.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut ticks: u64 = 0;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                if frontend.stopping() {
                    continue;
                }
                ticks += 1;
                let now = clock::now_ms();
                if ticks % PENDING_RETRY_TICKS == 0 {
                    frontend.retry_pending(now).await;
                }
                frontend.clean(now).await;
            }
        });
    }

    /// Stop accepting, kick every session, and wait for the registry to
    /// drain.
    pub async fn shutdown(&self) {
        tracing::info!("gateway stopping");
        self.cancel.cancel();
        self.frontend.shutdown().await;
        let deadline = Instant::now() + DRAIN_DEADLINE;
        while self.frontend.busy() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn busy(&self) -> bool {
        self.frontend.busy()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn frontend(&self) -> &Arc<FrontendModule> {
        &self.frontend
    }

    pub fn backend(&self) -> &Arc<BackendModule> {
        &self.backend
    }
}
