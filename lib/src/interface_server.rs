//! `InterfaceServer`: the composite that owns up to three sub-listeners for
//! one configured interface, per spec §4.7. `start` only binds the
//! sub-listeners the interface's configuration actually calls for; `stop`
//! cancels every task and gives them 5 seconds to drain before returning
//! regardless.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::arp::ArpResolver;
use crate::config::{DEFAULT_BIND_PORT, InterfaceConfig};
use crate::forward_proxy::ForwardProxy;
use crate::http_front;
use crate::transparent_tls::TransparentTls;

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

pub struct InterfaceServer {
    name: String,
    config: InterfaceConfig,
    arp: Arc<dyn ArpResolver>,
    shutdown: CancellationToken,
    tasks: JoinSet<()>,
}

impl InterfaceServer {
    pub fn new(config: InterfaceConfig, arp: Arc<dyn ArpResolver>) -> Self {
        Self {
            name: config.name.clone(),
            config,
            arp,
            shutdown: CancellationToken::new(),
            tasks: JoinSet::new(),
        }
    }

    pub async fn start(&mut self) -> anyhow::Result<()> {
        if self.config.has_http_front() {
            let bind_addr = SocketAddr::new(self.config.ip, DEFAULT_BIND_PORT);
            let listener = TcpListener::bind(bind_addr).await?;
            let reverse_proxies = self.config.reverse_proxies.clone();
            let wpad = self.config.wpad.clone();
            let shutdown = self.shutdown.clone();
            let interface = self.name.clone();
            self.tasks.spawn(async move {
                if let Err(err) =
                    http_front::serve_on(listener, reverse_proxies, wpad, shutdown).await
                {
                    error!(interface, error = %err, "http front exited with error");
                }
            });
            info!(interface = %self.name, %bind_addr, "http front started");
        }

        if self.config.enable_proxy {
            let bind_addr = SocketAddr::new(self.config.ip, self.config.policy.port);
            let listener = TcpListener::bind(bind_addr).await?;
            let proxy = Arc::new(ForwardProxy::new(
                self.name.clone(),
                Arc::new(self.config.policy.clone()),
                self.arp.clone(),
            ));
            let shutdown = self.shutdown.clone();
            let serving = proxy.clone();
            self.tasks.spawn(async move {
                serving.serve(listener, shutdown).await;
            });
            info!(interface = %self.name, %bind_addr, "forward proxy started");

            if self.config.policy.https_transparent_port > 0 {
                let bind_addr =
                    SocketAddr::new(self.config.ip, self.config.policy.https_transparent_port);
                let listener = TcpListener::bind(bind_addr).await?;
                // Shares `proxy` rather than building a second ForwardProxy so
                // transparent-TLS CONNECTs run the same on_connect hooks and
                // policy chain as the explicit-proxy listener (spec §4.6 step 4).
                let tls = Arc::new(TransparentTls::new(self.name.clone(), proxy.clone()));
                let shutdown = self.shutdown.clone();
                self.tasks.spawn(async move {
                    tls.serve(listener, shutdown).await;
                });
                info!(interface = %self.name, %bind_addr, "transparent TLS listener started");
            }
        }

        Ok(())
    }

    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        let drain = async {
            while self.tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(SHUTDOWN_DEADLINE, drain).await.is_err() {
            warn!(interface = %self.name, "shutdown deadline exceeded, abandoning remaining tasks");
            self.tasks.abort_all();
        }
    }
}
