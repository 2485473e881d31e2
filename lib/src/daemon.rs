//! `Daemon`: owns one `InterfaceServer` per configured interface and drives
//! their combined lifecycle. `start` aborts on the first interface that
//! fails to bind; `stop` is best-effort across all of them so one wedged
//! interface can't keep the others from shutting down.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::arp::ArpResolver;
use crate::config::Configuration;
use crate::interface_server::InterfaceServer;

const ARP_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

pub struct Daemon {
    interfaces: Vec<InterfaceServer>,
    log_mac_address: bool,
    arp_refresh: CancellationToken,
}

impl Daemon {
    pub fn new(config: Configuration, arp: Arc<dyn ArpResolver>) -> Self {
        let log_mac_address = config.logging.log_mac_address;
        let interfaces = config
            .interfaces
            .into_iter()
            .map(|iface| InterfaceServer::new(iface, arp.clone()))
            .collect();
        Self {
            interfaces,
            log_mac_address,
            arp_refresh: CancellationToken::new(),
        }
    }

    pub async fn start(&mut self) -> anyhow::Result<()> {
        for server in &mut self.interfaces {
            server.start().await?;
        }
        if self.log_mac_address {
            let refresh_token = self.arp_refresh.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(ARP_REFRESH_INTERVAL);
                loop {
                    tokio::select! {
                        _ = refresh_token.cancelled() => return,
                        _ = ticker.tick() => debug!("ARP cache refresh tick"),
                    }
                }
            });
        }
        info!(interfaces = self.interfaces.len(), "daemon started");
        Ok(())
    }

    pub async fn stop(&mut self) {
        self.arp_refresh.cancel();
        for server in &mut self.interfaces {
            server.stop().await;
        }
        info!("daemon stopped");
    }
}

/// Starts every interface; on the first failure, stops whatever already
/// started and returns the error.
pub async fn start_or_unwind(daemon: &mut Daemon) -> anyhow::Result<()> {
    if let Err(err) = daemon.start().await {
        error!(error = %err, "daemon failed to start, shutting down what did");
        daemon.stop().await;
        return Err(err);
    }
    Ok(())
}
