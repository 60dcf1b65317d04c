use crate::config::ProbeConfig;
use anyhow::{bail, Result};
use provision_core::services::ReachabilityProber;
use provision_core::Target;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};

/// Waits until a target accepts a TCP connection on one of its addresses
pub struct TcpProber {
    port: u16,
    interval: Duration,
    connect_timeout: Duration,
    give_up_after: Duration,
}

impl TcpProber {
    pub fn new(config: &ProbeConfig) -> Self {
        Self {
            port: config.port,
            interval: config.interval(),
            connect_timeout: config.connect_timeout(),
            give_up_after: config.timeout(),
        }
    }

    async fn handshake(&self, addr: IpAddr) -> bool {
        let socket_addr = SocketAddr::new(addr, self.port);
        matches!(
            timeout(self.connect_timeout, TcpStream::connect(socket_addr)).await,
            Ok(Ok(_))
        )
    }
}

#[async_trait::async_trait]
impl ReachabilityProber for TcpProber {
    async fn wait_reachable(&self, target: &Target) -> Result<()> {
        let addresses = target.ip_addresses();
        if addresses.is_empty() {
            bail!("{} has no address to probe", target.id);
        }

        let deadline = Instant::now() + self.give_up_after;
        loop {
            for addr in &addresses {
                if self.handshake(*addr).await {
                    tracing::debug!(target = %target.id, address = %addr, "Handshake succeeded");
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                bail!(
                    "{} did not answer on port {} within {}s",
                    target.id,
                    self.port,
                    self.give_up_after.as_secs()
                );
            }
            sleep(self.interval).await;
        }
    }
}
