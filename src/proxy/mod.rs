//! TCP forward proxy embedding the [`PolicyGateway`].
//!
//! Plain HTTP requests are fully intercepted and scrubbed; `CONNECT` tunnels
//! are decided on their host and relayed opaquely. Each client connection
//! carries one exchange and is closed afterwards.

pub mod connect;
pub mod http;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::info;

pub use connect::ProxySettings;

use crate::gateway::PolicyGateway;
use crate::policy::config::ProxyConfig;

impl From<&ProxyConfig> for ProxySettings {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            upstream_timeout: Duration::from_secs(config.upstream_timeout_secs),
            max_buffer_bytes: config.max_buffer_bytes,
        }
    }
}

pub struct ProxyServer {
    listen_addr: String,
    gateway: Arc<PolicyGateway>,
    settings: ProxySettings,
}

impl ProxyServer {
    pub fn new(listen_addr: String, gateway: Arc<PolicyGateway>, settings: ProxySettings) -> Self {
        Self {
            listen_addr,
            gateway,
            settings,
        }
    }

    /// Start the proxy server and return the actual bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("vibedom proxy listening on {}", local_addr);

        let gateway = self.gateway.clone();
        let settings = self.settings;
        tokio::spawn(async move {
            connect::accept_loop(listener, gateway, settings).await;
        });

        Ok(local_addr)
    }
}
