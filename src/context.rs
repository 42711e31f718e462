use std::time::Duration;

use crate::config::ProxyConfig;
use crate::upstream::UpstreamConnector;

/// Immutable settings shared by every listener and handler, built once at startup
#[derive(Debug, Clone)]
pub struct GatewayContext {
    /// Sent as `Proxy-agent` on established CONNECT tunnels
    pub proxy_agent: String,
    /// Ceiling for one forwarded plain-HTTP round trip
    pub http_timeout: Duration,
    pub connector: UpstreamConnector,
}

impl GatewayContext {
    pub fn new(proxy_agent: impl Into<String>, http_timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            proxy_agent: proxy_agent.into(),
            http_timeout,
            connector: UpstreamConnector::new(connect_timeout),
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(
            config.proxy_agent.clone(),
            config.http_timeout,
            config.connect_timeout,
        )
    }
}
