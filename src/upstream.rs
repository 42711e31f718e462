use std::borrow::Cow;
use std::fmt;
use std::io;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tokio_socks::TargetAddr;
use tracing::debug;

/// Egress path for one account
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamDescriptor {
    /// Open destination connections from this host
    Direct,
    /// Chain every destination through a SOCKS5 proxy (e.g. a Tor daemon)
    SocksChain { host: String, port: u16 },
}

impl UpstreamDescriptor {
    pub fn default_label(&self) -> String {
        match self {
            UpstreamDescriptor::Direct => "direct".to_string(),
            UpstreamDescriptor::SocksChain { host, port } => format!("socks5://{}:{}", host, port),
        }
    }
}

impl fmt::Display for UpstreamDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.default_label())
    }
}

/// Error type for reaching a destination through an upstream
#[derive(Debug, thiserror::Error)]
pub enum UpstreamConnectError {
    #[error("connection to {target} failed: {source}")]
    Direct { target: String, source: io::Error },

    #[error("SOCKS5 upstream {upstream} unreachable: {source}")]
    ChainUnreachable { upstream: String, source: io::Error },

    #[error("SOCKS5 upstream {upstream} could not reach {target}: {source}")]
    ChainRejected {
        upstream: String,
        target: String,
        source: tokio_socks::Error,
    },

    #[error("connection to {target} timed out after {timeout:?}")]
    Timeout { target: String, timeout: Duration },
}

/// Result type for upstream connections
pub type UpstreamResult<T> = Result<T, UpstreamConnectError>;

/// The single place that decides between direct egress and SOCKS5 chaining.
/// Handlers only ever see a connected `TcpStream` to the destination.
#[derive(Debug, Clone)]
pub struct UpstreamConnector {
    connect_timeout: Duration,
}

impl UpstreamConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Open a duplex stream to `host:port` through `upstream`
    pub async fn connect(
        &self,
        upstream: &UpstreamDescriptor,
        host: &str,
        port: u16,
    ) -> UpstreamResult<TcpStream> {
        let host = strip_brackets(host);
        let attempt = async {
            match upstream {
                UpstreamDescriptor::Direct => connect_direct(host, port).await,
                UpstreamDescriptor::SocksChain {
                    host: socks_host,
                    port: socks_port,
                } => connect_chain(socks_host, *socks_port, host, port).await,
            }
        };

        match tokio::time::timeout(self.connect_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamConnectError::Timeout {
                target: format!("{}:{}", host, port),
                timeout: self.connect_timeout,
            }),
        }
    }
}

async fn connect_direct(host: &str, port: u16) -> UpstreamResult<TcpStream> {
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|source| UpstreamConnectError::Direct {
            target: format!("{}:{}", host, port),
            source,
        })?;
    debug!("Connected to {}:{} directly", host, port);
    Ok(stream)
}

/// SOCKS5 client handshake against the chain upstream: no-auth negotiation,
/// then CONNECT with the domain-name address type regardless of what `host`
/// looks like, so name resolution happens on the far side of the chain.
async fn connect_chain(
    socks_host: &str,
    socks_port: u16,
    host: &str,
    port: u16,
) -> UpstreamResult<TcpStream> {
    let upstream = format!("{}:{}", socks_host, socks_port);
    let socket = TcpStream::connect((socks_host, socks_port))
        .await
        .map_err(|source| UpstreamConnectError::ChainUnreachable {
            upstream: upstream.clone(),
            source,
        })?;

    // On failure the socket is dropped here, closing the half-open chain hop.
    let stream = Socks5Stream::connect_with_socket(
        socket,
        TargetAddr::Domain(Cow::Borrowed(host), port),
    )
    .await
    .map_err(|source| UpstreamConnectError::ChainRejected {
        upstream,
        target: format!("{}:{}", host, port),
        source,
    })?;

    debug!(
        "Connected to {}:{} via SOCKS5 {}:{}",
        host, port, socks_host, socks_port
    );
    Ok(stream.into_inner())
}

/// `[::1]` -> `::1`; anything else is returned unchanged
pub fn strip_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}
