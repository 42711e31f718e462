use std::io;
use std::time::Duration;

use crate::upstream::UpstreamConnectError;

/// Why a single client connection ended abnormally. Never fatal to a listener.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("client I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Upstream(#[from] UpstreamConnectError),

    #[error("upstream HTTP exchange failed: {0}")]
    Http(#[from] hyper::Error),

    #[error("upstream HTTP round trip exceeded {0:?}")]
    Timeout(Duration),
}

impl ProxyError {
    pub fn protocol(reason: impl Into<String>) -> Self {
        ProxyError::Protocol(reason.into())
    }

    /// Client went away or sent garbage; not worth more than a debug line
    pub fn is_client_side(&self) -> bool {
        matches!(self, ProxyError::Io(_) | ProxyError::Protocol(_))
    }
}
