use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::upstream::UpstreamDescriptor;

/// Which listener families to start for every account
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ListenMode {
    /// HTTP(S) proxy and SOCKS5 proxy per account
    Both,
    /// HTTP(S) proxy only
    Http,
    /// SOCKS5 proxy only
    Socks,
}

impl ListenMode {
    pub fn http(self) -> bool {
        matches!(self, ListenMode::Both | ListenMode::Http)
    }

    pub fn socks(self) -> bool {
        matches!(self, ListenMode::Both | ListenMode::Socks)
    }
}

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "Per-account HTTP(S)/SOCKS5 gateway",
    long_about = "routegate gives every configured account its own HTTP(S) proxy port and SOCKS5 proxy port.\n\nEach account's traffic leaves through its own upstream:\n- direct : plain outbound TCP\n- tor    : chained through a SOCKS5 upstream such as a Tor daemon\n\nThe SOCKS5 port is the HTTP port plus --socks-port-offset; busy ports are replaced by the next free one.\n"
)]
pub struct Cli {
    /// JSON configuration file with the account table
    #[arg(short, long, default_value = "config.json", value_name = "PATH")]
    pub config: PathBuf,

    /// IP address every listener binds to
    #[arg(long, default_value = "0.0.0.0")]
    pub listen_ip: IpAddr,

    /// Listener families to start
    #[arg(long, value_enum, default_value_t = ListenMode::Both)]
    pub mode: ListenMode,

    /// SOCKS5 listen port = HTTP port + offset
    #[arg(long, default_value_t = 1000)]
    pub socks_port_offset: u16,

    /// How many ports above the requested one are probed before giving up
    #[arg(long, default_value_t = 100)]
    pub probe_limit: u16,

    /// Ceiling in seconds for a forwarded plain-HTTP round trip (at least 1)
    #[arg(long, default_value_t = 30)]
    pub http_timeout: u64,

    /// Ceiling in seconds for reaching a destination, SOCKS5 chain handshake included (at least 1)
    #[arg(long, default_value_t = 30)]
    pub connect_timeout: u64,

    /// Value of the Proxy-agent header sent on established CONNECT tunnels
    #[arg(long, default_value = concat!("routegate/", env!("CARGO_PKG_VERSION")))]
    pub proxy_agent: String,

    /// Interval in seconds between connection monitor reports
    #[arg(long, default_value_t = 300)]
    pub monitor_interval: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid configuration JSON: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("configuration defines no accounts")]
    NoAccounts,

    #[error("account {id}: {source}")]
    Account {
        id: String,
        source: serde_json::Error,
    },

    #[error("account {id}: proxy_port must be between 1 and 65535")]
    InvalidPort { id: String },

    #[error("account {id}: tor upstream requires {field}")]
    MissingUpstreamField { id: String, field: &'static str },
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum UpstreamKind {
    Direct,
    #[serde(alias = "socks5")]
    Tor,
}

#[derive(Debug, Deserialize)]
struct UpstreamConfig {
    #[serde(rename = "type")]
    kind: UpstreamKind,
    name: Option<String>,
    socks_host: Option<String>,
    socks_port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct AccountConfig {
    proxy_port: u16,
    upstream: UpstreamConfig,
    cookies_file: Option<PathBuf>,
}

/// On-disk layout. Accounts stay a raw JSON map so their definition order survives.
#[derive(Debug, Deserialize)]
struct FileConfig {
    #[serde(default)]
    accounts: serde_json::Map<String, serde_json::Value>,
    tailscale_ip: Option<String>,
}

/// One account as read from the configuration file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSpec {
    pub id: String,
    pub proxy_port: u16,
    pub upstream: UpstreamDescriptor,
    /// Human label for the upstream, only used in logs
    pub route_name: String,
    /// Owned by the browser automation side; carried through untouched
    pub cookies_file: Option<PathBuf>,
}

impl AccountSpec {
    fn from_value(id: &str, value: serde_json::Value) -> Result<Self, ConfigError> {
        let raw: AccountConfig =
            serde_json::from_value(value).map_err(|source| ConfigError::Account {
                id: id.to_string(),
                source,
            })?;

        if raw.proxy_port == 0 {
            return Err(ConfigError::InvalidPort { id: id.to_string() });
        }

        let upstream = match raw.upstream.kind {
            UpstreamKind::Direct => UpstreamDescriptor::Direct,
            UpstreamKind::Tor => {
                let host = raw
                    .upstream
                    .socks_host
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| ConfigError::MissingUpstreamField {
                        id: id.to_string(),
                        field: "socks_host",
                    })?;
                let port = raw
                    .upstream
                    .socks_port
                    .filter(|p| *p != 0)
                    .ok_or_else(|| ConfigError::MissingUpstreamField {
                        id: id.to_string(),
                        field: "socks_port",
                    })?;
                UpstreamDescriptor::SocksChain { host, port }
            }
        };

        let route_name = raw
            .upstream
            .name
            .unwrap_or_else(|| upstream.default_label());

        Ok(Self {
            id: id.to_string(),
            proxy_port: raw.proxy_port,
            upstream,
            route_name,
            cookies_file: raw.cookies_file,
        })
    }
}

/// Account table plus the advertised host, parsed from the JSON document
#[derive(Debug, Clone)]
pub struct AccountTable {
    pub accounts: Vec<AccountSpec>,
    pub advertise_host: String,
}

impl AccountTable {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = serde_json::from_str(text).map_err(ConfigError::Parse)?;
        if file.accounts.is_empty() {
            return Err(ConfigError::NoAccounts);
        }

        let accounts = file
            .accounts
            .into_iter()
            .map(|(id, value)| AccountSpec::from_value(&id, value))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            accounts,
            advertise_host: file
                .tailscale_ip
                .unwrap_or_else(|| Ipv4Addr::LOCALHOST.to_string()),
        })
    }
}

/// Gateway configuration derived from CLI arguments and the account file
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub mode: ListenMode,
    pub listen_ip: IpAddr,
    pub accounts: Vec<AccountSpec>,
    pub advertise_host: String,
    pub socks_port_offset: u16,
    pub probe_limit: u16,
    pub http_timeout: Duration,
    pub connect_timeout: Duration,
    pub proxy_agent: String,
    pub monitor_interval: Duration,
}

impl ProxyConfig {
    /// Create ProxyConfig from CLI arguments, reading the account file they point at
    pub fn from_cli(args: Cli) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(&args.config).map_err(|source| ConfigError::Read {
            path: args.config.clone(),
            source,
        })?;
        let table = AccountTable::from_json(&text)?;

        Ok(Self {
            mode: args.mode,
            listen_ip: args.listen_ip,
            accounts: table.accounts,
            advertise_host: table.advertise_host,
            socks_port_offset: args.socks_port_offset,
            probe_limit: args.probe_limit,
            http_timeout: Duration::from_secs(args.http_timeout.max(1)),
            connect_timeout: Duration::from_secs(args.connect_timeout.max(1)),
            proxy_agent: args.proxy_agent,
            monitor_interval: Duration::from_secs(args.monitor_interval.max(1)),
        })
    }
}
