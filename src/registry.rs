//! Account routes and collision-free listening port allocation.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::net::{IpAddr, TcpListener};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::AccountSpec;
use crate::upstream::UpstreamDescriptor;

/// Protocol served on a listening port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    Http,
    Socks5,
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerKind::Http => f.write_str("HTTP"),
            ListenerKind::Socks5 => f.write_str("SOCKS5"),
        }
    }
}

/// Static binding of one account to one listening port and one upstream.
/// Built once at startup and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRoute {
    pub account: String,
    pub kind: ListenerKind,
    /// Port asked for by the configuration (HTTP port + offset for SOCKS5)
    pub requested_port: u16,
    /// Port actually bound
    pub port: u16,
    pub upstream: Arc<UpstreamDescriptor>,
    pub route_name: String,
    pub cookies_file: Option<PathBuf>,
}

impl AccountRoute {
    pub fn relocated(&self) -> bool {
        self.port != self.requested_port
    }

    pub fn url(&self, advertise_host: &str) -> String {
        match self.kind {
            ListenerKind::Http => format!("http://{}:{}", advertise_host, self.port),
            ListenerKind::Socks5 => format!("socks5://{}:{}", advertise_host, self.port),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortAllocationError {
    #[error("{kind} port for {account}: no free port in {requested}..={last}")]
    Exhausted {
        account: String,
        kind: ListenerKind,
        requested: u16,
        last: u16,
    },

    #[error("{kind} port for {account}: {base} + {offset} is beyond 65535")]
    OutOfRange {
        account: String,
        kind: ListenerKind,
        base: u16,
        offset: u16,
    },
}

/// Tells whether a port can currently be bound
pub trait PortProbe {
    fn is_free(&self, port: u16) -> bool;
}

/// Probes by binding and immediately releasing the port
#[derive(Debug, Clone, Copy)]
pub struct BindProbe {
    pub ip: IpAddr,
}

impl PortProbe for BindProbe {
    fn is_free(&self, port: u16) -> bool {
        // The listener is dropped at the end of the statement, releasing the port.
        TcpListener::bind((self.ip, port)).is_ok()
    }
}

/// Knobs for [`allocate`]
#[derive(Debug, Clone, Copy)]
pub struct AllocationPlan {
    pub http: bool,
    pub socks: bool,
    pub socks_port_offset: u16,
    pub probe_limit: u16,
}

/// Effective port -> route. Every effective port appears once.
#[derive(Debug, Clone, Default)]
pub struct PortAllocationTable {
    routes: BTreeMap<u16, AccountRoute>,
}

impl PortAllocationTable {
    pub fn get(&self, port: u16) -> Option<&AccountRoute> {
        self.routes.get(&port)
    }

    pub fn routes(&self) -> impl Iterator<Item = &AccountRoute> {
        self.routes.values()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Route of `kind` for `account`, if it got a port
    pub fn find(&self, account: &str, kind: ListenerKind) -> Option<&AccountRoute> {
        self.routes
            .values()
            .find(|r| r.account == account && r.kind == kind)
    }
}

/// Outcome of allocation: the table plus every account/kind that got no port
#[derive(Debug, Clone, Default)]
pub struct Allocation {
    pub table: PortAllocationTable,
    pub failures: Vec<PortAllocationError>,
}

/// Resolve a listening port for every account, HTTP routes first, then SOCKS5
/// routes, each family in definition order.
///
/// A requested port is taken when it is unclaimed and `probe` reports it
/// free. Otherwise `requested + 1 ..= requested + probe_limit` are tried in
/// order, skipping ports already claimed in this run.
pub fn allocate<P: PortProbe>(
    accounts: &[AccountSpec],
    plan: &AllocationPlan,
    probe: &P,
) -> Allocation {
    let mut claimed = HashSet::new();
    let mut allocation = Allocation::default();

    let mut families = Vec::with_capacity(2);
    if plan.http {
        families.push((ListenerKind::Http, 0u16));
    }
    if plan.socks {
        families.push((ListenerKind::Socks5, plan.socks_port_offset));
    }

    for (kind, offset) in families {
        for spec in accounts {
            let result = spec
                .proxy_port
                .checked_add(offset)
                .ok_or_else(|| PortAllocationError::OutOfRange {
                    account: spec.id.clone(),
                    kind,
                    base: spec.proxy_port,
                    offset,
                })
                .and_then(|requested| {
                    resolve_port(&spec.id, kind, requested, plan.probe_limit, &claimed, probe)
                        .map(|port| (requested, port))
                });

            match result {
                Ok((requested, port)) => {
                    if port == requested {
                        info!("{} port {} is available for {}", kind, port, spec.id);
                    } else {
                        warn!(
                            "{} port {} busy, using {} for {}",
                            kind, requested, port, spec.id
                        );
                    }
                    claimed.insert(port);
                    allocation.table.routes.insert(
                        port,
                        AccountRoute {
                            account: spec.id.clone(),
                            kind,
                            requested_port: requested,
                            port,
                            upstream: Arc::new(spec.upstream.clone()),
                            route_name: spec.route_name.clone(),
                            cookies_file: spec.cookies_file.clone(),
                        },
                    );
                }
                Err(e) => allocation.failures.push(e),
            }
        }
    }

    allocation
}

fn resolve_port<P: PortProbe>(
    account: &str,
    kind: ListenerKind,
    requested: u16,
    probe_limit: u16,
    claimed: &HashSet<u16>,
    probe: &P,
) -> Result<u16, PortAllocationError> {
    let last = requested.saturating_add(probe_limit);
    (requested..=last)
        .filter(|port| !claimed.contains(port))
        .find(|port| probe.is_free(*port))
        .ok_or_else(|| PortAllocationError::Exhausted {
            account: account.to_string(),
            kind,
            requested,
            last,
        })
}
