use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::{bail, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use routegate::config::{Cli, ProxyConfig};
use routegate::context::GatewayContext;
use routegate::listener::ListenerManager;
use routegate::registry::{allocate, AllocationPlan, BindProbe};

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("routegate=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    let args = Cli::parse();
    let config = ProxyConfig::from_cli(args)?;

    info!(
        "Loaded {} accounts (mode {:?}, listening on {})",
        config.accounts.len(),
        config.mode,
        config.listen_ip
    );

    let plan = AllocationPlan {
        http: config.mode.http(),
        socks: config.mode.socks(),
        socks_port_offset: config.socks_port_offset,
        probe_limit: config.probe_limit,
    };
    let allocation = allocate(
        &config.accounts,
        &plan,
        &BindProbe {
            ip: config.listen_ip,
        },
    );
    for failure in &allocation.failures {
        error!("{}", failure);
    }
    if allocation.table.is_empty() {
        bail!("no listening port could be allocated for any account");
    }

    let ctx = Arc::new(GatewayContext::from_config(&config));
    let mut manager = ListenerManager::new(ctx);

    let started = manager.start(&allocation.table, config.listen_ip).await;
    if started.is_empty() {
        bail!("none of the {} listeners could be started", allocation.table.len());
    }

    for (route, local) in &started {
        if route.relocated() {
            warn!(
                "{} [{}] {} on port {} (requested {}) via {}: {}",
                route.account,
                route.route_name,
                route.kind,
                route.port,
                route.requested_port,
                local,
                route.url(&config.advertise_host)
            );
        } else {
            info!(
                "{} [{}] {} on port {} via {}: {}",
                route.account,
                route.route_name,
                route.kind,
                route.port,
                local,
                route.url(&config.advertise_host)
            );
        }
    }
    info!(
        "{} of {} listeners running; upstream connect timeout {:?}, HTTP timeout {:?}",
        started.len(),
        allocation.table.len(),
        config.connect_timeout,
        config.http_timeout
    );

    manager.spawn_monitor(config.monitor_interval);

    shutdown_signal().await?;
    info!("Shutdown signal received");
    manager.shutdown().await;
    info!("Server shutdown complete");

    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
