use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::ConnectionTracker;
use crate::context::GatewayContext;
use crate::error::ProxyError;
use crate::http_proxy::handle_http;
use crate::registry::{AccountRoute, ListenerKind, PortAllocationTable};
use crate::socks_server::handle_socks5;

/// How long `shutdown` waits for cancelled connections to drop their guards
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Owns every listener task plus the shared pieces they hand to connections
pub struct ListenerManager {
    ctx: Arc<GatewayContext>,
    tracker: Arc<ConnectionTracker>,
    shutdown: CancellationToken,
    tasks: JoinSet<()>,
}

impl ListenerManager {
    pub fn new(ctx: Arc<GatewayContext>) -> Self {
        Self {
            ctx,
            tracker: ConnectionTracker::new(),
            shutdown: CancellationToken::new(),
            tasks: JoinSet::new(),
        }
    }

    pub fn tracker(&self) -> Arc<ConnectionTracker> {
        Arc::clone(&self.tracker)
    }

    /// Bind and start one listener per route in `table`.
    ///
    /// A route whose port cannot be bound is logged and skipped, the others
    /// still start. Returns the routes that are now listening.
    pub async fn start(
        &mut self,
        table: &PortAllocationTable,
        listen_ip: IpAddr,
    ) -> Vec<(Arc<AccountRoute>, SocketAddr)> {
        let mut started = Vec::with_capacity(table.len());

        for route in table.routes() {
            let bind_addr = SocketAddr::new(listen_ip, route.port);
            let listener = match TcpListener::bind(bind_addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!(
                        "Failed to start {} listener for {} on {}: {}",
                        route.kind, route.account, bind_addr, e
                    );
                    continue;
                }
            };

            let local = listener.local_addr().unwrap_or(bind_addr);
            let route = Arc::new(route.clone());
            self.spawn_listener(listener, Arc::clone(&route));
            started.push((route, local));
        }

        started
    }

    /// Serve `route` on an already bound listener
    pub fn spawn_listener(&mut self, listener: TcpListener, route: Arc<AccountRoute>) {
        let ctx = Arc::clone(&self.ctx);
        let tracker = Arc::clone(&self.tracker);
        let token = self.shutdown.clone();
        self.tasks
            .spawn(accept_loop(listener, route, ctx, tracker, token));
    }

    /// Periodically log the active connection count while it changes
    pub fn spawn_monitor(&mut self, every: Duration) {
        let tracker = Arc::clone(&self.tracker);
        let token = self.shutdown.clone();

        self.tasks.spawn(async move {
            let mut interval = tokio::time::interval(every);
            let mut last_active = 0;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let active = tracker.active();
                if active != last_active {
                    info!(
                        "Active connections: {} ({} accepted since start)",
                        active,
                        tracker.total()
                    );
                }
                last_active = active;
            }
        });
    }

    /// Stop accepting, cancel in-flight connections and wait for the tasks
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        while self.tasks.join_next().await.is_some() {}

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while self.tracker.active() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let remaining = self.tracker.active();
        if remaining > 0 {
            warn!("Forced shutdown with {} connections still active", remaining);
        } else {
            info!("All connections closed");
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    route: Arc<AccountRoute>,
    ctx: Arc<GatewayContext>,
    tracker: Arc<ConnectionTracker>,
    token: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("[{}] Accept error: {} (continuing)", route.port, e);
                    // EMFILE and friends: give the process a moment to free descriptors.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
        };

        let guard = tracker.open();
        let route = Arc::clone(&route);
        let ctx = Arc::clone(&ctx);
        let token = token.clone();

        tokio::spawn(async move {
            let conn_id = guard.id();
            debug!(
                "#{} [{}] {} connection from {} ({})",
                conn_id, route.port, route.kind, peer, route.account
            );

            let result = tokio::select! {
                result = dispatch(stream, &route, &ctx, conn_id) => result,
                _ = token.cancelled() => {
                    debug!("#{} [{}] cancelled by shutdown", conn_id, route.port);
                    Ok(())
                }
            };

            match result {
                Ok(()) => {}
                Err(e) if e.is_client_side() => {
                    debug!("#{} [{}] {}", conn_id, route.port, e)
                }
                Err(e) => warn!("#{} [{}] {}", conn_id, route.port, e),
            }
            drop(guard);
        });
    }

    info!("[{}] {} listener for {} stopped", route.port, route.kind, route.account);
}

async fn dispatch(
    stream: TcpStream,
    route: &AccountRoute,
    ctx: &GatewayContext,
    conn_id: u64,
) -> Result<(), ProxyError> {
    let _ = stream.set_nodelay(true);
    match route.kind {
        ListenerKind::Http => handle_http(stream, route, ctx, conn_id).await,
        ListenerKind::Socks5 => handle_socks5(stream, route, ctx, conn_id).await,
    }
}
