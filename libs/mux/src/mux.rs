//! The multiplexing listener.
//!
//! One bound listener, one accept loop, one task per connection:
//!
//! - connections are sniffed and matched against the servers registered
//!   with [`Listener::serve_async`], in registration order
//! - a matched connection is queued, replay armed, for that server's
//!   [`MuxListener`]
//! - every failure goes through the error-handling policy
//!
//! `serve` owns shutdown: it signals every per-connection task, waits for
//! all of them, then closes the server queues.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn, Instrument};

use crate::error::{ErrorHandler, MuxError};
use crate::facade::{ConnQueue, MuxListener, Queued};
use crate::listen::{signaled, BoundListener, Listen};
use crate::matcher::{MatchResult, Matcher};
use crate::sniff::SniffedConn;

/// Default number of connections a server queue holds before dispatch waits.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default maximum bytes peeked while matching a connection.
pub const DEFAULT_MAX_SNIFF_BYTES: usize = 8192;

/// Configuration for a multiplexing listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to, `host:port`. An empty host binds all interfaces.
    pub bind_addr: String,
    /// Capacity of each server's connection queue.
    pub queue_capacity: usize,
    /// Timeout for each read made while matching. `None` waits forever.
    pub read_timeout: Option<Duration>,
    /// Maximum bytes peeked before a connection counts as unmatched.
    pub max_sniff_bytes: usize,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            read_timeout: None,
            max_sniff_bytes: DEFAULT_MAX_SNIFF_BYTES,
        }
    }
}

/// Statistics for a multiplexing listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections whose task has not finished yet.
    pub connections_active: AtomicU64,
    /// Connections queued for a downstream server.
    pub connections_dispatched: AtomicU64,
    /// Connections no server claimed.
    pub connections_unmatched: AtomicU64,
    /// Queued connections dropped at shutdown or when their server exits.
    pub connections_dropped: AtomicU64,
    /// Errors returned by the bound listener's accept.
    pub accept_errors: AtomicU64,
}

/// Decrements the active count however the connection task exits.
struct ActiveGuard(Arc<ListenerStats>);

impl ActiveGuard {
    fn new(stats: &Arc<ListenerStats>) -> Self {
        stats.connections_active.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(stats))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.connections_active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A downstream server registered with `serve_async`.
struct Route<C> {
    id: usize,
    matcher: Arc<dyn Matcher>,
    tx: mpsc::Sender<Queued<C>>,
    queue: Arc<ConnQueue<C>>,
}

impl<C> std::fmt::Debug for Route<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route").field("id", &self.id).finish_non_exhaustive()
    }
}

impl<C> Clone for Route<C> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            matcher: Arc::clone(&self.matcher),
            tx: self.tx.clone(),
            queue: Arc::clone(&self.queue),
        }
    }
}

/// A listener that multiplexes one bound address across several servers.
pub struct Listener<L: Listen = BoundListener> {
    /// The bound listener. Only the accept loop accepts on it.
    root: Arc<L>,
    /// Listener configuration.
    config: ListenerConfig,
    /// Error-handling policy, replaceable while serving.
    error_handler: ArcSwap<ErrorHandler>,
    /// Timeout applied to matching reads.
    read_timeout: ArcSwapOption<Duration>,
    /// Registered servers, in registration order.
    routes: ArcSwap<Vec<Route<L::Conn>>>,
    /// Set once when `serve` winds down.
    shutdown: watch::Sender<bool>,
    /// Set when `serve` is first called.
    served: AtomicBool,
    /// Statistics.
    stats: Arc<ListenerStats>,
}

impl Listener<BoundListener> {
    /// Bind the configured address.
    ///
    /// Listening on a hostname is not recommended: it binds only one of
    /// the addresses the name resolves to.
    pub async fn bind(config: ListenerConfig) -> Result<Self, MuxError> {
        let root = BoundListener::bind(&config.bind_addr).await?;
        let listener = Self::from_listener(root, config);

        info!(
            bind_addr = %listener.root.local_addr()?,
            queue_capacity = listener.config.queue_capacity,
            "Listener bound"
        );

        Ok(listener)
    }
}

impl<L: Listen> Listener<L> {
    /// Multiplex an existing listener.
    pub fn from_listener(root: L, config: ListenerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            root: Arc::new(root),
            read_timeout: ArcSwapOption::from_pointee(config.read_timeout),
            error_handler: ArcSwap::from_pointee(ErrorHandler::default()),
            routes: ArcSwap::from_pointee(Vec::new()),
            shutdown,
            served: AtomicBool::new(false),
            stats: Arc::new(ListenerStats::default()),
            config,
        }
    }

    /// Get the local address the bound listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, MuxError> {
        self.root.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Accept directly from the bound listener, bypassing the multiplexer.
    pub async fn accept(&self) -> Result<(L::Conn, SocketAddr), MuxError> {
        self.root.accept().await
    }

    /// Replace the error-handling policy. Takes effect for the next error,
    /// including while `serve` is running.
    pub fn handle_error<F>(&self, handler: F)
    where
        F: Fn(&MuxError) -> bool + Send + Sync + 'static,
    {
        self.error_handler.store(Arc::new(ErrorHandler::new(handler)));
    }

    /// Set the timeout for each read made while matching a connection.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        self.read_timeout.store(timeout.map(Arc::new));
    }

    /// Current timeout for matching reads.
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout.load().as_deref().copied()
    }

    /// Close the bound listener. A running `serve` returns with a transport
    /// error and performs its own shutdown; this call does not wait for it.
    pub fn close(&self) -> Result<(), MuxError> {
        self.root.close()
    }

    /// Register a downstream server and run it on its own task.
    ///
    /// `serve` is driven by a [`MuxListener`] whose `accept` yields the
    /// connections `matcher` claims, with any bytes peeked during matching
    /// replayed on first read.
    pub fn serve_async<M, F, Fut>(&self, matcher: M, serve: F) -> JoinHandle<Result<(), MuxError>>
    where
        M: Matcher,
        F: FnOnce(MuxListener<L>) -> Fut,
        Fut: Future<Output = Result<(), MuxError>> + Send + 'static,
    {
        let (tx, queue) = ConnQueue::new(self.config.queue_capacity);
        let queue = Arc::new(queue);
        let matcher: Arc<dyn Matcher> = Arc::new(matcher);

        let mut id = 0;
        self.routes.rcu(|routes| {
            id = routes.len();
            let mut next = Vec::clone(routes);
            next.push(Route {
                id,
                matcher: Arc::clone(&matcher),
                tx: tx.clone(),
                queue: Arc::clone(&queue),
            });
            next
        });
        debug!(server = id, "Server registered");

        let facade = MuxListener::new(Arc::clone(&self.root), Arc::clone(&queue));
        let server = serve(facade);
        let stats = Arc::clone(&self.stats);
        let server_queue = Arc::clone(&queue);

        let handle = tokio::spawn(
            async move {
                let result = server.await;
                match &result {
                    Ok(()) => debug!("Server finished"),
                    Err(e) if e.is_listener_closed() => debug!("Server listener closed"),
                    Err(e) => warn!(error = %e, "Server failed"),
                }

                // Nobody accepts from this queue any more.
                let dropped = server_queue.close().await;
                if dropped > 0 {
                    stats
                        .connections_dropped
                        .fetch_add(dropped as u64, Ordering::Relaxed);
                    warn!(dropped = dropped, "Dropped connections queued for exited server");
                }
                result
            }
            .instrument(tracing::info_span!("server", id = id)),
        );

        // Registered after shutdown: nothing will ever be queued.
        if *self.shutdown.borrow() {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue.close().await;
            });
        }

        handle
    }

    /// Run the accept loop until the bound listener fails or is closed.
    ///
    /// Accept errors are retried only when the policy allows it and the
    /// error is temporary. On the way out every per-connection task is
    /// signalled and awaited, and server queues are closed; connections
    /// still queued are dropped. Returns the error that ended the loop.
    ///
    /// A listener serves once: later calls return
    /// [`MuxError::ListenerClosed`] without accepting.
    pub async fn serve(self: &Arc<Self>) -> Result<(), MuxError> {
        if self.served.swap(true, Ordering::AcqRel) {
            return Err(MuxError::ListenerClosed);
        }
        let local_addr = self.root.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        let mut tasks = JoinSet::new();

        let err = loop {
            match self.root.accept().await {
                Ok((conn, peer_addr)) => {
                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);

                    let active = ActiveGuard::new(&self.stats);
                    let listener = Arc::clone(self);
                    let shutdown = self.shutdown.subscribe();

                    tasks.spawn(
                        async move {
                            listener.handle_connection(conn, peer_addr, shutdown).await;
                            drop(active);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );

                    while let Some(finished) = tasks.try_join_next() {
                        log_task_exit(finished);
                    }
                }
                Err(e) => {
                    self.stats.accept_errors.fetch_add(1, Ordering::Relaxed);
                    if self.should_continue(&e) {
                        warn!(error = %e, "Temporary accept error");
                        continue;
                    }
                    error!(error = %e, "Accept error");
                    break e;
                }
            }
        };

        self.shutdown.send_replace(true);
        while let Some(finished) = tasks.join_next().await {
            log_task_exit(finished);
        }
        self.close_queues().await;

        info!(bind_addr = %local_addr, "Listener stopped");
        Err(err)
    }

    /// Policy check for accept-loop errors: both the policy and the
    /// transport must agree the error is survivable.
    fn should_continue(&self, err: &MuxError) -> bool {
        if !self.error_handler.load().handle(err) {
            return false;
        }
        err.is_temporary()
    }

    async fn handle_connection(
        &self,
        conn: L::Conn,
        peer_addr: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let result = tokio::select! {
            result = self.dispatch(conn, peer_addr) => result,
            _ = signaled(&mut shutdown) => {
                debug!("Connection abandoned on shutdown");
                return;
            }
        };

        let Err(e) = result else {
            return;
        };

        if matches!(e, MuxError::NotMatched { .. }) {
            self.stats
                .connections_unmatched
                .fetch_add(1, Ordering::Relaxed);
        }

        if self.error_handler.load().handle(&e) {
            debug!(error = %e, "Connection error");
            return;
        }

        warn!(error = %e, "Error policy stopped the listener");
        if let Err(close_err) = self.root.close() {
            debug!(error = %close_err, "Bound listener already closed");
        }
    }

    /// Match a connection against the registered servers and queue it.
    async fn dispatch(&self, conn: L::Conn, peer_addr: SocketAddr) -> Result<(), MuxError> {
        let routes = self.routes.load_full();
        if routes.is_empty() {
            drop(conn);
            return Err(MuxError::NotMatched { peer_addr });
        }

        let mut conn = SniffedConn::new(conn);
        let selected = select_route(
            &mut conn,
            &routes,
            self.read_timeout(),
            self.config.max_sniff_bytes,
        )
        .await;
        conn.done_sniffing();

        let Some(route) = selected? else {
            return Err(MuxError::NotMatched { peer_addr });
        };

        debug!(
            server = route.id,
            peeked = conn.replay_pending(),
            "Connection matched"
        );

        route
            .tx
            .send((conn, peer_addr))
            .await
            .map_err(|_| MuxError::ListenerClosed)?;

        self.stats
            .connections_dispatched
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn close_queues(&self) {
        let routes = self.routes.load_full();
        for route in routes.iter() {
            let dropped = route.queue.close().await;
            if dropped > 0 {
                self.stats
                    .connections_dropped
                    .fetch_add(dropped as u64, Ordering::Relaxed);
                warn!(server = route.id, dropped = dropped, "Dropped queued connections");
            }
        }
    }
}

/// Peek at a connection until a route claims it.
///
/// Routes are asked in order and a route wins only once every route
/// before it has rejected the connection. Routes whose server has exited
/// are skipped. When no more bytes will be peeked (EOF, `max_bytes`
/// reached, or a matching read timing out), routes still undecided count
/// as rejected and the first remaining route to match wins. Returns `None`
/// when no route matches; a timeout with no match is returned as an error.
async fn select_route<'r, S, C>(
    conn: &mut SniffedConn<S>,
    routes: &'r [Route<C>],
    read_timeout: Option<Duration>,
    max_bytes: usize,
) -> Result<Option<&'r Route<C>>, MuxError>
where
    S: AsyncRead + Unpin,
{
    let mut sniff = conn.start_sniffing();
    let mut chunk = vec![0u8; max_bytes];

    loop {
        let peeked = sniff.peeked();
        let mut undecided = false;
        for route in routes.iter().filter(|r| !r.queue.is_closed()) {
            match route.matcher.matches(peeked) {
                MatchResult::Matched => return Ok(Some(route)),
                MatchResult::Rejected => continue,
                MatchResult::NeedMore => {
                    // Later routes wait until this one decides.
                    undecided = true;
                    break;
                }
            }
        }
        if !undecided {
            return Ok(None);
        }

        let room = max_bytes.saturating_sub(peeked.len());
        if room == 0 {
            return Ok(settle(routes, sniff.peeked()));
        }

        let read = sniff.read(&mut chunk[..room]);
        let n = match read_timeout {
            Some(timeout) => {
                let outcome = tokio::time::timeout(timeout, read).await;
                match outcome {
                    Ok(read) => read?,
                    Err(_) => {
                        return match settle(routes, sniff.peeked()) {
                            Some(route) => Ok(Some(route)),
                            None => Err(std::io::Error::new(
                                std::io::ErrorKind::TimedOut,
                                "mux: matching read timed out",
                            )
                            .into()),
                        };
                    }
                }
            }
            None => read.await?,
        };

        if n == 0 {
            return Ok(settle(routes, sniff.peeked()));
        }
    }
}

/// Final verdict once no more bytes will be peeked: the first open route
/// that matches, with undecided routes treated as rejected.
fn settle<'r, C>(routes: &'r [Route<C>], peeked: &[u8]) -> Option<&'r Route<C>> {
    routes
        .iter()
        .filter(|r| !r.queue.is_closed())
        .find(|r| r.matcher.matches(peeked) == MatchResult::Matched)
}

fn log_task_exit(finished: Result<(), tokio::task::JoinError>) {
    if let Err(e) = finished {
        if e.is_panic() {
            error!(error = %e, "Connection task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{any, prefix};

    #[test]
    fn test_listener_config_default() {
        let config = ListenerConfig::new(":7000");
        assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(config.max_sniff_bytes, DEFAULT_MAX_SNIFF_BYTES);
        assert!(config.read_timeout.is_none());
    }

    #[test]
    fn test_active_guard_decrements_on_drop() {
        let stats = Arc::new(ListenerStats::default());
        let guard = ActiveGuard::new(&stats);
        assert_eq!(stats.connections_active.load(Ordering::Relaxed), 1);
        drop(guard);
        assert_eq!(stats.connections_active.load(Ordering::Relaxed), 0);
    }

    fn route(id: usize, matcher: impl Matcher) -> Route<tokio::io::DuplexStream> {
        let (tx, queue) = ConnQueue::new(1);
        Route {
            id,
            matcher: Arc::new(matcher),
            tx,
            queue: Arc::new(queue),
        }
    }

    #[tokio::test]
    async fn test_select_route_first_match_wins() {
        let (client, mut remote) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut remote, b"SSH-2.0-test\r\n")
            .await
            .unwrap();

        let routes = vec![route(0, prefix("GET ")), route(1, prefix("SSH-")), route(2, any())];
        let mut conn = SniffedConn::new(client);
        let selected = select_route(&mut conn, &routes, None, 64).await.unwrap();
        assert_eq!(selected.map(|r| r.id), Some(1));

        conn.done_sniffing();
        let mut buf = Vec::new();
        drop(remote);
        conn.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"SSH-2.0-test\r\n");
    }

    #[tokio::test]
    async fn test_select_route_any_does_not_read() {
        let (client, _remote) = tokio::io::duplex(64);
        let routes = vec![route(0, any())];
        let mut conn = SniffedConn::new(client);

        let selected = select_route(&mut conn, &routes, None, 64).await.unwrap();
        assert_eq!(selected.map(|r| r.id), Some(0));
        assert!(conn.peeked().is_empty());
    }

    #[tokio::test]
    async fn test_select_route_all_rejected() {
        let (client, mut remote) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut remote, b"HELO")
            .await
            .unwrap();

        let routes = vec![route(0, prefix("SSH-"))];
        let mut conn = SniffedConn::new(client);
        assert!(select_route(&mut conn, &routes, None, 64)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_select_route_sniff_limit() {
        let (client, mut remote) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut remote, b"SSH")
            .await
            .unwrap();

        let routes = vec![route(0, prefix("SSH-"))];
        let mut conn = SniffedConn::new(client);
        assert!(select_route(&mut conn, &routes, None, 3)
            .await
            .unwrap()
            .is_none());
        assert_eq!(conn.peeked(), b"SSH");
    }

    #[tokio::test]
    async fn test_select_route_read_timeout() {
        let (client, _remote) = tokio::io::duplex(64);
        let routes = vec![route(0, prefix("SSH-"))];
        let mut conn = SniffedConn::new(client);

        let err = select_route(&mut conn, &routes, Some(Duration::from_millis(20)), 64)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_select_route_falls_back_at_eof() {
        let (client, mut remote) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut remote, b"SS")
            .await
            .unwrap();
        drop(remote);

        let routes = vec![route(0, prefix("SSH-")), route(1, any())];
        let mut conn = SniffedConn::new(client);
        let selected = select_route(&mut conn, &routes, None, 64).await.unwrap();
        assert_eq!(selected.map(|r| r.id), Some(1));
        assert_eq!(conn.peeked(), b"SS");
    }

    #[tokio::test]
    async fn test_select_route_falls_back_at_sniff_limit() {
        let (client, mut remote) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut remote, b"SSH")
            .await
            .unwrap();

        let routes = vec![route(0, prefix("SSH-")), route(1, prefix("SS")), route(2, any())];
        let mut conn = SniffedConn::new(client);
        let selected = select_route(&mut conn, &routes, None, 3).await.unwrap();
        assert_eq!(selected.map(|r| r.id), Some(1));
    }

    #[tokio::test]
    async fn test_select_route_falls_back_on_read_timeout() {
        let (client, _remote) = tokio::io::duplex(64);
        let routes = vec![route(0, crate::matcher::tls()), route(1, any())];
        let mut conn = SniffedConn::new(client);

        let selected = select_route(&mut conn, &routes, Some(Duration::from_millis(20)), 64)
            .await
            .unwrap();
        assert_eq!(selected.map(|r| r.id), Some(1));
        assert!(conn.peeked().is_empty());
    }

    #[tokio::test]
    async fn test_select_route_skips_closed_routes() {
        let (client, mut remote) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut remote, b"SSH-2.0")
            .await
            .unwrap();

        let routes = vec![route(0, prefix("SSH-")), route(1, any())];
        routes[0].queue.close().await;
        let mut conn = SniffedConn::new(client);
        let selected = select_route(&mut conn, &routes, None, 64).await.unwrap();
        assert_eq!(selected.map(|r| r.id), Some(1));
    }

    #[tokio::test]
    async fn test_select_route_eof() {
        let (client, remote) = tokio::io::duplex(64);
        drop(remote);
        let routes = vec![route(0, prefix("SSH-"))];
        let mut conn = SniffedConn::new(client);
        assert!(select_route(&mut conn, &routes, None, 64)
            .await
            .unwrap()
            .is_none());
    }
}
