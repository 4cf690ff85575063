//! Process-wide counters, in-flight work tracking, and the monitor endpoint.
//!
//! Counters are mutated with atomic increments from any relay or handshake
//! task and read by the HTTP monitor endpoint and the graceful-shutdown wait
//! logic. The [`ConnectionTracker`] pairs a `begin()` guard with every
//! connection-handling task body so shutdown can block until all in-flight
//! work reaches zero.

use crate::config::Config;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};

/// Current and cumulative counts for everything the proxy does.
#[derive(Debug, Default)]
pub struct Monitor {
    /// The current number of clients connected (to the "listen" addr).
    current_clients: AtomicI64,
    /// The total number of clients that have ever connected.
    total_clients: AtomicU64,
    /// Failed attempts to connect to the backend (the "connect" addr).
    total_connect_server_fails: AtomicU64,

    /// Attempts to dial tunnels to remote.
    total_tunnel_connect_attempts: AtomicU64,
    /// Tunnels that connected to remote (before any handshake).
    total_tunnels_connected: AtomicU64,
    /// Whether the tunneler has hit its consecutive-error cap and muted
    /// further dial errors.
    tunnels_at_max_err: AtomicBool,
    /// The current number of tunnels to remote (to the "tunnel" addr).
    current_tunnels: AtomicI64,
    /// The total number of tunnels to remote (ever).
    total_tunnels: AtomicU64,

    /// Timeouts that occurred while a client waited for a tunnel pairing.
    total_tunnel_wait_timeouts: AtomicU64,

    /// Server connections accepted for tunneling (accepted from the
    /// listener, not necessarily valid tunnels).
    total_accepted_servers: AtomicU64,
    /// The current number of tunnels from servers ("listen-servers" addr).
    current_tunneled: AtomicI64,
    /// The total number of tunnels from servers (ever).
    total_tunneled: AtomicU64,
    /// Tunnels from servers that failed the readiness check.
    total_tunneled_failed_ready: AtomicU64,

    shutting_down: AtomicBool,
}

impl Monitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_client(&self) -> (i64, u64) {
        (
            self.current_clients.fetch_add(1, Ordering::SeqCst) + 1,
            self.total_clients.fetch_add(1, Ordering::SeqCst) + 1,
        )
    }

    pub fn remove_client(&self) -> i64 {
        self.current_clients.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn add_connect_server_fail(&self) -> u64 {
        self.total_connect_server_fails.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn add_tunnel_connect_attempt(&self) -> u64 {
        self.total_tunnel_connect_attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn add_tunnel_connected(&self) -> u64 {
        self.total_tunnels_connected.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn set_tunnels_at_max_err(&self, at_max: bool) {
        self.tunnels_at_max_err.store(at_max, Ordering::SeqCst);
    }

    pub fn add_tunnel(&self) -> (i64, u64) {
        (
            self.current_tunnels.fetch_add(1, Ordering::SeqCst) + 1,
            self.total_tunnels.fetch_add(1, Ordering::SeqCst) + 1,
        )
    }

    pub fn remove_tunnel(&self) -> i64 {
        self.current_tunnels.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn add_tunnel_wait_timeout(&self) -> u64 {
        self.total_tunnel_wait_timeouts.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn add_accepted_server(&self) -> u64 {
        self.total_accepted_servers.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn add_tunneled(&self) -> (i64, u64) {
        (
            self.current_tunneled.fetch_add(1, Ordering::SeqCst) + 1,
            self.total_tunneled.fetch_add(1, Ordering::SeqCst) + 1,
        )
    }

    pub fn remove_tunneled(&self) -> i64 {
        self.current_tunneled.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn add_tunneled_failed_ready(&self) -> u64 {
        self.total_tunneled_failed_ready.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Marks the process as shutting down. Returns whether this call was the
    /// one that flipped the flag (idempotent; a second signal should force
    /// an immediate exit instead of waiting again).
    pub fn begin_shutdown(&self) -> bool {
        !self.shutting_down.swap(true, Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn current_clients(&self) -> i64 {
        self.current_clients.load(Ordering::SeqCst)
    }

    pub fn total_clients(&self) -> u64 {
        self.total_clients.load(Ordering::SeqCst)
    }

    pub fn total_tunnel_wait_timeouts(&self) -> u64 {
        self.total_tunnel_wait_timeouts.load(Ordering::SeqCst)
    }

    pub fn tunnel_connect_attempts(&self) -> u64 {
        self.total_tunnel_connect_attempts.load(Ordering::SeqCst)
    }

    pub fn total_tunneled_failed_ready(&self) -> u64 {
        self.total_tunneled_failed_ready.load(Ordering::SeqCst)
    }

    /// Read-only view of all counters plus the active configuration.
    pub fn snapshot(&self, config: &Config) -> Snapshot {
        Snapshot {
            current_clients: self.current_clients.load(Ordering::SeqCst),
            total_clients: self.total_clients.load(Ordering::SeqCst),
            total_connect_server_fails: self.total_connect_server_fails.load(Ordering::SeqCst),
            total_tunnel_connect_attempts: self
                .total_tunnel_connect_attempts
                .load(Ordering::SeqCst),
            total_tunnels_connected: self.total_tunnels_connected.load(Ordering::SeqCst),
            tunnels_at_max_err: self.tunnels_at_max_err.load(Ordering::SeqCst),
            current_tunnels: self.current_tunnels.load(Ordering::SeqCst),
            total_tunnels: self.total_tunnels.load(Ordering::SeqCst),
            total_tunnel_wait_timeouts: self.total_tunnel_wait_timeouts.load(Ordering::SeqCst),
            total_accepted_servers: self.total_accepted_servers.load(Ordering::SeqCst),
            current_tunneled: self.current_tunneled.load(Ordering::SeqCst),
            total_tunneled: self.total_tunneled.load(Ordering::SeqCst),
            total_tunneled_failed_ready: self.total_tunneled_failed_ready.load(Ordering::SeqCst),
            config: config.clone(),
            shutting_down: self.shutting_down.load(Ordering::SeqCst),
        }
    }
}

/// JSON-serializable snapshot served by the monitor endpoint.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub current_clients: i64,
    pub total_clients: u64,
    pub total_connect_server_fails: u64,
    pub total_tunnel_connect_attempts: u64,
    // Key kept as published by existing monitor consumers.
    #[serde(rename = "totalTunnelAttempts")]
    pub total_tunnels_connected: u64,
    pub tunnels_at_max_err: bool,
    pub current_tunnels: i64,
    pub total_tunnels: u64,
    pub total_tunnel_wait_timeouts: u64,
    pub total_accepted_servers: u64,
    pub current_tunneled: i64,
    pub total_tunneled: u64,
    pub total_tunneled_failed_ready: u64,
    pub config: Config,
    pub shutting_down: bool,
}

/// Counts outstanding connection-handling tasks so shutdown can wait for all
/// in-flight work to finish.
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    active: AtomicUsize,
    idle: tokio::sync::Notify,
}

impl ConnectionTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a unit of in-flight work; the returned guard releases it on
    /// drop, so every task body holds one for its whole scope.
    pub fn begin(self: &Arc<Self>) -> WorkGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        WorkGuard(self.clone())
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Resolves once no work is in flight. Returns immediately if nothing
    /// ever began.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// See [`ConnectionTracker::begin`].
pub struct WorkGuard(Arc<ConnectionTracker>);

impl Drop for WorkGuard {
    fn drop(&mut self) {
        if self.0.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Serves monitor snapshots over HTTP: a single GET endpoint returning the
/// counters and active configuration as JSON.
pub async fn serve_monitor(
    listener: tokio::net::TcpListener,
    monitor: Arc<Monitor>,
    config: Config,
    cancel: tokio_util::sync::CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(err) => {
                    tracing::warn!("monitor accept error: {err}");
                    continue;
                }
            },
        };
        let monitor = monitor.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let io = hyper_util::rt::TokioIo::new(stream);
            let service = hyper::service::service_fn(move |req: hyper::Request<_>| {
                let monitor = monitor.clone();
                let config = config.clone();
                async move { handle_monitor_request(req, &monitor, &config) }
            });
            if let Err(err) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                tracing::debug!("monitor connection error: {err}");
            }
        });
    }
}

fn handle_monitor_request(
    req: hyper::Request<hyper::body::Incoming>,
    monitor: &Monitor,
    config: &Config,
) -> Result<hyper::Response<http_body_util::Full<bytes::Bytes>>, std::convert::Infallible> {
    if req.method() != hyper::Method::GET {
        let mut response = hyper::Response::new(http_body_util::Full::new(bytes::Bytes::new()));
        *response.status_mut() = hyper::StatusCode::METHOD_NOT_ALLOWED;
        return Ok(response);
    }
    match serde_json::to_vec(&monitor.snapshot(config)) {
        Ok(body) => {
            let mut response =
                hyper::Response::new(http_body_util::Full::new(bytes::Bytes::from(body)));
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("application/json"),
            );
            Ok(response)
        }
        Err(err) => {
            tracing::warn!("error serializing monitor snapshot: {err}");
            let mut response =
                hyper::Response::new(http_body_util::Full::new(bytes::Bytes::new()));
            *response.status_mut() = hyper::StatusCode::INTERNAL_SERVER_ERROR;
            Ok(response)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_counts_pair_up() {
        let monitor = Monitor::new();
        assert_eq!(monitor.add_client(), (1, 1));
        assert_eq!(monitor.add_client(), (2, 2));
        assert_eq!(monitor.remove_client(), 1);
        assert_eq!(monitor.remove_client(), 0);
        // Cumulative total only increases.
        assert_eq!(monitor.total_clients(), 2);
    }

    #[test]
    fn shutdown_flag_flips_once() {
        let monitor = Monitor::new();
        assert!(monitor.begin_shutdown());
        assert!(!monitor.begin_shutdown());
        assert!(monitor.is_shutting_down());
    }

    #[test]
    fn snapshot_keeps_wire_keys() {
        let monitor = Monitor::new();
        monitor.add_tunnel_connected();
        let json = serde_json::to_string(&monitor.snapshot(&Config::default())).unwrap();
        assert!(json.contains("\"totalTunnelAttempts\":1"), "{json}");
        assert!(json.contains("\"currentClients\":0"), "{json}");
        assert!(json.contains("\"shuttingDown\":false"), "{json}");
    }

    #[tokio::test]
    async fn tracker_waits_for_outstanding_work() {
        let tracker = ConnectionTracker::new();
        // Nothing in flight: returns immediately.
        tracker.wait_idle().await;

        let guard = tracker.begin();
        assert_eq!(tracker.active(), 1);
        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_idle().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
    }
}
