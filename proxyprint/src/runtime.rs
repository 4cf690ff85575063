//! Runtime wiring: listeners, client pairing, the tunneling agent, and
//! graceful shutdown.
//!
//! [`ProxyRuntime`] is the single context object everything hangs off: the
//! resolved configuration and password, the counters, the rendezvous
//! registry, the print sink, and the shutdown token. [`ProxyHandle::start`]
//! binds the listeners, spawns the long-running loops, and hands back a
//! handle that exposes the bound addresses and drives shutdown.

use crate::config::Config;
use crate::handshake::{self, HandshakeError};
use crate::monitor::{ConnectionTracker, Monitor};
use crate::password::{self, PasswordError};
use crate::print::{PrintSink, Printer};
use crate::registry::{DequeueError, Registry};
use crate::relay;
use proxyprint_net::Conn;
use std::sync::Arc;

/// Consecutive tunnel dial failures tolerated before the errors are muted.
const TUNNEL_MAX_ERRS: u32 = 5;

/// Pause between tunnel dial attempts after a failure.
const TUNNEL_RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error(transparent)]
    Password(#[from] PasswordError),
    #[error("error resolving {what} addr {addr}: {source}")]
    Resolve {
        what: &'static str,
        addr: String,
        source: std::io::Error,
    },
    #[error("error binding {what} listener on {addr}: {source}")]
    Bind {
        what: &'static str,
        addr: String,
        source: std::io::Error,
    },
    #[error("error opening print output: {source}")]
    Print { source: std::io::Error },
    #[error("remote speaks a newer tunnel protocol (supported {supported}, got {got})")]
    VersionSkew { supported: u32, got: u32 },
}

/// Everything a connection-handling task needs, shared behind one `Arc`.
pub struct ProxyRuntime {
    config: Config,
    password: Vec<u8>,
    connect_addr: Option<std::net::SocketAddr>,
    monitor: Arc<Monitor>,
    tracker: Arc<ConnectionTracker>,
    registry: Registry,
    sink: Option<PrintSink>,
    cancel: tokio_util::sync::CancellationToken,
    // First unrecoverable error; surfaced by `ProxyHandle::wait`.
    fatal: std::sync::Mutex<Option<RuntimeError>>,
}

impl ProxyRuntime {
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    /// Begins graceful shutdown: stops accepting, drains the registry, and
    /// lets in-flight relays run to completion. Idempotent.
    pub async fn shutdown(&self) {
        if !self.monitor.begin_shutdown() {
            return;
        }
        self.cancel.cancel();
        for conn in self.registry.close().await {
            self.monitor.remove_tunneled();
            conn.close().await;
        }
    }

    fn client_printer(&self) -> Printer {
        Printer::new(self.config.client_print, self.sink.clone(), false)
    }

    fn server_printer(&self) -> Printer {
        Printer::new(self.config.server_print, self.sink.clone(), true)
    }

    fn record_fatal(&self, err: RuntimeError) {
        let mut slot = self.fatal.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(err);
        }
        self.cancel.cancel();
    }

    /// Accept loop for the client listener.
    async fn listen_clients(self: Arc<Self>, listener: tokio::net::TcpListener) {
        loop {
            let stream = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(err) => {
                        if !self.monitor.is_shutting_down() {
                            tracing::warn!("error accepting client: {err}");
                        }
                        continue;
                    }
                },
            };
            let conn = match Conn::from_stream(stream) {
                Ok(conn) => Arc::new(conn),
                Err(err) => {
                    tracing::warn!("error accepting client: {err}");
                    continue;
                }
            };
            tokio::spawn(self.clone().handle_client(conn));
        }
    }

    /// Serves one client: finds it a backend, relays until either side goes
    /// away, and keeps the counters balanced no matter which step failed.
    async fn handle_client(self: Arc<Self>, client: Arc<Conn>) {
        let _guard = self.tracker.begin();
        self.monitor.add_client();

        let paired = if self.config.listen_servers.is_empty() {
            self.dial_backend().await
        } else {
            self.pair_with_tunnel().await.map(|conn| (conn, true))
        };
        let (server, tunneled) = match paired {
            Some(pair) => pair,
            None => {
                client.close().await;
                self.monitor.remove_client();
                return;
            }
        };

        relay::run_pair(
            client,
            server,
            self.config.buffer as usize,
            self.client_printer(),
            self.server_printer(),
        )
        .await;

        self.monitor.remove_client();
        if tunneled {
            self.monitor.remove_tunneled();
        }
    }

    /// Dials the configured backend directly.
    async fn dial_backend(&self) -> Option<(Arc<Conn>, bool)> {
        // Resolved once at startup; present whenever this path is configured.
        let addr = self.connect_addr?;
        match Conn::connect(addr).await {
            Ok(conn) => Some((Arc::new(conn), false)),
            Err(err) => {
                self.monitor.add_connect_server_fail();
                tracing::warn!("error connecting to server at {addr}: {err}");
                None
            }
        }
    }

    /// Waits for an authenticated tunnel candidate and probes its readiness.
    ///
    /// One overall deadline covers the whole wait; a candidate that fails the
    /// readiness probe does not reset it. A timeout is counted and the client
    /// is turned away.
    async fn pair_with_tunnel(&self) -> Option<Arc<Conn>> {
        let deadline =
            tokio::time::Instant::now() + std::time::Duration::from_secs(self.config.tunnel_wait_secs);
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                self.monitor.add_tunnel_wait_timeout();
                return None;
            }
            match self.registry.dequeue_timeout(remaining).await {
                Ok(conn) => {
                    if handshake::check_tunnel_readiness(&conn).await {
                        return Some(conn);
                    }
                    self.monitor.add_tunneled_failed_ready();
                    self.monitor.remove_tunneled();
                }
                Err(DequeueError::Timeout) => {
                    self.monitor.add_tunnel_wait_timeout();
                    return None;
                }
                Err(DequeueError::Closed) => return None,
            }
        }
    }

    /// Accept loop for the tunnel-server listener.
    ///
    /// The handshake runs inline: a full registry blocks the enqueue, which
    /// in turn stalls this loop. That is the backpressure bound on how many
    /// authenticated servers can pile up.
    async fn listen_servers(self: Arc<Self>, listener: tokio::net::TcpListener) {
        loop {
            let stream = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(err) => {
                        if !self.monitor.is_shutting_down() {
                            tracing::warn!("error accepting server: {err}");
                        }
                        continue;
                    }
                },
            };
            self.monitor.add_accepted_server();
            let conn = match Conn::from_stream(stream) {
                Ok(conn) => Arc::new(conn),
                Err(err) => {
                    tracing::warn!("error accepting server: {err}");
                    continue;
                }
            };
            match handshake::accept_tunnel(&conn, &self.password).await {
                Ok(()) => {
                    self.monitor.add_tunneled();
                    if self.registry.enqueue(conn.clone()).await.is_err() {
                        // Shutting down; the candidate never got paired.
                        self.monitor.remove_tunneled();
                        conn.close().await;
                    }
                }
                Err(err) => {
                    if !err.is_ignorable() {
                        tracing::warn!("[{}] tunnel handshake failed: {err}", conn.peer_addr());
                    }
                    conn.close().await;
                }
            }
        }
    }

    /// Outbound tunneling agent: keeps up to the configured number of
    /// authenticated tunnels waiting at the remote, replacing each one as it
    /// gets used up.
    ///
    /// Dial and authentication failures share one consecutive-error count: a
    /// failed attempt of either kind waits out the retry delay before the
    /// next dial, and after five in a row further errors are muted, so a
    /// persistently rejected password never turns into a tight redial loop.
    async fn run_tunneler(self: Arc<Self>, addr: std::net::SocketAddr) {
        let permits = Arc::new(tokio::sync::Semaphore::new(self.config.max_waiting_tunnels));
        let mut err_count: u32 = 0;
        loop {
            let permit = tokio::select! {
                _ = self.cancel.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            self.monitor.add_tunnel_connect_attempt();
            let established = tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = self.connect_and_auth(addr) => res,
            };
            let conn = match established {
                Ok(conn) => conn,
                Err(err @ HandshakeError::VersionSkew { supported, got }) => {
                    tracing::error!("stopping tunneler: {err}");
                    self.record_fatal(RuntimeError::VersionSkew { supported, got });
                    break;
                }
                Err(err) => {
                    err_count += 1;
                    if err_count < TUNNEL_MAX_ERRS {
                        tracing::warn!("error establishing tunnel to {addr}: {err}");
                    } else if err_count == TUNNEL_MAX_ERRS {
                        tracing::warn!(
                            "error establishing tunnel to {addr}: {err} \
                             (muting further errors)"
                        );
                        self.monitor.set_tunnels_at_max_err(true);
                    }
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(TUNNEL_RETRY_DELAY) => continue,
                    }
                }
            };
            if err_count >= TUNNEL_MAX_ERRS {
                self.monitor.set_tunnels_at_max_err(false);
                tracing::info!("tunnel connection to {addr} restored");
            }
            err_count = 0;
            self.monitor.add_tunnel();
            tokio::spawn(self.clone().run_tunnel(conn, permit));
        }
    }

    /// Dials the remote and runs the authentication phase of the agent
    /// handshake under a deadline. The connection is closed on any failure.
    async fn connect_and_auth(
        &self,
        addr: std::net::SocketAddr,
    ) -> Result<Arc<Conn>, HandshakeError> {
        let conn = Arc::new(Conn::connect(addr).await?);
        self.monitor.add_tunnel_connected();
        conn.set_deadline(Some(
            tokio::time::Instant::now() + handshake::HANDSHAKE_TIMEOUT,
        ));
        match handshake::agent_auth(&conn, &self.password).await {
            Ok(()) => {
                conn.set_deadline(None);
                Ok(conn)
            }
            Err(err) => {
                conn.close().await;
                Err(err)
            }
        }
    }

    /// Drives one authenticated tunnel from pairing through relay.
    ///
    /// The permit is held while the tunnel waits to be paired and released
    /// the moment the remote pairs it with a client, letting the tunneler
    /// dial a replacement.
    async fn run_tunnel(
        self: Arc<Self>,
        conn: Arc<Conn>,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        let _guard = self.tracker.begin();
        let pairing = tokio::select! {
            _ = self.cancel.cancelled() => {
                conn.close().await;
                self.monitor.remove_tunnel();
                return;
            }
            res = handshake::agent_await_pairing(&conn) => res,
        };
        if let Err(err) = pairing {
            if !err.is_ignorable() && !self.monitor.is_shutting_down() {
                tracing::warn!("[{}] tunnel pairing failed: {err}", conn.peer_addr());
            }
            conn.close().await;
            self.monitor.remove_tunnel();
            return;
        }
        drop(permit);

        // The paired tunnel now carries a remote client's bytes; serve it
        // exactly like a locally accepted client.
        self.clone().handle_client(conn).await;
        self.monitor.remove_tunnel();
    }
}

/// A started proxy: bound addresses plus shutdown control.
pub struct ProxyHandle {
    runtime: Arc<ProxyRuntime>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    client_addr: Option<std::net::SocketAddr>,
    servers_addr: Option<std::net::SocketAddr>,
    monitor_addr: Option<std::net::SocketAddr>,
}

impl ProxyHandle {
    /// Validates the configuration, resolves the password if tunneling is in
    /// play, binds every configured listener, and spawns the runtime loops.
    pub async fn start(config: Config) -> Result<Self, RuntimeError> {
        let password = if config.uses_tunneling() {
            password::resolve(&config.pwd_env_name, config.require_pwd_env_exists)?
        } else {
            Vec::new()
        };
        Self::start_with_password(config, password).await
    }

    /// [`ProxyHandle::start`] with the password supplied directly instead of
    /// resolved from the environment.
    pub async fn start_with_password(
        mut config: Config,
        password: Vec<u8>,
    ) -> Result<Self, RuntimeError> {
        config.normalize();
        config.validate()?;

        let connect_addr = if config.connect.is_empty() {
            None
        } else {
            Some(resolve_addr("connect", &config.connect).await?)
        };
        let tunnel_addr = if config.tunnel.is_empty() {
            None
        } else {
            Some(resolve_addr("tunnel", &config.tunnel).await?)
        };

        let client_listener = bind("listen", &config.listen).await?;
        let servers_listener = bind("listen-servers", &config.listen_servers).await?;
        let monitor_listener = bind("monitor", &config.monitor_server).await?;
        let client_addr = local_addr("listen", &client_listener)?;
        let servers_addr = local_addr("listen-servers", &servers_listener)?;
        let monitor_addr = local_addr("monitor", &monitor_listener)?;

        let sink = if !config.client_print.is_none() || !config.server_print.is_none() {
            let (sink, _task) =
                PrintSink::start(&config.client_print_file, &config.server_print_file)
                    .await
                    .map_err(|source| RuntimeError::Print { source })?;
            Some(sink)
        } else {
            None
        };

        let registry = Registry::new(config.max_accepted_servers);
        let runtime = Arc::new(ProxyRuntime {
            config,
            password,
            connect_addr,
            monitor: Arc::new(Monitor::new()),
            tracker: ConnectionTracker::new(),
            registry,
            sink,
            cancel: tokio_util::sync::CancellationToken::new(),
            fatal: std::sync::Mutex::new(None),
        });

        let mut tasks = Vec::new();
        if let Some(listener) = client_listener {
            tasks.push(tokio::spawn(runtime.clone().listen_clients(listener)));
        }
        if let Some(listener) = servers_listener {
            tasks.push(tokio::spawn(runtime.clone().listen_servers(listener)));
        }
        if let Some(addr) = tunnel_addr {
            tasks.push(tokio::spawn(runtime.clone().run_tunneler(addr)));
        }
        if let Some(listener) = monitor_listener {
            tasks.push(tokio::spawn(crate::monitor::serve_monitor(
                listener,
                runtime.monitor.clone(),
                runtime.config.clone(),
                runtime.cancel.clone(),
            )));
        }

        Ok(Self {
            runtime,
            tasks,
            client_addr,
            servers_addr,
            monitor_addr,
        })
    }

    pub fn runtime(&self) -> &Arc<ProxyRuntime> {
        &self.runtime
    }

    /// Address the client listener bound to, if configured.
    pub fn client_addr(&self) -> Option<std::net::SocketAddr> {
        self.client_addr
    }

    /// Address the tunnel-server listener bound to, if configured.
    pub fn servers_addr(&self) -> Option<std::net::SocketAddr> {
        self.servers_addr
    }

    /// Address the monitor endpoint bound to, if configured.
    pub fn monitor_addr(&self) -> Option<std::net::SocketAddr> {
        self.monitor_addr
    }

    /// See [`ProxyRuntime::shutdown`].
    pub async fn shutdown(&self) {
        self.runtime.shutdown().await;
    }

    /// Waits for the runtime loops to stop and all in-flight connection work
    /// to finish, then surfaces the first fatal error if there was one.
    pub async fn wait(self) -> Result<(), RuntimeError> {
        for task in self.tasks {
            let _ = task.await;
        }
        self.runtime.tracker.wait_idle().await;
        let fatal = {
            let mut slot = self.runtime.fatal.lock().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        match fatal {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn resolve_addr(
    what: &'static str,
    addr: &str,
) -> Result<std::net::SocketAddr, RuntimeError> {
    let map_err = |source| RuntimeError::Resolve {
        what,
        addr: addr.to_string(),
        source,
    };
    tokio::net::lookup_host(addr)
        .await
        .map_err(map_err)?
        .next()
        .ok_or_else(|| map_err(std::io::Error::from(std::io::ErrorKind::AddrNotAvailable)))
}

async fn bind(
    what: &'static str,
    addr: &str,
) -> Result<Option<tokio::net::TcpListener>, RuntimeError> {
    if addr.is_empty() {
        return Ok(None);
    }
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| RuntimeError::Bind {
            what,
            addr: addr.to_string(),
            source,
        })?;
    Ok(Some(listener))
}

fn local_addr(
    what: &'static str,
    listener: &Option<tokio::net::TcpListener>,
) -> Result<Option<std::net::SocketAddr>, RuntimeError> {
    match listener {
        Some(listener) => listener
            .local_addr()
            .map(Some)
            .map_err(|source| RuntimeError::Bind {
                what,
                addr: "local".to_string(),
                source,
            }),
        None => Ok(None),
    }
}
