//! Server lifecycle: serve, stop, drain.
//!
//! A [`Server`] moves through `Idle → Starting → Serving → Stopping → Stopped`.
//! Serving claims the PID file, binds (or takes) a listener, registers with the
//! [`LifecycleManager`] and runs the accept loop. Stopping closes the listener,
//! waits for every accepted connection to finish, runs the shutdown callbacks
//! in registration order, and finally releases the PID file.
//!
//! `Stopped` is terminal: a stopped server cannot be served again.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::access_log::{AccessLogHook, TracingAccessLog};
use crate::config::ServerConfig;
use crate::drain::DrainTracker;
use crate::pidfile::{PidFile, PidFileError};

use super::connection::{self, ConnectionContext, StopSignal};
use super::listener::{is_resource_exhaustion, is_transient_accept_error, Listener};
use super::shutdown::LifecycleManager;
use super::tls::{self, TlsError};

/// Boxed error returned by shutdown callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type ShutdownCallback = Box<dyn FnOnce() -> Result<(), BoxError> + Send>;

/// Pause after running out of file descriptors before accepting again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

static NEXT_SERVER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Constructed, never served
    Idle,
    /// `serve` is claiming the PID file and binding
    Starting,
    /// Accepting connections
    Serving,
    /// Listener closed, draining connections and running callbacks
    Stopping,
    /// Fully stopped
    Stopped,
}

/// Server startup or runtime error
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("Server is already serving")]
    AlreadyServing,

    #[error("Server has already been stopped")]
    AlreadyStopped,

    #[error(transparent)]
    PidFile(#[from] PidFileError),

    #[error("Failed to bind server to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("Failed to accept connection: {0}")]
    Accept(#[source] io::Error),
}

/// Stop failure. Cloneable so every caller of `stop` sees the same outcome.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StopError {
    #[error("Server is not serving")]
    NotServing,

    #[error("Shutdown callback #{index} failed: {error}")]
    Callback { index: usize, error: Arc<BoxError> },

    #[error("Failed to release PID file: {0}")]
    PidFile(Arc<PidFileError>),

    #[error("Shutdown task aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Clone, Copy)]
struct Lifecycle {
    state: ServerState,
    local_addr: Option<SocketAddr>,
}

pub(crate) struct Shared {
    id: u64,
    config: ServerConfig,
    pid_file: PidFile,
    lifecycle: watch::Sender<Lifecycle>,
    /// Flipped to `true` once; observed by the accept loop, connections and handlers
    stopping: watch::Sender<bool>,
    /// `true` while the accept loop owns an open listener
    listener_open: watch::Sender<bool>,
    drain: DrainTracker,
    callbacks: Mutex<Vec<ShutdownCallback>>,
    outcome: OnceLock<Result<(), StopError>>,
    access_log: Arc<dyn AccessLogHook>,
    manager: Option<Arc<LifecycleManager>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn state(&self) -> ServerState {
        self.lifecycle.borrow().state
    }

    /// Atomically move from one of `from` to `to`. On refusal, returns the current state.
    fn transition(&self, from: &[ServerState], to: ServerState) -> Result<(), ServerState> {
        let mut refused = None;
        self.lifecycle.send_if_modified(|lc| {
            if from.contains(&lc.state) {
                lc.state = to;
                true
            } else {
                refused = Some(lc.state);
                false
            }
        });
        refused.map_or(Ok(()), Err)
    }

    async fn wait_for_state(&self, wanted: ServerState) {
        let mut rx = self.lifecycle.subscribe();
        // The sender lives in `self`, so the channel stays open.
        let _ = rx.wait_for(|lc| lc.state == wanted).await;
    }

    fn is_stopping(&self) -> bool {
        *self.stopping.borrow()
    }

    async fn wait_listener_closed(&self) {
        let mut open = self.listener_open.subscribe();
        let _ = open.wait_for(|open| !*open).await;
    }

    /// Outcome of the shutdown that already ran or is running.
    async fn stopped_outcome(&self) -> Result<(), StopError> {
        self.wait_for_state(ServerState::Stopped).await;
        self.outcome.get().cloned().unwrap_or(Ok(()))
    }

    /// The stop sequence. Runs exactly once, after the `Serving → Stopping` transition.
    async fn shutdown(&self) -> Result<(), StopError> {
        tracing::info!(addr = %self.config.addr, "Stopping server");

        self.stopping.send_replace(true);

        self.wait_listener_closed().await;
        tracing::debug!(
            addr = %self.config.addr,
            in_flight = self.drain.in_flight(),
            "Listener closed, draining connections"
        );

        self.drain.wait().await;

        let callbacks = std::mem::take(&mut *lock(&self.callbacks));
        let mut result = run_callbacks(callbacks);

        if let Err(e) = self.pid_file.release() {
            tracing::warn!(error = %e, "Failed to release PID file");
            if result.is_ok() {
                result = Err(StopError::PidFile(Arc::new(e)));
            }
        }

        if let Some(manager) = &self.manager {
            manager.unregister(self.id);
        }

        let _ = self.outcome.set(result.clone());
        self.lifecycle.send_modify(|lc| {
            lc.state = ServerState::Stopped;
            lc.local_addr = None;
        });

        tracing::info!(addr = %self.config.addr, "Server stopped");
        result
    }
}

/// Run every callback in order. All of them run; the first error is returned.
fn run_callbacks(callbacks: Vec<ShutdownCallback>) -> Result<(), StopError> {
    let mut first_error = None;

    for (index, callback) in callbacks.into_iter().enumerate() {
        if let Err(error) = callback() {
            tracing::warn!(index, error = %error, "Shutdown callback failed");
            if first_error.is_none() {
                first_error = Some(StopError::Callback {
                    index,
                    error: Arc::new(error),
                });
            }
        }
    }

    first_error.map_or(Ok(()), Err)
}

/// Owns the listener for the accept loop and marks it closed when dropped,
/// including when `serve`'s future is cancelled.
struct OpenListener<'a, L> {
    listener: Option<L>,
    open: &'a watch::Sender<bool>,
}

impl<'a, L> OpenListener<'a, L> {
    fn new(listener: L, open: &'a watch::Sender<bool>) -> Self {
        open.send_replace(true);
        Self {
            listener: Some(listener),
            open,
        }
    }
}

impl<L> Drop for OpenListener<'_, L> {
    fn drop(&mut self) {
        drop(self.listener.take());
        self.open.send_replace(false);
    }
}

/// Builder for a [`Server`].
pub struct ServerBuilder {
    config: ServerConfig,
    pid: Option<u32>,
    access_log: Arc<dyn AccessLogHook>,
    manager: Option<Arc<LifecycleManager>>,
}

impl ServerBuilder {
    /// Register with `manager` so process signals stop this server.
    pub fn manager(mut self, manager: &Arc<LifecycleManager>) -> Self {
        self.manager = Some(manager.clone());
        self
    }

    /// Replace the default tracing access log.
    pub fn access_log(mut self, hook: Arc<dyn AccessLogHook>) -> Self {
        self.access_log = hook;
        self
    }

    /// Write `pid` to the PID file instead of the current process id.
    pub fn pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn build(self) -> Server {
        let pid_file = match self.pid {
            Some(pid) => PidFile::with_pid(&self.config.pid_file, pid),
            None => PidFile::new(&self.config.pid_file),
        };
        let (lifecycle, _) = watch::channel(Lifecycle {
            state: ServerState::Idle,
            local_addr: None,
        });
        let (stopping, _) = watch::channel(false);
        let (listener_open, _) = watch::channel(false);

        Server {
            inner: Arc::new(Shared {
                id: NEXT_SERVER_ID.fetch_add(1, Ordering::Relaxed),
                config: self.config,
                pid_file,
                lifecycle,
                stopping,
                listener_open,
                drain: DrainTracker::new(),
                callbacks: Mutex::new(Vec::new()),
                outcome: OnceLock::new(),
                access_log: self.access_log,
                manager: self.manager,
            }),
        }
    }
}

/// One HTTP server with a managed lifecycle. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Shared>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.inner.id)
            .field("addr", &self.inner.config.addr)
            .field("state", &self.state())
            .finish()
    }
}

impl Server {
    pub fn builder(config: ServerConfig) -> ServerBuilder {
        ServerBuilder {
            config,
            pid: None,
            access_log: Arc::new(TracingAccessLog),
            manager: None,
        }
    }

    pub fn new(config: ServerConfig) -> Self {
        Self::builder(config).build()
    }

    pub(crate) fn from_shared(inner: Arc<Shared>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ServerState {
        self.inner.state()
    }

    /// Bound address while serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.lifecycle.borrow().local_addr
    }

    /// Connections currently being served.
    pub fn in_flight(&self) -> usize {
        self.inner.drain.in_flight()
    }

    /// Handle for observing shutdown from outside a request.
    pub fn stop_signal(&self) -> StopSignal {
        StopSignal::new(self.inner.stopping.subscribe())
    }

    /// Wait until the server has left `Idle`/`Starting`; returns the bound
    /// address if it is serving.
    pub async fn ready(&self) -> Option<SocketAddr> {
        let mut rx = self.inner.lifecycle.subscribe();
        let lc = match rx
            .wait_for(|lc| !matches!(lc.state, ServerState::Idle | ServerState::Starting))
            .await
        {
            Ok(lc) => *lc,
            Err(_) => return None,
        };
        match lc.state {
            ServerState::Serving => lc.local_addr,
            _ => None,
        }
    }

    /// Register a callback to run during stop, after all connections drain.
    ///
    /// Callbacks run in registration order. A failing callback does not
    /// prevent later ones from running.
    pub fn on_stop<F>(&self, callback: F)
    where
        F: FnOnce() -> Result<(), BoxError> + Send + 'static,
    {
        lock(&self.inner.callbacks).push(Box::new(callback));
    }

    /// Bind the configured address and serve `router` until stopped.
    ///
    /// Returns `Ok(())` after a stop, or the error that ended serving.
    pub async fn serve(&self, router: Router) -> Result<(), ServeError> {
        self.claim_start()?;
        if let Err(e) = self.inner.pid_file.acquire() {
            self.abort_start(false);
            return Err(e.into());
        }

        let listener = match TcpListener::bind(&self.inner.config.addr).await {
            Ok(listener) => listener,
            Err(source) => {
                self.abort_start(true);
                return Err(ServeError::Bind {
                    addr: self.inner.config.addr.clone(),
                    source,
                });
            }
        };

        self.run(listener, router).await
    }

    /// Serve `router` on an already bound listener until stopped.
    pub async fn serve_on<L: Listener>(&self, listener: L, router: Router) -> Result<(), ServeError> {
        self.claim_start()?;
        if let Err(e) = self.inner.pid_file.acquire() {
            self.abort_start(false);
            return Err(e.into());
        }

        self.run(listener, router).await
    }

    /// Stop serving and wait for the stop sequence to finish.
    ///
    /// Called from a handler running on this server, the drain would wait for
    /// that very handler. There `stop` only waits for the listener to close and
    /// returns `Ok(())`; the rest of the sequence finishes once the handler
    /// returns.
    pub async fn stop(&self) -> Result<(), StopError> {
        let reentrant = connection::current_server() == Some(self.inner.id);

        match self
            .inner
            .transition(&[ServerState::Serving], ServerState::Stopping)
        {
            Ok(()) => {
                // Run detached so a cancelled caller cannot strand the server in Stopping.
                let shared = self.inner.clone();
                let shutdown = tokio::spawn(async move { shared.shutdown().await });
                if reentrant {
                    self.inner.wait_listener_closed().await;
                    return Ok(());
                }
                match shutdown.await {
                    Ok(result) => result,
                    Err(e) => Err(StopError::Aborted(e.to_string())),
                }
            }
            Err(ServerState::Idle) | Err(ServerState::Starting) => Err(StopError::NotServing),
            Err(_) if reentrant => {
                self.inner.wait_listener_closed().await;
                Ok(())
            }
            Err(_) => self.inner.stopped_outcome().await,
        }
    }

    /// Start stopping in the background and return immediately.
    pub fn request_stop(&self) {
        let server = self.clone();
        tokio::spawn(async move {
            if let Err(e) = server.stop().await {
                tracing::warn!(error = %e, "Requested stop failed");
            }
        });
    }

    fn claim_start(&self) -> Result<(), ServeError> {
        match self
            .inner
            .transition(&[ServerState::Idle], ServerState::Starting)
        {
            Ok(()) => Ok(()),
            Err(ServerState::Starting) | Err(ServerState::Serving) => Err(ServeError::AlreadyServing),
            Err(_) => Err(ServeError::AlreadyStopped),
        }
    }

    fn abort_start(&self, release_pid_file: bool) {
        if release_pid_file {
            if let Err(e) = self.inner.pid_file.release() {
                tracing::warn!(error = %e, "Failed to release PID file after failed start");
            }
        }
        let _ = self
            .inner
            .transition(&[ServerState::Starting], ServerState::Idle);
    }

    async fn run<L: Listener>(&self, listener: L, router: Router) -> Result<(), ServeError> {
        let shared = &self.inner;

        let tls = match shared.config.tls_paths() {
            Some((cert, key)) => match tls::load_acceptor(cert, key) {
                Ok(acceptor) => Some(acceptor),
                Err(e) => {
                    self.abort_start(true);
                    return Err(e.into());
                }
            },
            None => None,
        };
        let tls_enabled = tls.is_some();

        let ctx = Arc::new(ConnectionContext::new(
            shared.id,
            router,
            &shared.config,
            tls,
            shared.access_log.clone(),
            self.stop_signal(),
        ));

        let local_addr = listener.local_addr().ok();
        let mut open = OpenListener::new(listener, &shared.listener_open);

        shared.lifecycle.send_modify(|lc| {
            lc.state = ServerState::Serving;
            lc.local_addr = local_addr;
        });
        if let Some(manager) = &shared.manager {
            manager.register(shared);
        }

        tracing::info!(
            addr = %shared.config.addr,
            local_addr = ?local_addr,
            tls = tls_enabled,
            pid_file = %shared.pid_file.path().display(),
            "Server listening"
        );

        let accepted = match open.listener.as_mut() {
            Some(listener) => self.accept_loop(listener, &ctx).await,
            None => Ok(()),
        };
        drop(open);

        match accepted {
            Ok(()) => {
                self.inner.wait_for_state(ServerState::Stopped).await;
                Ok(())
            }
            Err(e) => {
                tracing::error!(addr = %shared.config.addr, error = %e, "Accept loop failed, stopping server");
                if let Err(stop_err) = self.stop().await {
                    tracing::warn!(error = %stop_err, "Stop after accept failure reported an error");
                }
                Err(ServeError::Accept(e))
            }
        }
    }

    async fn accept_loop<L: Listener>(
        &self,
        listener: &mut L,
        ctx: &Arc<ConnectionContext>,
    ) -> io::Result<()> {
        let shared = &self.inner;
        let mut stopping = shared.stopping.subscribe();

        loop {
            tokio::select! {
                biased;

                // Drop the borrowed value inside the branch so the future stays Send
                _ = async { let _ = stopping.wait_for(|stopping| *stopping).await; } => return Ok(()),

                accepted = listener.accept() => match accepted {
                    Ok((io, remote)) => {
                        let guard = shared.drain.enter();
                        tracing::trace!(%remote, in_flight = shared.drain.in_flight(), "Accepted connection");
                        tokio::spawn(connection::serve_connection(io, remote, ctx.clone(), guard));
                    }
                    // Closed because we are stopping, not a transport fault
                    Err(_) if shared.is_stopping() => return Ok(()),
                    Err(e) if is_transient_accept_error(&e) => {
                        tracing::warn!(error = %e, "Transient accept error");
                        if is_resource_exhaustion(&e) {
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }
}
