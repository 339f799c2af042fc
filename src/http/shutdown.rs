//! Process-wide lifecycle manager and signal routing.
//!
//! One [`LifecycleManager`] is built at startup and handed to every server.
//! Servers register when they start serving and unregister when they stop.
//! After [`LifecycleManager::start`], a SIGINT or SIGTERM stops every
//! registered server concurrently, so total shutdown time is bounded by the
//! slowest drain rather than the sum of all drains.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::server::{Server, Shared, StopError};

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Failed to install signal handler: {0}")]
    Signal(#[source] io::Error),

    #[error("Signal watcher is already running")]
    AlreadyStarted,
}

/// Registry of live servers plus the task that routes OS signals to them.
pub struct LifecycleManager {
    servers: Mutex<HashMap<u64, Weak<Shared>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    /// Number of completed signal-driven shutdowns
    interrupts: watch::Sender<u64>,
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("servers", &self.len())
            .field("watching", &self.is_watching())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LifecycleManager {
    pub fn new() -> Arc<Self> {
        let (interrupts, _) = watch::channel(0);
        Arc::new(Self {
            servers: Mutex::new(HashMap::new()),
            watcher: Mutex::new(None),
            interrupts,
        })
    }

    pub(crate) fn register(&self, server: &Arc<Shared>) {
        lock(&self.servers).insert(server.id(), Arc::downgrade(server));
        tracing::debug!(server_id = server.id(), "Server registered");
    }

    pub(crate) fn unregister(&self, id: u64) {
        if lock(&self.servers).remove(&id).is_some() {
            tracing::debug!(server_id = id, "Server unregistered");
        }
    }

    /// Number of registered servers.
    pub fn len(&self) -> usize {
        lock(&self.servers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live_servers(&self) -> Vec<Server> {
        let mut servers = lock(&self.servers);
        servers.retain(|_, weak| weak.strong_count() > 0);
        servers
            .values()
            .filter_map(Weak::upgrade)
            .map(Server::from_shared)
            .collect()
    }

    /// Stop every registered server concurrently and wait for all of them.
    ///
    /// Returns each server's id with its stop outcome. With no servers
    /// registered this returns immediately.
    pub async fn interrupt(&self) -> Vec<(u64, Result<(), StopError>)> {
        let servers = self.live_servers();
        if servers.is_empty() {
            tracing::debug!("No servers registered, nothing to stop");
            return Vec::new();
        }

        tracing::info!(servers = servers.len(), "Stopping all servers");
        join_all(servers.into_iter().map(|server| async move {
            let result = server.stop().await;
            if let Err(e) = &result {
                tracing::warn!(server_id = server.id(), error = %e, "Server stopped with error");
            }
            (server.id(), result)
        }))
        .await
    }

    /// Install SIGINT and SIGTERM handlers and spawn the dispatcher task.
    ///
    /// Must be called from within a tokio runtime. Handlers are installed
    /// before this returns, so a signal sent right after is not missed.
    pub fn start(self: &Arc<Self>) -> Result<(), LifecycleError> {
        let mut watcher = lock(&self.watcher);
        if watcher.as_ref().is_some_and(|task| !task.is_finished()) {
            return Err(LifecycleError::AlreadyStarted);
        }

        let mut signals = Signals::install()?;
        let manager = Arc::downgrade(self);

        *watcher = Some(tokio::spawn(async move {
            loop {
                signals.recv().await;

                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.interrupt().await;
                manager.interrupts.send_modify(|n| *n += 1);
                tracing::info!("Signal-driven shutdown complete");
            }
        }));

        tracing::debug!("Signal watcher started");
        Ok(())
    }

    /// Stop watching for signals. Registered servers keep running.
    pub fn stop(&self) {
        if let Some(task) = lock(&self.watcher).take() {
            task.abort();
            tracing::debug!("Signal watcher stopped");
        }
    }

    pub fn is_watching(&self) -> bool {
        lock(&self.watcher)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Resolves once a signal-driven shutdown has stopped every registered server.
    pub async fn wait_interrupted(&self) {
        let mut rx = self.interrupts.subscribe();
        let _ = rx.wait_for(|n| *n > 0).await;
    }
}

impl Drop for LifecycleManager {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.watcher).take() {
            task.abort();
        }
    }
}

/// The OS signals that trigger a graceful shutdown.
struct Signals {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl Signals {
    #[cfg(unix)]
    fn install() -> Result<Self, LifecycleError> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt()).map_err(LifecycleError::Signal)?,
            terminate: signal(SignalKind::terminate()).map_err(LifecycleError::Signal)?,
        })
    }

    #[cfg(not(unix))]
    fn install() -> Result<Self, LifecycleError> {
        Ok(Self {})
    }

    #[cfg(unix)]
    async fn recv(&mut self) {
        tokio::select! {
            _ = self.interrupt.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = self.terminate.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    async fn recv(&mut self) {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received Ctrl+C, initiating graceful shutdown"),
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await
            }
        }
    }
}
