//! Vigil - lifecycle shell for HTTP servers
//!
//! Wraps an axum router with a PID-file guarded serve loop, graceful
//! connection draining, ordered shutdown callbacks, process-wide signal
//! routing, and a PID-file based protocol for stopping a server from another
//! process.

pub mod access_log;
pub mod config;
#[cfg(unix)]
pub mod daemon;
pub mod drain;
pub mod http;
pub mod pidfile;
#[cfg(unix)]
pub mod remote;

pub use config::{AppConfig, ConfigError, ServerConfig};
pub use drain::{DrainGuard, DrainTimeout, DrainTracker};
pub use http::{
    LifecycleManager, ServeError, Server, ServerBuilder, ServerState, StopError, StopSignal,
};
pub use pidfile::{PidFile, PidFileError};
#[cfg(unix)]
pub use remote::{force_kill, stop_remote, RemoteStop, RemoteStopError};
