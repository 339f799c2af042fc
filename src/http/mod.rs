//! HTTP serving with a managed lifecycle.
//!
//! This module provides the server side of the crate:
//! - **Server**: PID-file guarded serve loop over plain TCP or TLS
//! - **Graceful stop**: listener closed first, in-flight connections drained,
//!   then shutdown callbacks run in order
//! - **LifecycleManager**: fans SIGINT/SIGTERM out to every live server
//!
//! Handlers are plain axum [`Router`](axum::Router)s. Each request carries a
//! [`RequestId`] and a [`StopSignal`] extension.

mod connection;
mod listener;
mod response;
mod server;
mod shutdown;
mod tls;

pub use connection::{RequestId, StopSignal};
pub use listener::Listener;
pub use response::TrackedBody;
pub use server::{BoxError, ServeError, Server, ServerBuilder, ServerState, StopError};
pub use shutdown::{LifecycleError, LifecycleManager};
pub use tls::{load_acceptor, TlsError};
