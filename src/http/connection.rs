//! Per-connection serving and request dispatch.
//!
//! Each accepted connection runs in its own task holding a drain guard, so
//! the server's drain wait covers the whole connection including streaming
//! bodies. Requests are wrapped with a request-id span, a [`StopSignal`]
//! extension, and a [`TrackedBody`] feeding the access-log hook.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::Router;
use chrono::Local;
use http::header::CONTENT_LENGTH;
use http::{Request, Response};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tracing::Instrument;
use uuid::Uuid;

use crate::access_log::{AccessLogHook, RequestMeta};
use crate::config::{ServerConfig, MIN_HEADER_BUFFER_BYTES};
use crate::drain::DrainGuard;

use super::response::{Completion, TrackedBody};

tokio::task_local! {
    /// Id of the server whose handler is running on this task.
    static SERVING: u64;
}

/// Server whose handler is currently being polled, if any.
pub(crate) fn current_server() -> Option<u64> {
    SERVING.try_with(|id| *id).ok()
}

/// Request extension identifying one request in logs.
#[derive(Clone, Copy, Debug)]
pub struct RequestId(pub Uuid);

/// Tells handlers that the server is shutting down.
///
/// Inserted into every request's extensions; extract it with
/// `Extension<StopSignal>`. Long-running or streaming handlers should poll
/// [`is_stopping`](Self::is_stopping) or await [`stopped`](Self::stopped)
/// and finish early, since the server waits for them before it can stop.
#[derive(Clone, Debug)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub(crate) fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    pub fn is_stopping(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the server begins stopping.
    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        // A closed channel means the server is gone, which counts as stopped.
        let _ = rx.wait_for(|stopping| *stopping).await;
    }
}

/// Shared, immutable state for every connection of one server.
pub(crate) struct ConnectionContext {
    server_id: u64,
    router: Router,
    http: http1::Builder,
    tls: Option<TlsAcceptor>,
    access_log: Arc<dyn AccessLogHook>,
    stop: StopSignal,
}

impl ConnectionContext {
    #[allow(deprecated)]
    pub fn new(
        server_id: u64,
        router: Router,
        config: &ServerConfig,
        tls: Option<TlsAcceptor>,
        access_log: Arc<dyn AccessLogHook>,
        stop: StopSignal,
    ) -> Self {
        let mut http = http1::Builder::new();
        http.timer(TokioTimer::new());
        if let Some(timeout) = config.read_timeout {
            http.header_read_timeout(timeout);
        }
        if let Some(max) = config.max_header_bytes {
            http.max_buf_size(max.max(MIN_HEADER_BUFFER_BYTES));
        }

        let router = match config.write_timeout {
            Some(timeout) => router.layer(tower_http::timeout::TimeoutLayer::new(timeout)),
            None => router,
        };

        Self {
            server_id,
            router,
            http,
            tls,
            access_log,
            stop,
        }
    }
}

/// Serve one accepted connection to completion.
///
/// `_guard` keeps the connection counted until this function returns.
pub(crate) async fn serve_connection<I>(
    io: I,
    remote: SocketAddr,
    ctx: Arc<ConnectionContext>,
    _guard: DrainGuard,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match &ctx.tls {
        Some(acceptor) => {
            let handshake = acceptor.accept(io);
            let stream = tokio::select! {
                result = handshake => match result {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::debug!(%remote, error = %e, "TLS handshake failed");
                        return;
                    }
                },
                _ = ctx.stop.stopped() => {
                    tracing::debug!(%remote, "Server stopping, abandoning TLS handshake");
                    return;
                }
            };
            serve_http(stream, remote, &ctx).await
        }
        None => serve_http(io, remote, &ctx).await,
    }
}

async fn serve_http<I>(io: I, remote: SocketAddr, ctx: &Arc<ConnectionContext>)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = {
        let ctx = ctx.clone();
        service_fn(move |req| dispatch(req, remote, ctx.clone()))
    };

    let conn = ctx.http.serve_connection(TokioIo::new(io), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = ctx.stop.stopped() => {
            // Finish the in-flight request, then close instead of keeping alive
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    if let Err(e) = result {
        tracing::debug!(%remote, error = %e, "Connection closed with error");
    }
}

async fn dispatch(
    req: Request<Incoming>,
    remote: SocketAddr,
    ctx: Arc<ConnectionContext>,
) -> Result<Response<TrackedBody>, Infallible> {
    let started = Local::now();
    let clock = Instant::now();
    let request_id = Uuid::new_v4();
    let meta = RequestMeta::from_request(&req, remote, request_id);

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %meta.method,
        path = %meta.uri.path(),
    );

    let mut req = req.map(Body::new);
    let extensions = req.extensions_mut();
    extensions.insert(RequestId(request_id));
    extensions.insert(ConnectInfo(remote));
    extensions.insert(ctx.stop.clone());

    let handled = ctx.router.clone().oneshot(req).instrument(span);
    let response = match SERVING.scope(ctx.server_id, handled).await {
        Ok(response) => response,
        Err(never) => match never {},
    };

    let (parts, body) = response.into_parts();
    let content_length = parts
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());

    let completion = Completion {
        request: meta,
        started,
        clock,
        status: parts.status,
        content_length,
        hook: ctx.access_log.clone(),
    };

    Ok(Response::from_parts(parts, TrackedBody::new(body, completion)))
}
