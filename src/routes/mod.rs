//! Demo routes served by the `vigil` binary.
//!
//! `/stream` shows the cooperative stop hook: it streams ticks until the
//! server begins stopping, then ends the body so the drain can finish.

pub mod health;

use std::convert::Infallible;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::Extension;
use axum::routing::get;
use axum::Router;
use vigil::config::AppConfig;
use vigil::http::StopSignal;

/// Greeting when `[app] greeting` is not configured
const DEFAULT_GREETING: &str = "Hello World!";

/// Delay between `/stream` chunks
const STREAM_TICK: Duration = Duration::from_millis(500);

/// Upper bound on `/stream` chunks
const STREAM_MAX_TICKS: u32 = 120;

pub fn create_router(config: &AppConfig) -> Router {
    let greeting = config
        .string("greeting")
        .unwrap_or(DEFAULT_GREETING)
        .to_string();

    Router::new()
        .route("/", get(move || async move { greeting }))
        .route("/health", get(health::health))
        .route("/stream", get(stream))
}

async fn stream(Extension(stop): Extension<StopSignal>) -> Body {
    let ticks = futures::stream::unfold((0u32, stop), |(tick, stop)| async move {
        if tick >= STREAM_MAX_TICKS || stop.is_stopping() {
            return None;
        }
        if tick > 0 {
            tokio::select! {
                _ = tokio::time::sleep(STREAM_TICK) => {}
                _ = stop.stopped() => return None,
            }
        }
        let chunk = Bytes::from(format!("tick {}\n", tick));
        Some((Ok::<_, Infallible>(chunk), (tick + 1, stop)))
    });

    Body::from_stream(ticks)
}
