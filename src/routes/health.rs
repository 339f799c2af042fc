//! Liveness probe.

/// Returns "ok" while the process can answer HTTP. Once the server starts
/// stopping, new connections are refused, so probes fail naturally.
pub async fn health() -> &'static str {
    "ok"
}
