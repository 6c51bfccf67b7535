//! Admin/debug surface (component I): unauthenticated operator
//! endpoints separate from the rendezvous transports proper, plus the
//! `SIGHUP` GeoIP reload wiring.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, TextEncoder};

use crate::geoip::GeoIp;
use crate::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/debug", get(debug_handler))
        .route("/metrics", get(metrics_handler))
        .route("/prometheus", get(prometheus_handler))
        .route("/robots.txt", get(robots_handler))
        .with_state(state)
}

async fn debug_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = format!(
        "proxies_unrestricted {}\nproxies_restricted {}\n",
        state.engine.unrestricted_len(),
        state.engine.restricted_len(),
    );
    (StatusCode::OK, body)
}

/// A point-in-time snapshot of the same counters the periodic log report
/// emits, without clearing the window — useful for a human operator
/// checking in mid-window.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let lines = [
        ("client-denied", state.metrics.get("client-denied")),
        ("client-snowflake-match", state.metrics.get("client-snowflake-match")),
        ("client-snowflake-timeout", state.metrics.get("client-snowflake-timeout")),
        ("proxy-total", state.metrics.get("proxy-total")),
    ];
    let body = lines
        .iter()
        .map(|(name, value)| format!("{name} {value}\n"))
        .collect::<String>();
    (StatusCode::OK, body)
}

async fn prometheus_handler(State(state): State<AppState>) -> impl IntoResponse {
    let metric_families = state.metrics.prometheus.registry.gather();
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buf) {
        log::error!("failed to encode prometheus metrics: {err}");
        return (StatusCode::INTERNAL_SERVER_ERROR, Vec::new());
    }
    (StatusCode::OK, buf)
}

async fn robots_handler() -> impl IntoResponse {
    (StatusCode::OK, "User-agent: *\nDisallow: /\n")
}

/// Installs the `SIGHUP` handler that reloads the GeoIP database without
/// restarting the broker. No-op on non-Unix targets.
#[cfg(unix)]
pub fn spawn_sighup_reload(geoip: Arc<GeoIp>) -> tokio::task::JoinHandle<()> {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut stream = match signal(SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(err) => {
                log::error!("failed to install SIGHUP handler: {err}");
                return;
            }
        };

        loop {
            stream.recv().await;
            log::info!("SIGHUP received, reloading GeoIP database");
            geoip.reload();
        }
    })
}

#[cfg(not(unix))]
pub fn spawn_sighup_reload(_geoip: Arc<GeoIp>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async {})
}
