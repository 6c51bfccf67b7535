//! Rendezvous broker: pairs anti-censorship clients with volunteer
//! WebRTC proxies. See `SPEC_FULL.md` at the repository root for the
//! full design; this crate implements it module-for-module.

pub mod admin;
pub mod bridges;
pub mod config;
pub mod engine;
pub mod error;
pub mod geoip;
pub mod heap;
pub mod http;
pub mod metrics;
pub mod pattern;
pub mod scrub;
pub mod sqs;

use std::sync::Arc;

use config::Config;
use engine::MatchingEngine;
use geoip::GeoIp;
use metrics::Metrics;

/// Shared application state handed to every HTTP handler and the SQS
/// transport alike (component J: constructed once at boot, outliving
/// the process only on clean shutdown).
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<MatchingEngine>,
    pub metrics: Arc<Metrics>,
    pub geoip: Arc<GeoIp>,
}

impl AppState {
    pub fn country_of(&self, addr: std::net::IpAddr) -> String {
        self.geoip.lookup(addr)
    }
}

/// Builds the full broker: bridge registry, GeoIP, metrics, and matching
/// engine, from a parsed [`Config`].
pub fn build(config: &Config) -> std::io::Result<AppState> {
    let bridges = Arc::new(load_bridges(config)?);

    let allowed_pattern = pattern::RelayPattern::parse(&config.allowed_relay_pattern)
        .unwrap_or_else(|| pattern::RelayPattern::parse("").expect("empty pattern always parses"));

    let metrics = Metrics::new();

    let engine = MatchingEngine::new(
        metrics.clone(),
        bridges,
        allowed_pattern,
        config.proxy_timeout,
        config.client_timeout,
    );

    let geoip = Arc::new(GeoIp::load(
        config.geoipdb.clone(),
        config.geoip6db.clone(),
        config.disable_geoip,
    ));

    Ok(AppState { engine, metrics, geoip })
}

fn load_bridges(config: &Config) -> std::io::Result<bridges::BridgeRegistry> {
    match &config.bridge_list_path {
        Some(path) => {
            let file = std::fs::File::open(path)?;
            bridges::BridgeRegistry::load_from_reader(std::io::BufReader::new(file))
        }
        None => Ok(bridges::BridgeRegistry::new()),
    }
}

/// Spawns the periodic metrics report task (part of component D/J):
/// every `config.metrics_interval`, formats and clears the counters and
/// writes the block to `sink`.
pub fn spawn_metrics_reporter(
    metrics: Arc<Metrics>,
    interval: std::time::Duration,
    mut sink: Box<dyn std::io::Write + Send>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let now = time_now();
            let report = metrics.format_and_clear(now, interval.as_secs());
            if let Err(err) = sink.write_all(report.as_bytes()) {
                log::error!("failed to write metrics report: {err}");
            }
        }
    })
}

fn time_now() -> time::OffsetDateTime {
    time::OffsetDateTime::now_utc()
}
