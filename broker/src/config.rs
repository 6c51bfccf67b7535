//! CLI surface (component K), mirroring the broker process flags.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "snowflake-broker", about = "Rendezvous broker for snowflake proxies")]
pub struct Config {
    /// Address to listen on for HTTP rendezvous and admin endpoints.
    #[arg(long, default_value = "0.0.0.0:443")]
    pub addr: String,

    #[arg(long)]
    pub disable_tls: bool,

    #[arg(long)]
    pub cert: Option<PathBuf>,

    #[arg(long)]
    pub key: Option<PathBuf>,

    #[arg(long)]
    pub acme_hostnames: Option<String>,

    #[arg(long)]
    pub acme_email: Option<String>,

    #[arg(long)]
    pub acme_cert_cache: Option<PathBuf>,

    #[arg(long)]
    pub geoipdb: Option<PathBuf>,

    #[arg(long)]
    pub geoip6db: Option<PathBuf>,

    #[arg(long)]
    pub disable_geoip: bool,

    #[arg(long)]
    pub bridge_list_path: Option<PathBuf>,

    /// Maximally-permissive relay hostname pattern the broker will allow
    /// a proxy to advertise (empty matches every pattern).
    #[arg(long, default_value = "")]
    pub allowed_relay_pattern: String,

    #[arg(long)]
    pub metrics_log: Option<PathBuf>,

    #[arg(long)]
    pub ip_count_log: Option<PathBuf>,

    #[arg(long, default_value_t = 0)]
    pub ip_count_mask: u8,

    #[arg(long, value_parser = parse_duration_secs, default_value = "86400")]
    pub ip_count_interval: Duration,

    #[arg(long)]
    pub unsafe_logging: bool,

    #[arg(long)]
    pub broker_sqs_name: Option<String>,

    #[arg(long)]
    pub broker_sqs_region: Option<String>,

    #[arg(long, value_parser = parse_duration_secs, default_value = "10")]
    pub client_timeout: Duration,

    #[arg(long, value_parser = parse_duration_secs, default_value = "60")]
    pub proxy_timeout: Duration,

    #[arg(long, value_parser = parse_duration_secs, default_value = "86400")]
    pub metrics_interval: Duration,

    /// How long the SQS inbound queue is long-polled for per request.
    #[arg(long, value_parser = parse_duration_secs, default_value = "15")]
    pub sqs_wait_time: Duration,
}

fn parse_duration_secs(s: &str) -> Result<Duration, String> {
    s.parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| format!("invalid duration: {e}"))
}

impl Config {
    pub fn from_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_timeouts() {
        let cfg = Config::parse_from(["snowflake-broker"]);
        assert_eq!(cfg.client_timeout, Duration::from_secs(10));
        assert_eq!(cfg.proxy_timeout, Duration::from_secs(60));
        assert_eq!(cfg.metrics_interval, Duration::from_secs(86400));
        assert_eq!(cfg.sqs_wait_time, Duration::from_secs(15));
        assert_eq!(cfg.allowed_relay_pattern, "");
    }
}
