//! Lock-free counters, per-country maps, and the periodic textual report
//! (component D).
//!
//! Scalar counters are plain [`AtomicU64`]s behind a small name->counter
//! map; country maps are `parking_lot::Mutex<HashMap<...>>` (contention on
//! these is rare: one increment per rendezvous, not per byte). Binning
//! rounds every externally reported value up to the next multiple of 8 to
//! reduce user re-identifiability; uniqueness tracking counts each
//! `(ip, dimension)` tuple at most once per reporting window.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};

/// Rounds `n` up to the next multiple of 8, per the external-emission
/// binning policy.
pub fn bin_count(n: u64) -> u64 {
    (n + 7) / 8 * 8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Transport {
    Http,
    Amp,
    Sqs,
}

impl Transport {
    fn label(self) -> &'static str {
        match self {
            Transport::Http => "http",
            Transport::Amp => "ampcache",
            Transport::Sqs => "sqs",
        }
    }
}

struct ScalarCounters {
    values: Mutex<HashMap<&'static str, Arc<AtomicU64>>>,
}

impl ScalarCounters {
    fn new() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
        }
    }

    fn handle(&self, name: &'static str) -> Arc<AtomicU64> {
        self.values
            .lock()
            .entry(name)
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }

    fn incr(&self, name: &'static str) {
        self.handle(name).fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self, name: &'static str) -> u64 {
        self.handle(name).load(Ordering::Relaxed)
    }

    fn reset(&self, name: &'static str) {
        self.handle(name).store(0, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct CountryMap {
    counts: HashMap<String, u64>,
}

impl CountryMap {
    fn incr(&mut self, cc: &str) {
        *self.counts.entry(cc.to_string()).or_insert(0) += 1;
    }

    fn clear(&mut self) {
        self.counts.clear();
    }
}

/// Sorts `(cc, count)` pairs by count descending; on ties, by country
/// code descending for raw counts, ascending for already-binned counts
/// (pinned by the broker's metrics test fixture).
pub fn sort_country_counts(mut pairs: Vec<(String, u64)>, binned: bool) -> Vec<(String, u64)> {
    pairs.sort_by(|(cc_a, n_a), (cc_b, n_b)| {
        n_b.cmp(n_a).then_with(|| {
            if binned {
                cc_a.cmp(cc_b)
            } else {
                cc_b.cmp(cc_a)
            }
        })
    });
    pairs
}

fn format_country_map(map: &CountryMap, binned: bool) -> String {
    let pairs: Vec<(String, u64)> = map
        .counts
        .iter()
        .map(|(cc, n)| (cc.clone(), if binned { bin_count(*n) } else { *n }))
        .collect();
    let sorted = sort_country_counts(pairs, binned);
    sorted
        .into_iter()
        .map(|(cc, n)| format!("{cc}={n}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Tracks `(ip, dimension)` tuples seen during the current reporting
/// window so each is counted exactly once, regardless of how many times
/// the same client is observed.
#[derive(Default)]
struct UniqueSeen {
    marks: HashMap<String, ()>,
}

impl UniqueSeen {
    /// Returns `true` the first time `key` is seen this window.
    fn mark(&mut self, key: String) -> bool {
        self.marks.insert(key, ()).is_none()
    }

    fn clear(&mut self) {
        self.marks.clear();
    }
}

pub struct PrometheusMirrors {
    pub registry: Registry,
    matches: IntCounterVec,
    denied: IntCounterVec,
    proxies: IntGaugeVec,
}

impl PrometheusMirrors {
    fn new() -> Self {
        let registry = Registry::new();

        let matches = IntCounterVec::new(
            Opts::new("snowflake_client_match_total", "successful client/proxy pairings"),
            &["outcome"],
        )
        .expect("static metric config");
        let denied = IntCounterVec::new(
            Opts::new("snowflake_client_denied_total", "client offers that found no proxy"),
            &["reason"],
        )
        .expect("static metric config");
        let proxies = IntGaugeVec::new(
            Opts::new("snowflake_proxies_registered", "proxies currently registered"),
            &["nat_type"],
        )
        .expect("static metric config");

        registry.register(Box::new(matches.clone())).expect("unique metric name");
        registry.register(Box::new(denied.clone())).expect("unique metric name");
        registry.register(Box::new(proxies.clone())).expect("unique metric name");

        Self {
            registry,
            matches,
            denied,
            proxies,
        }
    }
}

pub struct Metrics {
    scalars: ScalarCounters,
    proxy_countries: Mutex<CountryMap>,
    transport_countries: Mutex<HashMap<Transport, CountryMap>>,
    unique_seen: Mutex<UniqueSeen>,
    pub prometheus: PrometheusMirrors,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        let mut transport_countries = HashMap::new();
        transport_countries.insert(Transport::Http, CountryMap::default());
        transport_countries.insert(Transport::Amp, CountryMap::default());
        transport_countries.insert(Transport::Sqs, CountryMap::default());

        Arc::new(Self {
            scalars: ScalarCounters::new(),
            proxy_countries: Mutex::new(CountryMap::default()),
            transport_countries: Mutex::new(transport_countries),
            unique_seen: Mutex::new(UniqueSeen::default()),
            prometheus: PrometheusMirrors::new(),
        })
    }

    pub fn incr(&self, name: &'static str) {
        self.scalars.incr(name);
    }

    pub fn get(&self, name: &'static str) -> u64 {
        self.scalars.get(name)
    }

    pub fn record_proxy_poll(&self, proxy_type: crate::engine::proxy::ProxyType, nat_type: crate::engine::proxy::NatType, cc: &str) {
        self.incr("proxy-total");
        match nat_type {
            crate::engine::proxy::NatType::Restricted => self.incr("proxy-nat-restricted"),
            crate::engine::proxy::NatType::Unrestricted => self.incr("proxy-nat-unrestricted"),
            crate::engine::proxy::NatType::Unknown => self.incr("proxy-nat-unknown"),
        }
        self.incr(match proxy_type {
            crate::engine::proxy::ProxyType::Standalone => "proxy-standalone",
            crate::engine::proxy::ProxyType::Badge => "proxy-badge",
            crate::engine::proxy::ProxyType::Iptproxy => "proxy-iptproxy",
            crate::engine::proxy::ProxyType::Webext => "proxy-webext",
            crate::engine::proxy::ProxyType::Unknown => "proxy-unknown",
        });
        self.prometheus.proxies.with_label_values(&[nat_type.as_str()]).inc();

        if self.unique_seen.lock().mark(format!("proxy|addr|{cc}")) {
            self.proxy_countries.lock().incr(cc);
        }
    }

    pub fn record_client_request(&self, transport: Transport, cc: &str) {
        let name = match transport {
            Transport::Http => "client-http",
            Transport::Amp => "client-ampcache",
            Transport::Sqs => "client-sqs",
        };
        self.incr(name);

        if self
            .unique_seen
            .lock()
            .mark(format!("client|{}|addr|{cc}", transport.label()))
        {
            self.transport_countries
                .lock()
                .get_mut(&transport)
                .expect("all transports pre-registered")
                .incr(cc);
        }
    }

    pub fn record_denied(&self, restricted: bool) {
        self.incr("client-denied");
        self.incr(if restricted {
            "client-restricted-denied"
        } else {
            "client-unrestricted-denied"
        });
        self.prometheus
            .denied
            .with_label_values(&[if restricted { "restricted" } else { "unrestricted" }])
            .inc();
    }

    pub fn record_match(&self) {
        self.incr("client-snowflake-match");
        self.prometheus.matches.with_label_values(&["match"]).inc();
    }

    pub fn record_timeout(&self) {
        self.incr("client-snowflake-timeout");
        self.prometheus.matches.with_label_values(&["timeout"]).inc();
    }

    pub fn record_relay_url_poll(&self, carried_pattern: bool, rejected: bool) {
        if rejected {
            self.incr("proxy-poll-rejected-relay-url");
        } else if carried_pattern {
            self.incr("proxy-poll-with-relay-url");
        } else {
            self.incr("proxy-poll-without-relay-url");
        }
    }

    /// Formats and clears the periodic textual report. `timestamp` is the
    /// UTC instant the window ended; `window_secs` the window length.
    pub fn format_and_clear(&self, timestamp: time::OffsetDateTime, window_secs: u64) -> String {
        // Formatted by hand rather than via a `time` format description:
        // `Iso8601` emits a numeric UTC offset (`+00:00`), not a literal
        // `Z`, so the pinned "YYYY-MM-DD HH:MM:SS" shape needs its own
        // component-by-component render.
        let ts = format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            timestamp.year(),
            u8::from(timestamp.month()),
            timestamp.day(),
            timestamp.hour(),
            timestamp.minute(),
            timestamp.second()
        );

        let mut out = String::new();
        out.push_str(&format!("snowflake-stats-end {ts} ({window_secs} s)\n"));

        let proxy_countries = self.proxy_countries.lock();
        out.push_str(&format!("snowflake-ips {}\n", format_country_map(&proxy_countries, false)));
        drop(proxy_countries);

        for (label, name) in [
            ("standalone", "proxy-standalone"),
            ("badge", "proxy-badge"),
            ("iptproxy", "proxy-iptproxy"),
            ("webext", "proxy-webext"),
        ] {
            out.push_str(&format!("snowflake-ips-{label} {}\n", self.get(name)));
        }
        let total = ["proxy-standalone", "proxy-badge", "proxy-iptproxy", "proxy-webext", "proxy-unknown"]
            .iter()
            .map(|n| self.get(n))
            .sum::<u64>();
        out.push_str(&format!("snowflake-ips-total {total}\n"));

        out.push_str(&format!("snowflake-idle-count {}\n", bin_count(self.get("proxy-idle"))));
        out.push_str(&format!(
            "snowflake-proxy-poll-with-relay-url-count {}\n",
            bin_count(self.get("proxy-poll-with-relay-url"))
        ));
        out.push_str(&format!(
            "snowflake-proxy-poll-without-relay-url-count {}\n",
            bin_count(self.get("proxy-poll-without-relay-url"))
        ));
        out.push_str(&format!(
            "snowflake-proxy-rejected-for-relay-url-count {}\n",
            bin_count(self.get("proxy-poll-rejected-relay-url"))
        ));
        out.push_str(&format!("client-denied-count {}\n", bin_count(self.get("client-denied"))));
        out.push_str(&format!(
            "client-restricted-denied-count {}\n",
            bin_count(self.get("client-restricted-denied"))
        ));
        out.push_str(&format!(
            "client-unrestricted-denied-count {}\n",
            bin_count(self.get("client-unrestricted-denied"))
        ));
        out.push_str(&format!(
            "client-snowflake-match-count {}\n",
            bin_count(self.get("client-snowflake-match"))
        ));
        out.push_str(&format!(
            "client-snowflake-timeout-count {}\n",
            bin_count(self.get("client-snowflake-timeout"))
        ));

        let mut transport_countries = self.transport_countries.lock();
        for (transport, count_name, ips_name) in [
            (Transport::Http, "client-http", "client-http"),
            (Transport::Amp, "client-ampcache", "client-ampcache"),
            (Transport::Sqs, "client-sqs", "client-sqs"),
        ] {
            out.push_str(&format!("{count_name}-count {}\n", bin_count(self.get(count_name))));
            let map = transport_countries.get_mut(&transport).expect("pre-registered");
            out.push_str(&format!("{ips_name}-ips {}\n", format_country_map(map, true)));
            map.clear();
        }
        drop(transport_countries);

        out.push_str(&format!("snowflake-ips-nat-restricted {}\n", self.get("proxy-nat-restricted")));
        out.push_str(&format!(
            "snowflake-ips-nat-unrestricted {}\n",
            self.get("proxy-nat-unrestricted")
        ));
        out.push_str(&format!("snowflake-ips-nat-unknown {}\n", self.get("proxy-nat-unknown")));

        self.clear_window();
        out
    }

    /// Zeroes the non-uniqueness counters and clears uniqueness marks, as
    /// the periodic report does after emission.
    fn clear_window(&self) {
        self.proxy_countries.lock().clear();
        self.unique_seen.lock().clear();

        for name in [
            "proxy-total",
            "proxy-nat-restricted",
            "proxy-nat-unrestricted",
            "proxy-nat-unknown",
            "proxy-standalone",
            "proxy-badge",
            "proxy-iptproxy",
            "proxy-webext",
            "proxy-unknown",
            "proxy-idle",
            "proxy-poll-with-relay-url",
            "proxy-poll-without-relay-url",
            "proxy-poll-rejected-relay-url",
            "client-denied",
            "client-restricted-denied",
            "client-unrestricted-denied",
            "client-snowflake-match",
            "client-snowflake-timeout",
            "client-http",
            "client-ampcache",
            "client-sqs",
        ] {
            self.scalars.reset(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bin_count_rounds_up_to_multiple_of_8() {
        assert_eq!(bin_count(0), 0);
        assert_eq!(bin_count(1), 8);
        assert_eq!(bin_count(8), 8);
        assert_eq!(bin_count(9), 16);
        for n in 0..200u64 {
            let b = bin_count(n);
            assert!(b >= n);
            assert_eq!(b % 8, 0);
        }
    }

    #[test]
    fn country_sort_raw_descending_by_count_then_cc_descending() {
        let pairs = vec![
            ("IT".to_string(), 50),
            ("FR".to_string(), 200),
            ("TZ".to_string(), 100),
            ("CN".to_string(), 250),
            ("RU".to_string(), 150),
            ("BE".to_string(), 1),
            ("CA".to_string(), 1),
            ("PH".to_string(), 1),
        ];
        let sorted = sort_country_counts(pairs, false);
        let order: Vec<&str> = sorted.iter().map(|(cc, _)| cc.as_str()).collect();
        assert_eq!(order, vec!["CN", "FR", "RU", "TZ", "IT", "PH", "CA", "BE"]);
    }

    #[test]
    fn country_fixture_binned_and_unbinned_orders() {
        let raw = vec![
            ("IT", 50),
            ("FR", 200),
            ("TZ", 100),
            ("CN", 250),
            ("RU", 150),
            ("CA", 1),
            ("BE", 1),
            ("PH", 1),
            ("AT", 105),
            ("MY", 112),
            ("ZA", 108),
        ]
        .into_iter()
        .map(|(cc, n)| (cc.to_string(), n))
        .collect::<Vec<_>>();

        let unbinned = sort_country_counts(raw.clone(), false);
        let unbinned_order: Vec<&str> = unbinned.iter().map(|(cc, _)| cc.as_str()).collect();
        assert_eq!(
            unbinned_order,
            vec!["CN", "FR", "RU", "MY", "ZA", "AT", "TZ", "IT", "BE", "CA", "PH"]
        );

        let binned: Vec<(String, u64)> = raw.into_iter().map(|(cc, n)| (cc, bin_count(n))).collect();
        let binned = sort_country_counts(binned, true);
        let binned_order: Vec<(&str, u64)> = binned.iter().map(|(cc, n)| (cc.as_str(), *n)).collect();
        assert_eq!(
            binned_order,
            vec![
                ("CN", 256),
                ("FR", 200),
                ("RU", 152),
                ("AT", 112),
                ("MY", 112),
                ("ZA", 112),
                ("TZ", 104),
                ("IT", 56),
                ("BE", 8),
                ("CA", 8),
                ("PH", 8),
            ]
        );
    }

    #[test]
    fn uniqueness_counts_each_ip_once_per_window() {
        let metrics = Metrics::new();
        metrics.record_proxy_poll(
            crate::engine::proxy::ProxyType::Standalone,
            crate::engine::proxy::NatType::Unrestricted,
            "US",
        );
        metrics.record_proxy_poll(
            crate::engine::proxy::ProxyType::Standalone,
            crate::engine::proxy::NatType::Unrestricted,
            "US",
        );
        let proxies = metrics.proxy_countries.lock();
        assert_eq!(proxies.counts.get("US"), Some(&1));
    }

    #[test]
    fn format_and_clear_zeroes_scalars_but_not_totals_before_reading() {
        let metrics = Metrics::new();
        metrics.record_denied(false);
        let report = metrics.format_and_clear(time::OffsetDateTime::UNIX_EPOCH, 86400);
        assert!(report.starts_with("snowflake-stats-end"));
        assert!(report.contains("client-denied-count 8"));
        assert_eq!(metrics.get("client-denied"), 0);
    }

    #[test]
    fn stats_end_header_matches_pinned_format_exactly() {
        let metrics = Metrics::new();
        let report = metrics.format_and_clear(time::OffsetDateTime::UNIX_EPOCH, 86400);
        let header = report.lines().next().unwrap();
        assert_eq!(header, "snowflake-stats-end 1970-01-01 00:00:00 (86400 s)");
    }
}
