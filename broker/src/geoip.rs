//! GeoIP lookup: an opaque `lookup(ip) -> country-code` function backed
//! by an optional MaxMind database, reloadable on `SIGHUP` without
//! restarting the broker.
//!
//! Absence of a database (no `-geoipdb`/`-geoip6db` flag, or a failed
//! load) is not a boot failure: every address simply maps to the `??`
//! sentinel the test suite expects.

use std::net::IpAddr;
use std::path::PathBuf;

use parking_lot::RwLock;

pub const UNKNOWN_COUNTRY: &str = "??";

struct Databases {
    v4: Option<maxminddb::Reader<Vec<u8>>>,
    v6: Option<maxminddb::Reader<Vec<u8>>>,
}

pub struct GeoIp {
    paths: (Option<PathBuf>, Option<PathBuf>),
    disabled: bool,
    dbs: RwLock<Databases>,
}

impl GeoIp {
    pub fn load(v4_path: Option<PathBuf>, v6_path: Option<PathBuf>, disabled: bool) -> Self {
        let dbs = if disabled {
            Databases { v4: None, v6: None }
        } else {
            Databases {
                v4: v4_path.as_ref().and_then(|p| open_or_log(p)),
                v6: v6_path.as_ref().and_then(|p| open_or_log(p)),
            }
        };

        Self {
            paths: (v4_path, v6_path),
            disabled,
            dbs: RwLock::new(dbs),
        }
    }

    /// Re-opens both database files from their configured paths. Called
    /// on `SIGHUP`; failures are logged and leave the previous database
    /// (or lack thereof) in place.
    pub fn reload(&self) {
        if self.disabled {
            return;
        }

        let v4 = self.paths.0.as_ref().and_then(|p| open_or_log(p));
        let v6 = self.paths.1.as_ref().and_then(|p| open_or_log(p));

        let mut guard = self.dbs.write();
        if v4.is_some() {
            guard.v4 = v4;
        }
        if v6.is_some() {
            guard.v6 = v6;
        }
    }

    /// Maps `addr` to an ISO country code, or [`UNKNOWN_COUNTRY`] if no
    /// database is loaded or the address isn't found.
    pub fn lookup(&self, addr: IpAddr) -> String {
        let dbs = self.dbs.read();
        let reader = match addr {
            IpAddr::V4(_) => dbs.v4.as_ref(),
            IpAddr::V6(_) => dbs.v6.as_ref(),
        };

        let Some(reader) = reader else {
            return UNKNOWN_COUNTRY.to_string();
        };

        reader
            .lookup::<maxminddb::geoip2::Country>(addr)
            .ok()
            .and_then(|country| country.country)
            .and_then(|c| c.iso_code)
            .map(|cc| cc.to_string())
            .unwrap_or_else(|| UNKNOWN_COUNTRY.to_string())
    }
}

fn open_or_log(path: &PathBuf) -> Option<maxminddb::Reader<Vec<u8>>> {
    match maxminddb::Reader::open_readfile(path) {
        Ok(reader) => Some(reader),
        Err(err) => {
            log::warn!("failed to load GeoIP database {}: {err}", path.display());
            None
        }
    }
}
