//! Bridge fingerprint -> relay URL resolution (component B).
//!
//! Loaded once at boot from a reader yielding one JSON object per line.
//! An embedded default record is always present so an empty file (or no
//! `-bridge-list-path` flag) still yields a usable broker.

use std::{collections::HashMap, io::BufRead};

use serde::Deserialize;

use crate::error::BrokerError;

pub const FINGERPRINT_LEN: usize = 20;

#[derive(Debug, Clone)]
pub struct BridgeRecord {
    pub display_name: String,
    pub websocket_address: String,
    pub fingerprint: [u8; FINGERPRINT_LEN],
}

#[derive(Debug, Deserialize)]
struct RawBridgeLine {
    #[serde(rename = "displayName")]
    display_name: String,
    #[serde(rename = "webSocketAddress")]
    websocket_address: String,
    fingerprint: String,
}

/// The broker's built-in default bridge, used whenever a client submits
/// no fingerprint (or a descriptor file is absent/empty).
const DEFAULT_DISPLAY_NAME: &str = "default";
const DEFAULT_WEBSOCKET_ADDRESS: &str = "wss://snowflake.torproject.net/";
const DEFAULT_FINGERPRINT_HEX: &str = "0000000000000000000000000000000000000000";

pub struct BridgeRegistry {
    by_fingerprint: HashMap<[u8; FINGERPRINT_LEN], BridgeRecord>,
    default_fingerprint: [u8; FINGERPRINT_LEN],
}

impl BridgeRegistry {
    /// Builds a registry containing only the embedded default.
    pub fn new() -> Self {
        let default = default_record();
        let default_fingerprint = default.fingerprint;
        let mut by_fingerprint = HashMap::new();
        by_fingerprint.insert(default_fingerprint, default);

        Self {
            by_fingerprint,
            default_fingerprint,
        }
    }

    /// Loads additional records from `reader`, one JSON object per line.
    /// Malformed lines are logged and skipped; they do not abort the load
    /// (per the "do not block boot" philosophy applied elsewhere to
    /// optional external data in the broker).
    pub fn load_from_reader(reader: impl BufRead) -> std::io::Result<Self> {
        let mut registry = Self::new();

        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match parse_line(line) {
                Ok(record) => {
                    registry.by_fingerprint.insert(record.fingerprint, record);
                }
                Err(err) => {
                    log::warn!("bridge-list-path:{}: skipping malformed entry: {err}", lineno + 1);
                }
            }
        }

        Ok(registry)
    }

    /// `GetBridgeInfo`: resolves a 20-byte fingerprint (or the default
    /// bridge, for an empty fingerprint) to its registry record.
    pub fn get_bridge_info(&self, fingerprint: &[u8]) -> Result<&BridgeRecord, BrokerError> {
        let key = if fingerprint.is_empty() {
            self.default_fingerprint
        } else {
            let mut key = [0u8; FINGERPRINT_LEN];
            if fingerprint.len() != FINGERPRINT_LEN {
                return Err(BrokerError::BridgeNotFound);
            }
            key.copy_from_slice(fingerprint);
            key
        };

        self.by_fingerprint.get(&key).ok_or(BrokerError::BridgeNotFound)
    }
}

impl Default for BridgeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn default_record() -> BridgeRecord {
    BridgeRecord {
        display_name: DEFAULT_DISPLAY_NAME.to_string(),
        websocket_address: DEFAULT_WEBSOCKET_ADDRESS.to_string(),
        fingerprint: decode_fingerprint(DEFAULT_FINGERPRINT_HEX).expect("static default fingerprint is valid hex"),
    }
}

fn parse_line(line: &str) -> Result<BridgeRecord, BrokerError> {
    let raw: RawBridgeLine =
        serde_json::from_str(line).map_err(|e| BrokerError::BadRequest(e.to_string()))?;

    let fingerprint = decode_fingerprint(&raw.fingerprint)
        .ok_or_else(|| BrokerError::BadRequest(format!("invalid fingerprint: {}", raw.fingerprint)))?;

    Ok(BridgeRecord {
        display_name: raw.display_name,
        websocket_address: raw.websocket_address,
        fingerprint,
    })
}

fn decode_fingerprint(hex_str: &str) -> Option<[u8; FINGERPRINT_LEN]> {
    let bytes = hex::decode(hex_str).ok()?;
    bytes.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn empty_registry_still_resolves_default() {
        let registry = BridgeRegistry::new();
        let record = registry.get_bridge_info(&[]).unwrap();
        assert_eq!(record.websocket_address, DEFAULT_WEBSOCKET_ADDRESS);
    }

    #[test]
    fn loads_lines_and_resolves_by_fingerprint() {
        let fp = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        let line = format!(
            r#"{{"displayName":"test bridge","webSocketAddress":"wss://example.com/","fingerprint":"{fp}"}}"#
        );
        let registry = BridgeRegistry::load_from_reader(Cursor::new(line)).unwrap();

        let want = decode_fingerprint(fp).unwrap();
        let record = registry.get_bridge_info(&want).unwrap();
        assert_eq!(record.display_name, "test bridge");
        assert_eq!(record.websocket_address, "wss://example.com/");
    }

    #[test]
    fn unknown_fingerprint_is_not_found() {
        let registry = BridgeRegistry::new();
        let unknown = [0xAAu8; FINGERPRINT_LEN];
        assert!(matches!(
            registry.get_bridge_info(&unknown),
            Err(BrokerError::BridgeNotFound)
        ));
    }

    #[test]
    fn malformed_lines_are_skipped_not_fatal() {
        let input = "not json\n{\"displayName\":\"x\"}\n";
        let registry = BridgeRegistry::load_from_reader(Cursor::new(input)).unwrap();
        // only the default remains
        assert!(registry.get_bridge_info(&[]).is_ok());
    }
}
