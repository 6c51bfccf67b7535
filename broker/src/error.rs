//! Unified error type for the broker.
//!
//! Every fallible broker operation funnels into [`BrokerError`] so handlers
//! can map a single type onto the wire-level responses described by the
//! rendezvous protocol: a bad request, no available proxy, a timed-out
//! wait, or a proxy answering for an id the broker no longer tracks.

use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Malformed JSON, oversize body, missing fields, unknown version.
    BadRequest(String),

    /// No compatible proxy was available in the chosen pool.
    NoProxies { restricted: bool },

    /// The matched proxy never answered within the client's deadline.
    Timeout,

    /// A proxy posted an answer for an id the broker no longer tracks.
    ClientGone,

    /// The client's bridge fingerprint has no matching registry entry.
    BridgeNotFound,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::BadRequest(msg) => write!(f, "{msg}"),
            BrokerError::NoProxies { .. } => {
                write!(f, "no snowflake proxies currently available")
            }
            BrokerError::Timeout => write!(f, "timed out waiting for answer!"),
            BrokerError::ClientGone => write!(f, "client gone"),
            BrokerError::BridgeNotFound => write!(f, "bridge not found"),
            BrokerError::Internal(err) => write!(f, "internal error: {err}"),
        }
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::BadRequest(format!("invalid request body: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_strings_match_protocol_fixtures() {
        assert_eq!(
            BrokerError::NoProxies { restricted: false }.to_string(),
            "no snowflake proxies currently available"
        );
        assert_eq!(BrokerError::Timeout.to_string(), "timed out waiting for answer!");
    }
}
