//! Types describing a registered proxy and the payloads passed through
//! its mailboxes.

use std::fmt;

use tokio::sync::oneshot;

use crate::heap::NOT_IN_HEAP;

/// Opaque ASCII identifier chosen by the proxy itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyId(String);

impl ProxyId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProxyId {
    fn from(s: &str) -> Self {
        ProxyId(s.to_string())
    }
}

impl From<String> for ProxyId {
    fn from(s: String) -> Self {
        ProxyId(s)
    }
}

impl fmt::Display for ProxyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyType {
    Standalone,
    Badge,
    Iptproxy,
    Webext,
    Unknown,
}

impl ProxyType {
    pub fn parse(s: &str) -> Self {
        match s {
            "standalone" => ProxyType::Standalone,
            "badge" => ProxyType::Badge,
            "iptproxy" => ProxyType::Iptproxy,
            "webext" => ProxyType::Webext,
            _ => ProxyType::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyType::Standalone => "standalone",
            ProxyType::Badge => "badge",
            ProxyType::Iptproxy => "iptproxy",
            ProxyType::Webext => "webext",
            ProxyType::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NatType {
    Unrestricted,
    Restricted,
    Unknown,
}

impl NatType {
    pub fn parse(s: &str) -> Self {
        match s {
            "unrestricted" => NatType::Unrestricted,
            "restricted" => NatType::Restricted,
            _ => NatType::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NatType::Unrestricted => "unrestricted",
            NatType::Restricted => "restricted",
            NatType::Unknown => "unknown",
        }
    }
}

/// An offer handed from a client to a matched proxy.
#[derive(Debug, Clone)]
pub struct OfferPayload {
    pub sdp: String,
    pub relay_url: String,
    pub nat_type: NatType,
}

/// A registered proxy, live inside a [`crate::heap::ProxyHeap`] until it
/// is matched with a client or its poll times out.
pub struct Proxy {
    pub id: ProxyId,
    pub proxy_type: ProxyType,
    pub nat_type: NatType,
    /// Self-reported load; the heap key (smaller = preferred).
    pub clients: u32,
    pub relay_pattern: Option<crate::pattern::RelayPattern>,
    /// Current index inside its heap, or [`NOT_IN_HEAP`].
    pub heap_pos: usize,
    /// Single-use sender for the one offer this proxy will ever receive.
    pub offer_tx: Option<oneshot::Sender<OfferPayload>>,
}

impl Proxy {
    pub fn new(
        id: ProxyId,
        proxy_type: ProxyType,
        nat_type: NatType,
        clients: u32,
        relay_pattern: Option<crate::pattern::RelayPattern>,
        offer_tx: oneshot::Sender<OfferPayload>,
    ) -> Self {
        Self {
            id,
            proxy_type,
            nat_type,
            clients,
            relay_pattern,
            heap_pos: NOT_IN_HEAP,
            offer_tx: Some(offer_tx),
        }
    }
}
