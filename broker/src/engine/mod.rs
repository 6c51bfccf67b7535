//! The matching engine (component F): the broker's heart.
//!
//! Owns the two proxy heaps and an id-index behind a single
//! `parking_lot::Mutex`, and a dedicated "matcher" task that is the sole
//! writer of new registrations, so poll requests are processed in
//! arrival order even though `RequestOffer`/`ClientOffers`/`ProxyAnswers`
//! are called concurrently from many request handlers.

pub mod proxy;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::bridges::BridgeRegistry;
use crate::error::BrokerError;
use crate::heap::ProxyHeap;
use crate::metrics::Metrics;
use crate::pattern::RelayPattern;

use proxy::{NatType, OfferPayload, Proxy, ProxyId, ProxyType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pool {
    Unrestricted,
    Restricted,
}

enum IndexEntry {
    /// Registered, still sitting in `pool`'s heap.
    Pending(Pool),
    /// An offer has been handed off; awaiting this proxy's answer.
    AwaitingAnswer(oneshot::Sender<String>),
}

#[derive(Default)]
struct Shared {
    unrestricted: ProxyHeap,
    restricted: ProxyHeap,
    id_index: HashMap<ProxyId, IndexEntry>,
}

impl Shared {
    fn heap_mut(&mut self, pool: Pool) -> &mut ProxyHeap {
        match pool {
            Pool::Unrestricted => &mut self.unrestricted,
            Pool::Restricted => &mut self.restricted,
        }
    }
}

struct PollRequest {
    id: ProxyId,
    proxy_type: ProxyType,
    nat_type: NatType,
    clients: u32,
    relay_pattern: Option<RelayPattern>,
    cc: String,
    reply_tx: oneshot::Sender<Option<OfferPayload>>,
}

/// A client's offer, ready to be matched against a registered proxy.
pub struct ClientOfferRequest {
    pub sdp: String,
    pub nat_type: NatType,
    /// Raw fingerprint bytes; empty means "default bridge".
    pub fingerprint: Vec<u8>,
}

pub enum AnswerOutcome {
    Success,
    ClientGone,
}

pub struct MatchingEngine {
    shared: Arc<Mutex<Shared>>,
    metrics: Arc<Metrics>,
    bridges: Arc<BridgeRegistry>,
    allowed_pattern: RelayPattern,
    proxy_timeout: Duration,
    client_timeout: Duration,
    request_tx: mpsc::UnboundedSender<PollRequest>,
}

impl MatchingEngine {
    pub fn new(
        metrics: Arc<Metrics>,
        bridges: Arc<BridgeRegistry>,
        allowed_pattern: RelayPattern,
        proxy_timeout: Duration,
        client_timeout: Duration,
    ) -> Arc<Self> {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let (request_tx, request_rx) = mpsc::unbounded_channel();

        let engine = Arc::new(Self {
            shared: shared.clone(),
            metrics: metrics.clone(),
            bridges,
            allowed_pattern,
            proxy_timeout,
            client_timeout,
            request_tx,
        });

        tokio::spawn(run_matcher(shared, metrics, proxy_timeout, request_rx));

        engine
    }

    /// `RequestOffer`: registers a proxy and waits for either an offer or
    /// the poll-timeout. Returns `None` on timeout (the proxy should
    /// report "no match" and poll again).
    pub async fn request_offer(
        &self,
        id: ProxyId,
        proxy_type: ProxyType,
        nat_type: NatType,
        clients: u32,
        relay_pattern_raw: Option<&str>,
        cc: String,
    ) -> Option<OfferPayload> {
        let relay_pattern = self.validate_relay_pattern(relay_pattern_raw);

        let (reply_tx, reply_rx) = oneshot::channel();
        let req = PollRequest {
            id,
            proxy_type,
            nat_type,
            clients,
            relay_pattern,
            cc,
            reply_tx,
        };

        if self.request_tx.send(req).is_err() {
            return None;
        }

        reply_rx.await.ok().flatten()
    }

    fn validate_relay_pattern(&self, raw: Option<&str>) -> Option<RelayPattern> {
        let Some(raw) = raw else {
            self.metrics.record_relay_url_poll(false, false);
            return None;
        };

        match RelayPattern::parse(raw) {
            Some(pattern) if pattern.is_superset_of(&self.allowed_pattern) => {
                self.metrics.record_relay_url_poll(true, false);
                Some(pattern)
            }
            _ => {
                self.metrics.record_relay_url_poll(true, true);
                None
            }
        }
    }

    /// `ClientOffers`: resolves the bridge, picks a compatible pool, pops
    /// a proxy, hands off the offer, and waits for the answer.
    pub async fn client_offers(&self, offer: ClientOfferRequest) -> Result<String, BrokerError> {
        let bridge = self.bridges.get_bridge_info(&offer.fingerprint)?;
        let relay_url = bridge.websocket_address.clone();
        let is_default_bridge = offer.fingerprint.is_empty();
        let relay_host = if is_default_bridge { None } else { host_of(&relay_url) };

        let is_restricted_client = matches!(offer.nat_type, NatType::Restricted);

        let popped = {
            let mut shared = self.shared.lock();
            let result = match offer.nat_type {
                NatType::Unrestricted => pop_eligible(&mut shared.restricted, relay_host)
                    .or_else(|| pop_eligible(&mut shared.unrestricted, relay_host)),
                NatType::Restricted | NatType::Unknown => pop_eligible(&mut shared.unrestricted, relay_host),
            };

            result.map(|proxy| {
                let (answer_tx, answer_rx) = oneshot::channel();
                shared.id_index.insert(proxy.id.clone(), IndexEntry::AwaitingAnswer(answer_tx));
                (proxy, answer_rx)
            })
        };

        let Some((mut proxy, answer_rx)) = popped else {
            self.metrics.record_denied(is_restricted_client);
            return Err(BrokerError::NoProxies {
                restricted: is_restricted_client,
            });
        };

        let proxy_id = proxy.id.clone();
        let offer_tx = proxy.offer_tx.take().expect("freshly popped proxy still owns its offer sender");
        let _ = offer_tx.send(OfferPayload {
            sdp: offer.sdp,
            relay_url,
            nat_type: offer.nat_type,
        });

        match tokio::time::timeout(self.client_timeout, answer_rx).await {
            Ok(Ok(answer)) => {
                self.metrics.record_match();
                Ok(answer)
            }
            Ok(Err(_)) => {
                self.metrics.record_timeout();
                Err(BrokerError::Timeout)
            }
            Err(_elapsed) => {
                self.shared.lock().id_index.remove(&proxy_id);
                self.metrics.record_timeout();
                Err(BrokerError::Timeout)
            }
        }
    }

    /// `ProxyAnswers`: routes `sdp` to the client awaiting this proxy's
    /// answer, or reports the proxy/client as gone.
    pub fn proxy_answers(&self, id: &ProxyId, sdp: String) -> AnswerOutcome {
        let mut shared = self.shared.lock();
        match shared.id_index.remove(id) {
            Some(IndexEntry::AwaitingAnswer(answer_tx)) => {
                // A dropped receiver means the client already gave up;
                // the answer is simply discarded.
                let _ = answer_tx.send(sdp);
                AnswerOutcome::Success
            }
            Some(pending @ IndexEntry::Pending(_)) => {
                // A proxy answering before being matched: restore the
                // entry untouched and report it as unroutable.
                shared.id_index.insert(id.clone(), pending);
                AnswerOutcome::ClientGone
            }
            None => AnswerOutcome::ClientGone,
        }
    }

    pub fn unrestricted_len(&self) -> usize {
        self.shared.lock().unrestricted.len()
    }

    pub fn restricted_len(&self) -> usize {
        self.shared.lock().restricted.len()
    }
}

async fn run_matcher(
    shared: Arc<Mutex<Shared>>,
    metrics: Arc<Metrics>,
    proxy_timeout: Duration,
    mut request_rx: mpsc::UnboundedReceiver<PollRequest>,
) {
    while let Some(req) = request_rx.recv().await {
        let PollRequest {
            id,
            proxy_type,
            nat_type,
            clients,
            relay_pattern,
            cc,
            reply_tx,
        } = req;

        let (offer_tx, offer_rx) = oneshot::channel();
        let proxy = Proxy::new(id.clone(), proxy_type, nat_type, clients, relay_pattern, offer_tx);
        let pool = match nat_type {
            NatType::Restricted => Pool::Restricted,
            NatType::Unrestricted | NatType::Unknown => Pool::Unrestricted,
        };

        {
            let mut guard = shared.lock();
            guard.heap_mut(pool).push(proxy);
            guard.id_index.insert(id.clone(), IndexEntry::Pending(pool));
        }

        metrics.record_proxy_poll(proxy_type, nat_type, &cc);

        let shared = shared.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(proxy_timeout, offer_rx).await {
                Ok(Ok(offer)) => {
                    let _ = reply_tx.send(Some(offer));
                }
                Ok(Err(_)) => {
                    let _ = reply_tx.send(None);
                }
                Err(_elapsed) => {
                    let mut guard = shared.lock();
                    let still_pending = matches!(guard.id_index.get(&id), Some(IndexEntry::Pending(p)) if *p == pool);
                    if still_pending {
                        guard.id_index.remove(&id);
                        guard.heap_mut(pool).remove(&id);
                        metrics.incr("proxy-idle");
                    }
                    drop(guard);
                    let _ = reply_tx.send(None);
                }
            }
        });
    }
}

/// Pops the minimum-`clients` proxy that can serve `relay_host` (or, if
/// `relay_host` is `None`, the default relay that every proxy serves).
/// Ineligible proxies popped along the way are pushed back so the heap's
/// ordering is unaffected.
fn pop_eligible(heap: &mut ProxyHeap, relay_host: Option<&str>) -> Option<Proxy> {
    let Some(host) = relay_host else {
        return heap.pop_min();
    };

    let mut stash = Vec::new();
    let found = loop {
        match heap.pop_min() {
            None => break None,
            Some(p) => {
                let eligible = p.relay_pattern.as_ref().is_some_and(|pat| pat.is_member(host));
                if eligible {
                    break Some(p);
                }
                stash.push(p);
            }
        }
    };

    for p in stash {
        heap.push(p);
    }

    found
}

fn host_of(url: &str) -> Option<&str> {
    let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    let host = without_scheme.split(['/', ':']).next()?;
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridges::BridgeRegistry;
    use std::time::Duration;

    fn test_engine() -> Arc<MatchingEngine> {
        MatchingEngine::new(
            Metrics::new(),
            Arc::new(BridgeRegistry::new()),
            RelayPattern::parse("").unwrap(),
            Duration::from_millis(200),
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn client_with_no_proxies_is_denied() {
        let engine = test_engine();
        let result = engine
            .client_offers(ClientOfferRequest {
                sdp: "offer-sdp".into(),
                nat_type: NatType::Unknown,
                fingerprint: vec![],
            })
            .await;
        assert!(matches!(result, Err(BrokerError::NoProxies { restricted: false })));
    }

    #[tokio::test]
    async fn unknown_fingerprint_is_denied_even_with_proxies_available() {
        let engine = test_engine();
        let engine2 = engine.clone();
        tokio::spawn(async move {
            let _ = engine2
                .request_offer(
                    ProxyId::from("p1"),
                    ProxyType::Standalone,
                    NatType::Unrestricted,
                    0,
                    None,
                    "??".to_string(),
                )
                .await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = engine
            .client_offers(ClientOfferRequest {
                sdp: "offer-sdp".into(),
                nat_type: NatType::Unknown,
                fingerprint: vec![0xAA; 20],
            })
            .await;
        assert!(matches!(result, Err(BrokerError::BridgeNotFound)));
    }

    #[tokio::test]
    async fn full_rendezvous_round_trip() {
        let engine = test_engine();
        let engine2 = engine.clone();
        let poll = tokio::spawn(async move {
            engine2
                .request_offer(
                    ProxyId::from("p1"),
                    ProxyType::Standalone,
                    NatType::Unrestricted,
                    0,
                    None,
                    "US".to_string(),
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;

        let engine3 = engine.clone();
        let client = tokio::spawn(async move {
            engine3
                .client_offers(ClientOfferRequest {
                    sdp: "client-sdp".into(),
                    nat_type: NatType::Unrestricted,
                    fingerprint: vec![],
                })
                .await
        });

        let offer = poll.await.unwrap().expect("offer should be delivered");
        assert_eq!(offer.sdp, "client-sdp");

        let outcome = engine.proxy_answers(&ProxyId::from("p1"), "proxy-answer-sdp".into());
        assert!(matches!(outcome, AnswerOutcome::Success));

        let answer = client.await.unwrap().expect("client should receive answer");
        assert_eq!(answer, "proxy-answer-sdp");
    }

    #[tokio::test]
    async fn poll_response_reports_clients_nat_type_not_the_proxys_own() {
        let engine = test_engine();
        let engine2 = engine.clone();
        let poll = tokio::spawn(async move {
            engine2
                .request_offer(
                    ProxyId::from("p2"),
                    ProxyType::Standalone,
                    NatType::Unrestricted,
                    0,
                    None,
                    "US".to_string(),
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;

        let engine3 = engine.clone();
        let client = tokio::spawn(async move {
            engine3
                .client_offers(ClientOfferRequest {
                    sdp: "client-sdp".into(),
                    nat_type: NatType::Restricted,
                    fingerprint: vec![],
                })
                .await
        });

        let offer = poll.await.unwrap().expect("offer should be delivered");
        assert_eq!(offer.nat_type, NatType::Restricted);

        let _ = client.await.unwrap();
    }

    #[tokio::test]
    async fn restricted_client_never_paired_with_restricted_proxy() {
        let engine = test_engine();
        let engine2 = engine.clone();
        tokio::spawn(async move {
            let _ = engine2
                .request_offer(
                    ProxyId::from("restricted-proxy"),
                    ProxyType::Standalone,
                    NatType::Restricted,
                    0,
                    None,
                    "US".to_string(),
                )
                .await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = engine
            .client_offers(ClientOfferRequest {
                sdp: "offer-sdp".into(),
                nat_type: NatType::Restricted,
                fingerprint: vec![],
            })
            .await;
        assert!(matches!(result, Err(BrokerError::NoProxies { restricted: true })));
    }

    #[tokio::test]
    async fn proxy_poll_times_out_without_a_client() {
        let engine = test_engine();
        let offer = engine
            .request_offer(
                ProxyId::from("lonely"),
                ProxyType::Standalone,
                NatType::Unrestricted,
                0,
                None,
                "US".to_string(),
            )
            .await;
        assert!(offer.is_none());
        assert_eq!(engine.unrestricted_len(), 0);
    }

    #[tokio::test]
    async fn answer_for_unknown_proxy_is_client_gone() {
        let engine = test_engine();
        let outcome = engine.proxy_answers(&ProxyId::from("ghost"), "sdp".into());
        assert!(matches!(outcome, AnswerOutcome::ClientGone));
    }

    #[test]
    fn host_of_extracts_host_from_websocket_url() {
        assert_eq!(host_of("wss://snowflake.torproject.net/"), Some("snowflake.torproject.net"));
        assert_eq!(host_of("wss://example.com:443/path"), Some("example.com"));
    }
}
