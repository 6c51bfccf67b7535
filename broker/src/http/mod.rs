//! HTTP rendezvous transport (component G): direct JSON, AMP-armored
//! GET, and the legacy raw-SDP shim, all built on `axum`.

pub mod amp;

use std::net::SocketAddr;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::engine::proxy::{NatType, ProxyType};
use crate::engine::{AnswerOutcome, ClientOfferRequest};
use crate::error::BrokerError;
use crate::metrics::Transport;
use crate::AppState;

/// Requests bodies are capped at this many bytes; oversize or truncated
/// bodies are a bad request.
pub const MAX_BODY_BYTES: usize = 100_000;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/client", post(client_handler).options(cors_preflight))
        .route("/proxy", post(proxy_handler).options(cors_preflight))
        .route("/answer", post(answer_handler).options(cors_preflight))
        .route("/amp/client/*path", get(amp_client_handler))
        .with_state(state)
        .layer(axum::middleware::from_fn(add_cors_headers))
}

async fn add_cors_headers(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert("Access-Control-Allow-Origin", HeaderValue::from_static("*"));
    headers.insert(
        "Access-Control-Allow-Headers",
        HeaderValue::from_static("Origin, X-Session-ID"),
    );
    response
}

async fn cors_preflight() -> StatusCode {
    StatusCode::OK
}

fn client_ip(connect_info: Option<&ConnectInfo<SocketAddr>>) -> std::net::IpAddr {
    connect_info
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED))
}

async fn read_capped_body(body: axum::body::Body) -> Result<Bytes, BrokerError> {
    axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|_| BrokerError::BadRequest("request body too large or truncated".into()))
}

// ---- /proxy ----

#[derive(Deserialize)]
struct ProxyPollRequest {
    #[serde(rename = "Sid")]
    sid: String,
    #[serde(rename = "Version")]
    #[allow(dead_code)]
    version: String,
    #[serde(rename = "Type")]
    r#type: Option<String>,
    #[serde(rename = "NAT")]
    nat: Option<String>,
    #[serde(rename = "Clients")]
    clients: Option<u32>,
    #[serde(rename = "AcceptedRelayPattern")]
    accepted_relay_pattern: Option<String>,
}

#[derive(Serialize)]
struct ProxyPollResponse {
    #[serde(rename = "Status")]
    status: &'static str,
    #[serde(rename = "Offer")]
    offer: String,
    #[serde(rename = "NAT")]
    nat: String,
    #[serde(rename = "RelayURL")]
    relay_url: String,
}

async fn proxy_handler(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    body: axum::body::Body,
) -> Response {
    let bytes = match read_capped_body(body).await {
        Ok(b) => b,
        Err(err) => return bad_request(&err),
    };

    let req: ProxyPollRequest = match serde_json::from_slice(&bytes) {
        Ok(r) => r,
        Err(err) => return bad_request(&BrokerError::BadRequest(err.to_string())),
    };

    let cc = state.country_of(client_ip(connect_info.as_ref()));
    let proxy_type = req.r#type.as_deref().map_or(ProxyType::Unknown, ProxyType::parse);
    let nat_type = req.nat.as_deref().map_or(NatType::Unknown, NatType::parse);
    let clients = req.clients.unwrap_or(0);

    let offer = state
        .engine
        .request_offer(
            req.sid.as_str().into(),
            proxy_type,
            nat_type,
            clients,
            req.accepted_relay_pattern.as_deref(),
            cc,
        )
        .await;

    let response = match offer {
        Some(offer) => ProxyPollResponse {
            status: "client match",
            offer: offer.sdp,
            nat: offer.nat_type.as_str().to_string(),
            relay_url: offer.relay_url,
        },
        None => ProxyPollResponse {
            status: "no match",
            offer: String::new(),
            nat: String::new(),
            relay_url: String::new(),
        },
    };

    Json(response).into_response()
}

// ---- /answer ----

#[derive(Deserialize)]
struct ProxyAnswerRequest {
    #[serde(rename = "Version")]
    #[allow(dead_code)]
    version: String,
    #[serde(rename = "Sid")]
    sid: String,
    #[serde(rename = "Answer")]
    answer: String,
}

#[derive(Serialize)]
struct ProxyAnswerResponse {
    #[serde(rename = "Status")]
    status: &'static str,
}

async fn answer_handler(State(state): State<AppState>, body: axum::body::Body) -> Response {
    let bytes = match read_capped_body(body).await {
        Ok(b) => b,
        Err(err) => return bad_request(&err),
    };

    let req: ProxyAnswerRequest = match serde_json::from_slice(&bytes) {
        Ok(r) => r,
        Err(err) => return bad_request(&BrokerError::BadRequest(err.to_string())),
    };

    let outcome = state.engine.proxy_answers(&req.sid.as_str().into(), req.answer);
    let status = match outcome {
        AnswerOutcome::Success => "success",
        AnswerOutcome::ClientGone => "client gone",
    };

    Json(ProxyAnswerResponse { status }).into_response()
}

// ---- /client ----

#[derive(Deserialize)]
struct ClientOfferJsonRequest {
    offer: String,
    nat: Option<String>,
    fingerprint: Option<String>,
}

async fn client_handler(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: axum::body::Body,
) -> Response {
    let bytes = match read_capped_body(body).await {
        Ok(b) => b,
        Err(err) => return bad_request(&err),
    };

    let cc = state.country_of(client_ip(connect_info.as_ref()));
    state.metrics.record_client_request(Transport::Http, &cc);

    match serde_json::from_slice::<ClientOfferJsonRequest>(&bytes) {
        Ok(req) => {
            let fingerprint = match decode_fingerprint(req.fingerprint.as_deref()) {
                Ok(fp) => fp,
                Err(err) => return json_error_response(&err),
            };
            let nat_type = req.nat.as_deref().map_or(NatType::Unknown, NatType::parse);

            let result = state
                .engine
                .client_offers(ClientOfferRequest {
                    sdp: req.offer,
                    nat_type,
                    fingerprint,
                })
                .await;

            match result {
                Ok(answer) => Json(json!({ "answer": answer })).into_response(),
                Err(err) => json_error_response(&err),
            }
        }
        Err(_) if bytes.first() == Some(&b'{') => {
            // Legacy shim: treat the whole body as the raw SDP offer.
            legacy_client_handler(state, headers, bytes).await
        }
        Err(err) => bad_request(&BrokerError::BadRequest(err.to_string())),
    }
}

async fn legacy_client_handler(state: AppState, headers: HeaderMap, body: Bytes) -> Response {
    let sdp = String::from_utf8_lossy(&body).into_owned();
    let nat_type = headers
        .get("Snowflake-NAT-Type")
        .and_then(|v| v.to_str().ok())
        .map_or(NatType::Unknown, NatType::parse);

    let result = state
        .engine
        .client_offers(ClientOfferRequest {
            sdp,
            nat_type,
            fingerprint: Vec::new(),
        })
        .await;

    match result {
        Ok(answer) => answer.into_response(),
        Err(BrokerError::NoProxies { .. }) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        Err(BrokerError::Timeout) => StatusCode::GATEWAY_TIMEOUT.into_response(),
        Err(err) => bad_request(&err),
    }
}

fn decode_fingerprint(raw: Option<&str>) -> Result<Vec<u8>, BrokerError> {
    match raw {
        None | Some("") => Ok(Vec::new()),
        Some(hex_str) => {
            hex::decode(hex_str).map_err(|_| BrokerError::BadRequest(format!("invalid fingerprint: {hex_str}")))
        }
    }
}

// ---- /amp/client/<encoded> ----

async fn amp_client_handler(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Path(path): Path<String>,
) -> Response {
    let decoded = match amp::decode(&path) {
        Ok(bytes) => bytes,
        Err(err) => return amp_error_response(&err),
    };

    let req: ClientOfferJsonRequest = match serde_json::from_slice(&decoded) {
        Ok(r) => r,
        Err(err) => return amp_error_response(&BrokerError::BadRequest(err.to_string())),
    };

    let cc = state.country_of(client_ip(connect_info.as_ref()));
    state.metrics.record_client_request(Transport::Amp, &cc);

    let fingerprint = match decode_fingerprint(req.fingerprint.as_deref()) {
        Ok(fp) => fp,
        Err(err) => return amp_error_response(&err),
    };
    let nat_type = req.nat.as_deref().map_or(NatType::Unknown, NatType::parse);

    let result = state
        .engine
        .client_offers(ClientOfferRequest {
            sdp: req.offer,
            nat_type,
            fingerprint,
        })
        .await;

    let payload = match result {
        Ok(answer) => json!({ "answer": answer }),
        Err(err) => json!({ "error": err.to_string() }),
    };

    amp_html_response(&payload)
}

fn amp_html_response(payload: &serde_json::Value) -> Response {
    let armored = amp::encode(payload.to_string().as_bytes());
    (
        StatusCode::OK,
        [("Content-Type", "text/html; charset=utf-8")],
        armored,
    )
        .into_response()
}

fn amp_error_response(err: &BrokerError) -> Response {
    amp_html_response(&json!({ "error": err.to_string() }))
}

fn bad_request(err: &BrokerError) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": err.to_string() }))).into_response()
}

fn json_error_response(err: &BrokerError) -> Response {
    // Per the external interface contract, structured client-offer
    // errors are reported with HTTP 200 and an `error` field, never a
    // non-2xx status (that is reserved for BadRequest and the legacy
    // shim's 503/504).
    Json(json!({ "error": err.to_string() })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_fingerprint_accepts_empty_and_hex() {
        assert_eq!(decode_fingerprint(None).unwrap(), Vec::<u8>::new());
        assert_eq!(decode_fingerprint(Some("")).unwrap(), Vec::<u8>::new());
        assert_eq!(decode_fingerprint(Some("aa")).unwrap(), vec![0xAA]);
    }

    #[test]
    fn decode_fingerprint_rejects_non_hex() {
        assert!(decode_fingerprint(Some("not-hex")).is_err());
    }
}
