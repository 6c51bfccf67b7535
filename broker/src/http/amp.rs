//! AMP armor: encodes payload bytes into a path-safe alphabet that
//! survives being proxied through an AMP cache CDN, and decodes the
//! inverse. The cache is only trusted to forward path *segments*
//! unmodified, so the encoded form is broken into bounded-length
//! segments joined by `.`.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

use crate::error::BrokerError;

/// AMP caches have historically mangled very long single path segments;
/// breaking the base64 stream into chunks of this size keeps every
/// segment well under that limit.
const SEGMENT_LEN: usize = 60;

/// Encodes `payload` into a `.`-delimited sequence of URL-safe base64
/// segments.
pub fn encode(payload: &[u8]) -> String {
    let b64 = URL_SAFE_NO_PAD.encode(payload);
    b64.as_bytes()
        .chunks(SEGMENT_LEN)
        .map(|chunk| std::str::from_utf8(chunk).expect("base64 alphabet is ASCII"))
        .collect::<Vec<_>>()
        .join(".")
}

/// Inverts [`encode`]: strips the segment delimiters and decodes the
/// resulting base64 stream.
pub fn decode(armored: &str) -> Result<Vec<u8>, BrokerError> {
    let joined: String = armored.split('.').collect();
    URL_SAFE_NO_PAD
        .decode(joined)
        .map_err(|_| BrokerError::BadRequest("cannot decode URL path".into()))
}
