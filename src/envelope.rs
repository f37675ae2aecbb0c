//! Canonical request envelope.
//!
//! The fixed JSON contract every echo backend must produce: object keys are
//! exactly `headers`, `body`, `uri`, `method`, `version`, in that order, and
//! every value is base64 (standard alphabet, padded, no wrapping) of the
//! exact bytes the client sent. Decoding the fields must reproduce the
//! request bit-for-bit: no re-encoding, trimming, or case changes.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;

use crate::http::request::ParsedRequest;

/// The canonical JSON envelope for one request.
///
/// Field declaration order is the wire key order; do not reorder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CanonicalEnvelope {
    /// Base64 header pairs, arrival order, duplicates preserved.
    pub headers: Vec<(String, String)>,
    /// Base64 body bytes; empty string when the request had no body.
    pub body: String,
    /// Base64 of the request-target exactly as sent.
    pub uri: String,
    /// Base64 of the method token.
    pub method: String,
    /// Base64 of the version token.
    pub version: String,
}

impl CanonicalEnvelope {
    /// Encode a parsed request. Pure and total: always succeeds, never
    /// touches I/O, and identical input yields an identical envelope.
    pub fn encode(req: &ParsedRequest) -> Self {
        Self {
            headers: req
                .headers
                .iter()
                .map(|(name, value)| (STANDARD.encode(name), STANDARD.encode(value)))
                .collect(),
            body: req.body.as_deref().map(|b| STANDARD.encode(b)).unwrap_or_default(),
            uri: STANDARD.encode(&req.target),
            method: STANDARD.encode(&req.method),
            version: STANDARD.encode(&req.version),
        }
    }
}
