//! Parsed HTTP request record.
//!
//! Everything is kept as raw bytes exactly as it arrived on the wire. The
//! echo contract forbids normalization: header name case, duplicate headers,
//! arrival order, and unparsable request targets all pass through untouched.

/// One inbound request, created fresh per request by the framer and consumed
/// once by the canonical encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    /// Method token, e.g. `GET`. Never empty on a successful parse.
    pub method: Vec<u8>,
    /// Request-target exactly as sent. Raw bytes, never percent-decoded.
    pub target: Vec<u8>,
    /// Protocol version token, e.g. `HTTP/1.1`.
    pub version: Vec<u8>,
    /// Header pairs in arrival order, duplicates preserved, name case
    /// preserved.
    pub headers: Vec<(Vec<u8>, Vec<u8>)>,
    /// Decoded body bytes. `None` only when no body-framing header
    /// (Content-Length or chunked Transfer-Encoding) was present.
    pub body: Option<Vec<u8>>,
    /// Whether the connection stays open after this exchange.
    pub persistent: bool,
}

impl ParsedRequest {
    /// Append a synthesized `("Host", authority)` pair.
    ///
    /// For adapters mapping a pre-parsed request from another HTTP stack
    /// onto this shape: some stacks split the authority out of the header
    /// fields, and the envelope contract expects it back as a header pair.
    #[allow(dead_code)]
    pub fn push_authority(&mut self, authority: &[u8]) {
        self.headers.push((b"Host".to_vec(), authority.to_vec()));
    }
}
