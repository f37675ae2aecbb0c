//! HTTP/1.x response serialization.
//!
//! Every successful parse is answered with a single 200 response carrying
//! the canonical JSON envelope. The whole response is assembled into one
//! buffer so the connection loop can hand it to a single `write_all` and
//! partial responses are never observed on the wire.

use bytes::{BufMut, BytesMut};

/// Serialize a 200 response around the already-encoded envelope JSON.
///
/// The status line mirrors the request's negotiated version; `Connection:
/// close` is added only when the exchange ends the connection.
pub fn render(version: &[u8], persistent: bool, json: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(json.len() + 128);

    if version == b"HTTP/1.0" {
        buf.put_slice(b"HTTP/1.0 200 OK\r\n");
    } else {
        buf.put_slice(b"HTTP/1.1 200 OK\r\n");
    }
    buf.put_slice(b"Content-Type: application/json\r\n");
    buf.put_slice(format!("Content-Length: {}\r\n", json.len()).as_bytes());
    if !persistent {
        buf.put_slice(b"Connection: close\r\n");
    }
    buf.put_slice(b"\r\n");
    buf.put_slice(json);

    buf
}
