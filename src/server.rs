//! TCP server for the request-echo endpoint.
//!
//! Accepts connections, frames HTTP/1.x requests off the raw byte stream,
//! and answers each one with the canonical JSON envelope. One tokio task
//! per connection; no state is shared between connections.

use crate::config::Config;
use crate::envelope::CanonicalEnvelope;
use crate::http::parser::{parse, ParseError, ParseLimits, ParseResult};
use crate::http::request::ParsedRequest;
use crate::http::response;
use bytes::{Buf, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, trace};

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// Server instance
pub struct Server {
    config: Config,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        let connection_limit = Arc::new(Semaphore::new(config.max_connections));
        Server {
            config,
            connection_limit,
        }
    }

    /// Bind the configured address and begin accepting connections.
    ///
    /// A failed bind is fatal and propagates out; per-connection accept
    /// errors are logged and the loop continues.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.listen).await?;
        info!(address = %self.config.listen, "Server listening");
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener.
    async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let limits = ParseLimits {
            max_head_size: self.config.max_head_size,
            max_body_size: self.config.max_body_size,
        };
        let read_timeout = Duration::from_secs(self.config.read_timeout);

        loop {
            // Wait for a connection slot
            let permit = self.connection_limit.clone().acquire_owned().await?;

            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, limits, read_timeout).await {
                            debug!(error = %e, "Connection error");
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

/// Connection loop states. `Responding` owns the request it is answering;
/// `Failed` closes the socket without writing anything back.
#[derive(Debug)]
enum ConnState {
    AwaitingRequest,
    Parsing,
    Responding(ParsedRequest),
    Failed,
    Closed,
}

/// Drive one connection through repeated frame-encode-respond cycles until
/// the peer closes, a response is non-persistent, or framing fails.
///
/// Generic over the stream so tests can run it against in-memory pipes.
/// Pipelining needs no special handling: a completed parse advances the
/// buffer and any bytes behind it are the next request.
async fn handle_connection<S>(
    mut stream: S,
    limits: ParseLimits,
    read_timeout: Duration,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);
    let mut state = ConnState::AwaitingRequest;

    loop {
        state = match state {
            ConnState::AwaitingRequest => {
                if !buffer.is_empty() {
                    // Pipelined bytes already buffered
                    ConnState::Parsing
                } else if read_more(&mut stream, &mut buffer, read_timeout).await? == 0 {
                    trace!("Connection closed by client");
                    ConnState::Closed
                } else {
                    ConnState::Parsing
                }
            }

            ConnState::Parsing => match parse(&buffer, &limits) {
                ParseResult::Complete(request, consumed) => {
                    buffer.advance(consumed);
                    ConnState::Responding(request)
                }
                ParseResult::Incomplete => {
                    if read_more(&mut stream, &mut buffer, read_timeout).await? == 0 {
                        debug!(error = %ParseError::TruncatedBody, "Closing on protocol violation");
                        ConnState::Failed
                    } else {
                        ConnState::Parsing
                    }
                }
                ParseResult::Error(e) => {
                    debug!(error = %e, "Closing on protocol violation");
                    ConnState::Failed
                }
            },

            ConnState::Responding(request) => {
                let envelope = CanonicalEnvelope::encode(&request);
                let json = serde_json::to_vec(&envelope)?;
                let resp = response::render(&request.version, request.persistent, &json);

                stream.write_all(&resp).await?;
                stream.flush().await?;

                if request.persistent {
                    ConnState::AwaitingRequest
                } else {
                    ConnState::Closed
                }
            }

            // No best-effort error response: the socket just closes
            ConnState::Failed => ConnState::Closed,

            ConnState::Closed => break,
        }
    }

    Ok(())
}

/// Read more bytes into the buffer, bounded by the idle timeout.
///
/// A timeout is reported as 0 bytes read, which the loop treats the same
/// way as a peer close.
async fn read_more<S>(
    stream: &mut S,
    buffer: &mut BytesMut,
    read_timeout: Duration,
) -> std::io::Result<usize>
where
    S: AsyncRead + Unpin,
{
    if read_timeout.is_zero() {
        return stream.read_buf(buffer).await;
    }

    match tokio::time::timeout(read_timeout, stream.read_buf(buffer)).await {
        Ok(result) => result,
        Err(_) => {
            trace!("Read timed out");
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};
    use tokio::net::TcpStream;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    fn spawn_loop(server_side: DuplexStream) {
        tokio::spawn(async move {
            let _ = handle_connection(server_side, ParseLimits::default(), TEST_TIMEOUT).await;
        });
    }

    /// Read one HTTP response: head lines, then exactly Content-Length
    /// body bytes.
    async fn read_response<S: AsyncRead + Unpin>(stream: &mut S) -> (String, Vec<u8>) {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            let n = stream.read(&mut byte).await.unwrap();
            assert_ne!(n, 0, "stream closed mid-response");
            head.push(byte[0]);
        }
        let head = String::from_utf8(head).unwrap();

        let content_length: usize = head
            .lines()
            .find_map(|l| l.strip_prefix("Content-Length: "))
            .unwrap()
            .parse()
            .unwrap();

        let mut body = vec![0u8; content_length];
        stream.read_exact(&mut body).await.unwrap();
        (head, body)
    }

    fn decode_field(value: &serde_json::Value) -> Vec<u8> {
        STANDARD.decode(value.as_str().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_round_trip_envelope() {
        let (mut client, server_side) = duplex(BUFFER_SIZE);
        spawn_loop(server_side);

        client
            .write_all(
                b"POST /a?b=c HTTP/1.1\r\nHost: h\r\nX-A: 1\r\nX-A: 2\r\nContent-Length: 5\r\n\r\nhello",
            )
            .await
            .unwrap();

        let (head, body) = read_response(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Type: application/json\r\n"));

        let env: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(decode_field(&env["method"]), b"POST");
        assert_eq!(decode_field(&env["uri"]), b"/a?b=c");
        assert_eq!(decode_field(&env["version"]), b"HTTP/1.1");
        assert_eq!(decode_field(&env["body"]), b"hello");

        let headers = env["headers"].as_array().unwrap();
        let decoded: Vec<(Vec<u8>, Vec<u8>)> = headers
            .iter()
            .map(|pair| (decode_field(&pair[0]), decode_field(&pair[1])))
            .collect();
        assert_eq!(
            decoded,
            vec![
                (b"Host".to_vec(), b"h".to_vec()),
                (b"X-A".to_vec(), b"1".to_vec()),
                (b"X-A".to_vec(), b"2".to_vec()),
                (b"Content-Length".to_vec(), b"5".to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_body_get() {
        let (mut client, server_side) = duplex(BUFFER_SIZE);
        spawn_loop(server_side);

        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let (_, body) = read_response(&mut client).await;
        let env: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(env["body"].as_str().unwrap(), "");
    }

    #[tokio::test]
    async fn test_chunked_reassembly() {
        let (mut client, server_side) = duplex(BUFFER_SIZE);
        spawn_loop(server_side);

        client
            .write_all(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n")
            .await
            .unwrap();
        client.write_all(b"4\r\nWiki\r\n").await.unwrap();
        client.write_all(b"0\r\n\r\n").await.unwrap();

        let (_, body) = read_response(&mut client).await;
        let env: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(decode_field(&env["body"]), b"Wiki");
    }

    #[tokio::test]
    async fn test_pipelined_requests_then_close() {
        let (mut client, server_side) = duplex(BUFFER_SIZE);
        spawn_loop(server_side);

        // Three requests in one write; the third asks for close
        client
            .write_all(
                b"GET /one HTTP/1.1\r\n\r\nGET /two HTTP/1.1\r\n\r\nGET /three HTTP/1.1\r\nConnection: close\r\n\r\n",
            )
            .await
            .unwrap();

        for expected in [&b"/one"[..], b"/two", b"/three"] {
            let (_, body) = read_response(&mut client).await;
            let env: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(decode_field(&env["uri"]), expected);
        }

        // Socket closes after the non-persistent response
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_request_line_closes_without_response() {
        let (mut client, server_side) = duplex(BUFFER_SIZE);
        spawn_loop(server_side);

        client.write_all(b"GET\r\n").await.unwrap();

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_truncated_body_closes_without_response() {
        let (mut client, server_side) = duplex(BUFFER_SIZE);
        spawn_loop(server_side);

        client
            .write_all(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nhi")
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_head_too_large_closes_without_response() {
        let (mut client, server_side) = duplex(BUFFER_SIZE);
        let limits = ParseLimits {
            max_head_size: 128,
            max_body_size: 1024,
        };
        tokio::spawn(async move {
            let _ = handle_connection(server_side, limits, TEST_TIMEOUT).await;
        });

        let raw = format!("GET /{} HTTP/1.1\r\n\r\n", "a".repeat(512));
        client.write_all(raw.as_bytes()).await.unwrap();

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_http10_defaults_to_close() {
        let (mut client, server_side) = duplex(BUFFER_SIZE);
        spawn_loop(server_side);

        client.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();

        let (head, _) = read_response(&mut client).await;
        assert!(head.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(head.contains("Connection: close\r\n"));

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_identical_requests_yield_identical_envelopes() {
        let (mut client, server_side) = duplex(BUFFER_SIZE);
        spawn_loop(server_side);

        let raw = b"GET /same HTTP/1.1\r\nX-K: v\r\n\r\n";
        client.write_all(raw).await.unwrap();
        let (_, first) = read_response(&mut client).await;
        client.write_all(raw).await.unwrap();
        let (_, second) = read_response(&mut client).await;

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_connection() {
        let (mut client, server_side) = duplex(BUFFER_SIZE);
        tokio::spawn(async move {
            let _ = handle_connection(
                server_side,
                ParseLimits::default(),
                Duration::from_millis(50),
            )
            .await;
        });

        // Send nothing; the server should give up and close
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_request_split_across_reads() {
        let req = ParsedRequest {
            method: b"GET".to_vec(),
            target: b"/split".to_vec(),
            version: b"HTTP/1.1".to_vec(),
            headers: vec![(b"Host".to_vec(), b"h".to_vec())],
            body: None,
            persistent: true,
        };
        let json = serde_json::to_vec(&CanonicalEnvelope::encode(&req)).unwrap();
        let expected = response::render(b"HTTP/1.1", true, &json);

        // Dribble the request head in three reads; framing must not care
        // where the read boundaries fall
        let stream = tokio_test::io::Builder::new()
            .read(b"GET /spl")
            .read(b"it HTTP/1.1\r\nHo")
            .read(b"st: h\r\n\r\n")
            .write(&expected)
            .build();

        handle_connection(stream, ParseLimits::default(), Duration::from_millis(50))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_serve_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = Server::new(Config {
            listen: addr.to_string(),
            ..Config::default()
        });
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET /tcp HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let (head, body) = read_response(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        let env: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(decode_field(&env["uri"]), b"/tcp");
    }
}
