//! HTTP/1.x request framer.
//!
//! Incremental parser over a raw byte buffer. The connection loop reads
//! into a buffer and calls [`parse`]; `Incomplete` means "read more bytes
//! and try again", and `Complete` reports how many bytes the request
//! consumed so pipelined requests behind it stay in the buffer.
//!
//! Framing rules:
//! - Request line: exactly three tokens separated by single spaces
//! - Header lines until an empty line; split on the first colon
//! - Body: `Transfer-Encoding: chunked` decoded chunk-by-chunk, else
//!   `Content-Length` read exactly, else no body
//!
//! The request-target is never inspected beyond tokenization. Non-UTF8 or
//! otherwise unparsable targets are carried as opaque bytes; only structural
//! malformation of the line, headers, or body framing is an error.

use crate::http::request::ParsedRequest;

/// Per-request parse limits, resolved from server configuration.
#[derive(Debug, Clone, Copy)]
pub struct ParseLimits {
    /// Maximum size of the request line plus header block, in bytes.
    pub max_head_size: usize,
    /// Maximum decoded body size in bytes.
    pub max_body_size: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            max_head_size: 64 * 1024,
            max_body_size: 16 * 1024 * 1024,
        }
    }
}

/// Protocol parsing errors. All are fatal to the connection: the loop
/// closes the socket without writing a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Request line did not split into exactly three tokens.
    MalformedRequestLine,
    /// Header line without a colon, or unusable framing value
    /// (Content-Length, chunk size line).
    MalformedHeader,
    /// Stream closed before the declared framing was satisfied.
    TruncatedBody,
    /// Request line plus headers exceeded the configured cap.
    HeadTooLarge,
    /// Declared or decoded body exceeded the configured cap.
    BodyTooLarge,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::MalformedRequestLine => write!(f, "Malformed request line"),
            ParseError::MalformedHeader => write!(f, "Malformed header"),
            ParseError::TruncatedBody => write!(f, "Truncated request body"),
            ParseError::HeadTooLarge => write!(f, "Request head too large"),
            ParseError::BodyTooLarge => write!(f, "Request body too large"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Result of a parse attempt against the buffered bytes.
#[derive(Debug)]
pub enum ParseResult {
    /// A full request, and the number of buffer bytes it consumed.
    Complete(ParsedRequest, usize),
    /// The buffer does not yet hold a full request.
    Incomplete,
    /// Structural protocol violation.
    Error(ParseError),
}

/// Try to parse one request from the start of `input`.
pub fn parse(input: &[u8], limits: &ParseLimits) -> ParseResult {
    // Request line
    let line_end = match find_crlf(input) {
        Some(pos) => pos,
        None => {
            if input.len() > limits.max_head_size {
                return ParseResult::Error(ParseError::HeadTooLarge);
            }
            return ParseResult::Incomplete;
        }
    };

    let tokens: Vec<&[u8]> = input[..line_end].split(|&b| b == b' ').collect();
    let &[method, target, version] = tokens.as_slice() else {
        return ParseResult::Error(ParseError::MalformedRequestLine);
    };
    if method.is_empty() || target.is_empty() || version.is_empty() {
        return ParseResult::Error(ParseError::MalformedRequestLine);
    }

    let mut pos = line_end + 2;

    // Header block, terminated by an empty line
    let mut headers: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    loop {
        let line_end = match find_crlf(&input[pos..]) {
            Some(p) => p,
            None => {
                if input.len() > limits.max_head_size {
                    return ParseResult::Error(ParseError::HeadTooLarge);
                }
                return ParseResult::Incomplete;
            }
        };

        let line = &input[pos..pos + line_end];
        pos += line_end + 2;

        if pos > limits.max_head_size {
            return ParseResult::Error(ParseError::HeadTooLarge);
        }

        if line.is_empty() {
            break;
        }

        // Split on the first colon; a line without one is malformed
        let colon = match line.iter().position(|&b| b == b':') {
            Some(p) => p,
            None => return ParseResult::Error(ParseError::MalformedHeader),
        };

        let name = line[..colon].to_vec();
        let value = trim_whitespace(&line[colon + 1..]).to_vec();
        headers.push((name, value));
    }

    // Body framing: chunked wins over Content-Length, else no body
    let body = if has_chunked_encoding(&headers) {
        match read_chunked_body(input, &mut pos, limits) {
            Ok(Some(body)) => Some(body),
            Ok(None) => return ParseResult::Incomplete,
            Err(e) => return ParseResult::Error(e),
        }
    } else if let Some(value) = find_header(&headers, b"content-length") {
        let length = match parse_decimal(value) {
            Some(n) => n,
            None => return ParseResult::Error(ParseError::MalformedHeader),
        };
        if length > limits.max_body_size {
            return ParseResult::Error(ParseError::BodyTooLarge);
        }
        if input.len() < pos + length {
            return ParseResult::Incomplete;
        }
        let body = input[pos..pos + length].to_vec();
        pos += length;
        Some(body)
    } else {
        None
    };

    let persistent = is_persistent(version, &headers);

    ParseResult::Complete(
        ParsedRequest {
            method: method.to_vec(),
            target: target.to_vec(),
            version: version.to_vec(),
            headers,
            body,
            persistent,
        },
        pos,
    )
}

/// Decode a chunked body starting at `*pos`.
///
/// Returns `Ok(None)` when more bytes are needed, and advances `*pos` past
/// the final CRLF on success.
fn read_chunked_body(
    input: &[u8],
    pos: &mut usize,
    limits: &ParseLimits,
) -> Result<Option<Vec<u8>>, ParseError> {
    let mut body = Vec::new();

    loop {
        let line_end = match find_crlf(&input[*pos..]) {
            Some(p) => p,
            None => {
                // A size line that never ends must not grow the buffer
                // past the body cap
                if body.len().saturating_add(input.len() - *pos) > limits.max_body_size {
                    return Err(ParseError::BodyTooLarge);
                }
                return Ok(None);
            }
        };

        // Chunk size is hex, with optional extensions after ';' ignored
        let size_line = &input[*pos..*pos + line_end];
        let size_field = match size_line.iter().position(|&b| b == b';') {
            Some(p) => &size_line[..p],
            None => size_line,
        };
        let size = match parse_hex(trim_whitespace(size_field)) {
            Some(n) => n,
            None => return Err(ParseError::MalformedHeader),
        };
        *pos += line_end + 2;

        if size == 0 {
            // Zero-size chunk must be followed directly by CRLF
            if input.len() < *pos + 2 {
                return Ok(None);
            }
            if &input[*pos..*pos + 2] != b"\r\n" {
                return Err(ParseError::MalformedHeader);
            }
            *pos += 2;
            return Ok(Some(body));
        }

        if body.len().saturating_add(size) > limits.max_body_size {
            return Err(ParseError::BodyTooLarge);
        }
        if input.len() < *pos + size + 2 {
            return Ok(None);
        }

        body.extend_from_slice(&input[*pos..*pos + size]);
        if &input[*pos + size..*pos + size + 2] != b"\r\n" {
            return Err(ParseError::MalformedHeader);
        }
        *pos += size + 2;
    }
}

/// Compute connection persistence from the version default and any explicit
/// `Connection` header. The header always overrides the default; with
/// several recognized tokens the last one wins.
fn is_persistent(version: &[u8], headers: &[(Vec<u8>, Vec<u8>)]) -> bool {
    let mut persistent = version == b"HTTP/1.1";

    for (name, value) in headers {
        if !name.eq_ignore_ascii_case(b"connection") {
            continue;
        }
        for token in value.split(|&b| b == b',') {
            let token = trim_whitespace(token);
            if token.eq_ignore_ascii_case(b"close") {
                persistent = false;
            } else if token.eq_ignore_ascii_case(b"keep-alive") {
                persistent = true;
            }
        }
    }

    persistent
}

/// Whether any `Transfer-Encoding` header lists the `chunked` coding.
fn has_chunked_encoding(headers: &[(Vec<u8>, Vec<u8>)]) -> bool {
    headers.iter().any(|(name, value)| {
        name.eq_ignore_ascii_case(b"transfer-encoding")
            && value
                .split(|&b| b == b',')
                .any(|token| trim_whitespace(token).eq_ignore_ascii_case(b"chunked"))
    })
}

/// First header value with the given (case-insensitive) name.
fn find_header<'a>(headers: &'a [(Vec<u8>, Vec<u8>)], name: &[u8]) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_slice())
}

fn parse_decimal(bytes: &[u8]) -> Option<usize> {
    let s = std::str::from_utf8(bytes).ok()?;
    s.parse().ok()
}

fn parse_hex(bytes: &[u8]) -> Option<usize> {
    let s = std::str::from_utf8(bytes).ok()?;
    usize::from_str_radix(s, 16).ok()
}

fn trim_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|&b| b != b' ' && b != b'\t')
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|&b| b != b' ' && b != b'\t')
        .map_or(start, |p| p + 1);
    &bytes[start..end]
}

/// Find \r\n in buffer, returning the position of \r.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    (0..buffer.len().saturating_sub(1)).find(|&i| buffer[i] == b'\r' && buffer[i + 1] == b'\n')
}
