//! Building and parsing of individual request/response exchanges.
//!
//! An exchange is one request/response round trip carrying a slice of the
//! logical stream. The codec is stateless: the session id, the destination
//! address and the end-of-data marker are passed in per call, and nothing
//! about the connection is remembered between calls.

use bytes::Bytes;

use crate::{Error, Result};

/// Session identifier, carried on every exchange.
pub const HEADER_CONN_ID: &str = "X-HTTPConn-Id";

/// Destination address, carried on the first exchange of a connection only.
pub const HEADER_DEST_ADDR: &str = "X-HTTPConn-Dest-Addr";

/// End-of-data marker: the sending side has no more bytes for this stream.
pub const HEADER_EOF: &str = "X-HTTPConn-EOF";

pub(crate) const METHOD_POST: &str = "POST";

/// Outbound protocol envelope produced by the request factory.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: &str, target: &str, body: Bytes) -> Self {
        Self {
            method: method.to_owned(),
            target: target.to_owned(),
            headers: Vec::new(),
            body,
        }
    }
}

/// Parsed head of an inbound response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub conn_id: Option<String>,
    pub content_length: usize,
    pub eof: bool,
}

/// Session metadata stamped onto one outbound exchange.
pub(crate) struct ExchangeMeta<'a> {
    pub id: &'a str,
    /// Present on the connection's first exchange only.
    pub dest_addr: Option<&'a str>,
    /// Marks the final exchange of the stream.
    pub eof: bool,
}

/// Serialise `req` with the session metadata attached into wire bytes.
pub(crate) fn encode_request(req: &Request, meta: &ExchangeMeta) -> Vec<u8> {
    let mut head = format!("{} {} HTTP/1.1\r\n", req.method, req.target);
    for (key, value) in &req.headers {
        head.push_str(&format!("{key}: {value}\r\n"));
    }
    head.push_str(&format!("{HEADER_CONN_ID}: {}\r\n", meta.id));
    if let Some(dest) = meta.dest_addr {
        head.push_str(&format!("{HEADER_DEST_ADDR}: {dest}\r\n"));
    }
    if meta.eof {
        head.push_str(&format!("{HEADER_EOF}: true\r\n"));
    }
    head.push_str(&format!("Content-Length: {}\r\n\r\n", req.body.len()));

    let mut out = head.into_bytes();
    out.extend_from_slice(&req.body);
    out
}

/// Parse a complete response head, terminator included.
#[cfg(not(feature = "nom"))]
pub(crate) fn parse_head(input: &str) -> Result<ResponseHead> {
    parse_response_head(input)
}

#[cfg(feature = "nom")]
pub(crate) fn parse_head(input: &str) -> Result<ResponseHead> {
    crate::parse::parse_response_head(input)
}

#[cfg_attr(feature = "nom", allow(dead_code))]
pub(crate) fn parse_response_head(input: &str) -> Result<ResponseHead> {
    let mut lines = input.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| Error::Protocol("empty response head".to_owned()))?;
    interpret_head(status_line, lines)
}

/// Turn a status line and raw header lines into a [`ResponseHead`]. Shared
/// between the hand-written parser and the nom one.
pub(crate) fn interpret_head<'a>(
    status_line: &str,
    lines: impl Iterator<Item = &'a str>,
) -> Result<ResponseHead> {
    let mut parts = status_line.split_whitespace();
    match parts.next() {
        Some(version) if version.starts_with("HTTP/") => {}
        _ => {
            return Err(Error::Protocol(format!(
                "malformed status line: {status_line:?}"
            )))
        }
    }
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Protocol(format!("malformed status line: {status_line:?}")))?;

    let mut conn_id = None;
    let mut content_length = None;
    let mut eof = false;
    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some((key, value)) = line.split_once(':') else {
            return Err(Error::Protocol(format!("malformed header line: {line:?}")));
        };
        let key = key.trim();
        let value = value.trim();
        if key.eq_ignore_ascii_case(HEADER_CONN_ID) {
            conn_id = Some(value.to_owned());
        } else if key.eq_ignore_ascii_case(HEADER_EOF) {
            eof = true;
        } else if key.eq_ignore_ascii_case("Content-Length") {
            let parsed = value
                .parse()
                .map_err(|_| Error::Protocol(format!("bad content length: {value:?}")))?;
            content_length = Some(parsed);
        }
        // other headers are transport detail and ignored
    }

    let content_length = content_length
        .ok_or_else(|| Error::Protocol("response without content length".to_owned()))?;

    Ok(ResponseHead {
        status,
        conn_id,
        content_length,
        eof,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_first_exchange_carries_destination() {
        let req = Request::new(METHOD_POST, "/", Bytes::from_static(b"hello"));
        let meta = ExchangeMeta {
            id: "abc",
            dest_addr: Some("example.com:443"),
            eof: false,
        };
        let wire = encode_request(&req, &meta);
        assert_eq!(
            wire,
            b"POST / HTTP/1.1\r\n\
              X-HTTPConn-Id: abc\r\n\
              X-HTTPConn-Dest-Addr: example.com:443\r\n\
              Content-Length: 5\r\n\r\nhello"
                .to_vec()
        );
    }

    #[test]
    fn encode_later_exchange_omits_destination() {
        let req = Request::new(METHOD_POST, "/", Bytes::new());
        let meta = ExchangeMeta {
            id: "abc",
            dest_addr: None,
            eof: true,
        };
        let wire = encode_request(&req, &meta);
        let text = std::str::from_utf8(&wire).unwrap();
        assert!(!text.contains(HEADER_DEST_ADDR));
        assert!(text.contains("X-HTTPConn-EOF: true\r\n"));
        assert!(text.ends_with("Content-Length: 0\r\n\r\n"));
    }

    #[test]
    fn parse_plain_head() {
        let head = parse_response_head(
            "HTTP/1.1 200 OK\r\nX-HTTPConn-Id: abc\r\nContent-Length: 5\r\n\r\n",
        )
        .unwrap();
        assert_eq!(
            head,
            ResponseHead {
                status: 200,
                conn_id: Some("abc".to_owned()),
                content_length: 5,
                eof: false,
            }
        );
    }

    #[test]
    fn parse_head_with_eof_marker() {
        let head = parse_response_head(
            "HTTP/1.1 200 OK\r\nX-HTTPConn-Id: abc\r\nContent-Length: 0\r\nX-HTTPConn-EOF: true\r\n\r\n",
        )
        .unwrap();
        assert!(head.eof);
        assert_eq!(head.content_length, 0);
    }

    #[test]
    fn header_keys_are_case_insensitive() {
        let head = parse_response_head(
            "HTTP/1.1 200 OK\r\nx-httpconn-id: abc\r\ncontent-length: 3\r\n\r\n",
        )
        .unwrap();
        assert_eq!(head.conn_id.as_deref(), Some("abc"));
        assert_eq!(head.content_length, 3);
    }

    #[test]
    fn missing_content_length_is_rejected() {
        let err = parse_response_head("HTTP/1.1 200 OK\r\nX-HTTPConn-Id: abc\r\n\r\n").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn malformed_header_line_is_rejected() {
        let err =
            parse_response_head("HTTP/1.1 200 OK\r\nnot a header\r\nContent-Length: 0\r\n\r\n")
                .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn malformed_status_line_is_rejected() {
        let err = parse_response_head("garbage\r\nContent-Length: 0\r\n\r\n").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
