//! HTTP front door
//!
//! Reads the request head of a fresh connection and decides whether it is a
//! WebSocket upgrade or a plain request that gets the fixed status page.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::protocol::{ProtocolError, ProtocolResult, PLAIN_BODY};

/// Maximum size of a request head (request line + headers)
pub const MAX_HEAD_SIZE: usize = 8 * 1024;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Parsed request line and headers
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub version: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Parse a complete request head, terminating blank line included
    pub fn parse(raw: &[u8]) -> ProtocolResult<Self> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| ProtocolError::HandshakeMalformed("request head is not UTF-8".into()))?;
        let mut lines = text.split("\r\n");

        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();
        let (method, path, version) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(p), Some(v)) => (m.to_string(), p.to_string(), v.to_string()),
            _ => {
                return Err(ProtocolError::HandshakeMalformed(format!(
                    "invalid request line: {request_line:?}"
                )))
            }
        };

        let mut headers = Vec::new();
        for line in lines.filter(|l| !l.is_empty()) {
            let (name, value) = line.split_once(':').ok_or_else(|| {
                ProtocolError::HandshakeMalformed(format!("invalid header line: {line:?}"))
            })?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self {
            method,
            path,
            version,
            headers,
        })
    }

    /// Look up a header value by case-insensitive name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether the client asked to upgrade to WebSocket
    pub fn is_websocket_upgrade(&self) -> bool {
        self.header("Upgrade").is_some_and(|value| {
            value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("websocket"))
        })
    }
}

/// Read from `reader` until a full request head is buffered, then parse it.
///
/// The head is consumed from `buf`; anything the client sent after it stays
/// in the buffer for the session to decode.
pub async fn read_request_head<R>(reader: &mut R, buf: &mut BytesMut) -> ProtocolResult<RequestHead>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = find_terminator(buf) {
            let end = pos + HEAD_TERMINATOR.len();
            let head = RequestHead::parse(&buf[..end])?;
            buf.advance(end);
            return Ok(head);
        }

        if buf.len() >= MAX_HEAD_SIZE {
            return Err(ProtocolError::HandshakeMalformed(
                "request head too large".into(),
            ));
        }

        if reader.read_buf(buf).await? == 0 {
            return Err(ProtocolError::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before request head was complete",
            )));
        }
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
}

/// Fixed response for requests that do not upgrade
pub fn plain_response() -> String {
    format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{PLAIN_BODY}",
        PLAIN_BODY.len()
    )
}
