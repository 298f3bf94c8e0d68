//! WebSocket opening handshake
//!
//! Derives `Sec-WebSocket-Accept` from the client key and builds the
//! `101 Switching Protocols` response (RFC 6455 §4.2.2).

use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha1::{Digest, Sha1};

use super::http::RequestHead;
use super::protocol::{ProtocolError, ProtocolResult, WS_ACCEPT_GUID};

/// Header carrying the client's handshake key
pub const KEY_HEADER: &str = "Sec-WebSocket-Key";

/// Compute the accept token: base64(SHA-1(key + GUID))
pub fn derive_accept_token(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_ACCEPT_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Validate an upgrade request and return the accept token for it
pub fn accept_upgrade(head: &RequestHead) -> ProtocolResult<String> {
    let key = head
        .header(KEY_HEADER)
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| ProtocolError::HandshakeMalformed(format!("missing {KEY_HEADER}")))?;
    Ok(derive_accept_token(key))
}

/// The response that switches the connection into framed mode
pub fn switching_protocols_response(token: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {token}\r\n\r\n"
    )
}

/// Response for an upgrade request we refuse
pub fn bad_request_response(reason: &str) -> String {
    format!(
        "HTTP/1.1 400 Bad Request\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{reason}",
        reason.len()
    )
}
