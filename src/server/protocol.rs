//! Protocol definitions
//!
//! Opcodes, decoded events and error types shared by the handshake, the frame
//! codec and the connection session.

use thiserror::Error;

/// Magic GUID appended to the client key when deriving `Sec-WebSocket-Accept` (RFC 6455 §4.2.2)
pub const WS_ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest payload that fits in a single-byte length field
pub const MAX_SHORT_PAYLOAD: usize = 125;

/// Largest payload we encode or decode (16-bit extended length)
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Length marker for a 16-bit extended length
pub const LEN_EXTENDED_16: u8 = 126;

/// Length marker for a 64-bit extended length (never decoded)
pub const LEN_EXTENDED_64: u8 = 127;

/// Label prepended to every echoed text message
pub const ECHO_PREFIX: &str = "Relay Echo: ";

/// Body returned to plain HTTP requests
pub const PLAIN_BODY: &str = "Relay is active.";

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed upgrade request: {0}")]
    HandshakeMalformed(String),

    #[error("Message too large")]
    FrameTooLarge,

    #[error("Truncated frame: needed {needed} bytes, {available} available")]
    FrameTruncated { needed: usize, available: usize },

    #[error("Payload of {0} bytes exceeds the 16-bit frame length")]
    PayloadTooLarge(usize),

    #[error("Session used before the handshake completed")]
    SessionNotOpen,

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Opcodes
// ============================================================================

/// Opcodes the relay emits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Text = 0x1,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    /// Raw 4-bit value
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Map a raw opcode to one the relay knows about
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x1 => Some(Self::Text),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }
}

// ============================================================================
// Decoded Events
// ============================================================================

/// Result of decoding one complete frame
#[derive(Debug)]
pub enum DecodedEvent {
    /// Text frame, already unmasked
    Text(String),
    /// Pong reply to one of our pings
    Pong,
    /// Client requested close
    Close,
    /// Any opcode the relay does not handle (binary, continuation, client ping)
    Unsupported(u8),
    /// Frame could not be decoded
    Error(ProtocolError),
}
