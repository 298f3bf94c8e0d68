//! WebSocket frame codec (RFC 6455 §5)
//!
//! The decoder buffers raw bytes and yields one [`DecodedEvent`] per complete
//! frame, so frames split across reads (or several frames in one read) are
//! handled. The encoder only produces what a server may send: FIN set, no
//! mask, payloads up to 16-bit length.

use bytes::{BufMut, BytesMut};

use super::protocol::{
    DecodedEvent, Opcode, ProtocolError, ProtocolResult, LEN_EXTENDED_16, LEN_EXTENDED_64,
    MAX_FRAME_PAYLOAD, MAX_SHORT_PAYLOAD,
};

const FIN_BIT: u8 = 0x80;
const MASK_BIT: u8 = 0x80;

/// Header fields of a frame whose header bytes are fully buffered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameHeader {
    opcode: u8,
    mask: Option<[u8; 4]>,
    header_len: usize,
    payload_len: usize,
}

impl FrameHeader {
    fn frame_len(&self) -> usize {
        self.header_len + self.payload_len
    }
}

#[derive(Debug, PartialEq, Eq)]
enum HeaderStatus {
    /// At least `needed` bytes must be buffered before the frame can be decoded
    Incomplete { needed: usize },
    Complete(FrameHeader),
}

fn parse_header(buf: &[u8]) -> ProtocolResult<HeaderStatus> {
    if buf.len() < 2 {
        return Ok(HeaderStatus::Incomplete { needed: 2 });
    }

    let opcode = buf[0] & 0x0f;
    let masked = buf[1] & MASK_BIT != 0;
    let (payload_len, mut offset) = match buf[1] & 0x7f {
        LEN_EXTENDED_64 => return Err(ProtocolError::FrameTooLarge),
        LEN_EXTENDED_16 => {
            if buf.len() < 4 {
                return Ok(HeaderStatus::Incomplete { needed: 4 });
            }
            (u16::from_be_bytes([buf[2], buf[3]]) as usize, 4)
        }
        len => (len as usize, 2),
    };

    let mask = if masked {
        if buf.len() < offset + 4 {
            return Ok(HeaderStatus::Incomplete {
                needed: offset + 4,
            });
        }
        let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
        offset += 4;
        Some(key)
    } else {
        None
    };

    let header = FrameHeader {
        opcode,
        mask,
        header_len: offset,
        payload_len,
    };
    if buf.len() < header.frame_len() {
        return Ok(HeaderStatus::Incomplete {
            needed: header.frame_len(),
        });
    }
    Ok(HeaderStatus::Complete(header))
}

/// XOR `payload` in place with the 4-byte mask key
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

// ============================================================================
// Decoder
// ============================================================================

/// Buffering frame decoder for one connection
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a decoder seeded with bytes that were read before framing began
    pub fn with_buffer(buf: BytesMut) -> Self {
        Self { buf }
    }

    /// Buffer that reads should append to
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Append raw bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of bytes waiting to be decoded
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decode the next complete frame, or `None` if more bytes are needed.
    ///
    /// After an `Error` event the buffer is discarded; the stream can no
    /// longer be trusted to be frame-aligned.
    pub fn decode(&mut self) -> Option<DecodedEvent> {
        match parse_header(&self.buf) {
            Ok(HeaderStatus::Incomplete { .. }) => None,
            Ok(HeaderStatus::Complete(header)) => {
                let mut frame = self.buf.split_to(header.frame_len());
                Some(to_event(header, &mut frame[header.header_len..]))
            }
            Err(e) => {
                self.buf.clear();
                Some(DecodedEvent::Error(e))
            }
        }
    }

    /// Report leftover bytes at end-of-stream as a truncated frame
    pub fn finish(&self) -> Option<DecodedEvent> {
        if self.buf.is_empty() {
            return None;
        }
        match parse_header(&self.buf) {
            Ok(HeaderStatus::Incomplete { needed }) => {
                Some(DecodedEvent::Error(ProtocolError::FrameTruncated {
                    needed,
                    available: self.buf.len(),
                }))
            }
            Ok(HeaderStatus::Complete(_)) => None,
            Err(e) => Some(DecodedEvent::Error(e)),
        }
    }
}

fn to_event(header: FrameHeader, payload: &mut [u8]) -> DecodedEvent {
    match Opcode::from_u8(header.opcode) {
        Some(Opcode::Text) => {
            if let Some(key) = header.mask {
                apply_mask(payload, key);
            }
            DecodedEvent::Text(String::from_utf8_lossy(payload).into_owned())
        }
        Some(Opcode::Close) => DecodedEvent::Close,
        Some(Opcode::Pong) => DecodedEvent::Pong,
        Some(Opcode::Ping) | None => DecodedEvent::Unsupported(header.opcode),
    }
}

/// Decode a buffer assumed to hold exactly one frame
pub fn parse_frame(buf: &[u8]) -> DecodedEvent {
    let mut decoder = FrameDecoder::with_buffer(BytesMut::from(buf));
    decoder
        .decode()
        .or_else(|| decoder.finish())
        .unwrap_or(DecodedEvent::Error(ProtocolError::FrameTruncated {
            needed: 2,
            available: 0,
        }))
}

// ============================================================================
// Encoder
// ============================================================================

/// Append one unmasked, final frame to `out`
pub fn encode_frame(opcode: Opcode, payload: &[u8], out: &mut BytesMut) -> ProtocolResult<()> {
    let len = payload.len();
    if len > MAX_FRAME_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge(len));
    }

    out.reserve(4 + len);
    out.put_u8(FIN_BIT | opcode.as_u8());
    if len <= MAX_SHORT_PAYLOAD {
        out.put_u8(len as u8);
    } else {
        out.put_u8(LEN_EXTENDED_16);
        out.put_u16(len as u16);
    }
    out.put_slice(payload);
    Ok(())
}

/// Text frame carrying `text`
pub fn text_frame(text: &str) -> ProtocolResult<BytesMut> {
    let mut out = BytesMut::new();
    encode_frame(Opcode::Text, text.as_bytes(), &mut out)?;
    Ok(out)
}

/// Empty ping frame
pub fn ping_frame() -> BytesMut {
    empty_frame(Opcode::Ping)
}

/// Empty close frame
pub fn close_frame() -> BytesMut {
    empty_frame(Opcode::Close)
}

fn empty_frame(opcode: Opcode) -> BytesMut {
    let mut out = BytesMut::with_capacity(2);
    out.put_u8(FIN_BIT | opcode.as_u8());
    out.put_u8(0);
    out
}

/// Build a masked frame the way a client would send it
#[cfg(test)]
pub(crate) fn client_frame(opcode: u8, payload: &[u8], key: [u8; 4]) -> Vec<u8> {
    let mut out = vec![FIN_BIT | opcode];
    if payload.len() <= MAX_SHORT_PAYLOAD {
        out.push(MASK_BIT | payload.len() as u8);
    } else {
        out.push(MASK_BIT | LEN_EXTENDED_16);
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    }
    out.extend_from_slice(&key);
    let mut masked = payload.to_vec();
    apply_mask(&mut masked, key);
    out.extend_from_slice(&masked);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    fn expect_text(event: DecodedEvent) -> String {
        match event {
            DecodedEvent::Text(text) => text,
            other => panic!("Expected Text event, got {other:?}"),
        }
    }

    #[test]
    fn test_rfc_masked_hello() {
        // RFC 6455 §5.7: single-frame masked text message "Hello"
        let frame = [
            0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
        ];
        assert_eq!(expect_text(parse_frame(&frame)), "Hello");
    }

    #[test]
    fn test_unmasked_text() {
        let frame = [0x81, 0x05, 0x48, 0x65, 0x6c, 0x6c, 0x6f];
        assert_eq!(expect_text(parse_frame(&frame)), "Hello");
    }

    #[test]
    fn test_mask_spans_multibyte_utf8() {
        let text = "héllo wörld ✓ 日本";
        let frame = client_frame(0x1, text.as_bytes(), KEY);
        assert_eq!(expect_text(parse_frame(&frame)), text);
    }

    #[test]
    fn test_apply_mask_matches_xor_definition() {
        let bytes: Vec<u8> = (0u8..11).collect();
        let mut masked = bytes.clone();
        apply_mask(&mut masked, KEY);
        for (i, b) in masked.iter().enumerate() {
            assert_eq!(*b, bytes[i] ^ KEY[i % 4]);
        }
    }

    #[test]
    fn test_control_and_unsupported_opcodes() {
        assert!(matches!(parse_frame(&[0x88, 0x00]), DecodedEvent::Close));
        assert!(matches!(parse_frame(&[0x8A, 0x00]), DecodedEvent::Pong));
        assert!(matches!(
            parse_frame(&client_frame(0x2, &[1, 2, 3], KEY)),
            DecodedEvent::Unsupported(0x2)
        ));
        assert!(matches!(
            parse_frame(&[0x89, 0x00]),
            DecodedEvent::Unsupported(0x9)
        ));
    }

    #[test]
    fn test_64bit_length_is_rejected() {
        let mut frame = vec![0x81, 0xFF];
        frame.extend_from_slice(&(70_000u64).to_be_bytes());
        frame.extend_from_slice(&KEY);
        assert!(matches!(
            parse_frame(&frame),
            DecodedEvent::Error(ProtocolError::FrameTooLarge)
        ));

        // Rejected from the two header bytes alone
        assert!(matches!(
            parse_frame(&[0x81, 0x7F]),
            DecodedEvent::Error(ProtocolError::FrameTooLarge)
        ));
    }

    #[test]
    fn test_truncated_frame() {
        let frame = client_frame(0x1, b"truncated", KEY);
        match parse_frame(&frame[..frame.len() - 3]) {
            DecodedEvent::Error(ProtocolError::FrameTruncated { needed, available }) => {
                assert_eq!(needed, frame.len());
                assert_eq!(available, frame.len() - 3);
            }
            other => panic!("Expected FrameTruncated, got {other:?}"),
        }
        assert!(matches!(
            parse_frame(&[]),
            DecodedEvent::Error(ProtocolError::FrameTruncated { .. })
        ));
    }

    #[test]
    fn test_decoder_reassembles_split_frame() {
        let frame = client_frame(0x1, b"split across reads", KEY);
        let mut decoder = FrameDecoder::new();

        for chunk in frame.chunks(3) {
            assert!(decoder.buffered() < frame.len());
            if let Some(event) = decoder.decode() {
                panic!("Decoded early: {event:?}");
            }
            decoder.extend(chunk);
        }

        assert_eq!(expect_text(decoder.decode().unwrap()), "split across reads");
        assert_eq!(decoder.buffered(), 0);
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_decoder_multiple_frames_in_one_read() {
        let mut bytes = client_frame(0x1, b"one", KEY);
        bytes.extend(client_frame(0x2, b"skip me", KEY));
        bytes.extend(client_frame(0xA, b"", KEY));
        bytes.extend(client_frame(0x1, b"two", KEY));

        let mut decoder = FrameDecoder::new();
        decoder.extend(&bytes);
        assert_eq!(expect_text(decoder.decode().unwrap()), "one");
        assert!(matches!(
            decoder.decode(),
            Some(DecodedEvent::Unsupported(0x2))
        ));
        assert!(matches!(decoder.decode(), Some(DecodedEvent::Pong)));
        assert_eq!(expect_text(decoder.decode().unwrap()), "two");
        assert!(decoder.decode().is_none());
    }

    #[test]
    fn test_decoder_finish_reports_partial_header() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[0x81, 0xFE, 0x01]);
        assert!(decoder.decode().is_none());
        match decoder.finish() {
            Some(DecodedEvent::Error(ProtocolError::FrameTruncated { needed, available })) => {
                assert_eq!(needed, 4);
                assert_eq!(available, 3);
            }
            other => panic!("Expected FrameTruncated, got {other:?}"),
        }
    }

    #[test]
    fn test_encode_short_frame() {
        let frame = text_frame("Hi").unwrap();
        assert_eq!(&frame[..], &[0x81, 0x02, b'H', b'i']);
    }

    #[test]
    fn test_encode_extended_length() {
        let payload = "x".repeat(300);
        let frame = text_frame(&payload).unwrap();
        assert_eq!(frame[0], 0x81);
        assert_eq!(frame[1], 126);
        assert_eq!(u16::from_be_bytes([frame[2], frame[3]]), 300);
        assert_eq!(frame.len(), 4 + 300);
        assert_eq!(expect_text(parse_frame(&frame)), payload);
    }

    #[test]
    fn test_length_boundaries_round_trip() {
        for len in [0usize, 125, 126, 65_535] {
            let payload = "a".repeat(len);
            let frame = text_frame(&payload).unwrap();
            assert_eq!(frame[1] & MASK_BIT, 0, "server frames are never masked");
            assert_eq!(expect_text(parse_frame(&frame)), payload);

            let masked = client_frame(0x1, payload.as_bytes(), KEY);
            assert_eq!(expect_text(parse_frame(&masked)), payload);
        }
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let payload = vec![0u8; MAX_FRAME_PAYLOAD + 1];
        let mut out = BytesMut::new();
        assert!(matches!(
            encode_frame(Opcode::Text, &payload, &mut out),
            Err(ProtocolError::PayloadTooLarge(65_536))
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn test_ping_frames_are_identical() {
        let pings: Vec<BytesMut> = (0..5).map(|_| ping_frame()).collect();
        for ping in &pings {
            assert_eq!(&ping[..], &[0x89, 0x00]);
        }
        assert_eq!(&close_frame()[..], &[0x88, 0x00]);
    }
}
