//! The framed binary wire protocol spoken on every chat-server socket.
//!
//! A frame is a fixed 24-byte header followed by exactly `length` bytes of
//! JSON body. All multi-byte header fields are little-endian on the wire.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::errors::ProtocolError;

pub const MAGIC: u32 = 0x464B_4348; // "FKCH"
pub const PROTOCOL_VERSION: u16 = 1;
pub const HEADER_LEN: usize = 24;
pub const MAX_BODY: u32 = 1 << 20;
pub const MIN_READ: usize = 1024;

/// Frame type tags. Values are part of the wire contract — never renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FrameType {
    AuthRequest = 1,
    AuthResponse = 2,
    Heartbeat = 3,
    ChatMessage = 4,
    SystemNotification = 5,
    ErrorMessage = 6,
}

impl FrameType {
    fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(Self::AuthRequest),
            2 => Some(Self::AuthResponse),
            3 => Some(Self::Heartbeat),
            4 => Some(Self::ChatMessage),
            5 => Some(Self::SystemNotification),
            6 => Some(Self::ErrorMessage),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub magic: u32,
    pub version: u16,
    pub r#type: u16,
    pub length: u32,
    pub timestamp: u64,
    pub reserved: u32,
}

impl FrameHeader {
    fn decode(buf: &[u8]) -> Self {
        debug_assert_eq!(buf.len(), HEADER_LEN);
        let mut cur = buf;
        let magic = cur.get_u32_le();
        let version = cur.get_u16_le();
        let r#type = cur.get_u16_le();
        let length = cur.get_u32_le();
        let timestamp = cur.get_u64_le();
        let reserved = cur.get_u32_le();
        Self {
            magic,
            version,
            r#type,
            length,
            timestamp,
            reserved,
        }
    }

    fn encode(&self, out: &mut BytesMut) {
        out.put_u32_le(self.magic);
        out.put_u16_le(self.version);
        out.put_u16_le(self.r#type);
        out.put_u32_le(self.length);
        out.put_u64_le(self.timestamp);
        out.put_u32_le(self.reserved);
    }

    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::from_u16(self.r#type)
    }
}

/// Build a complete wire frame (header + body) in one allocation.
pub fn encode_frame(frame_type: FrameType, body: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(HEADER_LEN + body.len());
    let header = FrameHeader {
        magic: MAGIC,
        version: PROTOCOL_VERSION,
        r#type: frame_type as u16,
        length: body.len() as u32,
        timestamp: now_unix(),
        reserved: 0,
    };
    header.encode(&mut out);
    out.put_slice(body);
    out.freeze()
}

pub fn encode_json_frame<T: serde::Serialize>(
    frame_type: FrameType,
    body: &T,
) -> Result<Bytes, ProtocolError> {
    let json = serde_json::to_vec(body)?;
    Ok(encode_frame(frame_type, &json))
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Incremental frame decoder over a growable receive buffer.
///
/// Owns the unconsumed bytes plus whatever header has already been parsed
/// for the frame currently in flight. `feed` appends newly-read bytes and
/// drains as many complete `(header, body)` pairs as are now available; at
/// most one frame is ever partially parsed at a time, and nothing is
/// returned until it is fully present.
pub struct FrameParser {
    buf: BytesMut,
    pending_header: Option<FrameHeader>,
}

impl FrameParser {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(MIN_READ),
            pending_header: None,
        }
    }

    /// Reserve at least `max(MIN_READ, expected_body)` bytes of spare
    /// capacity at the tail for the next socket read.
    pub fn reserve_for_next_read(&mut self) {
        let want = self
            .pending_header
            .map(|h| (h.length as usize).max(MIN_READ))
            .unwrap_or(MIN_READ);
        if self.buf.capacity() - self.buf.len() < want {
            self.buf.reserve(want);
        }
    }

    /// Append freshly-read bytes and drain every complete frame now
    /// available. Returns frames in wire order. On the first invariant
    /// violation, returns `Err` — the caller must close the session and
    /// must not call `feed` again.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<(FrameHeader, Bytes)>, ProtocolError> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();

        loop {
            if self.pending_header.is_none() {
                if self.buf.len() < HEADER_LEN {
                    break;
                }
                let header_bytes = self.buf.split_to(HEADER_LEN);
                let header = FrameHeader::decode(&header_bytes);
                if header.magic != MAGIC {
                    return Err(ProtocolError::InvalidHeader);
                }
                if header.version != PROTOCOL_VERSION {
                    return Err(ProtocolError::UnsupportedVersion(header.version));
                }
                if header.length > MAX_BODY {
                    return Err(ProtocolError::BodyTooLarge(header.length, MAX_BODY));
                }
                self.pending_header = Some(header);
            }

            let header = self.pending_header.expect("just set above");
            let body_len = header.length as usize;
            if self.buf.len() < body_len {
                break;
            }

            let body = self.buf.split_to(body_len).freeze();
            self.pending_header = None;
            out.push((header, body));
        }

        Ok(out)
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_a_single_frame() {
        let body = json!({"hello": "world"});
        let wire = encode_json_frame(FrameType::ChatMessage, &body).unwrap();

        let mut parser = FrameParser::new();
        let frames = parser.feed(&wire).unwrap();
        assert_eq!(frames.len(), 1);
        let (header, decoded_body) = &frames[0];
        assert_eq!(header.magic, MAGIC);
        assert_eq!(header.frame_type(), Some(FrameType::ChatMessage));
        let decoded: serde_json::Value = serde_json::from_slice(decoded_body).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn handles_a_byte_at_a_time_partial_feed() {
        let wire = encode_frame(FrameType::Heartbeat, b"{}");
        let mut parser = FrameParser::new();
        let mut all = Vec::new();
        for byte in wire.iter() {
            all.extend(parser.feed(&[*byte]).unwrap());
        }
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0.frame_type(), Some(FrameType::Heartbeat));
    }

    #[test]
    fn drains_multiple_frames_from_one_read() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&encode_frame(FrameType::Heartbeat, b"{}"));
        wire.extend_from_slice(&encode_frame(FrameType::ChatMessage, b"{\"x\":1}"));

        let mut parser = FrameParser::new();
        let frames = parser.feed(&wire).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].0.frame_type(), Some(FrameType::Heartbeat));
        assert_eq!(frames[1].0.frame_type(), Some(FrameType::ChatMessage));
    }

    #[test]
    fn rejects_bad_magic() {
        let mut wire = BytesMut::new();
        wire.put_u32_le(0xDEAD_BEEF);
        wire.put_u16_le(PROTOCOL_VERSION);
        wire.put_u16_le(FrameType::Heartbeat as u16);
        wire.put_u32_le(0);
        wire.put_u64_le(0);
        wire.put_u32_le(0);

        let mut parser = FrameParser::new();
        assert!(matches!(parser.feed(&wire), Err(ProtocolError::InvalidHeader)));
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut wire = BytesMut::new();
        wire.put_u32_le(MAGIC);
        wire.put_u16_le(2);
        wire.put_u16_le(FrameType::Heartbeat as u16);
        wire.put_u32_le(0);
        wire.put_u64_le(0);
        wire.put_u32_le(0);

        let mut parser = FrameParser::new();
        assert!(matches!(
            parser.feed(&wire),
            Err(ProtocolError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn rejects_oversize_body() {
        let mut wire = BytesMut::new();
        wire.put_u32_le(MAGIC);
        wire.put_u16_le(PROTOCOL_VERSION);
        wire.put_u16_le(FrameType::ChatMessage as u16);
        wire.put_u32_le(MAX_BODY + 1);
        wire.put_u64_le(0);
        wire.put_u32_le(0);

        let mut parser = FrameParser::new();
        assert!(matches!(
            parser.feed(&wire),
            Err(ProtocolError::BodyTooLarge(_, _))
        ));
    }

    #[test]
    fn leaves_unconsumed_suffix_for_the_next_feed() {
        let full = encode_frame(FrameType::Heartbeat, b"{}");
        let split = HEADER_LEN + 1;
        let mut parser = FrameParser::new();
        assert!(parser.feed(&full[..split]).unwrap().is_empty());
        let frames = parser.feed(&full[split..]).unwrap();
        assert_eq!(frames.len(), 1);
    }
}
