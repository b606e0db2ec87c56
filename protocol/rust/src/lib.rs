//! Wire format of the minusconf protocol.
//!
//! Every datagram is `MAGIC || OPCODE || PAYLOAD`. Payloads are sequences of
//! UTF-8 strings, each terminated by a single NUL byte.

pub mod address;

use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use thiserror::Error;
use tokio_util::codec::Decoder;

/// Prefix of every protocol datagram.
pub const MAGIC: [u8; 4] = [0xAD, 0xC3, 0xE6, 0xE7];

/// Biggest datagram this implementation accepts. Anything longer is cut here.
pub const MAX_PACKET_SIZE: usize = 2048;

const STRING_TERMINATOR: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Query,
    Empty,
    Advertisement,
    Error,
    Unknown(u8),
}

impl Opcode {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x01 => Self::Query,
            0x02 => Self::Empty,
            0x65 => Self::Advertisement,
            0x6F => Self::Error,
            other => Self::Unknown(other),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Self::Query => 0x01,
            Self::Empty => 0x02,
            Self::Advertisement => 0x65,
            Self::Error => 0x6F,
            Self::Unknown(byte) => byte,
        }
    }
}

/// A datagram with its magic prefix stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
        }
    }

    /// A no-op frame, sent to wake up a socket parked in a receive.
    pub fn empty(reason: &str) -> Self {
        let mut payload = BytesMut::new();
        encode_string(reason, &mut payload);
        Self::new(Opcode::Empty, payload)
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(MAGIC.len() + 1 + self.payload.len());
        buffer.extend_from_slice(&MAGIC);
        buffer.put_u8(self.opcode.to_byte());
        buffer.extend_from_slice(&self.payload);
        buffer.freeze()
    }
}

/// Filters of a discovery query. Empty strings match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Query {
    pub advertiser_name: String,
    pub service_type: String,
    pub service_name: String,
}

impl Query {
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let (advertiser_name, offset) = decode_string(payload, 0)?;
        let (service_type, offset) = decode_string(payload, offset)?;
        let (service_name, _) = decode_string(payload, offset)?;
        Ok(Self {
            advertiser_name,
            service_type,
            service_name,
        })
    }

    pub fn to_frame(&self) -> Frame {
        let mut payload = BytesMut::new();
        encode_string(&self.advertiser_name, &mut payload);
        encode_string(&self.service_type, &mut payload);
        encode_string(&self.service_name, &mut payload);
        Frame::new(Opcode::Query, payload)
    }
}

/// One service announced by an advertiser in reply to a query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Advertisement {
    pub advertiser_name: String,
    pub service_type: String,
    pub service_name: String,
    pub location: String,
    pub port: String,
}

impl Advertisement {
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let (advertiser_name, offset) = decode_string(payload, 0)?;
        let (service_type, offset) = decode_string(payload, offset)?;
        let (service_name, offset) = decode_string(payload, offset)?;
        let (location, offset) = decode_string(payload, offset)?;
        let (port, _) = decode_string(payload, offset)?;
        Ok(Self {
            advertiser_name,
            service_type,
            service_name,
            location,
            port,
        })
    }

    pub fn to_frame(&self) -> Frame {
        let mut payload = BytesMut::new();
        for field in [
            &self.advertiser_name,
            &self.service_type,
            &self.service_name,
            &self.location,
            &self.port,
        ] {
            encode_string(field, &mut payload);
        }
        Frame::new(Opcode::Advertisement, payload)
    }
}

/// Error reported to a peer in an `ERROR` packet.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ProtocolError {
    pub message: String,
}

impl ProtocolError {
    pub fn new(message: impl Into<String>) -> Self {
        let mut message = message.into();
        message.retain(|c| c != '\0');
        Self { message }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let (message, _) = decode_string(payload, 0)?;
        Ok(Self { message })
    }

    pub fn to_frame(&self) -> Frame {
        let mut payload = BytesMut::new();
        encode_string(&self.message, &mut payload);
        Frame::new(Opcode::Error, payload)
    }
}

/// Appends `value` and its NUL terminator. `value` must not contain NUL itself.
pub fn encode_string(value: &str, dst: &mut BytesMut) {
    dst.reserve(value.len() + 1);
    dst.extend_from_slice(value.as_bytes());
    dst.put_u8(STRING_TERMINATOR);
}

/// Reads the string starting at `offset`.
///
/// Returns the string and the offset of the byte following its terminator.
pub fn decode_string(buffer: &[u8], offset: usize) -> Result<(String, usize), DecodeError> {
    let remaining = buffer
        .get(offset..)
        .ok_or(DecodeError::UnterminatedString)?;
    let length = remaining
        .iter()
        .position(|&b| b == STRING_TERMINATOR)
        .ok_or(DecodeError::UnterminatedString)?;
    let value = std::str::from_utf8(&remaining[..length])?;
    Ok((value.to_owned(), offset + length + 1))
}

/// Splits datagrams into [`Frame`]s.
///
/// Datagrams without the magic prefix are foreign traffic and yield nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        // One datagram per call, consumed whole even when it is rejected.
        let mut datagram = src.split();
        datagram.truncate(MAX_PACKET_SIZE);
        if datagram.len() < MAGIC.len() + 1 || datagram[..MAGIC.len()] != MAGIC {
            return Ok(None);
        }

        let opcode = Opcode::from_byte(datagram[MAGIC.len()]);
        let payload = datagram.split_off(MAGIC.len() + 1).freeze();
        Ok(Some(Frame { opcode, payload }))
    }
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Error from network I/O")]
    Io(#[from] std::io::Error),

    #[error("Premature end of string")]
    UnterminatedString,

    #[error("String is not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),
}

impl DecodeError {
    /// Whether the packet itself was bad, as opposed to the socket.
    pub fn is_malformed(&self) -> bool {
        !matches!(self, Self::Io(_))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn datagram(bytes: &[u8]) -> BytesMut {
        BytesMut::from(bytes)
    }

    #[test]
    fn string_round_trip() {
        let mut buffer = BytesMut::new();
        encode_string("sharp s = \u{df}", &mut buffer);

        // When
        let (value, offset) = decode_string(&buffer, 0).unwrap();

        // Then
        assert_eq!(value, "sharp s = \u{df}");
        assert_eq!(offset, buffer.len());
    }

    #[test]
    fn decode_consecutive_strings() {
        let buffer = b"first\0\0third\0";

        let (first, offset) = decode_string(buffer, 0).unwrap();
        let (second, offset) = decode_string(buffer, offset).unwrap();
        let (third, offset) = decode_string(buffer, offset).unwrap();

        assert_eq!(
            (first.as_str(), second.as_str(), third.as_str()),
            ("first", "", "third")
        );
        assert_eq!(offset, buffer.len());
    }

    #[test]
    fn decode_unterminated_string() {
        let e = decode_string(b"no terminator", 0).unwrap_err();
        assert!(matches!(e, DecodeError::UnterminatedString));
        assert!(e.is_malformed());
    }

    #[test]
    fn decode_past_end() {
        let e = decode_string(b"a\0", 5).unwrap_err();
        assert!(matches!(e, DecodeError::UnterminatedString));
    }

    #[test]
    fn decode_invalid_utf8() {
        let e = decode_string(&[0xFF, 0xFE, 0], 0).unwrap_err();
        assert!(matches!(e, DecodeError::InvalidUtf8(_)));
    }

    #[test]
    fn query_payload_order() {
        let query = Query {
            advertiser_name: "a".into(),
            service_type: "t".into(),
            service_name: "n".into(),
        };

        // When
        let frame = query.to_frame();

        // Then
        assert_eq!(frame.opcode, Opcode::Query);
        assert_eq!(frame.payload.as_ref(), b"a\0t\0n\0");
        assert_eq!(Query::decode(&frame.payload).unwrap(), query);
    }

    #[test]
    fn truncated_query() {
        let e = Query::decode(b"a\0t\0n").unwrap_err();
        assert!(matches!(e, DecodeError::UnterminatedString));
    }

    #[test]
    fn advertisement_ignores_trailing_bytes() {
        let payload = b"aname\0http\0web\0\x008080\0garbage";

        // When
        let advertisement = Advertisement::decode(payload).unwrap();

        // Then
        assert_eq!(
            advertisement,
            Advertisement {
                advertiser_name: "aname".into(),
                service_type: "http".into(),
                service_name: "web".into(),
                location: "".into(),
                port: "8080".into(),
            }
        );
    }

    #[test]
    fn protocol_error_strips_nul() {
        let error = ProtocolError::new("bad\0packet");
        assert_eq!(error.message, "badpacket");
        assert_eq!(error.to_frame().payload.as_ref(), b"badpacket\0");
    }

    #[test]
    fn frame_bytes() {
        let bytes = Frame::empty("stop").to_bytes();
        assert_eq!(bytes.as_ref(), b"\xad\xc3\xe6\xe7\x02stop\0");
    }

    #[test]
    fn decode_frame() {
        let mut src = datagram(b"\xad\xc3\xe6\xe7\x65payload");

        // When
        let frame = FrameCodec.decode(&mut src).unwrap();

        // Then
        assert_eq!(
            frame,
            Some(Frame::new(Opcode::Advertisement, &b"payload"[..]))
        );
        assert!(src.is_empty());
    }

    #[test]
    fn decode_unknown_opcode() {
        let frame = FrameCodec
            .decode(&mut datagram(b"\xad\xc3\xe6\xe7\x7f"))
            .unwrap()
            .unwrap();
        assert_eq!(frame.opcode, Opcode::Unknown(0x7F));
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn foreign_datagram_is_consumed() {
        let mut src = datagram(b"M-SEARCH * HTTP/1.1\r\n");

        // When
        let frame = FrameCodec.decode(&mut src).unwrap();

        // Then
        assert_eq!(frame, None);
        assert!(src.is_empty(), "Foreign datagrams must not stay buffered");
    }

    #[test]
    fn datagram_without_opcode_is_foreign() {
        let frame = FrameCodec.decode(&mut datagram(&MAGIC)).unwrap();
        assert_eq!(frame, None);
    }

    #[test]
    fn decode_empty_datagram() {
        let frame = FrameCodec.decode(&mut Default::default()).unwrap();
        assert_eq!(frame, None);
    }

    #[test]
    fn oversized_datagram_is_truncated() {
        let mut bytes = Query::default().to_frame().to_bytes().to_vec();
        bytes.truncate(MAGIC.len() + 1);
        bytes.resize(MAX_PACKET_SIZE + 10, b'x');
        bytes.push(0);

        // When
        let frame = FrameCodec.decode(&mut datagram(&bytes)).unwrap().unwrap();

        // Then
        assert_eq!(frame.payload.len(), MAX_PACKET_SIZE - MAGIC.len() - 1);
        assert!(Query::decode(&frame.payload).is_err());
    }

    #[test]
    fn opcode_bytes() {
        for byte in 0..=u8::MAX {
            assert_eq!(Opcode::from_byte(byte).to_byte(), byte);
        }
        assert_eq!(Opcode::from_byte(0x6F), Opcode::Error);
    }
}
