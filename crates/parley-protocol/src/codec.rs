//! Codec for encoding and decoding Parley frames.
//!
//! Every frame is a fixed header (packet type and flags in one byte, then a
//! variable-byte-integer remaining length) followed by a type specific body.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::{Frame, PacketType, QoS};

/// Largest value the remaining-length field can carry (four 7-bit groups).
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Largest encodable string (2-byte length prefix).
pub const MAX_STRING_LENGTH: usize = u16::MAX as usize;

/// Protocol name sent in every Connect frame.
pub const PROTOCOL_NAME: &str = "MQTT";

/// Protocol level for MQTT 3.1.1.
pub const PROTOCOL_LEVEL: u8 = 4;

const CONNECT_FLAG_CLEAN_SESSION: u8 = 0x02;
const CONNECT_FLAG_WILL: u8 = 0x04;
const CONNECT_FLAG_PASSWORD: u8 = 0x40;
const CONNECT_FLAG_USERNAME: u8 = 0x80;

/// Flags mandated for Subscribe and Unsubscribe headers.
const REQUIRED_SUBSCRIBE_FLAGS: u8 = 0b0010;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Not enough data to decode a frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// Frame body exceeds what the remaining-length field can express.
    #[error("Frame size {0} exceeds maximum {MAX_REMAINING_LENGTH}")]
    FrameTooLarge(usize),

    /// Remaining-length field has more than four bytes.
    #[error("Malformed remaining length")]
    MalformedLength,

    /// High nibble does not name a known packet type.
    #[error("Unknown packet type {0}")]
    UnknownPacketType(u8),

    /// Frame body does not match its packet type.
    #[error("Malformed {packet} frame: {reason}")]
    Malformed {
        /// Packet name.
        packet: &'static str,
        /// What was wrong.
        reason: &'static str,
    },

    /// String longer than a 2-byte length prefix allows.
    #[error("String of {0} bytes exceeds maximum {MAX_STRING_LENGTH}")]
    StringTooLong(usize),

    /// String field is not valid UTF-8.
    #[error("Invalid UTF-8 in {0} string field")]
    InvalidUtf8(&'static str),
}

impl ProtocolError {
    /// Whether the stream can continue after this error.
    ///
    /// Body-level errors are raised after the declared frame length has been
    /// consumed, so decoding can resume at the next frame. A broken length
    /// field leaves no way to find the next frame boundary.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            ProtocolError::MalformedLength | ProtocolError::FrameTooLarge(_)
        )
    }

    fn malformed(packet: PacketType, reason: &'static str) -> Self {
        ProtocolError::Malformed {
            packet: packet.name(),
            reason,
        }
    }
}

/// Append the variable-byte-integer encoding of `len` to `buf`.
///
/// # Errors
///
/// Returns an error if `len` exceeds [`MAX_REMAINING_LENGTH`].
pub fn encode_remaining_length(len: usize, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(ProtocolError::FrameTooLarge(len));
    }

    let mut value = len;
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            return Ok(());
        }
    }
}

/// Decode a variable-byte integer from the front of `data`.
///
/// Returns `Ok(Some((value, bytes_used)))`, or `Ok(None)` if the field is
/// not complete yet.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedLength`] if the fourth byte still has
/// its continuation bit set.
pub fn decode_remaining_length(data: &[u8]) -> Result<Option<(usize, usize)>, ProtocolError> {
    let mut value = 0usize;
    let mut multiplier = 1usize;

    for (i, &byte) in data.iter().take(4).enumerate() {
        value += usize::from(byte & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        multiplier *= 128;
    }

    if data.len() >= 4 {
        Err(ProtocolError::MalformedLength)
    } else {
        Ok(None)
    }
}

/// Encode a frame to bytes.
///
/// # Errors
///
/// Returns an error if a string field is too long, the frame is too large,
/// or the message id does not agree with the QoS.
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a frame into an existing buffer.
///
/// Nothing is written to `buf` if encoding fails.
///
/// # Errors
///
/// Same as [`encode`].
pub fn encode_into(frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let mut body = BytesMut::new();
    let first = encode_body(frame, &mut body)?;

    buf.reserve(1 + 4 + body.len());
    buf.put_u8(first);
    encode_remaining_length(body.len(), buf)?;
    buf.extend_from_slice(&body);
    Ok(())
}

/// Write the body of `frame` and return its fixed header byte.
fn encode_body(frame: &Frame, body: &mut BytesMut) -> Result<u8, ProtocolError> {
    let type_bits = u8::from(frame.packet_type()) << 4;

    match frame {
        Frame::Connect {
            client_id,
            username,
            password,
            keep_alive_secs,
            clean_session,
        } => {
            put_string(body, PROTOCOL_NAME)?;
            body.put_u8(PROTOCOL_LEVEL);

            let mut flags = 0u8;
            if *clean_session {
                flags |= CONNECT_FLAG_CLEAN_SESSION;
            }
            if password.is_some() {
                flags |= CONNECT_FLAG_PASSWORD;
            }
            if username.is_some() {
                flags |= CONNECT_FLAG_USERNAME;
            }
            body.put_u8(flags);
            body.put_u16(*keep_alive_secs);

            put_string(body, client_id)?;
            if let Some(username) = username {
                put_string(body, username)?;
            }
            if let Some(password) = password {
                put_string(body, password)?;
            }
            Ok(type_bits)
        }

        Frame::ConnectAck {
            session_present,
            return_code,
        } => {
            body.put_u8(u8::from(*session_present));
            body.put_u8(*return_code);
            Ok(type_bits)
        }

        Frame::Publish {
            topic,
            message_id,
            payload,
            qos,
            retain,
            dup,
        } => {
            put_string(body, topic)?;
            match (qos, message_id) {
                (QoS::AtMostOnce, None) => {}
                (QoS::AtMostOnce, Some(_)) => {
                    return Err(ProtocolError::malformed(
                        PacketType::Publish,
                        "message id present at QoS 0",
                    ))
                }
                (_, Some(id)) => body.put_u16(*id),
                (_, None) => {
                    return Err(ProtocolError::malformed(
                        PacketType::Publish,
                        "message id missing above QoS 0",
                    ))
                }
            }
            body.extend_from_slice(payload);

            let mut flags = u8::from(*qos) << 1;
            if *retain {
                flags |= 0x01;
            }
            if *dup {
                flags |= 0x08;
            }
            Ok(type_bits | flags)
        }

        Frame::PublishAck { message_id } | Frame::UnsubscribeAck { message_id } => {
            body.put_u16(*message_id);
            Ok(type_bits)
        }

        Frame::Subscribe {
            message_id,
            topic,
            qos,
        } => {
            body.put_u16(*message_id);
            put_string(body, topic)?;
            body.put_u8(u8::from(*qos));
            Ok(type_bits | REQUIRED_SUBSCRIBE_FLAGS)
        }

        Frame::SubscribeAck {
            message_id,
            return_codes,
        } => {
            body.put_u16(*message_id);
            body.extend_from_slice(return_codes);
            Ok(type_bits)
        }

        Frame::Unsubscribe { message_id, topic } => {
            body.put_u16(*message_id);
            put_string(body, topic)?;
            Ok(type_bits | REQUIRED_SUBSCRIBE_FLAGS)
        }

        Frame::PingRequest | Frame::PingResponse | Frame::Disconnect => Ok(type_bits),
    }
}

fn put_string(buf: &mut BytesMut, value: &str) -> Result<(), ProtocolError> {
    let bytes = value.as_bytes();
    if bytes.len() > MAX_STRING_LENGTH {
        return Err(ProtocolError::StringTooLong(bytes.len()));
    }
    buf.put_u16(bytes.len() as u16);
    buf.extend_from_slice(bytes);
    Ok(())
}

/// Parsed fixed header.
struct FixedHeader {
    first: u8,
    header_len: usize,
    remaining: usize,
}

impl FixedHeader {
    fn frame_len(&self) -> usize {
        self.header_len + self.remaining
    }
}

fn parse_header(data: &[u8]) -> Result<Option<FixedHeader>, ProtocolError> {
    let Some((&first, rest)) = data.split_first() else {
        return Ok(None);
    };

    Ok(decode_remaining_length(rest)?.map(|(remaining, used)| FixedHeader {
        first,
        header_len: 1 + used,
        remaining,
    }))
}

/// Decode one frame from the front of `data`.
///
/// Returns the frame and the number of bytes it occupied.
///
/// # Errors
///
/// Returns [`ProtocolError::Incomplete`] if `data` holds less than one
/// frame, or another variant if the frame is malformed.
pub fn decode(data: &[u8]) -> Result<(Frame, usize), ProtocolError> {
    let header = match parse_header(data)? {
        Some(header) => header,
        None if data.is_empty() => return Err(ProtocolError::Incomplete(2)),
        None => return Err(ProtocolError::Incomplete(1)),
    };

    let total = header.frame_len();
    if data.len() < total {
        return Err(ProtocolError::Incomplete(total - data.len()));
    }

    let frame = decode_body(header.first, &data[header.header_len..total])?;
    Ok((frame, total))
}

/// Try to decode a frame from a buffer, advancing it if a whole frame is
/// present.
///
/// Returns `Ok(Some(frame))` if a complete frame was decoded, `Ok(None)` if
/// more data is needed, or `Err` on protocol error. When the error is
/// [recoverable](ProtocolError::is_recoverable) the offending frame has
/// already been removed from `buf`.
///
/// # Errors
///
/// Returns an error if the frame is malformed.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    let Some(header) = parse_header(buf)? else {
        return Ok(None);
    };

    let total = header.frame_len();
    if buf.len() < total {
        return Ok(None);
    }

    let frame = buf.split_to(total);
    decode_body(header.first, &frame[header.header_len..]).map(Some)
}

fn decode_body(first: u8, body: &[u8]) -> Result<Frame, ProtocolError> {
    let packet = PacketType::try_from(first >> 4).map_err(ProtocolError::UnknownPacketType)?;
    let flags = first & 0x0F;

    match packet {
        PacketType::Publish => {}
        PacketType::Subscribe | PacketType::Unsubscribe => {
            if flags != REQUIRED_SUBSCRIBE_FLAGS {
                return Err(ProtocolError::malformed(packet, "invalid header flags"));
            }
        }
        _ => {
            if flags != 0 {
                return Err(ProtocolError::malformed(packet, "reserved header flags set"));
            }
        }
    }

    let mut reader = Reader::new(packet, body);

    let frame = match packet {
        PacketType::Connect => {
            if reader.string()? != PROTOCOL_NAME {
                return Err(ProtocolError::malformed(packet, "unknown protocol name"));
            }
            if reader.u8()? != PROTOCOL_LEVEL {
                return Err(ProtocolError::malformed(packet, "unsupported protocol level"));
            }
            let connect_flags = reader.u8()?;
            if connect_flags & 0x01 != 0 {
                return Err(ProtocolError::malformed(packet, "reserved connect flag set"));
            }
            if connect_flags & CONNECT_FLAG_WILL != 0 {
                return Err(ProtocolError::malformed(packet, "will message not supported"));
            }
            let keep_alive_secs = reader.u16()?;
            let client_id = reader.string()?;
            let username = if connect_flags & CONNECT_FLAG_USERNAME != 0 {
                Some(reader.string()?)
            } else {
                None
            };
            let password = if connect_flags & CONNECT_FLAG_PASSWORD != 0 {
                Some(reader.string()?)
            } else {
                None
            };
            Frame::Connect {
                client_id,
                username,
                password,
                keep_alive_secs,
                clean_session: connect_flags & CONNECT_FLAG_CLEAN_SESSION != 0,
            }
        }

        PacketType::ConnectAck => {
            let ack_flags = reader.u8()?;
            if ack_flags & 0xFE != 0 {
                return Err(ProtocolError::malformed(packet, "reserved acknowledge flags set"));
            }
            Frame::ConnectAck {
                session_present: ack_flags & 0x01 != 0,
                return_code: reader.u8()?,
            }
        }

        PacketType::Publish => {
            let qos = QoS::try_from((flags >> 1) & 0x03)
                .map_err(|_| ProtocolError::malformed(packet, "invalid QoS"))?;
            let topic = reader.string()?;
            let message_id = if qos == QoS::AtMostOnce {
                None
            } else {
                Some(reader.u16()?)
            };
            Frame::Publish {
                topic,
                message_id,
                payload: Bytes::copy_from_slice(reader.rest()),
                qos,
                retain: flags & 0x01 != 0,
                dup: flags & 0x08 != 0,
            }
        }

        PacketType::PublishAck => Frame::PublishAck {
            message_id: reader.u16()?,
        },

        PacketType::Subscribe => {
            let message_id = reader.u16()?;
            let topic = reader.string()?;
            let qos = QoS::try_from(reader.u8()?)
                .map_err(|_| ProtocolError::malformed(packet, "invalid requested QoS"))?;
            Frame::Subscribe {
                message_id,
                topic,
                qos,
            }
        }

        PacketType::SubscribeAck => {
            let message_id = reader.u16()?;
            let return_codes = reader.rest().to_vec();
            if return_codes.is_empty() {
                return Err(ProtocolError::malformed(packet, "no return codes"));
            }
            Frame::SubscribeAck {
                message_id,
                return_codes,
            }
        }

        PacketType::Unsubscribe => Frame::Unsubscribe {
            message_id: reader.u16()?,
            topic: reader.string()?,
        },

        PacketType::UnsubscribeAck => Frame::UnsubscribeAck {
            message_id: reader.u16()?,
        },

        PacketType::PingRequest => Frame::PingRequest,
        PacketType::PingResponse => Frame::PingResponse,
        PacketType::Disconnect => Frame::Disconnect,
    };

    reader.finish()?;
    Ok(frame)
}

/// Bounds-checked cursor over a frame body.
struct Reader<'a> {
    packet: PacketType,
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(packet: PacketType, data: &'a [u8]) -> Self {
        Self { packet, data }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.data.len() < n {
            return Err(ProtocolError::malformed(self.packet, "body shorter than declared fields"));
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn string(&mut self) -> Result<String, ProtocolError> {
        let len = usize::from(self.u16()?);
        if self.data.len() < len {
            return Err(ProtocolError::malformed(
                self.packet,
                "string length prefix exceeds frame",
            ));
        }
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidUtf8(self.packet.name()))
    }

    fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.data)
    }

    fn finish(&self) -> Result<(), ProtocolError> {
        if self.data.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::malformed(self.packet, "trailing bytes"))
        }
    }
}
