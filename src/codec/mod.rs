//! MQTT 3.1.1 wire codec.
//!
//! `decode` frames one control packet out of a byte buffer and `encode`
//! serializes one back. Decoding distinguishes "not enough bytes yet"
//! (`Ok(None)`, the buffer is left untouched) from a malformed packet
//! (`Err(CodecError)`), so a connection can keep appending reads to the same
//! buffer and resume where it left off. `PacketReader` wraps that loop.
//!
//! ```text
//!          7                          3                          0
//!          +--------------------------+--------------------------+
//! byte 1   | MQTT Control Packet Type | Flags for each type      |
//!          +--------------------------+--------------------------+
//!          |         Remaining Bytes Len  (1/2/3/4 bytes)        |
//!          +-----------------------------------------------------+
//! ```

use std::slice::Iter;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::utils::error::CodecError;

mod packets;

pub use packets::connack::{ConnAck, ConnectReturnCode};
pub use packets::connect::{Connect, LastWill};
pub use packets::publish::Publish;
pub use packets::suback::{SubAck, SubscribeReturnCode};
pub use packets::subscribe::{Subscribe, SubscribeFilter};
pub use packets::unsubscribe::Unsubscribe;

/// Largest value the remaining-length varint can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Quality of service level.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(CodecError::InvalidQoS(other)),
        }
    }
}

/// MQTT control packet type, the high nibble of the first byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Connect = 1,
    ConnAck,
    Publish,
    PubAck,
    PubRec,
    PubRel,
    PubComp,
    Subscribe,
    SubAck,
    Unsubscribe,
    UnsubAck,
    PingReq,
    PingResp,
    Disconnect,
}

/// A decoded MQTT control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(u16),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    /// Upper-case packet name, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnAck(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PubAck(_) => "PUBACK",
            Packet::PubRec(_) => "PUBREC",
            Packet::PubRel(_) => "PUBREL",
            Packet::PubComp(_) => "PUBCOMP",
            Packet::Subscribe(_) => "SUBSCRIBE",
            Packet::SubAck(_) => "SUBACK",
            Packet::Unsubscribe(_) => "UNSUBSCRIBE",
            Packet::UnsubAck(_) => "UNSUBACK",
            Packet::PingReq => "PINGREQ",
            Packet::PingResp => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    /// First byte of the frame: packet type and flags.
    pub byte1: u8,
    /// Byte 1 plus the 1..4 bytes of the remaining-length varint.
    pub fixed_header_len: usize,
    /// Variable header + payload size.
    pub remaining_len: usize,
}

impl FixedHeader {
    pub fn frame_length(&self) -> usize {
        self.fixed_header_len + self.remaining_len
    }

    pub fn flags(&self) -> u8 {
        self.byte1 & 0x0F
    }

    /// Packet type, checking the reserved flag bits MQTT 3.1.1 fixes per type.
    pub fn packet_type(&self) -> Result<PacketType, CodecError> {
        let num = self.byte1 >> 4;
        let packet_type = match num {
            1 => PacketType::Connect,
            2 => PacketType::ConnAck,
            3 => PacketType::Publish,
            4 => PacketType::PubAck,
            5 => PacketType::PubRec,
            6 => PacketType::PubRel,
            7 => PacketType::PubComp,
            8 => PacketType::Subscribe,
            9 => PacketType::SubAck,
            10 => PacketType::Unsubscribe,
            11 => PacketType::UnsubAck,
            12 => PacketType::PingReq,
            13 => PacketType::PingResp,
            14 => PacketType::Disconnect,
            _ => return Err(CodecError::InvalidPacketType(num)),
        };

        let expected = match packet_type {
            PacketType::Publish => return Ok(packet_type),
            PacketType::PubRel | PacketType::Subscribe | PacketType::Unsubscribe => 0b0010,
            _ => 0,
        };

        if self.flags() != expected {
            return Err(CodecError::InvalidFlags {
                packet_type: num,
                flags: self.flags(),
            });
        }

        Ok(packet_type)
    }
}

/// Returns the fixed header once the whole frame is buffered, `None` while
/// more bytes are needed. Oversized frames are rejected before their body
/// arrives.
pub fn check(stream: Iter<u8>, max_packet_size: usize) -> Result<Option<FixedHeader>, CodecError> {
    let stream_len = stream.len();
    let fixed_header = match parse_fixed_header(stream)? {
        Some(header) => header,
        None => return Ok(None),
    };

    if fixed_header.frame_length() > max_packet_size {
        return Err(CodecError::PacketTooLarge(fixed_header.frame_length()));
    }

    if stream_len < fixed_header.frame_length() {
        return Ok(None);
    }

    Ok(Some(fixed_header))
}

fn parse_fixed_header(mut stream: Iter<u8>) -> Result<Option<FixedHeader>, CodecError> {
    let byte1 = match stream.next() {
        Some(byte) => *byte,
        None => return Ok(None),
    };

    let mut remaining_len: usize = 0;
    let mut shift = 0;

    // Stream 0b1xxx_xxxx 0b1yyy_yyyy 0b1zzz_zzzz 0b0www_wwww will
    // be framed as number 0bwww_wwww_zzz_zzzz_yyy_yyyy_xxx_xxxx
    for (len_len, byte) in stream.enumerate() {
        remaining_len += ((*byte & 0x7F) as usize) << shift;
        if *byte & 0x80 == 0 {
            return Ok(Some(FixedHeader {
                byte1,
                fixed_header_len: len_len + 2,
                remaining_len,
            }));
        }

        shift += 7;
        if shift > 21 {
            return Err(CodecError::MalformedRemainingLength);
        }
    }

    Ok(None)
}

/// Decodes the next packet out of `stream`.
///
/// On `Ok(Some(_))` the frame's bytes are consumed; on `Ok(None)` nothing is.
/// After an error the buffer should be discarded along with the connection.
pub fn decode(stream: &mut BytesMut, max_packet_size: usize) -> Result<Option<Packet>, CodecError> {
    let fixed_header = match check(stream.iter(), max_packet_size)? {
        Some(header) => header,
        None => return Ok(None),
    };

    let packet_type = fixed_header.packet_type()?;
    let frame = stream.split_to(fixed_header.frame_length()).freeze();
    let mut body = frame.slice(fixed_header.fixed_header_len..);

    let packet = match packet_type {
        PacketType::Connect => Packet::Connect(packets::connect::read(&mut body)?),
        PacketType::ConnAck => Packet::ConnAck(packets::connack::read(&mut body)?),
        PacketType::Publish => {
            Packet::Publish(packets::publish::read(fixed_header, &mut body)?)
        }
        PacketType::PubAck => Packet::PubAck(read_packet_id(&mut body)?),
        PacketType::PubRec => Packet::PubRec(read_packet_id(&mut body)?),
        PacketType::PubRel => Packet::PubRel(read_packet_id(&mut body)?),
        PacketType::PubComp => Packet::PubComp(read_packet_id(&mut body)?),
        PacketType::Subscribe => Packet::Subscribe(packets::subscribe::read(&mut body)?),
        PacketType::SubAck => Packet::SubAck(packets::suback::read(&mut body)?),
        PacketType::Unsubscribe => {
            Packet::Unsubscribe(packets::unsubscribe::read(&mut body)?)
        }
        PacketType::UnsubAck => Packet::UnsubAck(read_packet_id(&mut body)?),
        PacketType::PingReq => Packet::PingReq,
        PacketType::PingResp => Packet::PingResp,
        PacketType::Disconnect => Packet::Disconnect,
    };

    if !body.is_empty() {
        return Err(CodecError::TrailingBytes(body.len()));
    }

    Ok(Some(packet))
}

/// Serializes `packet` onto `buffer`, returning the number of bytes written.
pub fn encode(packet: &Packet, buffer: &mut BytesMut) -> Result<usize, CodecError> {
    match packet {
        Packet::Connect(connect) => packets::connect::write(connect, buffer),
        Packet::ConnAck(connack) => packets::connack::write(connack, buffer),
        Packet::Publish(publish) => packets::publish::write(publish, buffer),
        Packet::PubAck(pkid) => write_packet_id(0x40, *pkid, buffer),
        Packet::PubRec(pkid) => write_packet_id(0x50, *pkid, buffer),
        Packet::PubRel(pkid) => write_packet_id(0x62, *pkid, buffer),
        Packet::PubComp(pkid) => write_packet_id(0x70, *pkid, buffer),
        Packet::Subscribe(subscribe) => packets::subscribe::write(subscribe, buffer),
        Packet::SubAck(suback) => packets::suback::write(suback, buffer),
        Packet::Unsubscribe(unsubscribe) => packets::unsubscribe::write(unsubscribe, buffer),
        Packet::UnsubAck(pkid) => write_packet_id(0xB0, *pkid, buffer),
        Packet::PingReq => write_empty(0xC0, buffer),
        Packet::PingResp => write_empty(0xD0, buffer),
        Packet::Disconnect => write_empty(0xE0, buffer),
    }
}

/// Incremental decoder over a growing buffer.
///
/// Bytes are appended as they arrive from the transport; `next_packet` yields
/// packets until the buffer holds only a partial frame.
#[derive(Debug)]
pub struct PacketReader {
    buffer: BytesMut,
    max_packet_size: usize,
}

impl PacketReader {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_packet_size,
        }
    }

    /// The buffer reads should land in.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn next_packet(&mut self) -> Result<Option<Packet>, CodecError> {
        decode(&mut self.buffer, self.max_packet_size)
    }
}

fn read_packet_id(stream: &mut Bytes) -> Result<u16, CodecError> {
    match read_u16(stream)? {
        0 => Err(CodecError::PacketIdZero),
        pkid => Ok(pkid),
    }
}

fn write_packet_id(byte1: u8, pkid: u16, buffer: &mut BytesMut) -> Result<usize, CodecError> {
    if pkid == 0 {
        return Err(CodecError::PacketIdZero);
    }

    buffer.put_u8(byte1);
    buffer.put_u8(2);
    buffer.put_u16(pkid);
    Ok(4)
}

fn write_empty(byte1: u8, buffer: &mut BytesMut) -> Result<usize, CodecError> {
    buffer.put_u8(byte1);
    buffer.put_u8(0);
    Ok(2)
}

pub(crate) fn read_u16(stream: &mut Bytes) -> Result<u16, CodecError> {
    if stream.len() < 2 {
        return Err(CodecError::Malformed("truncated two byte integer"));
    }

    Ok(stream.get_u16())
}

pub(crate) fn read_u8(stream: &mut Bytes) -> Result<u8, CodecError> {
    if stream.is_empty() {
        return Err(CodecError::Malformed("truncated byte"));
    }

    Ok(stream.get_u8())
}

/// Reads length-prefixed binary data without crossing the frame boundary.
pub(crate) fn read_mqtt_bytes(stream: &mut Bytes) -> Result<Bytes, CodecError> {
    let len = read_u16(stream)? as usize;
    if len > stream.len() {
        return Err(CodecError::BoundaryCrossed(len));
    }

    Ok(stream.split_to(len))
}

/// Reads a length-prefixed UTF-8 string. U+0000 is not allowed in MQTT strings.
pub(crate) fn read_mqtt_string(stream: &mut Bytes) -> Result<String, CodecError> {
    let bytes = read_mqtt_bytes(stream)?;
    let s = String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)?;
    if s.contains('\0') {
        return Err(CodecError::InvalidUtf8);
    }

    Ok(s)
}

pub(crate) fn write_mqtt_bytes(stream: &mut BytesMut, bytes: &[u8]) -> Result<(), CodecError> {
    let len = u16::try_from(bytes.len()).map_err(|_| CodecError::PayloadTooLong(bytes.len()))?;
    stream.put_u16(len);
    stream.extend_from_slice(bytes);
    Ok(())
}

pub(crate) fn write_mqtt_string(stream: &mut BytesMut, string: &str) -> Result<(), CodecError> {
    write_mqtt_bytes(stream, string.as_bytes())
}

/// Writes the remaining-length varint and returns how many bytes it took.
pub(crate) fn write_remaining_length(stream: &mut BytesMut, len: usize) -> Result<usize, CodecError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(CodecError::PayloadTooLong(len));
    }

    let mut x = len;
    let mut count = 0;
    loop {
        let mut byte = (x % 128) as u8;
        x /= 128;
        if x > 0 {
            byte |= 128;
        }

        stream.put_u8(byte);
        count += 1;
        if x == 0 {
            return Ok(count);
        }
    }
}

#[cfg(test)]
mod tests;
