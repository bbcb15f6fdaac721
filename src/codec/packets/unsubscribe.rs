use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{read_mqtt_string, read_u16, write_mqtt_string, write_remaining_length};
use crate::utils::error::CodecError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub pkid: u16,
    pub topics: Vec<String>,
}

pub fn read(bytes: &mut Bytes) -> Result<Unsubscribe, CodecError> {
    let pkid = read_u16(bytes)?;
    if pkid == 0 {
        return Err(CodecError::PacketIdZero);
    }

    let mut topics = Vec::new();
    while bytes.has_remaining() {
        topics.push(read_mqtt_string(bytes)?);
    }

    match topics.len() {
        0 => Err(CodecError::EmptySubscription),
        _ => Ok(Unsubscribe { pkid, topics }),
    }
}

pub fn write(unsubscribe: &Unsubscribe, buffer: &mut BytesMut) -> Result<usize, CodecError> {
    if unsubscribe.topics.is_empty() {
        return Err(CodecError::EmptySubscription);
    }

    let remaining_len = 2 + unsubscribe
        .topics
        .iter()
        .fold(0, |s, topic| s + 2 + topic.len());

    buffer.put_u8(0xA2);
    let remaining_len_bytes = write_remaining_length(buffer, remaining_len)?;
    buffer.put_u16(unsubscribe.pkid);
    for topic in &unsubscribe.topics {
        write_mqtt_string(buffer, topic)?;
    }

    Ok(1 + remaining_len_bytes + remaining_len)
}
