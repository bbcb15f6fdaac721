use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{QoS, read_mqtt_string, read_u8, read_u16, write_mqtt_string, write_remaining_length};
use crate::utils::error::CodecError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub pkid: u16,
    pub filters: Vec<SubscribeFilter>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeFilter {
    pub path: String,
    pub qos: QoS,
}

impl SubscribeFilter {
    pub fn new(path: impl Into<String>, qos: QoS) -> Self {
        Self {
            path: path.into(),
            qos,
        }
    }
}

fn len(subscribe: &Subscribe) -> usize {
    // packet id + (length prefix + filter + options byte) per filter
    2 + subscribe
        .filters
        .iter()
        .fold(0, |s, f| s + 2 + f.path.len() + 1)
}

pub fn read(bytes: &mut Bytes) -> Result<Subscribe, CodecError> {
    let pkid = read_u16(bytes)?;
    if pkid == 0 {
        return Err(CodecError::PacketIdZero);
    }

    let mut filters = Vec::new();
    while bytes.has_remaining() {
        let path = read_mqtt_string(bytes)?;
        let options = read_u8(bytes)?;
        if options & 0b1111_1100 != 0 {
            return Err(CodecError::Malformed("reserved subscription option bits set"));
        }

        filters.push(SubscribeFilter {
            path,
            qos: QoS::try_from(options)?,
        });
    }

    match filters.len() {
        0 => Err(CodecError::EmptySubscription),
        _ => Ok(Subscribe { pkid, filters }),
    }
}

pub fn write(subscribe: &Subscribe, buffer: &mut BytesMut) -> Result<usize, CodecError> {
    if subscribe.filters.is_empty() {
        return Err(CodecError::EmptySubscription);
    }

    buffer.put_u8(0x82);
    let remaining_len = len(subscribe);
    let remaining_len_bytes = write_remaining_length(buffer, remaining_len)?;

    buffer.put_u16(subscribe.pkid);
    for f in subscribe.filters.iter() {
        write_mqtt_string(buffer, &f.path)?;
        buffer.put_u8(f.qos as u8);
    }

    Ok(1 + remaining_len_bytes + remaining_len)
}
