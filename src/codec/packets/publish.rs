use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{
    FixedHeader, QoS, read_mqtt_string, read_u16, write_mqtt_string, write_remaining_length,
};
use crate::utils::error::CodecError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// Zero for QoS 0, where no packet identifier is carried.
    pub pkid: u16,
    pub payload: Bytes,
}

impl Publish {
    pub fn new(topic: impl Into<String>, qos: QoS, payload: impl Into<Bytes>) -> Self {
        Self {
            dup: false,
            qos,
            retain: false,
            topic: topic.into(),
            pkid: 0,
            payload: payload.into(),
        }
    }

    fn len(&self) -> usize {
        let len = 2 + self.topic.len() + self.payload.len();
        match self.qos {
            QoS::AtMostOnce => len,
            _ => len + 2,
        }
    }
}

pub fn read(fixed_header: FixedHeader, bytes: &mut Bytes) -> Result<Publish, CodecError> {
    let qos = QoS::try_from((fixed_header.byte1 & 0b0110) >> 1)?;
    let dup = (fixed_header.byte1 & 0b1000) != 0;
    let retain = (fixed_header.byte1 & 0b0001) != 0;

    if qos == QoS::AtMostOnce && dup {
        return Err(CodecError::Malformed("dup flag set on qos 0 publish"));
    }

    let topic = read_mqtt_string(bytes)?;

    // Packet identifier exists where QoS > 0
    let pkid = match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce | QoS::ExactlyOnce => match read_u16(bytes)? {
            0 => return Err(CodecError::PacketIdZero),
            pkid => pkid,
        },
    };

    let payload = bytes.split_off(0);

    Ok(Publish {
        dup,
        qos,
        retain,
        topic,
        pkid,
        payload,
    })
}

pub fn write(publish: &Publish, buffer: &mut BytesMut) -> Result<usize, CodecError> {
    if publish.qos != QoS::AtMostOnce && publish.pkid == 0 {
        return Err(CodecError::PacketIdZero);
    }

    let len = publish.len();

    let dup = publish.dup as u8;
    let qos = publish.qos as u8;
    let retain = publish.retain as u8;
    buffer.put_u8(0b0011_0000 | retain | (qos << 1) | (dup << 3));

    let count = write_remaining_length(buffer, len)?;
    write_mqtt_string(buffer, &publish.topic)?;

    if publish.qos != QoS::AtMostOnce {
        buffer.put_u16(publish.pkid);
    }

    buffer.extend_from_slice(&publish.payload);

    Ok(1 + count + len)
}
