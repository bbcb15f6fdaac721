use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{QoS, read_u8, read_u16, write_remaining_length};
use crate::utils::error::CodecError;

/// Per-filter result carried in SUBACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReturnCode {
    Success(QoS),
    Failure,
}

impl SubscribeReturnCode {
    fn to_byte(self) -> u8 {
        match self {
            SubscribeReturnCode::Success(qos) => qos as u8,
            SubscribeReturnCode::Failure => 0x80,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub pkid: u16,
    pub return_codes: Vec<SubscribeReturnCode>,
}

pub fn read(bytes: &mut Bytes) -> Result<SubAck, CodecError> {
    let pkid = read_u16(bytes)?;
    let mut return_codes = Vec::new();

    while bytes.has_remaining() {
        let code = match read_u8(bytes)? {
            0x80 => SubscribeReturnCode::Failure,
            qos => SubscribeReturnCode::Success(QoS::try_from(qos)?),
        };
        return_codes.push(code);
    }

    if return_codes.is_empty() {
        return Err(CodecError::Malformed("suback without return codes"));
    }

    Ok(SubAck { pkid, return_codes })
}

pub fn write(suback: &SubAck, buffer: &mut BytesMut) -> Result<usize, CodecError> {
    buffer.put_u8(0x90);
    let remaining_len = 2 + suback.return_codes.len();
    let remaining_len_bytes = write_remaining_length(buffer, remaining_len)?;

    buffer.put_u16(suback.pkid);
    for code in &suback.return_codes {
        buffer.put_u8(code.to_byte());
    }

    Ok(1 + remaining_len_bytes + remaining_len)
}
