use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::read_u8;
use crate::utils::error::CodecError;

/// CONNACK return codes defined by MQTT 3.1.1.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    BadUserNamePassword,
    NotAuthorized,
}

impl TryFrom<u8> for ConnectReturnCode {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let code = match value {
            0 => ConnectReturnCode::Accepted,
            1 => ConnectReturnCode::UnacceptableProtocolVersion,
            2 => ConnectReturnCode::IdentifierRejected,
            3 => ConnectReturnCode::ServerUnavailable,
            4 => ConnectReturnCode::BadUserNamePassword,
            5 => ConnectReturnCode::NotAuthorized,
            _ => return Err(CodecError::Malformed("unknown connack return code")),
        };
        Ok(code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: ConnectReturnCode,
}

impl ConnAck {
    pub fn new(code: ConnectReturnCode, session_present: bool) -> Self {
        Self {
            session_present,
            code,
        }
    }
}

pub fn read(bytes: &mut Bytes) -> Result<ConnAck, CodecError> {
    let flags = read_u8(bytes)?;
    if flags & 0b1111_1110 != 0 {
        return Err(CodecError::Malformed("reserved connack flags set"));
    }

    let code = ConnectReturnCode::try_from(read_u8(bytes)?)?;

    Ok(ConnAck {
        session_present: flags & 0x01 != 0,
        code,
    })
}

pub fn write(connack: &ConnAck, buffer: &mut BytesMut) -> Result<usize, CodecError> {
    buffer.put_u8(0x20);
    buffer.put_u8(0x02);
    buffer.put_u8(connack.session_present as u8);
    buffer.put_u8(connack.code as u8);
    Ok(4)
}
