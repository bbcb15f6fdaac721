use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{
    QoS, read_mqtt_bytes, read_mqtt_string, read_u8, read_u16, write_mqtt_bytes,
    write_mqtt_string, write_remaining_length,
};
use crate::utils::error::CodecError;

/// Protocol name and level sent by MQTT 3.1.1 clients.
pub const MQTT_V311: (&str, u8) = ("MQTT", 4);
/// Protocol name and level sent by MQTT 3.1 clients.
pub const MQTT_V31: (&str, u8) = ("MQIsdp", 3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub protocol_name: String,
    /// Left unvalidated here so the broker can answer with
    /// `UnacceptableProtocolVersion` instead of dropping the connection.
    pub protocol_level: u8,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<LastWill>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

impl Connect {
    /// A 3.1.1 CONNECT with no will and no credentials.
    pub fn new(client_id: impl Into<String>, clean_session: bool, keep_alive: u16) -> Self {
        Self {
            protocol_name: MQTT_V311.0.to_string(),
            protocol_level: MQTT_V311.1,
            clean_session,
            keep_alive,
            client_id: client_id.into(),
            will: None,
            username: None,
            password: None,
        }
    }

    pub fn is_supported_version(&self) -> bool {
        (self.protocol_name.as_str(), self.protocol_level) == MQTT_V311
            || (self.protocol_name.as_str(), self.protocol_level) == MQTT_V31
    }

    fn len(&self) -> usize {
        let mut len = 2 + self.protocol_name.len() + 1 + 1 + 2 + 2 + self.client_id.len();
        if let Some(will) = &self.will {
            len += 2 + will.topic.len() + 2 + will.message.len();
        }
        if let Some(username) = &self.username {
            len += 2 + username.len();
        }
        if let Some(password) = &self.password {
            len += 2 + password.len();
        }
        len
    }
}

/// Will message registered in CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub message: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

pub fn read(bytes: &mut Bytes) -> Result<Connect, CodecError> {
    let protocol_name = read_mqtt_string(bytes)?;
    if protocol_name != MQTT_V311.0 && protocol_name != MQTT_V31.0 {
        return Err(CodecError::InvalidProtocol(protocol_name));
    }

    let protocol_level = read_u8(bytes)?;
    let connect_flags = read_u8(bytes)?;
    let keep_alive = read_u16(bytes)?;

    if connect_flags & 0b0000_0001 != 0 {
        return Err(CodecError::InvalidConnectFlags(connect_flags));
    }

    let clean_session = connect_flags & 0b0000_0010 != 0;
    let will_flag = connect_flags & 0b0000_0100 != 0;
    let will_qos = (connect_flags & 0b0001_1000) >> 3;
    let will_retain = connect_flags & 0b0010_0000 != 0;
    let password_flag = connect_flags & 0b0100_0000 != 0;
    let username_flag = connect_flags & 0b1000_0000 != 0;

    if !will_flag && (will_qos != 0 || will_retain) {
        return Err(CodecError::InvalidConnectFlags(connect_flags));
    }
    if password_flag && !username_flag {
        return Err(CodecError::InvalidConnectFlags(connect_flags));
    }

    let client_id = read_mqtt_string(bytes)?;

    let will = match will_flag {
        true => {
            let qos = QoS::try_from(will_qos)?;
            let topic = read_mqtt_string(bytes)?;
            let message = read_mqtt_bytes(bytes)?;
            Some(LastWill {
                topic,
                message,
                qos,
                retain: will_retain,
            })
        }
        false => None,
    };

    let username = match username_flag {
        true => Some(read_mqtt_string(bytes)?),
        false => None,
    };

    let password = match password_flag {
        true => Some(read_mqtt_bytes(bytes)?),
        false => None,
    };

    Ok(Connect {
        protocol_name,
        protocol_level,
        clean_session,
        keep_alive,
        client_id,
        will,
        username,
        password,
    })
}

pub fn write(connect: &Connect, buffer: &mut BytesMut) -> Result<usize, CodecError> {
    let len = connect.len();
    buffer.put_u8(0b0001_0000);
    let count = write_remaining_length(buffer, len)?;

    write_mqtt_string(buffer, &connect.protocol_name)?;
    buffer.put_u8(connect.protocol_level);

    let mut connect_flags = 0;
    if connect.clean_session {
        connect_flags |= 0b0000_0010;
    }
    if let Some(will) = &connect.will {
        connect_flags |= 0b0000_0100;
        connect_flags |= (will.qos as u8) << 3;
        if will.retain {
            connect_flags |= 0b0010_0000;
        }
    }
    if connect.password.is_some() {
        connect_flags |= 0b0100_0000;
    }
    if connect.username.is_some() {
        connect_flags |= 0b1000_0000;
    }

    buffer.put_u8(connect_flags);
    buffer.put_u16(connect.keep_alive);
    write_mqtt_string(buffer, &connect.client_id)?;

    if let Some(will) = &connect.will {
        write_mqtt_string(buffer, &will.topic)?;
        write_mqtt_bytes(buffer, &will.message)?;
    }
    if let Some(username) = &connect.username {
        write_mqtt_string(buffer, username)?;
    }
    if let Some(password) = &connect.password {
        write_mqtt_bytes(buffer, password)?;
    }

    Ok(1 + count + len)
}
