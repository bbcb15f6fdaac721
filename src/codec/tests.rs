use bytes::{Bytes, BytesMut};

use super::*;

const MAX: usize = MAX_REMAINING_LENGTH;

fn decode_all(bytes: &[u8]) -> Result<Option<Packet>, CodecError> {
    let mut buf = BytesMut::from(bytes);
    decode(&mut buf, MAX)
}

fn encoded(packet: &Packet) -> Vec<u8> {
    let mut buf = BytesMut::new();
    let written = encode(packet, &mut buf).unwrap();
    assert_eq!(written, buf.len());
    buf.to_vec()
}

#[test]
fn test_decode_connect_with_will_and_credentials() {
    let bytes: &[u8] = &[
        0x10, 0x27, // CONNECT, remaining length 39
        0x00, 0x04, b'M', b'Q', b'T', b'T', // protocol name
        0x04, // level
        0b1110_1110, // username, password, will retain, will qos 1, will, clean
        0x00, 0x3C, // keep alive 60
        0x00, 0x03, b'e', b's', b'p', // client id
        0x00, 0x04, b'e', b'/', b's', b't', // will topic
        0x00, 0x04, b'd', b'o', b'w', b'n', // will message
        0x00, 0x04, b'u', b's', b'e', b'r', // username
        0x00, 0x04, b'p', b'a', b's', b's', // password
    ];

    let packet = decode_all(bytes).unwrap().unwrap();
    let Packet::Connect(connect) = &packet else {
        panic!("expected CONNECT, got {packet:?}");
    };

    assert_eq!(connect.protocol_level, 4);
    assert!(connect.clean_session);
    assert_eq!(connect.keep_alive, 60);
    assert_eq!(connect.client_id, "esp");
    let will = connect.will.as_ref().unwrap();
    assert_eq!(will.topic, "e/st");
    assert_eq!(will.message, Bytes::from_static(b"down"));
    assert_eq!(will.qos, QoS::AtLeastOnce);
    assert!(will.retain);
    assert_eq!(connect.username.as_deref(), Some("user"));
    assert_eq!(connect.password, Some(Bytes::from_static(b"pass")));

    assert_eq!(encoded(&packet), bytes);
}

#[test]
fn test_decode_mqtt31_connect_and_unknown_level() {
    let mut connect = Connect::new("old", true, 15);
    connect.protocol_name = "MQIsdp".to_string();
    connect.protocol_level = 3;
    let bytes = encoded(&Packet::Connect(connect.clone()));
    assert_eq!(decode_all(&bytes).unwrap(), Some(Packet::Connect(connect.clone())));
    assert!(connect.is_supported_version());

    connect.protocol_name = "MQTT".to_string();
    connect.protocol_level = 5;
    let bytes = encoded(&Packet::Connect(connect.clone()));
    let Some(Packet::Connect(decoded)) = decode_all(&bytes).unwrap() else {
        panic!("level 5 connect should still decode");
    };
    assert!(!decoded.is_supported_version());
}

#[test]
fn test_publish_qos1_matches_wire_bytes() {
    let bytes: &[u8] = &[
        0x32, 0x0D, // PUBLISH qos 1, remaining length 13
        0x00, 0x05, b'a', b'/', b'b', b'/', b'c', // topic
        0x00, 0x0A, // packet id 10
        b'2', b'2', b'.', b'5', // payload
    ];

    let packet = decode_all(bytes).unwrap().unwrap();
    assert_eq!(
        packet,
        Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: "a/b/c".into(),
            pkid: 10,
            payload: Bytes::from_static(b"22.5"),
        })
    );
    assert_eq!(encoded(&packet), bytes);
}

#[test]
fn test_control_packets_survive_encode_then_decode() {
    let packets = vec![
        Packet::ConnAck(ConnAck::new(ConnectReturnCode::Accepted, true)),
        Packet::ConnAck(ConnAck::new(ConnectReturnCode::NotAuthorized, false)),
        Packet::PubAck(1),
        Packet::PubRec(2),
        Packet::PubRel(3),
        Packet::PubComp(4),
        Packet::Subscribe(Subscribe {
            pkid: 5,
            filters: vec![
                SubscribeFilter::new("sensors/+/temp", QoS::AtLeastOnce),
                SubscribeFilter::new("#", QoS::ExactlyOnce),
            ],
        }),
        Packet::SubAck(SubAck {
            pkid: 5,
            return_codes: vec![
                SubscribeReturnCode::Success(QoS::AtLeastOnce),
                SubscribeReturnCode::Failure,
            ],
        }),
        Packet::Unsubscribe(Unsubscribe {
            pkid: 6,
            topics: vec!["a/b".into(), "c".into()],
        }),
        Packet::UnsubAck(6),
        Packet::PingReq,
        Packet::PingResp,
        Packet::Disconnect,
    ];

    for packet in packets {
        let bytes = encoded(&packet);
        assert_eq!(decode_all(&bytes).unwrap(), Some(packet.clone()), "{}", packet.name());
    }
}

#[test]
fn test_fixed_size_packets_have_expected_bytes() {
    assert_eq!(encoded(&Packet::PingReq), [0xC0, 0x00]);
    assert_eq!(encoded(&Packet::PingResp), [0xD0, 0x00]);
    assert_eq!(encoded(&Packet::Disconnect), [0xE0, 0x00]);
    assert_eq!(encoded(&Packet::PubRel(0x0102)), [0x62, 0x02, 0x01, 0x02]);
    assert_eq!(
        encoded(&Packet::ConnAck(ConnAck::new(ConnectReturnCode::Accepted, false))),
        [0x20, 0x02, 0x00, 0x00]
    );
}

#[test]
fn test_partial_frames_need_more_data() {
    let mut full = BytesMut::new();
    encode(
        &Packet::Publish(Publish::new("t", QoS::AtMostOnce, "hello")),
        &mut full,
    )
    .unwrap();
    encode(&Packet::PingReq, &mut full).unwrap();

    let mut reader = PacketReader::new(MAX);
    reader.extend(&full[..5]);
    assert_eq!(reader.next_packet(), Ok(None));
    assert_eq!(reader.buffered(), 5);

    for byte in &full[5..full.len() - 1] {
        reader.extend(std::slice::from_ref(byte));
    }
    // PUBLISH is complete, PINGREQ is missing its length byte
    assert!(matches!(reader.next_packet(), Ok(Some(Packet::Publish(_)))));
    assert_eq!(reader.next_packet(), Ok(None));

    reader.extend(&full[full.len() - 1..]);
    assert_eq!(reader.next_packet(), Ok(Some(Packet::PingReq)));
    assert_eq!(reader.next_packet(), Ok(None));
    assert_eq!(reader.buffered(), 0);
}

#[test]
fn test_incomplete_varint_is_not_malformed() {
    assert_eq!(decode_all(&[]), Ok(None));
    assert_eq!(decode_all(&[0x30]), Ok(None));
    assert_eq!(decode_all(&[0x30, 0xFF, 0xFF]), Ok(None));
}

#[test]
fn test_five_byte_remaining_length_is_malformed() {
    assert_eq!(
        decode_all(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]),
        Err(CodecError::MalformedRemainingLength)
    );
}

#[test]
fn test_oversized_frame_rejected_before_body_arrives() {
    let mut buf = BytesMut::from(&[0x30, 0xFF, 0x01][..]);
    assert_eq!(decode(&mut buf, 64), Err(CodecError::PacketTooLarge(258)));
}

#[test]
fn test_remaining_length_inconsistent_with_body() {
    // PUBACK must carry exactly two bytes
    assert_eq!(
        decode_all(&[0x40, 0x03, 0x00, 0x01, 0x00]),
        Err(CodecError::TrailingBytes(1))
    );
    assert!(decode_all(&[0x40, 0x01, 0x00]).is_err());
    // topic length claims more than the frame holds
    assert_eq!(
        decode_all(&[0x30, 0x04, 0x00, 0x09, b'a', b'b']),
        Err(CodecError::BoundaryCrossed(9))
    );
    assert_eq!(
        decode_all(&[0xC0, 0x01, 0x00]),
        Err(CodecError::TrailingBytes(1))
    );
}

#[test]
fn test_invalid_utf8_topic_is_malformed() {
    assert_eq!(
        decode_all(&[0x30, 0x04, 0x00, 0x02, 0xC3, 0x28]),
        Err(CodecError::InvalidUtf8)
    );
    assert_eq!(
        decode_all(&[0x30, 0x04, 0x00, 0x02, b'a', 0x00]),
        Err(CodecError::InvalidUtf8)
    );
}

#[test]
fn test_invalid_qos_values() {
    assert_eq!(
        decode_all(&[0x36, 0x05, 0x00, 0x01, b'a', 0x00, 0x01]),
        Err(CodecError::InvalidQoS(3))
    );
    assert_eq!(
        decode_all(&[0x82, 0x06, 0x00, 0x01, 0x00, 0x01, b'a', 0x03]),
        Err(CodecError::InvalidQoS(3))
    );
}

#[test]
fn test_invalid_type_and_flag_combinations() {
    assert_eq!(decode_all(&[0x00, 0x00]), Err(CodecError::InvalidPacketType(0)));
    assert_eq!(decode_all(&[0xF0, 0x00]), Err(CodecError::InvalidPacketType(15)));
    assert_eq!(
        decode_all(&[0x80, 0x06, 0x00, 0x01, 0x00, 0x01, b'a', 0x00]),
        Err(CodecError::InvalidFlags {
            packet_type: 8,
            flags: 0
        })
    );
    assert_eq!(
        decode_all(&[0x60, 0x02, 0x00, 0x01]),
        Err(CodecError::InvalidFlags {
            packet_type: 6,
            flags: 0
        })
    );
    assert_eq!(
        decode_all(&[0xC1, 0x00]),
        Err(CodecError::InvalidFlags {
            packet_type: 12,
            flags: 1
        })
    );
    // DUP on a QoS 0 publish
    assert!(decode_all(&[0x38, 0x03, 0x00, 0x01, b'a']).is_err());
}

#[test]
fn test_connect_flag_violations() {
    let mut connect = BytesMut::new();
    encode(&Packet::Connect(Connect::new("c", true, 0)), &mut connect).unwrap();

    // flags byte sits after 2 header bytes, 6 protocol name bytes and the level
    let mut reserved = connect.clone();
    reserved[9] |= 0b0000_0001;
    assert_eq!(
        decode_all(&reserved),
        Err(CodecError::InvalidConnectFlags(0b0000_0011))
    );

    let mut will_qos_without_will = connect.clone();
    will_qos_without_will[9] |= 0b0000_1000;
    assert!(decode_all(&will_qos_without_will).is_err());

    let mut wrong_name = connect.to_vec();
    wrong_name[4..8].copy_from_slice(b"MQTX");
    assert_eq!(
        decode_all(&wrong_name),
        Err(CodecError::InvalidProtocol("MQTX".into()))
    );
}

#[test]
fn test_zero_packet_ids_and_empty_subscriptions() {
    assert_eq!(decode_all(&[0x40, 0x02, 0x00, 0x00]), Err(CodecError::PacketIdZero));
    assert_eq!(
        decode_all(&[0x82, 0x02, 0x00, 0x01]),
        Err(CodecError::EmptySubscription)
    );
    assert_eq!(
        decode_all(&[0xA2, 0x02, 0x00, 0x01]),
        Err(CodecError::EmptySubscription)
    );

    let mut buf = BytesMut::new();
    let publish = Publish::new("a", QoS::AtLeastOnce, "x");
    assert_eq!(
        encode(&Packet::Publish(publish), &mut buf),
        Err(CodecError::PacketIdZero)
    );
    assert!(buf.is_empty(), "rejected publish left {buf:?} behind");
}

#[test]
fn test_multi_byte_remaining_length() {
    let payload = vec![7u8; 200];
    let mut publish = Publish::new("big", QoS::ExactlyOnce, payload);
    publish.pkid = 77;
    publish.retain = true;
    let bytes = encoded(&Packet::Publish(publish.clone()));
    // 2 + 3 + 2 + 200 = 207 needs two varint bytes
    assert_eq!(&bytes[..3], &[0x35, 0xCF, 0x01]);
    assert_eq!(decode_all(&bytes).unwrap(), Some(Packet::Publish(publish)));
}
