use bytes::{Bytes, BytesMut};

use super::topic::{matches, valid_topic_filter, valid_topic_name};
use super::*;
use crate::utils::error::MalformedPacketError;

fn decode_all(codec: &MqttCodec, bytes: &[u8]) -> Result<Option<Packet>, MalformedPacketError> {
    let mut buf = BytesMut::from(bytes);
    codec.decode(&mut buf)
}

fn sample_packets() -> Vec<Packet> {
    vec![
        Packet::Connect(Connect {
            client_id: "sensor-7".to_string(),
            keep_alive: 30,
            clean_session: false,
            username: Some("user".to_string()),
            password: Some(Bytes::from_static(b"secret")),
            last_will: Some(LastWill {
                topic: "status/sensor-7".to_string(),
                payload: Bytes::from_static(b"offline"),
                qos: QoS::AtLeastOnce,
                retain: true,
            }),
        }),
        Packet::ConnAck(ConnAck {
            session_present: true,
            code: ConnectReturnCode::Accepted,
        }),
        Packet::Publish(Publish::new("sensors/temp", &b"21.5"[..])),
        Packet::Publish(Publish {
            dup: true,
            qos: QoS::ExactlyOnce,
            retain: true,
            topic: "alerts".to_string(),
            packet_id: Some(65_535),
            payload: Bytes::new(),
        }),
        Packet::PubAck(PubAck { packet_id: 1 }),
        Packet::PubRec(PubRec { packet_id: 2 }),
        Packet::PubRel(PubRel { packet_id: 3 }),
        Packet::PubComp(PubComp { packet_id: 4 }),
        Packet::Subscribe(Subscribe {
            packet_id: 10,
            filters: vec![
                SubscribeFilter::new("sensors/+/temp", QoS::AtLeastOnce),
                SubscribeFilter::new("alerts/#", QoS::ExactlyOnce),
            ],
        }),
        Packet::SubAck(SubAck {
            packet_id: 10,
            return_codes: vec![
                SubscribeReturnCode::Success(QoS::AtLeastOnce),
                SubscribeReturnCode::Failure,
            ],
        }),
        Packet::Unsubscribe(Unsubscribe {
            packet_id: 11,
            filters: vec!["alerts/#".to_string()],
        }),
        Packet::UnsubAck(UnsubAck { packet_id: 11 }),
        Packet::PingReq,
        Packet::PingResp,
        Packet::Disconnect,
    ]
}

#[test]
fn test_decode_inverts_encode() {
    let codec = MqttCodec::default();
    for packet in sample_packets() {
        let bytes = codec.to_bytes(&packet).unwrap();
        let decoded = decode_all(&codec, &bytes).unwrap();
        assert_eq!(decoded, Some(packet));
    }
}

#[test]
fn test_connect_wire_format() {
    let codec = MqttCodec::default();
    let connect = Packet::Connect(Connect {
        client_id: "abc".to_string(),
        keep_alive: 60,
        clean_session: true,
        username: None,
        password: None,
        last_will: None,
    });

    let bytes = codec.to_bytes(&connect).unwrap();
    assert_eq!(
        &bytes[..],
        &[
            0x10, 15, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x3C, 0x00, 0x03,
            b'a', b'b', b'c'
        ]
    );
}

#[test]
fn test_encoding_is_deterministic() {
    let codec = MqttCodec::default();
    for packet in sample_packets() {
        assert_eq!(codec.to_bytes(&packet).unwrap(), codec.to_bytes(&packet).unwrap());
    }
}

#[test]
fn test_multi_byte_remaining_length() {
    let codec = MqttCodec::default();
    let publish = Packet::Publish(Publish::new("t", vec![0xAB; 200]));

    let bytes = codec.to_bytes(&publish).unwrap();
    // 2 (topic length) + 1 (topic) + 200 (payload) = 203
    assert_eq!(&bytes[..3], &[0x30, 0xCB, 0x01]);
    assert_eq!(bytes.len(), 3 + 203);
    assert_eq!(decode_all(&codec, &bytes).unwrap(), Some(publish));
}

#[test]
fn test_partial_buffer_is_incomplete_until_last_byte() {
    let codec = MqttCodec::default();
    let packet = Packet::Subscribe(Subscribe {
        packet_id: 42,
        filters: vec![SubscribeFilter::new("a/b", QoS::AtLeastOnce)],
    });
    let bytes = codec.to_bytes(&packet).unwrap();

    let mut buf = BytesMut::new();
    for (i, byte) in bytes.iter().enumerate() {
        buf.extend_from_slice(&[*byte]);
        let decoded = codec.decode(&mut buf).unwrap();
        if i + 1 < bytes.len() {
            assert_eq!(decoded, None);
            assert_eq!(buf.len(), i + 1);
        } else {
            assert_eq!(decoded, Some(packet.clone()));
        }
    }
    assert!(buf.is_empty());
}

#[test]
fn test_back_to_back_packets_decode_in_order() {
    let codec = MqttCodec::default();
    let mut buf = BytesMut::new();
    codec.encode(&Packet::PubAck(PubAck { packet_id: 7 }), &mut buf).unwrap();
    codec.encode(&Packet::PingResp, &mut buf).unwrap();
    buf.extend_from_slice(&[0x30]);

    assert_eq!(
        codec.decode(&mut buf).unwrap(),
        Some(Packet::PubAck(PubAck { packet_id: 7 }))
    );
    assert_eq!(codec.decode(&mut buf).unwrap(), Some(Packet::PingResp));
    assert_eq!(codec.decode(&mut buf).unwrap(), None);
    assert_eq!(&buf[..], &[0x30]);
}

#[test]
fn test_remaining_length_longer_than_four_bytes_is_malformed() {
    let codec = MqttCodec::default();
    assert_eq!(decode_all(&codec, &[0x30, 0xFF, 0xFF]).unwrap(), None);
    assert_eq!(
        decode_all(&codec, &[0x30, 0xFF, 0xFF, 0xFF, 0xFF]),
        Err(MalformedPacketError::MalformedRemainingLength)
    );
}

#[test]
fn test_oversized_packet_rejected_from_header() {
    let codec = MqttCodec::new(10);
    assert_eq!(
        decode_all(&codec, &[0x30, 100]),
        Err(MalformedPacketError::PacketTooLarge { size: 102, max: 10 })
    );

    let mut dst = BytesMut::new();
    let result = codec.encode(&Packet::Publish(Publish::new("topic", vec![0; 32])), &mut dst);
    assert!(matches!(result, Err(MalformedPacketError::PacketTooLarge { .. })));
    assert!(dst.is_empty());
}

#[test]
fn test_header_alone_does_not_grow_the_buffer() {
    // PUBLISH claiming a 192 MiB body
    let mut buf = BytesMut::from(&[0x30, 0x80, 0x80, 0x80, 0x60][..]);
    let before = buf.capacity();
    assert_eq!(MqttCodec::default().decode(&mut buf), Ok(None));
    assert_eq!(buf.len(), 5);
    assert_eq!(buf.capacity(), before);
}

#[test]
fn test_reserved_flags_are_checked() {
    let codec = MqttCodec::default();
    assert_eq!(
        decode_all(&codec, &[0x60, 0x02, 0x00, 0x01]),
        Err(MalformedPacketError::InvalidFlags {
            packet_type: PacketType::PubRel,
            flags: 0,
        })
    );
    assert_eq!(
        decode_all(&codec, &[0x62, 0x02, 0x00, 0x01]).unwrap(),
        Some(Packet::PubRel(PubRel { packet_id: 1 }))
    );
    assert_eq!(
        decode_all(&codec, &[0x00, 0x00]),
        Err(MalformedPacketError::InvalidPacketType(0))
    );
}

#[test]
fn test_publish_with_qos_3_is_malformed() {
    let codec = MqttCodec::default();
    assert_eq!(
        decode_all(&codec, &[0x36, 0x05, 0x00, 0x01, b't', 0x00, 0x01]),
        Err(MalformedPacketError::InvalidQoS(3))
    );
}

#[test]
fn test_publish_topic_with_wildcard_is_malformed() {
    let codec = MqttCodec::default();
    assert!(matches!(
        decode_all(&codec, &[0x30, 0x03, 0x00, 0x01, b'#']),
        Err(MalformedPacketError::Invalid(_))
    ));
}

#[test]
fn test_zero_packet_id_is_malformed() {
    let codec = MqttCodec::default();
    assert_eq!(
        decode_all(&codec, &[0x40, 0x02, 0x00, 0x00]),
        Err(MalformedPacketError::ZeroPacketId)
    );
    assert_eq!(
        codec.to_bytes(&Packet::PubAck(PubAck { packet_id: 0 })),
        Err(MalformedPacketError::ZeroPacketId)
    );
}

#[test]
fn test_connack_refusal_codes() {
    let codec = MqttCodec::default();
    assert_eq!(
        decode_all(&codec, &[0x20, 0x02, 0x00, 0x05]).unwrap(),
        Some(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::NotAuthorized,
        }))
    );
    assert_eq!(
        decode_all(&codec, &[0x20, 0x02, 0x00, 0x06]),
        Err(MalformedPacketError::InvalidReturnCode(6))
    );
    assert!(decode_all(&codec, &[0x20, 0x02, 0x01, 0x05]).is_err());
}

#[test]
fn test_trailing_bytes_are_malformed() {
    let codec = MqttCodec::default();
    assert_eq!(
        decode_all(&codec, &[0xD0, 0x01, 0x00]),
        Err(MalformedPacketError::TrailingBytes(1))
    );
}

#[test]
fn test_invalid_utf8_string_is_malformed() {
    let codec = MqttCodec::default();
    assert_eq!(
        decode_all(&codec, &[0x30, 0x04, 0x00, 0x02, 0xC3, 0x28]),
        Err(MalformedPacketError::InvalidUtf8)
    );
}

#[test]
fn test_connect_with_unknown_protocol_level() {
    let codec = MqttCodec::default();
    let mut bytes = codec
        .to_bytes(&Packet::Connect(Connect {
            client_id: "x".to_string(),
            keep_alive: 0,
            clean_session: true,
            username: None,
            password: None,
            last_will: None,
        }))
        .unwrap()
        .to_vec();
    // protocol level follows the 2 length bytes and "MQTT"
    bytes[8] = 5;
    assert_eq!(
        decode_all(&codec, &bytes),
        Err(MalformedPacketError::UnsupportedProtocol)
    );
}

#[test]
fn test_password_requires_username() {
    let codec = MqttCodec::default();
    let connect = Packet::Connect(Connect {
        client_id: "x".to_string(),
        keep_alive: 0,
        clean_session: true,
        username: None,
        password: Some(Bytes::from_static(b"pw")),
        last_will: None,
    });
    assert!(codec.to_bytes(&connect).is_err());
}

#[test]
fn test_topic_name_validation() {
    assert!(valid_topic_name("sensors/temp"));
    assert!(valid_topic_name("/"));
    assert!(!valid_topic_name(""));
    assert!(!valid_topic_name("sensors/+"));
    assert!(!valid_topic_name("sensors/#"));
}

#[test]
fn test_topic_filter_validation() {
    assert!(valid_topic_filter("#"));
    assert!(valid_topic_filter("+"));
    assert!(valid_topic_filter("sensors/+/temp"));
    assert!(valid_topic_filter("sensors/#"));
    assert!(!valid_topic_filter(""));
    assert!(!valid_topic_filter("sensors/#/temp"));
    assert!(!valid_topic_filter("sensors/te#"));
    assert!(!valid_topic_filter("sensors/t+"));
}

#[test]
fn test_topic_matching() {
    assert!(matches("sensors/+/temp", "sensors/kitchen/temp"));
    assert!(!matches("sensors/+/temp", "sensors/kitchen/humidity"));
    assert!(matches("sensors/#", "sensors"));
    assert!(matches("sensors/#", "sensors/a/b/c"));
    assert!(matches("#", "anything/at/all"));
    assert!(!matches("#", "$SYS/uptime"));
    assert!(!matches("+/uptime", "$SYS/uptime"));
    assert!(matches("$SYS/#", "$SYS/uptime"));
    assert!(!matches("a/+", "a"));
    assert!(matches("a/+", "a/"));
}
