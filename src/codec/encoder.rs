use bytes::{BufMut, BytesMut};

use super::packet::*;
use crate::utils::error::MalformedPacketError;

/// Serialize `packet` onto the end of `dst`.
///
/// `dst` is left untouched when the packet cannot be encoded.
pub(crate) fn encode_packet(
    packet: &Packet,
    dst: &mut BytesMut,
    max_packet_size: usize,
) -> Result<(), MalformedPacketError> {
    let mut body = BytesMut::new();
    let flags = match packet {
        Packet::Connect(connect) => encode_connect(connect, &mut body)?,
        Packet::ConnAck(ack) => {
            body.put_u8(u8::from(ack.session_present));
            body.put_u8(ack.code as u8);
            0
        }
        Packet::Publish(publish) => encode_publish(publish, &mut body)?,
        Packet::PubAck(PubAck { packet_id })
        | Packet::PubRec(PubRec { packet_id })
        | Packet::PubComp(PubComp { packet_id })
        | Packet::UnsubAck(UnsubAck { packet_id }) => {
            put_packet_id(&mut body, *packet_id)?;
            0
        }
        Packet::PubRel(PubRel { packet_id }) => {
            put_packet_id(&mut body, *packet_id)?;
            0b0010
        }
        Packet::Subscribe(subscribe) => {
            if subscribe.filters.is_empty() {
                return Err(MalformedPacketError::Invalid("SUBSCRIBE without topic filters"));
            }
            put_packet_id(&mut body, subscribe.packet_id)?;
            for entry in &subscribe.filters {
                put_string(&mut body, &entry.filter)?;
                body.put_u8(entry.qos as u8);
            }
            0b0010
        }
        Packet::SubAck(ack) => {
            put_packet_id(&mut body, ack.packet_id)?;
            for code in &ack.return_codes {
                body.put_u8(code.to_byte());
            }
            0
        }
        Packet::Unsubscribe(unsubscribe) => {
            if unsubscribe.filters.is_empty() {
                return Err(MalformedPacketError::Invalid("UNSUBSCRIBE without topic filters"));
            }
            put_packet_id(&mut body, unsubscribe.packet_id)?;
            for filter in &unsubscribe.filters {
                put_string(&mut body, filter)?;
            }
            0b0010
        }
        Packet::PingReq | Packet::PingResp | Packet::Disconnect => 0,
    };

    let remaining = body.len();
    if remaining > MAX_REMAINING_LENGTH {
        return Err(MalformedPacketError::PacketTooLarge {
            size: remaining,
            max: max_packet_size,
        });
    }
    let size = 1 + remaining_length_len(remaining) + remaining;
    if size > max_packet_size {
        return Err(MalformedPacketError::PacketTooLarge {
            size,
            max: max_packet_size,
        });
    }

    dst.reserve(size);
    dst.put_u8(((packet.packet_type() as u8) << 4) | flags);
    put_remaining_length(dst, remaining);
    dst.extend_from_slice(&body);
    Ok(())
}

fn encode_connect(connect: &Connect, body: &mut BytesMut) -> Result<u8, MalformedPacketError> {
    if connect.password.is_some() && connect.username.is_none() {
        return Err(MalformedPacketError::Invalid("password without user name"));
    }

    put_string(body, PROTOCOL_NAME)?;
    body.put_u8(PROTOCOL_LEVEL);

    let mut flags = 0u8;
    if connect.username.is_some() {
        flags |= 0x80;
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    if let Some(will) = &connect.last_will {
        flags |= 0x04 | ((will.qos as u8) << 3);
        if will.retain {
            flags |= 0x20;
        }
    }
    if connect.clean_session {
        flags |= 0x02;
    }
    body.put_u8(flags);
    body.put_u16(connect.keep_alive);

    put_string(body, &connect.client_id)?;
    if let Some(will) = &connect.last_will {
        put_string(body, &will.topic)?;
        put_binary(body, &will.payload)?;
    }
    if let Some(username) = &connect.username {
        put_string(body, username)?;
    }
    if let Some(password) = &connect.password {
        put_binary(body, password)?;
    }
    Ok(0)
}

fn encode_publish(publish: &Publish, body: &mut BytesMut) -> Result<u8, MalformedPacketError> {
    put_string(body, &publish.topic)?;
    match (publish.qos, publish.packet_id) {
        (QoS::AtMostOnce, None) => {
            if publish.dup {
                return Err(MalformedPacketError::Invalid("DUP set on a QoS 0 PUBLISH"));
            }
        }
        (QoS::AtMostOnce, Some(_)) => {
            return Err(MalformedPacketError::Invalid("packet identifier on a QoS 0 PUBLISH"));
        }
        (_, None) => return Err(MalformedPacketError::ZeroPacketId),
        (_, Some(packet_id)) => put_packet_id(body, packet_id)?,
    }
    body.extend_from_slice(&publish.payload);

    let mut flags = (publish.qos as u8) << 1;
    if publish.dup {
        flags |= 0b1000;
    }
    if publish.retain {
        flags |= 0b0001;
    }
    Ok(flags)
}

fn put_packet_id(buf: &mut BytesMut, packet_id: u16) -> Result<(), MalformedPacketError> {
    if packet_id == 0 {
        return Err(MalformedPacketError::ZeroPacketId);
    }
    buf.put_u16(packet_id);
    Ok(())
}

fn put_string(buf: &mut BytesMut, value: &str) -> Result<(), MalformedPacketError> {
    if value.contains('\0') {
        return Err(MalformedPacketError::InvalidUtf8);
    }
    put_binary(buf, value.as_bytes())
}

fn put_binary(buf: &mut BytesMut, value: &[u8]) -> Result<(), MalformedPacketError> {
    let len = u16::try_from(value.len())
        .map_err(|_| MalformedPacketError::FieldTooLong(value.len()))?;
    buf.put_u16(len);
    buf.extend_from_slice(value);
    Ok(())
}

/// Variable byte integer: 7 bits per byte, high bit set when another byte follows.
fn put_remaining_length(buf: &mut BytesMut, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

fn remaining_length_len(len: usize) -> usize {
    match len {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}
