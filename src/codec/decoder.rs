use bytes::{Buf, Bytes, BytesMut};

use super::packet::*;
use super::topic;
use crate::utils::error::MalformedPacketError;

/// Decode one packet from the front of `src`.
///
/// Returns `Ok(None)` and leaves `src` untouched when the buffer does not
/// yet hold a complete packet. A complete packet is split off `src` whether
/// or not its body turns out to be valid.
pub(crate) fn decode_packet(
    src: &mut BytesMut,
    max_packet_size: usize,
) -> Result<Option<Packet>, MalformedPacketError> {
    if src.is_empty() {
        return Ok(None);
    }

    let first = src[0];
    let packet_type = PacketType::try_from(first >> 4)?;
    let flags = first & 0x0F;
    if let Some(required) = packet_type.required_flags() {
        if flags != required {
            return Err(MalformedPacketError::InvalidFlags { packet_type, flags });
        }
    }

    let Some((remaining, len_bytes)) = read_remaining_length(&src[1..])? else {
        return Ok(None);
    };
    let size = 1 + len_bytes + remaining;
    if size > max_packet_size {
        return Err(MalformedPacketError::PacketTooLarge {
            size,
            max: max_packet_size,
        });
    }
    // the caller grows the buffer as bytes arrive
    if src.len() < size {
        return Ok(None);
    }

    let mut frame = src.split_to(size).freeze();
    frame.advance(1 + len_bytes);
    decode_body(packet_type, flags, Body(frame)).map(Some)
}

/// Returns the decoded value and how many bytes it occupied, or `None` if
/// the length field itself is still incomplete.
fn read_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, MalformedPacketError> {
    let mut value = 0usize;
    let mut multiplier = 1usize;
    for (i, byte) in buf.iter().take(4).enumerate() {
        value += usize::from(byte & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        multiplier *= 128;
    }
    if buf.len() >= 4 {
        Err(MalformedPacketError::MalformedRemainingLength)
    } else {
        Ok(None)
    }
}

fn decode_body(packet_type: PacketType, flags: u8, mut body: Body) -> Result<Packet, MalformedPacketError> {
    let packet = match packet_type {
        PacketType::Connect => Packet::Connect(decode_connect(&mut body)?),
        PacketType::ConnAck => {
            let ack_flags = body.u8()?;
            if ack_flags & 0xFE != 0 {
                return Err(MalformedPacketError::Invalid("reserved CONNACK flags set"));
            }
            let code = ConnectReturnCode::try_from(body.u8()?)?;
            let session_present = ack_flags & 0x01 == 0x01;
            if session_present && code.is_error() {
                return Err(MalformedPacketError::Invalid(
                    "session present on a refused connection",
                ));
            }
            Packet::ConnAck(ConnAck {
                session_present,
                code,
            })
        }
        PacketType::Publish => return decode_publish(flags, body),
        PacketType::PubAck => Packet::PubAck(PubAck {
            packet_id: body.packet_id()?,
        }),
        PacketType::PubRec => Packet::PubRec(PubRec {
            packet_id: body.packet_id()?,
        }),
        PacketType::PubRel => Packet::PubRel(PubRel {
            packet_id: body.packet_id()?,
        }),
        PacketType::PubComp => Packet::PubComp(PubComp {
            packet_id: body.packet_id()?,
        }),
        PacketType::Subscribe => {
            let packet_id = body.packet_id()?;
            let mut filters = Vec::new();
            while body.has_remaining() {
                let filter = body.string()?;
                let options = body.u8()?;
                if options & 0xFC != 0 {
                    return Err(MalformedPacketError::Invalid("reserved subscription option bits set"));
                }
                filters.push(SubscribeFilter {
                    filter,
                    qos: QoS::try_from(options)?,
                });
            }
            if filters.is_empty() {
                return Err(MalformedPacketError::Invalid("SUBSCRIBE without topic filters"));
            }
            Packet::Subscribe(Subscribe { packet_id, filters })
        }
        PacketType::SubAck => {
            let packet_id = body.packet_id()?;
            let return_codes = body
                .rest()
                .iter()
                .map(|byte| SubscribeReturnCode::from_byte(*byte))
                .collect::<Result<Vec<_>, _>>()?;
            if return_codes.is_empty() {
                return Err(MalformedPacketError::Invalid("SUBACK without return codes"));
            }
            Packet::SubAck(SubAck {
                packet_id,
                return_codes,
            })
        }
        PacketType::Unsubscribe => {
            let packet_id = body.packet_id()?;
            let mut filters = Vec::new();
            while body.has_remaining() {
                filters.push(body.string()?);
            }
            if filters.is_empty() {
                return Err(MalformedPacketError::Invalid("UNSUBSCRIBE without topic filters"));
            }
            Packet::Unsubscribe(Unsubscribe { packet_id, filters })
        }
        PacketType::UnsubAck => Packet::UnsubAck(UnsubAck {
            packet_id: body.packet_id()?,
        }),
        PacketType::PingReq => Packet::PingReq,
        PacketType::PingResp => Packet::PingResp,
        PacketType::Disconnect => Packet::Disconnect,
    };
    body.finish()?;
    Ok(packet)
}

fn decode_connect(body: &mut Body) -> Result<Connect, MalformedPacketError> {
    let protocol_name = body.string()?;
    let level = body.u8()?;
    if protocol_name != PROTOCOL_NAME || level != PROTOCOL_LEVEL {
        return Err(MalformedPacketError::UnsupportedProtocol);
    }

    let flags = body.u8()?;
    if flags & 0x01 != 0 {
        return Err(MalformedPacketError::Invalid("reserved CONNECT flag set"));
    }
    let has_username = flags & 0x80 != 0;
    let has_password = flags & 0x40 != 0;
    let will_retain = flags & 0x20 != 0;
    let will_qos = QoS::try_from((flags >> 3) & 0x03)?;
    let has_will = flags & 0x04 != 0;
    let clean_session = flags & 0x02 != 0;

    if !has_will && (will_retain || will_qos != QoS::AtMostOnce) {
        return Err(MalformedPacketError::Invalid("will QoS or retain set without a will"));
    }
    if has_password && !has_username {
        return Err(MalformedPacketError::Invalid("password without user name"));
    }

    let keep_alive = body.u16()?;
    let client_id = body.string()?;
    let last_will = if has_will {
        Some(LastWill {
            topic: body.string()?,
            payload: body.binary()?,
            qos: will_qos,
            retain: will_retain,
        })
    } else {
        None
    };
    let username = if has_username { Some(body.string()?) } else { None };
    let password = if has_password { Some(body.binary()?) } else { None };

    Ok(Connect {
        client_id,
        keep_alive,
        clean_session,
        username,
        password,
        last_will,
    })
}

fn decode_publish(flags: u8, mut body: Body) -> Result<Packet, MalformedPacketError> {
    let dup = flags & 0b1000 != 0;
    let qos = QoS::try_from((flags >> 1) & 0b11)?;
    let retain = flags & 0b0001 != 0;
    if dup && qos == QoS::AtMostOnce {
        return Err(MalformedPacketError::Invalid("DUP set on a QoS 0 PUBLISH"));
    }

    let topic = body.string()?;
    if !topic::valid_topic_name(&topic) {
        return Err(MalformedPacketError::Invalid("invalid topic name in PUBLISH"));
    }
    let packet_id = match qos {
        QoS::AtMostOnce => None,
        _ => Some(body.packet_id()?),
    };

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic,
        packet_id,
        payload: body.rest(),
    }))
}

/// Bounds-checked reader over a packet's variable header and payload.
struct Body(Bytes);

impl Body {
    fn has_remaining(&self) -> bool {
        self.0.has_remaining()
    }

    fn u8(&mut self) -> Result<u8, MalformedPacketError> {
        if self.0.remaining() < 1 {
            return Err(MalformedPacketError::UnexpectedEof);
        }
        Ok(self.0.get_u8())
    }

    fn u16(&mut self) -> Result<u16, MalformedPacketError> {
        if self.0.remaining() < 2 {
            return Err(MalformedPacketError::UnexpectedEof);
        }
        Ok(self.0.get_u16())
    }

    fn packet_id(&mut self) -> Result<u16, MalformedPacketError> {
        match self.u16()? {
            0 => Err(MalformedPacketError::ZeroPacketId),
            id => Ok(id),
        }
    }

    fn binary(&mut self) -> Result<Bytes, MalformedPacketError> {
        let len = usize::from(self.u16()?);
        if self.0.remaining() < len {
            return Err(MalformedPacketError::UnexpectedEof);
        }
        Ok(self.0.split_to(len))
    }

    fn string(&mut self) -> Result<String, MalformedPacketError> {
        let raw = self.binary()?;
        let value = String::from_utf8(raw.to_vec()).map_err(|_| MalformedPacketError::InvalidUtf8)?;
        if value.contains('\0') {
            return Err(MalformedPacketError::InvalidUtf8);
        }
        Ok(value)
    }

    fn rest(&mut self) -> Bytes {
        let len = self.0.remaining();
        self.0.split_to(len)
    }

    fn finish(&self) -> Result<(), MalformedPacketError> {
        match self.0.remaining() {
            0 => Ok(()),
            extra => Err(MalformedPacketError::TrailingBytes(extra)),
        }
    }
}
