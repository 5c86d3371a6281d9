//! The `codec` module turns MQTT 3.1.1 control packets into bytes and back.
//!
//! Decoding is streaming: [`MqttCodec::decode`] is handed the connection's
//! read buffer after every read and either splits one complete packet off its
//! front or reports that more bytes are needed. Encoding is deterministic: the
//! same [`Packet`] always produces the same bytes.

mod decoder;
mod encoder;
pub mod packet;
pub mod topic;

#[cfg(test)]
mod tests;

use bytes::{Bytes, BytesMut};

use crate::utils::error::MalformedPacketError;

pub use packet::*;

/// Packet encoder/decoder bounded by a maximum packet size.
#[derive(Debug, Clone, Copy)]
pub struct MqttCodec {
    max_packet_size: usize,
}

impl Default for MqttCodec {
    fn default() -> Self {
        Self::new(MAX_PACKET_SIZE)
    }
}

impl MqttCodec {
    /// Sizes above the protocol limit are clamped to it.
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            max_packet_size: max_packet_size.min(MAX_PACKET_SIZE),
        }
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Decode the next packet from `src`; `Ok(None)` means incomplete.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Packet>, MalformedPacketError> {
        decoder::decode_packet(src, self.max_packet_size)
    }

    /// Append the encoding of `packet` to `dst`.
    pub fn encode(&self, packet: &Packet, dst: &mut BytesMut) -> Result<(), MalformedPacketError> {
        encoder::encode_packet(packet, dst, self.max_packet_size)
    }

    /// Encode `packet` into a fresh buffer.
    pub fn to_bytes(&self, packet: &Packet) -> Result<Bytes, MalformedPacketError> {
        let mut buf = BytesMut::new();
        self.encode(packet, &mut buf)?;
        Ok(buf.freeze())
    }
}
