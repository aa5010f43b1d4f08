//! MQTT Packet Decoder

use bytes::Bytes;

use super::{read_string, read_u16, read_variable_int, DEFAULT_MAX_PACKET_SIZE};
use crate::protocol::{
    ConnAck, ConnectReturnCode, DecodeError, Packet, Publish, QoS, SubAck, SubscribeReturnCode,
};

/// Headers of a PUBLISH whose body is over the packet size limit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OversizedPublish {
    pub qos: QoS,
    pub topic: String,
    pub packet_id: Option<u16>,
    /// Fixed plus variable header length; the payload starts here
    pub header_len: usize,
    pub payload_len: usize,
}

/// MQTT Packet Decoder
///
/// Handles the packets a subscribing client receives plus the client's own
/// acknowledgements. CONNECT and SUBSCRIBE are never decoded.
#[derive(Debug, Clone)]
pub struct Decoder {
    /// Maximum remaining length accepted
    max_packet_size: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(super::MAX_REMAINING_LENGTH);
        self
    }

    /// Decode a packet from the buffer
    /// Returns (packet, bytes_consumed), or `None` if the buffer does not
    /// hold a complete packet yet.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let first_byte = buf[0];
        let packet_type = first_byte >> 4;
        let flags = first_byte & 0x0F;

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        if remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let total_len = 1 + len_bytes + remaining_length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        let body = &buf[1 + len_bytes..total_len];

        let packet = match packet_type {
            2 => decode_connack(flags, body)?,
            3 => decode_publish(flags, body)?,
            4 => Packet::PubAck(decode_packet_id(flags, 0, body)?),
            5 => Packet::PubRec(decode_packet_id(flags, 0, body)?),
            6 => Packet::PubRel(decode_packet_id(flags, 0x02, body)?),
            7 => Packet::PubComp(decode_packet_id(flags, 0, body)?),
            9 => decode_suback(flags, body)?,
            12 => {
                expect_empty(flags, body)?;
                Packet::PingReq
            }
            13 => {
                expect_empty(flags, body)?;
                Packet::PingResp
            }
            14 => {
                expect_empty(flags, body)?;
                Packet::Disconnect
            }
            _ => return Err(DecodeError::InvalidPacketType(packet_type)),
        };

        Ok(Some((packet, total_len)))
    }

    /// Read the headers of an over-limit PUBLISH at the start of `buf`
    ///
    /// Lets a reader skip the payload without buffering it. Returns `None`
    /// until the variable header has arrived. Any other packet type stays
    /// `PacketTooLarge`.
    pub fn decode_oversized_publish(
        &self,
        buf: &[u8],
    ) -> Result<Option<OversizedPublish>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }
        if buf[0] >> 4 != 3 {
            return Err(DecodeError::PacketTooLarge);
        }

        let qos_bits = (buf[0] >> 1) & 0x03;
        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };
        let remaining_length = remaining_length as usize;
        let start = 1 + len_bytes;
        let body = &buf[start..buf.len().min(start + remaining_length)];
        let partial = body.len() < remaining_length;

        let (topic, mut pos) = match read_string(body) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) if partial => return Ok(None),
            Err(e) => return Err(e),
        };

        let packet_id = if qos != QoS::AtMostOnce {
            let id = match read_u16(&body[pos..]) {
                Ok(id) => id,
                Err(DecodeError::InsufficientData) if partial => return Ok(None),
                Err(e) => return Err(e),
            };
            if id == 0 {
                return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
            }
            pos += 2;
            Some(id)
        } else {
            None
        };

        Ok(Some(OversizedPublish {
            qos,
            topic: topic.to_string(),
            packet_id,
            header_len: start + pos,
            payload_len: remaining_length - pos,
        }))
    }
}

fn expect_empty(flags: u8, body: &[u8]) -> Result<(), DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    if !body.is_empty() {
        return Err(DecodeError::MalformedPacket("unexpected payload"));
    }
    Ok(())
}

fn decode_packet_id(flags: u8, expected_flags: u8, body: &[u8]) -> Result<u16, DecodeError> {
    if flags != expected_flags {
        return Err(DecodeError::InvalidFlags);
    }
    if body.len() != 2 {
        return Err(DecodeError::MalformedPacket("expected a packet identifier"));
    }
    read_u16(body)
}

fn decode_connack(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    if body.len() != 2 {
        return Err(DecodeError::MalformedPacket("CONNACK must be 2 bytes"));
    }
    if (body[0] & 0xFE) != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    let return_code =
        ConnectReturnCode::from_u8(body[1]).ok_or(DecodeError::InvalidReturnCode(body[1]))?;

    Ok(Packet::ConnAck(ConnAck {
        session_present: (body[0] & 0x01) != 0,
        return_code,
    }))
}

fn decode_publish(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    let dup = (flags & 0x08) != 0;
    let qos_bits = (flags >> 1) & 0x03;
    let retain = (flags & 0x01) != 0;

    let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

    if qos == QoS::AtMostOnce && dup {
        return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
    }

    let (topic, mut pos) = read_string(body)?;

    if topic.contains('+') || topic.contains('#') {
        return Err(DecodeError::MalformedPacket("topic contains wildcard"));
    }

    let packet_id = if qos != QoS::AtMostOnce {
        let id = read_u16(&body[pos..])?;
        if id == 0 {
            return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
        }
        pos += 2;
        Some(id)
    } else {
        None
    };

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic: topic.to_string(),
        packet_id,
        payload: Bytes::copy_from_slice(&body[pos..]),
    }))
}

fn decode_suback(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    let packet_id = read_u16(body)?;
    let return_codes = body[2..]
        .iter()
        .map(|&b| SubscribeReturnCode::from_u8(b).ok_or(DecodeError::InvalidReturnCode(b)))
        .collect::<Result<Vec<_>, _>>()?;

    if return_codes.is_empty() {
        return Err(DecodeError::MalformedPacket("SUBACK without return codes"));
    }

    Ok(Packet::SubAck(SubAck {
        packet_id,
        return_codes,
    }))
}
