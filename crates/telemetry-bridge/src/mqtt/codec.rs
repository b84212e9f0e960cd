// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT 3.1.1 packet codec.
//!
//! Covers the packets a subscribing client exchanges with a broker. Both
//! directions are encoded and decoded so a loopback broker can reuse them.
//!
//! Fixed header layout:
//!
//! ```text
//! +--------+--------+-----------------------+------------------+
//! | type:4 | flags:4| remaining length 1..4 | variable + body  |
//! +--------+--------+-----------------------+------------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

const CONNECT: u8 = 1;
const CONNACK: u8 = 2;
const PUBLISH: u8 = 3;
const PUBACK: u8 = 4;
const SUBSCRIBE: u8 = 8;
const SUBACK: u8 = 9;
const PINGREQ: u8 = 12;
const PINGRESP: u8 = 13;
const DISCONNECT: u8 = 14;

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 4;

/// Largest value the remaining-length varint can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// SUBACK return code for a refused filter.
pub const SUBACK_FAILURE: u8 = 0x80;

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("malformed remaining length")]
    MalformedRemainingLength,

    #[error("packet too large: {size} > {max}")]
    PacketTooLarge { size: usize, max: usize },

    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),

    #[error("invalid flags {flags:#06b} for packet type {packet_type}")]
    InvalidFlags { packet_type: u8, flags: u8 },

    #[error("invalid QoS {0}")]
    InvalidQos(u8),

    #[error("truncated {0}")]
    Truncated(&'static str),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("unsupported protocol {name} level {level}")]
    UnsupportedProtocol { name: String, level: u8 },
}

/// CONNECT payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

/// PUBLISH packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub qos: u8,
    pub dup: bool,
    pub retain: bool,
    /// Present for QoS 1 and 2.
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

/// Control packets understood by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck { session_present: bool, code: u8 },
    Publish(Publish),
    PubAck { packet_id: u16 },
    Subscribe { packet_id: u16, filters: Vec<(String, u8)> },
    SubAck { packet_id: u16, return_codes: Vec<u8> },
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnAck { .. } => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PubAck { .. } => "PUBACK",
            Packet::Subscribe { .. } => "SUBSCRIBE",
            Packet::SubAck { .. } => "SUBACK",
            Packet::PingReq => "PINGREQ",
            Packet::PingResp => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }
}

/// Try to decode one packet from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed; `buf` is only consumed
/// once a whole packet is available.
pub fn decode(buf: &mut BytesMut, max_packet_size: usize) -> Result<Option<Packet>, CodecError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let mut remaining = 0usize;
    let mut multiplier = 1usize;
    let mut header_len = 1;
    loop {
        if header_len > 4 {
            return Err(CodecError::MalformedRemainingLength);
        }
        let Some(&byte) = buf.get(header_len) else {
            return Ok(None);
        };
        remaining += usize::from(byte & 0x7F) * multiplier;
        multiplier *= 128;
        header_len += 1;
        if byte & 0x80 == 0 {
            break;
        }
    }

    let total = header_len + remaining;
    if total > max_packet_size {
        return Err(CodecError::PacketTooLarge {
            size: total,
            max: max_packet_size,
        });
    }
    if buf.len() < total {
        buf.reserve(total - buf.len());
        return Ok(None);
    }

    let first = buf[0];
    let mut frame = buf.split_to(total).freeze();
    frame.advance(header_len);
    parse(first >> 4, first & 0x0F, frame).map(Some)
}

fn parse(packet_type: u8, flags: u8, mut body: Bytes) -> Result<Packet, CodecError> {
    let expect_flags = |expected: u8| {
        if flags == expected {
            Ok(())
        } else {
            Err(CodecError::InvalidFlags { packet_type, flags })
        }
    };

    match packet_type {
        CONNECT => {
            expect_flags(0)?;
            parse_connect(&mut body).map(Packet::Connect)
        }
        CONNACK => {
            expect_flags(0)?;
            if body.remaining() < 2 {
                return Err(CodecError::Truncated("CONNACK"));
            }
            let ack_flags = body.get_u8();
            let code = body.get_u8();
            Ok(Packet::ConnAck {
                session_present: ack_flags & 0x01 != 0,
                code,
            })
        }
        PUBLISH => {
            let qos = (flags >> 1) & 0x03;
            if qos > 2 {
                return Err(CodecError::InvalidQos(qos));
            }
            let topic = read_string(&mut body, "PUBLISH topic")?;
            let packet_id = if qos > 0 {
                Some(read_u16(&mut body, "PUBLISH packet id")?)
            } else {
                None
            };
            Ok(Packet::Publish(Publish {
                topic,
                qos,
                dup: flags & 0x08 != 0,
                retain: flags & 0x01 != 0,
                packet_id,
                payload: body,
            }))
        }
        PUBACK => {
            expect_flags(0)?;
            Ok(Packet::PubAck {
                packet_id: read_u16(&mut body, "PUBACK")?,
            })
        }
        SUBSCRIBE => {
            expect_flags(0b0010)?;
            let packet_id = read_u16(&mut body, "SUBSCRIBE packet id")?;
            let mut filters = Vec::new();
            while body.has_remaining() {
                let filter = read_string(&mut body, "SUBSCRIBE filter")?;
                if !body.has_remaining() {
                    return Err(CodecError::Truncated("SUBSCRIBE qos"));
                }
                let qos = body.get_u8();
                if qos > 2 {
                    return Err(CodecError::InvalidQos(qos));
                }
                filters.push((filter, qos));
            }
            Ok(Packet::Subscribe { packet_id, filters })
        }
        SUBACK => {
            expect_flags(0)?;
            let packet_id = read_u16(&mut body, "SUBACK packet id")?;
            Ok(Packet::SubAck {
                packet_id,
                return_codes: body.to_vec(),
            })
        }
        PINGREQ => {
            expect_flags(0)?;
            Ok(Packet::PingReq)
        }
        PINGRESP => {
            expect_flags(0)?;
            Ok(Packet::PingResp)
        }
        DISCONNECT => {
            expect_flags(0)?;
            Ok(Packet::Disconnect)
        }
        other => Err(CodecError::UnknownPacketType(other)),
    }
}

fn parse_connect(body: &mut Bytes) -> Result<Connect, CodecError> {
    let name = read_string(body, "CONNECT protocol name")?;
    if body.remaining() < 4 {
        return Err(CodecError::Truncated("CONNECT header"));
    }
    let level = body.get_u8();
    if name != PROTOCOL_NAME || level != PROTOCOL_LEVEL {
        return Err(CodecError::UnsupportedProtocol { name, level });
    }
    let flags = body.get_u8();
    let keep_alive = body.get_u16();
    let client_id = read_string(body, "CONNECT client id")?;

    if flags & 0x04 != 0 {
        // Will topic and message are not used by the bridge.
        read_string(body, "CONNECT will topic")?;
        read_binary(body, "CONNECT will message")?;
    }
    let username = if flags & 0x80 != 0 {
        Some(read_string(body, "CONNECT username")?)
    } else {
        None
    };
    let password = if flags & 0x40 != 0 {
        Some(read_binary(body, "CONNECT password")?)
    } else {
        None
    };

    Ok(Connect {
        client_id,
        keep_alive,
        clean_session: flags & 0x02 != 0,
        username,
        password,
    })
}

fn read_u16(body: &mut Bytes, what: &'static str) -> Result<u16, CodecError> {
    if body.remaining() < 2 {
        return Err(CodecError::Truncated(what));
    }
    Ok(body.get_u16())
}

fn read_binary(body: &mut Bytes, what: &'static str) -> Result<Bytes, CodecError> {
    let len = usize::from(read_u16(body, what)?);
    if body.remaining() < len {
        return Err(CodecError::Truncated(what));
    }
    Ok(body.split_to(len))
}

fn read_string(body: &mut Bytes, what: &'static str) -> Result<String, CodecError> {
    let raw = read_binary(body, what)?;
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8(what))
}

/// Append the wire form of `packet` to `out`.
pub fn encode(packet: &Packet, out: &mut BytesMut) {
    let mut body = BytesMut::new();
    let first = match packet {
        Packet::Connect(c) => {
            put_string(&mut body, PROTOCOL_NAME);
            body.put_u8(PROTOCOL_LEVEL);
            let mut flags = 0u8;
            if c.clean_session {
                flags |= 0x02;
            }
            if c.username.is_some() {
                flags |= 0x80;
            }
            if c.password.is_some() {
                flags |= 0x40;
            }
            body.put_u8(flags);
            body.put_u16(c.keep_alive);
            put_string(&mut body, &c.client_id);
            if let Some(ref username) = c.username {
                put_string(&mut body, username);
            }
            if let Some(ref password) = c.password {
                put_binary(&mut body, password);
            }
            CONNECT << 4
        }
        Packet::ConnAck {
            session_present,
            code,
        } => {
            body.put_u8(u8::from(*session_present));
            body.put_u8(*code);
            CONNACK << 4
        }
        Packet::Publish(p) => {
            put_string(&mut body, &p.topic);
            if let Some(id) = p.packet_id {
                body.put_u16(id);
            }
            body.put_slice(&p.payload);
            let mut flags = (p.qos & 0x03) << 1;
            if p.dup {
                flags |= 0x08;
            }
            if p.retain {
                flags |= 0x01;
            }
            (PUBLISH << 4) | flags
        }
        Packet::PubAck { packet_id } => {
            body.put_u16(*packet_id);
            PUBACK << 4
        }
        Packet::Subscribe { packet_id, filters } => {
            body.put_u16(*packet_id);
            for (filter, qos) in filters {
                put_string(&mut body, filter);
                body.put_u8(*qos);
            }
            (SUBSCRIBE << 4) | 0b0010
        }
        Packet::SubAck {
            packet_id,
            return_codes,
        } => {
            body.put_u16(*packet_id);
            body.put_slice(return_codes);
            SUBACK << 4
        }
        Packet::PingReq => PINGREQ << 4,
        Packet::PingResp => PINGRESP << 4,
        Packet::Disconnect => DISCONNECT << 4,
    };

    out.put_u8(first);
    put_remaining_length(out, body.len());
    out.put_slice(&body);
}

fn put_remaining_length(out: &mut BytesMut, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

fn put_binary(out: &mut BytesMut, data: &[u8]) {
    // Strings and binaries are capped at u16::MAX by the protocol.
    let len = data.len().min(usize::from(u16::MAX));
    out.put_u16(len as u16);
    out.put_slice(&data[..len]);
}

fn put_string(out: &mut BytesMut, s: &str) {
    put_binary(out, s.as_bytes());
}

/// Human-readable CONNACK refusal reason.
pub fn connack_reason(code: u8) -> &'static str {
    match code {
        0 => "accepted",
        1 => "unacceptable protocol version",
        2 => "identifier rejected",
        3 => "server unavailable",
        4 => "bad user name or password",
        5 => "not authorized",
        _ => "unknown",
    }
}
