// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire format: fixed 6-byte little-endian header plus type-specific payload.
//!
//! ```text
//! offset  size  field
//! 0       2     message_id   (u16 LE, top bit = "reply with ACK")
//! 2       1     message_type (1=heartbeat 2=hello 3=chat 4=ack >=64 custom)
//! 3       1     console_id   (0xFF = unknown)
//! 4       2     message_size (u16 LE, total bytes including header)
//! ```
//!
//! A hello payload carries a one-byte is-reply flag, a u16 count of UTF-16
//! code units and the sender display name. An ACK has no payload; its
//! header `message_id` is the id being acknowledged. Heartbeat, chat and
//! custom payloads are opaque.

use crate::config::{CONSOLE_ID_UNKNOWN, CUSTOM_TYPE_BASE, HEADER_LEN, RELIABLE_BIT};

/// Message type as carried in the header type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Heartbeat,
    Hello,
    Chat,
    Ack,
    /// Application-defined message; subtype = wire byte - 64.
    Custom(u8),
}

impl MessageType {
    /// Wire byte for this type.
    #[must_use]
    pub fn to_wire(self) -> u8 {
        match self {
            MessageType::Heartbeat => 1,
            MessageType::Hello => 2,
            MessageType::Chat => 3,
            MessageType::Ack => 4,
            MessageType::Custom(subtype) => CUSTOM_TYPE_BASE.wrapping_add(subtype),
        }
    }

    /// Decode a wire type byte. Bytes 0 and 5..=63 are not assigned.
    #[must_use]
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(MessageType::Heartbeat),
            2 => Some(MessageType::Hello),
            3 => Some(MessageType::Chat),
            4 => Some(MessageType::Ack),
            v if v >= CUSTOM_TYPE_BASE => Some(MessageType::Custom(v - CUSTOM_TYPE_BASE)),
            _ => None,
        }
    }
}

/// Parsed wire header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub message_id: u16,
    pub message_type: u8,
    pub console_id: u8,
    pub message_size: u16,
}

impl PacketHeader {
    /// Parse the leading header out of `buf`.
    #[must_use]
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        Some(Self {
            message_id: u16::from_le_bytes([buf[0], buf[1]]),
            message_type: buf[2],
            console_id: buf[3],
            message_size: u16::from_le_bytes([buf[4], buf[5]]),
        })
    }

    /// True if the sender expects an ACK for this packet.
    #[must_use]
    pub fn is_reliable(&self) -> bool {
        self.message_id & RELIABLE_BIT != 0
    }

    /// Sequence id with the reliable bit cleared. The bit is wire-only
    /// signalling; ACK matching and the order filter use this value.
    #[must_use]
    pub fn logical_id(&self) -> u16 {
        self.message_id & !RELIABLE_BIT
    }

    /// True if the sender did not stamp a console id.
    #[must_use]
    pub fn sender_unknown(&self) -> bool {
        self.console_id == CONSOLE_ID_UNKNOWN
    }
}

/// Frame a packet: header then payload.
///
/// `message_id` is masked to the logical id range; the reliable bit is set
/// from the flag. The caller guarantees the total size fits in `u16`.
#[must_use]
pub fn frame(
    message_id: u16,
    ty: MessageType,
    console_id: u8,
    reliable: bool,
    payload: &[u8],
) -> Vec<u8> {
    let total = HEADER_LEN + payload.len();
    debug_assert!(total <= u16::MAX as usize, "oversized frame");

    let mut id = message_id & !RELIABLE_BIT;
    if reliable {
        id |= RELIABLE_BIT;
    }

    let mut bytes = Vec::with_capacity(total);
    bytes.extend_from_slice(&id.to_le_bytes());
    bytes.push(ty.to_wire());
    bytes.push(console_id);
    bytes.extend_from_slice(&(total as u16).to_le_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

/// Decoded hello payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloPayload {
    pub is_reply: bool,
    pub name: String,
}

/// Encode a hello payload: is-reply flag, name length, UTF-16LE name.
#[must_use]
pub fn encode_hello(name: &str, is_reply: bool) -> Vec<u8> {
    let units: Vec<u16> = name.encode_utf16().collect();
    let mut payload = Vec::with_capacity(3 + units.len() * 2);
    payload.push(u8::from(is_reply));
    payload.extend_from_slice(&(units.len() as u16).to_le_bytes());
    for unit in units {
        payload.extend_from_slice(&unit.to_le_bytes());
    }
    payload
}

/// Decode a hello payload. Returns `None` on truncation.
#[must_use]
pub fn decode_hello(payload: &[u8]) -> Option<HelloPayload> {
    if payload.len() < 3 {
        return None;
    }
    let is_reply = payload[0] != 0;
    let units = u16::from_le_bytes([payload[1], payload[2]]) as usize;
    let name_bytes = payload.get(3..3 + units * 2)?;
    let code_units: Vec<u16> = name_bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    Some(HelloPayload {
        is_reply,
        name: String::from_utf16_lossy(&code_units),
    })
}

/// Walks a receive buffer that may hold several back-to-back packets.
///
/// Consumes `message_size` bytes per step. A step whose declared size
/// would overrun the buffer (or undercut the header) stops the walk and
/// marks it truncated.
pub struct PacketWalker<'a> {
    buf: &'a [u8],
    offset: usize,
    truncated: bool,
}

impl<'a> PacketWalker<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            offset: 0,
            truncated: false,
        }
    }

    /// Next well-formed packet as (header, payload), or `None` at the end.
    pub fn next_packet(&mut self) -> Option<(PacketHeader, &'a [u8])> {
        if self.truncated || self.offset >= self.buf.len() {
            return None;
        }
        let rest = &self.buf[self.offset..];
        let Some(header) = PacketHeader::parse(rest) else {
            self.truncated = true;
            return None;
        };
        let size = header.message_size as usize;
        if size < HEADER_LEN || size > rest.len() {
            self.truncated = true;
            return None;
        }
        self.offset += size;
        Some((header, &rest[HEADER_LEN..size]))
    }

    /// True if the walk ended on a malformed or overrunning packet.
    #[must_use]
    pub fn truncated(&self) -> bool {
        self.truncated
    }
}
