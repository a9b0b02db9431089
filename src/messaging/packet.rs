use std::fmt::{Debug, Formatter};
use anyhow::{anyhow, bail};
use crate::messaging::message::{Message, MESSAGE_BASE_HEADER_LEN};
use crate::messaging::message_definition::MessageRegistry;
use crate::util::byte_buffer::{ByteBuffer, Endianness};
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

pub const ETHERNET_MTU: usize = 1500;
const IPV4_HEADER_ALLOWANCE: usize = 40;
const UDP_HEADER_LEN: usize = 8;

/// The maximum size of a packet, i.e. a UDP payload, that is sent without IP fragmentation
pub const PACKET_MTU: usize = ETHERNET_MTU - IPV4_HEADER_ALLOWANCE - UDP_HEADER_LEN;


/// Fixed-size header at the start of every packet.
///
/// ```ascii
/// 0: sender connection index (u8), 0xFF for connectionless packets
/// 1: packet ack (u16) - this packet's number, 0 is never used
/// 3: highest received ack (u16) - highest packet number received from the peer, 0 if none
/// 5: received history (u16) - bit i set means packet `highest - i - 1` was received
/// 7: message count (u8)
/// ```
#[derive(Clone, Copy, Eq, PartialEq, Default)]
pub struct PacketHeader {
    pub sender_connection_index: u8,
    pub packet_ack: u16,
    pub highest_received_ack: u16,
    pub received_history: u16,
    pub message_count: u8,
}

impl Debug for PacketHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PCKT{{C{} #{} ack:{}/{:016b} n:{}}}", self.sender_connection_index, self.packet_ack, self.highest_received_ack, self.received_history, self.message_count)
    }
}

impl PacketHeader {
    pub const SERIALIZED_LEN: usize = size_of::<u8>() + 3 * size_of::<u16>() + size_of::<u8>();

    pub const CONNECTIONLESS_INDEX: u8 = u8::MAX;

    pub fn ser(&self, buf: &mut ByteBuffer) {
        buf.write_u8(self.sender_connection_index);
        buf.write_u16(self.packet_ack);
        buf.write_u16(self.highest_received_ack);
        buf.write_u16(self.received_history);
        buf.write_u8(self.message_count);
    }

    pub fn deser(buf: &mut ByteBuffer) -> anyhow::Result<PacketHeader> {
        Ok(PacketHeader {
            sender_connection_index: buf.try_read_u8()?,
            packet_ack: buf.try_read_u16()?,
            highest_received_ack: buf.try_read_u16()?,
            received_history: buf.try_read_u16()?,
            message_count: buf.try_read_u8()?,
        })
    }
}


/// A datagram under construction or being parsed: a [PacketHeader] followed by framed messages.
///
/// Message framing:
/// ```ascii
/// 0: total size (u16), covering this header and the payload
/// 2: definition id (u8)
/// *: reliable id (u16) - only for reliable definitions
/// *: sequence id (u16) - only for in-order definitions
/// *: payload
/// ```
pub struct Packet {
    buf: ByteBuffer,
    message_count: u8,
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Packet{{{} messages, {} bytes}}", self.message_count, self.buf.len())
    }
}

impl Packet {
    /// an empty outgoing packet with room reserved for the header
    pub fn new(endianness: Endianness) -> Packet {
        let mut buf = ByteBuffer::with_capacity(endianness, PACKET_MTU);
        buf.write_bytes(&[0; PacketHeader::SERIALIZED_LEN]);
        Packet {
            buf,
            message_count: 0,
        }
    }

    /// wraps a received datagram for parsing
    pub fn from_received(endianness: Endianness, data: &[u8]) -> Packet {
        Packet {
            buf: ByteBuffer::from_slice(endianness, data),
            message_count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.message_count == 0
    }

    pub fn message_count(&self) -> u8 {
        self.message_count
    }

    pub fn remaining_space(&self) -> usize {
        PACKET_MTU.saturating_sub(self.buf.len())
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.buf.as_bytes()
    }

    /// Writes the header at offset 0, regardless of how many messages were written so far. The
    ///  header's message count is taken from the packet.
    pub fn write_header(&mut self, header: &PacketHeader) {
        let header = PacketHeader {
            message_count: self.message_count,
            ..*header
        };

        let write_pos = self.buf.write_position();
        self.buf.set_write_position(0);
        header.ser(&mut self.buf);
        self.buf.set_write_position(write_pos);
    }

    /// Appends a message if it fits into the packet's remaining space. Nothing is written if it
    ///  does not fit, and the caller should send this packet and put the message in the next one.
    #[must_use]
    pub fn write_message(&mut self, message: &Message) -> bool {
        let total_len = message.encoded_len();
        if total_len > self.remaining_space() || self.message_count == u8::MAX {
            return false;
        }

        let definition = message.definition();
        self.buf.write_u16(total_len.prechecked_cast());
        self.buf.write_u8(definition.id());
        if definition.is_reliable() {
            self.buf.write_u16(message.reliable_id().unwrap_or_default());
        }
        if definition.channel().is_some() {
            self.buf.write_u16(message.sequence_id().unwrap_or_default());
        }
        self.buf.write_bytes(message.payload());

        self.message_count += 1;
        true
    }

    pub fn read_header(&mut self) -> anyhow::Result<PacketHeader> {
        PacketHeader::deser(&mut self.buf)
    }

    /// Parses the next message, resolving its definition through the registry. Truncated or
    ///  inconsistent data results in an error, and the rest of the packet should be discarded.
    pub fn read_message(&mut self, registry: &MessageRegistry) -> anyhow::Result<Message> {
        let total_len: usize = self.buf.try_read_u16()?.safe_cast();
        let definition_id = self.buf.try_read_u8()?;
        let definition = registry.get(definition_id)
            .ok_or_else(|| anyhow!("unknown message definition id {}", definition_id))?
            .clone();

        let reliable_id = if definition.is_reliable() {
            Some(self.buf.try_read_u16()?)
        }
        else {
            None
        };
        let sequence_id = if definition.channel().is_some() {
            Some(self.buf.try_read_u16()?)
        }
        else {
            None
        };

        let header_len = Message::header_len_for(&definition);
        debug_assert!(header_len >= MESSAGE_BASE_HEADER_LEN);
        if total_len < header_len {
            bail!("message size {} is smaller than its header ({} bytes) for {:?}", total_len, header_len, definition.name());
        }
        let payload_len = total_len - header_len;
        if payload_len > self.buf.remaining() {
            bail!("truncated message {:?}: {} payload bytes announced, {} available", definition.name(), payload_len, self.buf.remaining());
        }

        let payload = self.buf.read_bytes(payload_len).to_vec();
        Ok(Message::from_wire(definition, payload, reliable_id, sequence_id))
    }

    pub fn has_unread_data(&self) -> bool {
        self.buf.remaining() > 0
    }
}
