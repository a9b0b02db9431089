use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use anyhow::bail;
use crate::messaging::message_definition::MessageDefinition;
use crate::messaging::packet::{PacketHeader, PACKET_MTU};
use crate::util::byte_buffer::{ByteBuffer, Endianness};

/// Per-message framing: total size (u16) and definition id (u8)
pub const MESSAGE_BASE_HEADER_LEN: usize = size_of::<u16>() + size_of::<u8>();
/// Framing for a reliable, ordered message: base header plus reliable id and sequence id
pub const MESSAGE_MAX_HEADER_LEN: usize = MESSAGE_BASE_HEADER_LEN + size_of::<u16>() + size_of::<u16>();

/// The biggest payload that fits into a single packet together with all headers
pub const MESSAGE_MTU: usize = PACKET_MTU - PacketHeader::SERIALIZED_LEN - MESSAGE_MAX_HEADER_LEN;


/// A single unit of application data, bound to its [MessageDefinition].
///
/// A message owns its payload. It is deliberately not `Clone`: copying happens only through
///  [Message::deep_copy].
pub struct Message {
    definition: Arc<MessageDefinition>,
    payload: Vec<u8>,
    reliable_id: Option<u16>,
    sequence_id: Option<u16>,
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "MSG{{{}", self.definition.name())?;
        if let Some(id) = self.reliable_id {
            write!(f, " R{}", id)?;
        }
        if let Some(id) = self.sequence_id {
            write!(f, " S{}", id)?;
        }
        write!(f, " {}b}}", self.payload.len())
    }
}

impl Message {
    pub fn new(definition: Arc<MessageDefinition>, payload: &[u8]) -> anyhow::Result<Message> {
        if payload.len() > MESSAGE_MTU {
            bail!("payload of {} bytes for message {:?} exceeds MESSAGE_MTU of {} bytes", payload.len(), definition.name(), MESSAGE_MTU);
        }
        Ok(Message {
            definition,
            payload: payload.to_vec(),
            reliable_id: None,
            sequence_id: None,
        })
    }

    /// for messages parsed off the wire - the packet has validated the sizes
    pub(crate) fn from_wire(definition: Arc<MessageDefinition>, payload: Vec<u8>, reliable_id: Option<u16>, sequence_id: Option<u16>) -> Message {
        Message {
            definition,
            payload,
            reliable_id,
            sequence_id,
        }
    }

    pub fn encode<T: NetMessage>(definition: Arc<MessageDefinition>, value: &T, endianness: Endianness) -> anyhow::Result<Message> {
        let mut buf = ByteBuffer::new(endianness);
        value.ser(&mut buf)?;
        Message::new(definition, buf.as_bytes())
    }

    pub fn decode<T: NetMessage>(&self, endianness: Endianness) -> anyhow::Result<T> {
        let mut buf = ByteBuffer::from_slice(endianness, &self.payload);
        T::deser(&mut buf)
    }

    pub fn deep_copy(&self) -> Message {
        Message {
            definition: self.definition.clone(),
            payload: self.payload.clone(),
            reliable_id: self.reliable_id,
            sequence_id: self.sequence_id,
        }
    }

    pub fn definition(&self) -> &Arc<MessageDefinition> {
        &self.definition
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn reliable_id(&self) -> Option<u16> {
        self.reliable_id
    }

    pub fn sequence_id(&self) -> Option<u16> {
        self.sequence_id
    }

    pub(crate) fn set_reliable_id(&mut self, id: u16) {
        self.reliable_id = Some(id);
    }

    pub(crate) fn set_sequence_id(&mut self, id: u16) {
        self.sequence_id = Some(id);
    }

    pub fn requires_connection(&self) -> bool {
        !self.definition.is_connectionless()
    }

    pub fn header_len(&self) -> usize {
        Self::header_len_for(&self.definition)
    }

    pub fn header_len_for(definition: &MessageDefinition) -> usize {
        let mut result = MESSAGE_BASE_HEADER_LEN;
        if definition.is_reliable() {
            result += size_of::<u16>();
        }
        if definition.channel().is_some() {
            result += size_of::<u16>();
        }
        result
    }

    /// number of bytes this message occupies in a packet
    pub fn encoded_len(&self) -> usize {
        self.header_len() + self.payload.len()
    }
}


/// A message type with a compile-time schema. Implementations map a Rust type to the
///  payload of the message definition registered under [NetMessage::NAME].
pub trait NetMessage: Sized {
    const NAME: &'static str;

    fn ser(&self, buf: &mut ByteBuffer) -> anyhow::Result<()>;
    fn deser(buf: &mut ByteBuffer) -> anyhow::Result<Self>;
}
