use std::io::ErrorKind;
use std::sync::Arc;
use anyhow::{anyhow, bail};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use crate::messaging::connection::Connection;
use crate::messaging::datagram_socket::{DatagramSocket, UdpDatagramSocket};
use crate::messaging::message::{Message, NetMessage};
use crate::messaging::message_definition::{MessageDefinition, MessageHandler, MessageOptions, MessageRegistry, SenderInfo};
use crate::messaging::net_address::NetAddress;
use crate::messaging::net_config::NetConfig;
use crate::messaging::packet::{Packet, PacketHeader, ETHERNET_MTU, PACKET_MTU};
use crate::messaging::{BindingIndex, ConnectionIndex};

/// The number of connection slots in a session
pub const MAX_CONNECTIONS: usize = 32;


/// The entry point for applications: holds the message definitions, the local bindings
///  (sockets) and the connections to peers, and runs the send / receive loop.
///
/// A session is driven by calling [Session::tick] regularly, typically at or above the rate of
///  the configured net tick. All processing happens inside that call, there are no background
///  tasks.
pub struct Session {
    config: Arc<NetConfig>,
    registry: MessageRegistry,
    bindings: Vec<Box<dyn DatagramSocket>>,
    connections: Vec<Option<Connection>>,
    connections_by_address: FxHashMap<(BindingIndex, NetAddress), ConnectionIndex>,
    receive_buf: Vec<u8>,
}

impl Session {
    pub fn new(config: NetConfig) -> anyhow::Result<Session> {
        config.validate()?;

        Ok(Session {
            config: Arc::new(config),
            registry: MessageRegistry::default(),
            bindings: Vec::new(),
            connections: (0..MAX_CONNECTIONS).map(|_| None).collect(),
            connections_by_address: Default::default(),
            receive_buf: vec![0; ETHERNET_MTU],
        })
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn register_definition(&mut self, name: &str, options: MessageOptions, handler: impl MessageHandler) -> anyhow::Result<()> {
        self.registry.register(name, options, Arc::new(handler))
    }

    pub fn register_typed<T: NetMessage>(&mut self, options: MessageOptions, handler: impl MessageHandler) -> anyhow::Result<()> {
        self.register_definition(T::NAME, options, handler)
    }

    /// Assigns definition ids. This must happen before any traffic, and both peers must have
    ///  registered the same definitions.
    pub fn finalize_definitions(&mut self) -> anyhow::Result<()> {
        self.registry.finalize()?;
        info!("finalized {} message definitions", self.registry.len());
        Ok(())
    }

    pub fn registry(&self) -> &MessageRegistry {
        &self.registry
    }

    /// Binds a UDP socket on the given port, 0 for an ephemeral port
    pub async fn bind(&mut self, port: u16) -> anyhow::Result<BindingIndex> {
        let socket = UdpDatagramSocket::bind(port).await?;
        Ok(self.add_binding(socket))
    }

    pub fn add_binding(&mut self, socket: impl DatagramSocket) -> BindingIndex {
        info!("adding binding #{} at {}", self.bindings.len(), socket.local_address());
        self.bindings.push(Box::new(socket));
        self.bindings.len() - 1
    }

    pub fn local_address(&self, binding: BindingIndex) -> Option<NetAddress> {
        self.bindings.get(binding)
            .map(|s| s.local_address())
    }

    pub fn add_connection(&mut self, binding: BindingIndex, address: NetAddress) -> anyhow::Result<ConnectionIndex> {
        if binding >= self.bindings.len() {
            bail!("no binding #{}", binding);
        }
        if let Some(existing) = self.connections_by_address.get(&(binding, address)) {
            bail!("there is already a connection #{} to {} on binding #{}", existing, address, binding);
        }
        let index = self.connections.iter()
            .position(|c| c.is_none())
            .ok_or_else(|| anyhow!("all {} connection slots are in use", MAX_CONNECTIONS))?;

        let index: ConnectionIndex = index.try_into()?;
        info!("connection #{} to {} on binding #{}", index, address, binding);
        self.connections[index as usize] = Some(Connection::new(self.config.clone(), index, binding, address, Instant::now()));
        self.connections_by_address.insert((binding, address), index);
        Ok(index)
    }

    /// Drops the connection's queues and state immediately, freeing the slot. Returns `false` if
    ///  there was no such connection.
    pub fn close_connection(&mut self, index: ConnectionIndex) -> bool {
        let Some(mut connection) = self.connections.get_mut(index as usize).and_then(|c| c.take()) else {
            return false;
        };
        info!("closing connection #{} to {}", index, connection.address());
        connection.close();
        self.connections_by_address.remove(&(connection.binding(), connection.address()));
        true
    }

    pub fn connection(&self, index: ConnectionIndex) -> Option<&Connection> {
        self.connections.get(index as usize)
            .and_then(|c| c.as_ref())
    }

    pub fn connection_by_address(&self, binding: BindingIndex, address: NetAddress) -> Option<ConnectionIndex> {
        self.connections_by_address.get(&(binding, address)).copied()
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.iter().flatten()
    }

    /// connections that did not receive anything for longer than the configured timeout
    pub fn timed_out_connections(&self) -> Vec<ConnectionIndex> {
        let now = Instant::now();
        self.connections()
            .filter(|c| c.has_timed_out(now))
            .map(|c| c.index())
            .collect()
    }

    fn definition_for_send(&self, name: &str) -> Option<Arc<MessageDefinition>> {
        if !self.registry.is_finalized() {
            warn!("sending {:?} before message definitions are finalized - ignoring", name);
            return None;
        }
        let result = self.registry.by_name(name).cloned();
        if result.is_none() {
            warn!("sending unregistered message {:?} - ignoring", name);
        }
        result
    }

    fn enqueue(&mut self, index: ConnectionIndex, message: Message) -> bool {
        let Some(connection) = self.connections.get_mut(index as usize).and_then(|c| c.as_mut()) else {
            warn!("sending {:?} to connection #{} which does not exist - ignoring", message, index);
            return false;
        };
        connection.enqueue(message)
    }

    /// Queues a message for sending over a connection. Returns `false` if the message was not
    ///  queued, details are logged.
    pub fn send(&mut self, index: ConnectionIndex, name: &str, payload: &[u8]) -> bool {
        let Some(definition) = self.definition_for_send(name) else {
            return false;
        };
        match Message::new(definition, payload) {
            Ok(message) => self.enqueue(index, message),
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }

    pub fn send_typed<T: NetMessage>(&mut self, index: ConnectionIndex, value: &T) -> bool {
        let Some(definition) = self.definition_for_send(T::NAME) else {
            return false;
        };
        match Message::encode(definition, value, self.config.endianness) {
            Ok(message) => self.enqueue(index, message),
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }

    /// Sends a message of a connectionless definition in a packet of its own, immediately and
    ///  without any delivery guarantees. There need not be a connection to the receiver.
    pub fn send_connectionless(&mut self, binding: BindingIndex, to: NetAddress, name: &str, payload: &[u8]) -> bool {
        let Some(definition) = self.definition_for_send(name) else {
            return false;
        };
        if !definition.is_connectionless() {
            warn!("message {:?} is not connectionless - not sending it to {}", name, to);
            return false;
        }
        let Some(socket) = self.bindings.get(binding) else {
            warn!("no binding #{} for sending {:?} - ignoring", binding, name);
            return false;
        };
        let message = match Message::new(definition, payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("{}", e);
                return false;
            }
        };

        let mut packet = Packet::new(self.config.endianness);
        if !packet.write_message(&message) {
            warn!("{:?} does not fit into a packet - not sending it", message);
            return false;
        }
        packet.write_header(&PacketHeader {
            sender_connection_index: PacketHeader::CONNECTIONLESS_INDEX,
            ..Default::default()
        });

        trace!("sending connectionless {:?} to {}", message, to);
        match socket.send_to(to, packet.as_bytes()) {
            Ok(_) => true,
            Err(e) => {
                warn!("error sending connectionless {:?} to {}: {}", message, to, e);
                false
            }
        }
    }

    /// Receives and processes all datagrams waiting on all bindings, dispatching received
    ///  messages to their handlers. Returns the number of datagrams received.
    pub fn process_incoming(&mut self) -> usize {
        let mut buf = std::mem::take(&mut self.receive_buf);
        let mut num_received = 0;

        for binding in 0..self.bindings.len() {
            loop {
                match self.bindings[binding].receive_from(&mut buf) {
                    Ok((from, len)) => {
                        num_received += 1;
                        self.on_datagram(binding, from, &buf[..len]);
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        warn!("error receiving on binding #{}: {}", binding, e);
                        break;
                    }
                }
            }
        }

        self.receive_buf = buf;
        num_received
    }

    fn on_datagram(&mut self, binding: BindingIndex, from: NetAddress, data: &[u8]) {
        if data.len() > PACKET_MTU {
            warn!("datagram from {} exceeds the packet MTU ({} bytes) - dropping", from, data.len());
            return;
        }

        let mut packet = Packet::from_received(self.config.endianness, data);
        let header = match packet.read_header() {
            Ok(header) => header,
            Err(e) => {
                warn!("received invalid packet header from {}: {} - dropping", from, e);
                return;
            }
        };
        let mut messages = Vec::with_capacity(header.message_count as usize);
        for _ in 0..header.message_count {
            match packet.read_message(&self.registry) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    warn!("received invalid message from {} in {:?}: {} - dropping packet", from, header, e);
                    return;
                }
            }
        }
        if packet.has_unread_data() {
            warn!("trailing data after {} messages from {} in {:?} - dropping packet", header.message_count, from, header);
            return;
        }

        let connection_index = self.connections_by_address.get(&(binding, from)).copied();
        let sender = SenderInfo {
            address: from,
            binding,
            connection: connection_index,
        };

        let to_dispatch = match connection_index {
            Some(index) if header.sender_connection_index != PacketHeader::CONNECTIONLESS_INDEX => {
                match self.connections.get_mut(index as usize).and_then(|c| c.as_mut()) {
                    Some(connection) => connection.on_packet_received(&header, messages, Instant::now()),
                    None => return,
                }
            }
            _ => {
                messages.into_iter()
                    .filter(|m| {
                        if m.requires_connection() {
                            debug!("dropping {:?} from {} which requires a connection", m, from);
                            false
                        }
                        else {
                            true
                        }
                    })
                    .collect()
            }
        };

        for message in to_dispatch {
            trace!("dispatching {:?} from {:?}", message, sender);
            message.definition().handler().on_message(&message, &sender);
        }
    }

    /// Flushes all connections whose net tick elapsed or that have a full packet's worth of
    ///  queued data. Returns the number of packets sent.
    pub fn process_outgoing(&mut self) -> usize {
        let now = Instant::now();
        let mut num_sent = 0;
        for connection in self.connections.iter_mut().flatten() {
            if connection.has_net_tick_elapsed(now) || connection.needs_to_force_send() {
                let Some(socket) = self.bindings.get(connection.binding()) else {
                    continue;
                };
                num_sent += connection.flush(socket.as_ref(), now);
            }
        }
        num_sent
    }

    /// Processes all incoming datagrams, then sends what is due
    pub fn tick(&mut self) {
        self.process_incoming();
        self.process_outgoing();
    }
}
