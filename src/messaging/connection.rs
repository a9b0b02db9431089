use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use rustc_hash::FxHashSet;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use crate::messaging::ack_number::AckNumber;
use crate::messaging::datagram_socket::DatagramSocket;
use crate::messaging::message::Message;
use crate::messaging::message_definition::MAX_CHANNELS;
use crate::messaging::net_address::NetAddress;
use crate::messaging::net_config::NetConfig;
use crate::messaging::packet::{Packet, PacketHeader, PACKET_MTU};
use crate::messaging::packet_tracker::{AckOutcome, PacketTracker, ACK_BITFIELD_LEN, MAX_RELIABLES_PER_PACKET};
use crate::messaging::sequence_channel::SequenceChannel;
use crate::messaging::{BindingIndex, ConnectionIndex};
use crate::util::rolling_data::RollingData;

/// The number of packets whose fate (delivered or lost) goes into the loss ratio
pub const LOSS_WINDOW_COUNT: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub duplicate_packets: u64,
    pub packets_confirmed: u64,
    pub packets_lost: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub reliable_resends: u64,
    pub send_errors: u64,
}


struct PendingReliable {
    message: Message,
    last_sent: Instant,
    /// the flush in which this message was last written, so it is written at most once per flush
    last_flush: u64,
}

impl PendingReliable {
    fn id(&self) -> u16 {
        self.message.reliable_id().unwrap_or_default()
    }
}


/// The state of a link to a single peer: outgoing queues, acknowledgement bookkeeping in both
///  directions, duplicate detection, ordering channels and link quality telemetry.
///
/// A connection does no I/O on its own and never reads the clock. The owning session passes in
///  the socket for sending and the current time.
pub struct Connection {
    config: Arc<NetConfig>,
    index: ConnectionIndex,
    binding: BindingIndex,
    address: NetAddress,

    unreliable_queue: VecDeque<Message>,
    unsent_reliables: VecDeque<Message>,
    /// oldest first
    unconfirmed_reliables: VecDeque<PendingReliable>,
    /// encoded size of everything in the unreliable queue and the unsent reliables
    queued_bytes: usize,
    next_reliable_id: u16,

    processed_reliable_ids: FxHashSet<u16>,
    processed_reliable_order: VecDeque<u16>,
    channels: Vec<SequenceChannel>,

    next_ack: AckNumber,
    last_sent_ack: Option<AckNumber>,
    highest_received_ack: Option<AckNumber>,
    received_history: u16,
    /// the peer sent us messages, and we owe it an acknowledgement
    ack_pending: bool,

    tracker: PacketTracker,
    rtt: Option<Duration>,
    loss: RollingData<LOSS_WINDOW_COUNT>,

    flush_counter: u64,
    last_flush: Option<Instant>,
    last_sent: Instant,
    last_received: Instant,

    stats: ConnectionStats,
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection{{C{}@{} {}}}", self.index, self.binding, self.address)
    }
}

impl Connection {
    pub fn new(config: Arc<NetConfig>, index: ConnectionIndex, binding: BindingIndex, address: NetAddress, now: Instant) -> Connection {
        Connection {
            config,
            index,
            binding,
            address,
            unreliable_queue: Default::default(),
            unsent_reliables: Default::default(),
            unconfirmed_reliables: Default::default(),
            queued_bytes: 0,
            next_reliable_id: 0,
            processed_reliable_ids: Default::default(),
            processed_reliable_order: Default::default(),
            channels: (0..MAX_CHANNELS).map(|_| SequenceChannel::new()).collect(),
            next_ack: AckNumber::FIRST,
            last_sent_ack: None,
            highest_received_ack: None,
            received_history: 0,
            ack_pending: false,
            tracker: PacketTracker::new(),
            rtt: None,
            loss: RollingData::new(),
            flush_counter: 0,
            last_flush: None,
            last_sent: now,
            last_received: now,
            stats: Default::default(),
        }
    }

    pub fn index(&self) -> ConnectionIndex {
        self.index
    }

    pub fn binding(&self) -> BindingIndex {
        self.binding
    }

    pub fn address(&self) -> NetAddress {
        self.address
    }

    /// Queues a message for sending with the next flush. Reliable messages get their reliable
    ///  id (and sequence id for ordered messages) here.
    ///
    /// Returns `false` if the message was refused because too many reliable messages are pending.
    pub fn enqueue(&mut self, mut message: Message) -> bool {
        let encoded_len = message.encoded_len();
        let definition = message.definition().clone();

        if definition.is_reliable() {
            let num_pending = self.unsent_reliables.len() + self.unconfirmed_reliables.len();
            if num_pending >= self.config.max_pending_reliables {
                warn!("{:?}: {} reliable messages pending - refusing {:?}", self, num_pending, message);
                return false;
            }

            message.set_reliable_id(self.next_reliable_id);
            self.next_reliable_id = self.next_reliable_id.wrapping_add(1);

            if let Some(channel) = definition.channel() {
                message.set_sequence_id(self.channels[channel as usize].next_send_id());
            }
            trace!("{:?}: enqueued {:?}", self, message);
            self.unsent_reliables.push_back(message);
        }
        else {
            trace!("{:?}: enqueued {:?}", self, message);
            self.unreliable_queue.push_back(message);
        }

        self.queued_bytes += encoded_len;
        true
    }

    /// Sends queued messages, retransmits unconfirmed reliable messages that are due, and sends
    ///  an empty packet if an acknowledgement or a keepalive is owed. This may send several
    ///  packets, up to the configured limit per flush.
    ///
    /// Returns the number of packets sent.
    pub fn flush(&mut self, socket: &dyn DatagramSocket, now: Instant) -> usize {
        self.flush_counter += 1;
        self.last_flush = Some(now);

        let mut num_sent = 0;
        while num_sent < self.config.max_packets_per_flush {
            let mut packet = Packet::new(self.config.endianness);
            let mut reliable_ids = Vec::new();

            // new messages first, resends only fill the remaining space
            self.write_unreliables(&mut packet);
            self.write_unsent_reliables(&mut packet, &mut reliable_ids, now);
            self.write_due_reliables(&mut packet, &mut reliable_ids, now);

            if packet.is_empty() {
                if num_sent == 0 && (self.ack_pending || self.has_heartbeat_elapsed(now)) {
                    trace!("{:?}: sending empty packet (ack pending: {})", self, self.ack_pending);
                    self.send_packet(socket, packet, reliable_ids, now);
                    num_sent += 1;
                }
                break;
            }

            self.send_packet(socket, packet, reliable_ids, now);
            num_sent += 1;
        }

        if num_sent == self.config.max_packets_per_flush && self.has_outbound_messages() {
            debug!("{:?}: reached {} packets in a single flush, deferring the rest", self, num_sent);
        }
        num_sent
    }

    fn write_due_reliables(&mut self, packet: &mut Packet, reliable_ids: &mut Vec<u16>, now: Instant) {
        for pending in self.unconfirmed_reliables.iter_mut() {
            if reliable_ids.len() == MAX_RELIABLES_PER_PACKET {
                break;
            }
            if pending.last_flush == self.flush_counter {
                continue;
            }
            if now.saturating_duration_since(pending.last_sent) < self.config.reliable_resend_delay {
                continue;
            }
            if !packet.write_message(&pending.message) {
                continue;
            }

            pending.last_flush = self.flush_counter;
            pending.last_sent = now;
            reliable_ids.push(pending.id());
            self.stats.reliable_resends += 1;
        }
    }

    fn write_unsent_reliables(&mut self, packet: &mut Packet, reliable_ids: &mut Vec<u16>, now: Instant) {
        while reliable_ids.len() < MAX_RELIABLES_PER_PACKET {
            let Some(message) = self.unsent_reliables.front() else {
                break;
            };
            if !packet.write_message(message) {
                break;
            }
            if let Some(message) = self.unsent_reliables.pop_front() {
                self.queued_bytes -= message.encoded_len();
                self.stats.messages_sent += 1;
                reliable_ids.push(message.reliable_id().unwrap_or_default());
                self.unconfirmed_reliables.push_back(PendingReliable {
                    message,
                    last_sent: now,
                    last_flush: self.flush_counter,
                });
            }
        }
    }

    fn write_unreliables(&mut self, packet: &mut Packet) {
        while let Some(message) = self.unreliable_queue.front() {
            if !packet.write_message(message) {
                break;
            }
            if let Some(message) = self.unreliable_queue.pop_front() {
                self.queued_bytes -= message.encoded_len();
                self.stats.messages_sent += 1;
            }
        }
    }

    fn send_packet(&mut self, socket: &dyn DatagramSocket, mut packet: Packet, reliable_ids: Vec<u16>, now: Instant) {
        let ack = self.next_ack;
        self.next_ack = ack.next();
        self.last_sent_ack = Some(ack);

        let header = PacketHeader {
            sender_connection_index: self.index,
            packet_ack: ack.to_raw(),
            highest_received_ack: AckNumber::raw_or_none(self.highest_received_ack),
            received_history: self.received_history,
            message_count: packet.message_count(),
        };
        packet.write_header(&header);

        let evicted = if packet.is_empty() {
            self.tracker.on_sent_untracked(ack)
        }
        else {
            self.tracker.on_sent(ack, reliable_ids, now)
        };
        if evicted.is_some() {
            self.on_packet_lost();
        }

        trace!("{:?}: sending {:?} ({} bytes)", self, header, packet.len());
        match socket.send_to(self.address, packet.as_bytes()) {
            Ok(_) => {
                self.stats.bytes_sent += packet.len() as u64;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                debug!("{:?}: socket is not ready for sending - dropping packet {:?}", self, ack);
                self.stats.send_errors += 1;
            }
            Err(e) => {
                warn!("{:?}: error sending packet {:?}: {}", self, ack, e);
                self.stats.send_errors += 1;
            }
        }

        self.stats.packets_sent += 1;
        self.ack_pending = false;
        self.last_sent = now;
    }

    /// Processes a received packet's header and its parsed messages. Returns the messages that
    ///  are ready for dispatch, in the order they should be handled.
    ///
    /// The header's acknowledgement data is always processed, even if the packet turns out to be
    ///  a duplicate. Its messages are dropped if the packet is a duplicate or too old to be
    ///  represented in the received history.
    pub fn on_packet_received(&mut self, header: &PacketHeader, messages: Vec<Message>, now: Instant) -> Vec<Message> {
        self.last_received = now;
        self.stats.packets_received += 1;

        self.on_ack_header(header, now);

        let Some(ack) = AckNumber::from_raw(header.packet_ack) else {
            warn!("{:?}: received packet with invalid ack number 0 - dropping", self);
            return Vec::new();
        };
        if !self.register_received_ack(ack) {
            trace!("{:?}: dropping {} messages of duplicate or stale packet {:?}", self, messages.len(), ack);
            self.stats.duplicate_packets += 1;
            return Vec::new();
        }

        if !messages.is_empty() {
            self.ack_pending = true;
        }

        let mut result = Vec::with_capacity(messages.len());
        for message in messages {
            let definition = message.definition().clone();
            if let Some(channel) = definition.channel() {
                result.extend(self.channels[channel as usize].on_received(message));
            }
            else if let Some(reliable_id) = message.reliable_id() {
                if self.register_processed_reliable(reliable_id) {
                    result.push(message);
                }
                else {
                    trace!("{:?}: dropping duplicate reliable message {:?}", self, message);
                }
            }
            else {
                result.push(message);
            }
        }

        self.stats.messages_received += result.len() as u64;
        result
    }

    fn on_ack_header(&mut self, header: &PacketHeader, now: Instant) {
        let Some(highest) = AckNumber::from_raw(header.highest_received_ack) else {
            return;
        };
        let Some(last_sent_ack) = self.last_sent_ack else {
            debug!("{:?}: peer acknowledges {:?} before we sent anything - ignoring", self, highest);
            return;
        };
        if highest.is_newer_than(last_sent_ack) {
            warn!("{:?}: peer acknowledges {:?}, but the latest packet sent was {:?} - ignoring", self, highest, last_sent_ack);
            return;
        }

        let AckOutcome { confirmed, lost } = self.tracker.on_ack_header(highest, header.received_history, now);
        for packet in confirmed {
            trace!("{:?}: packet {:?} confirmed after {:?}", self, packet.ack, packet.rtt);
            self.stats.packets_confirmed += 1;
            self.loss.add_value(0.0);
            self.on_rtt_sample(packet.rtt);

            if !packet.reliable_ids.is_empty() {
                self.unconfirmed_reliables.retain(|p| !packet.reliable_ids.contains(&p.id()));
            }
        }
        for ack in lost {
            trace!("{:?}: packet {:?} lost", self, ack);
            self.on_packet_lost();
        }
    }

    fn on_packet_lost(&mut self) {
        self.stats.packets_lost += 1;
        self.loss.add_value(1.0);
    }

    fn on_rtt_sample(&mut self, sample: Duration) {
        self.rtt = Some(match self.rtt {
            None => sample,
            Some(prev) => {
                let alpha = self.config.rtt_blend_factor;
                Duration::from_secs_f64(sample.as_secs_f64() * alpha + prev.as_secs_f64() * (1.0 - alpha))
            }
        });
    }

    /// Records a received packet ack in the received history. Returns `false` if the packet
    ///  was received before or is too old to tell.
    fn register_received_ack(&mut self, ack: AckNumber) -> bool {
        let Some(highest) = self.highest_received_ack else {
            self.highest_received_ack = Some(ack);
            self.received_history = 0;
            return true;
        };

        if ack == highest {
            return false;
        }

        if ack.is_newer_than(highest) {
            let shift = ack.distance_from(highest) as u32;
            self.received_history = if shift > ACK_BITFIELD_LEN as u32 {
                0
            }
            else {
                (((self.received_history as u32) << shift) | (1 << (shift - 1))) as u16
            };
            self.highest_received_ack = Some(ack);
            return true;
        }

        let distance = highest.distance_from(ack);
        if distance > ACK_BITFIELD_LEN {
            return false;
        }
        let bit = 1u16 << (distance - 1);
        if self.received_history & bit != 0 {
            return false;
        }
        self.received_history |= bit;
        true
    }

    /// Returns `false` if the reliable id was processed recently
    fn register_processed_reliable(&mut self, reliable_id: u16) -> bool {
        if !self.processed_reliable_ids.insert(reliable_id) {
            return false;
        }
        self.processed_reliable_order.push_back(reliable_id);
        if self.processed_reliable_order.len() > self.config.processed_reliable_history {
            if let Some(oldest) = self.processed_reliable_order.pop_front() {
                self.processed_reliable_ids.remove(&oldest);
            }
        }
        true
    }

    pub fn has_net_tick_elapsed(&self, now: Instant) -> bool {
        match self.last_flush {
            None => true,
            Some(last_flush) => now.saturating_duration_since(last_flush) >= self.config.net_tick_interval,
        }
    }

    pub fn has_heartbeat_elapsed(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_sent) >= self.config.heartbeat_interval
    }

    /// nothing was received for longer than the configured connection timeout
    pub fn has_timed_out(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_received) > self.config.connection_timeout
    }

    pub fn has_outbound_messages(&self) -> bool {
        !self.unreliable_queue.is_empty()
            || !self.unsent_reliables.is_empty()
            || !self.unconfirmed_reliables.is_empty()
    }

    /// There is enough unsent data queued to fill at least one packet
    pub fn needs_to_force_send(&self) -> bool {
        PacketHeader::SERIALIZED_LEN + self.queued_bytes >= PACKET_MTU
    }

    /// smoothed round trip time, `None` before the first acknowledgement
    pub fn rtt(&self) -> Option<Duration> {
        self.rtt
    }

    /// fraction of recently sent packets that were lost, between 0.0 and 1.0
    pub fn loss_ratio(&self) -> f64 {
        self.loss.mean()
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn num_unconfirmed_reliables(&self) -> usize {
        self.unconfirmed_reliables.len()
    }

    pub fn num_queued_messages(&self) -> usize {
        self.unreliable_queue.len() + self.unsent_reliables.len()
    }

    /// Drops all queued and in-flight data
    pub fn close(&mut self) {
        debug!("{:?}: closing with {} queued and {} unconfirmed messages", self, self.num_queued_messages(), self.unconfirmed_reliables.len());
        self.unreliable_queue.clear();
        self.unsent_reliables.clear();
        self.unconfirmed_reliables.clear();
        self.queued_bytes = 0;
        self.tracker.clear();
        for channel in self.channels.iter_mut() {
            channel.reset();
        }
    }
}
