use tracing::{debug, trace};
use crate::messaging::message::Message;

/// One ordering channel of a connection. The sending side hands out consecutive sequence ids,
///  the receiving side releases messages strictly in sequence id order, holding back messages
///  that arrive early until the gap before them is filled.
///
/// Sequence ids are `u16` and wrap around. An id counts as 'older' than the next expected id if
///  it is less than half the id space behind it.
#[derive(Default)]
pub struct SequenceChannel {
    next_send_id: u16,
    next_expected_id: u16,
    /// out-of-order messages waiting for their predecessors, no particular order
    held: Vec<Message>,
}

impl SequenceChannel {
    pub fn new() -> SequenceChannel {
        SequenceChannel::default()
    }

    /// returns the id for the next outgoing message, advancing the counter
    pub fn next_send_id(&mut self) -> u16 {
        let result = self.next_send_id;
        self.next_send_id = self.next_send_id.wrapping_add(1);
        result
    }

    pub fn next_expected_id(&self) -> u16 {
        self.next_expected_id
    }

    pub fn num_held(&self) -> usize {
        self.held.len()
    }

    /// Accepts a received message, returning all messages that are now ready for delivery
    ///  in sequence order. That can be nothing (the message is early, or a duplicate), the
    ///  message itself, or the message followed by previously held messages.
    pub fn on_received(&mut self, message: Message) -> Vec<Message> {
        let Some(id) = message.sequence_id() else {
            debug!("message {:?} without sequence id on ordering channel - delivering as is", message);
            return vec![message];
        };

        let ahead = id.wrapping_sub(self.next_expected_id) as i16;
        if ahead < 0 {
            trace!("stale sequence id {} (expecting {}) - discarding duplicate", id, self.next_expected_id);
            return Vec::new();
        }
        if ahead > 0 {
            if self.held.iter().any(|m| m.sequence_id() == Some(id)) {
                trace!("sequence id {} is already held - discarding duplicate", id);
            }
            else {
                trace!("holding sequence id {} until {} arrives", id, self.next_expected_id);
                self.held.push(message);
            }
            return Vec::new();
        }

        let mut result = vec![message];
        self.next_expected_id = self.next_expected_id.wrapping_add(1);

        while let Some(pos) = self.held.iter().position(|m| m.sequence_id() == Some(self.next_expected_id)) {
            result.push(self.held.swap_remove(pos));
            self.next_expected_id = self.next_expected_id.wrapping_add(1);
        }
        result
    }

    /// Starts over at sequence id 0 in both directions, dropping held messages
    pub fn reset(&mut self) {
        if !self.held.is_empty() {
            debug!("resetting sequence channel, dropping {} held messages", self.held.len());
        }
        *self = SequenceChannel::default();
    }
}
