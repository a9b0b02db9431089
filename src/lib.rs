//! A message transport on top of unreliable datagrams, mixing best-effort and guaranteed
//!  delivery in the same packets.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages*, each of which fits into a single packet.
//!   There is no fragmentation, and packets are sized to avoid IP-level fragmentation.
//! * Each kind of message is registered up front as a *message definition* with its delivery
//!   options:
//!   * unreliable: sent once, may be lost
//!   * reliable: resent until acknowledged, handed to the application exactly once
//!   * in-order: reliable, and delivered in send order relative to all other messages on the same
//!     *channel*. Messages arriving early are held back until the gap before them is filled.
//!   * connectionless: unreliable, may be sent to and received from peers without a connection
//! * Definition ids are assigned by sorting names, so peers that register the same definitions
//!   agree on ids without negotiation
//! * Messages are collected and sent at a configurable tick rate, combining many small messages
//!   into a single packet
//! * There is no handshake: a connection is a local slot for a peer's address, and both sides
//!   start sending whenever they are ready
//! * Every packet header acknowledges the packets received from the peer. There are no separate
//!   ack packets except for empty packets that are sent when an acknowledgement is owed.
//! * Link quality (round trip time, loss ratio) is tracked per connection, and there are advisory
//!   timeouts. It is up to the application to act on them.
//! * All processing happens in the session's `tick()`, there are no background tasks or locks
//!
//! ## Packet header
//!
//! All numbers in the configured byte order (default little endian):
//! ```ascii
//! 0: sender connection index (u8) - 0xFF for connectionless packets
//! 1: packet ack (u16) - consecutive per connection, wrapping around and skipping 0
//! 3: highest received ack (u16) - the highest packet ack received from the peer, 0 for none
//! 5: received history (u16) - bit i is set if packet `highest received - i - 1` was received
//! 7: message count (u8)
//! ```
//!
//! A packet that acknowledges packets which carried reliable messages confirms these messages,
//!  removing them from the sender's resend queue. A packet that falls out of the received
//!  history window without being acknowledged is counted as lost, and its reliable messages
//!  are still resent.
//!
//! ## Messages
//!
//! Messages follow the header without padding:
//! ```ascii
//! 0: total size (u16) - including this message header
//! 2: definition id (u8)
//! *: reliable id (u16) - only for reliable messages, consecutive per connection
//! *: sequence id (u16) - only for in-order messages, consecutive per channel
//! *: payload
//! ```
//!
//! Messages in a packet that was received before are dropped. Reliable messages are checked
//!  against a window of recently processed reliable ids in addition, and in-order messages are
//!  checked by their channel.

pub mod messaging;
pub mod util;
pub mod test_util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
