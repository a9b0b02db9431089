pub mod ack_number;
pub mod connection;
pub mod datagram_socket;
pub mod message;
pub mod message_definition;
pub mod net_address;
pub mod net_config;
pub mod packet;
pub mod packet_tracker;
pub mod sequence_channel;
pub mod session;

/// Index of a connection slot in its session, sent as a single byte in packet headers
pub type ConnectionIndex = u8;

/// Index of a local socket in its session
pub type BindingIndex = usize;
