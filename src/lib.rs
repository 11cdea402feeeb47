//! Reliable, ordered messaging between partitions, on top of an unreliable one-way transport.
//!
//! An outbound session sends messages from a source partition to a target partition on a peer;
//!  the peer's inbound session for the same session id receives them in order. Every frame is
//!  acknowledged by the receiving side, and the sending side retransmits until the ack arrives.
//!
//! Opening, closing and aborting a session are handshakes of request / response frames that
//!  are retransmitted in the same way. Closing is graceful: all messages sent before the close
//!  are delivered before the receiving application sees the session closed.
//!
//! Frames are handled by the [dispatcher::TransportDispatcher] in one of two ways:
//! * acks and message content are processed on the caller's task
//! * everything else goes through a bounded pool of buffers to worker tasks
pub mod ack_table;
pub mod action_code;
pub mod completion;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod environment;
pub mod error;
pub mod frame;
pub mod message_pool;
pub mod partition;
pub mod protocol_operation;
pub mod receive_operation;
pub mod send_operation;
pub mod session;
pub mod session_directory;
pub mod transport;

#[cfg(test)]
mod test_util;
