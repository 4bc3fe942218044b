//! A connection-oriented message transport for Scalability-Protocols sockets,
//!  layered on top of a connectionless virtual L2 overlay network (a
//!  ZeroTier-like network running over UDP).
//!
//! The overlay gives us encrypted, best-effort delivery of Ethernet-style
//!  frames between 40-bit node identities. This crate builds the missing
//!  connection abstraction on top of that: many logical *pipes* multiplexed
//!  over one node identity, each pipe carrying whole application messages in
//!  both directions.
//!
//! ## Design goals
//!
//! * Emulate connections over a connectionless network
//!   * 24-bit port numbers are combined with the 40-bit node id into 64-bit
//!     addresses - one hash lookup demultiplexes every incoming frame
//!   * ports above 0x800000 are ephemeral and allocated from a randomly
//!     seeded counter; the rest are available for well-known services
//! * The abstraction is sending / receiving *messages* (defined-length chunks
//!   of data), not byte streams
//!   * messages are fragmented to the virtual network's MTU and reassembled
//!     from out-of-order fragments on the far side; fragments of several
//!     messages may interleave
//!   * delivery is best-effort: a message whose fragments stop arriving is
//!     discarded after a staleness window, and the *next* fully reassembled
//!     message wins - there is no cross-message ordering guarantee
//! * Connection establishment is a two-frame handshake with retries
//!   * the dialer re-sends its request on a timer and gives up after a
//!     configured number of attempts
//!   * listeners keep a bounded backlog of unpaired requests and answer
//!     retransmits idempotently - a duplicate request never yields a second
//!     pipe
//! * One shared overlay instance per home directory
//!   * the overlay library is not reentrant: one node-wide lock serializes
//!     it together with all demux state, and its callbacks are buffered and
//!     acted on after the overlay call returns
//!   * a background worker thread runs the overlay's housekeeping at the
//!     times it asks for
//!
//! ## Frame format
//!
//! Every frame starts with a fixed 12-byte header - all numbers in network
//!  byte order:
//!
//! ```ascii
//! 0:  opcode (u8)
//! 1:  flags (u8, must be zero)
//! 2:  protocol version (u16, currently 0x0001)
//! 4:  reserved (u8, must be zero)
//! 5:  destination port (u24)
//! 8:  reserved (u8, must be zero)
//! 9:  source port (u24)
//! ```
//!
//! followed by the opcode-specific body:
//!
//! ```ascii
//! DATA    (0x00) / DATA_MF (0x01):
//!     msg id (u16), fragment size (u16), fragment number (u16),
//!     fragment count (u16), payload
//! CONN_REQ (0x10) / CONN_ACK (0x12):
//!     SP protocol number (u16)
//! DISC_REQ (0x20), PING_REQ (0x30), PING_ACK (0x32):
//!     no body
//! ERROR   (0x40):
//!     code (u8), UTF-8 reason (rest of frame)
//! ```
//!
//! `DATA_MF` marks a fragment with more to follow; the final fragment of a
//!  message goes out as plain `DATA`. Frames travel on the overlay under
//!  ethertype 0x0901.

pub mod addr;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod fragment;
pub mod frame;
mod id_table;
mod node;
pub mod overlay;
pub mod pipe;
pub mod state_store;
mod wire;
pub mod zt_url;

#[cfg(test)]
mod test_util;

pub use crate::config::ZtConfig;
pub use crate::endpoint::{Dialer, Listener};
pub use crate::error::{ZtError, ZtResult};
pub use crate::pipe::Pipe;
