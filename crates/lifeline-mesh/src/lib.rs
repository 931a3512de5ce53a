//! Lifeline Mesh: status fan-out between directly connected peers.
//!
//! A [`PeerChannel`] is a black-box connection to a handful of remote nodes.
//! It accepts outbound [`WireMessage`]s without blocking and reports
//! everything that happens on the wire (connection state, handshakes,
//! inbound frames, transport errors) as [`ChannelEvent`]s on an mpsc
//! receiver handed to its owner.
//!
//! Delivery is at-most-once with no acknowledgement and no retry. Every
//! status frame fully supersedes the previous one, so a lost frame is
//! repaired by the next check-in.
//!
//! # Transports
//!
//! - [`TcpPeerChannel`]: newline-delimited JSON over TCP
//! - [`LoopbackHub`] / [`MemoryChannel`]: in-process, for tests and embedding

pub mod channel;
pub mod error;
pub mod identity;
pub mod memory;
pub mod status;
pub mod tcp;
pub mod wire;

pub use channel::{ChannelEvent, ConnectionState, EventReceiver, PeerChannel};
pub use error::{Result, TransportError};
pub use identity::{assign_peer_id, ConnectionCode};
pub use memory::{LoopbackHub, MemoryChannel};
pub use status::Status;
pub use tcp::{TcpChannelConfig, TcpPeerChannel, MAX_FRAME_BYTES};
pub use wire::{now_millis, MessageKind, Payload, WireMessage};

/// Keepalive period for live connections.
pub const PING_INTERVAL_SECS: u64 = 30;
