//! The peer channel abstraction.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{Result, Status, TransportError, WireMessage};

/// Connection lifecycle of one remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Everything a channel reports back to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    StateChanged {
        peer_id: String,
        state: ConnectionState,
    },
    /// The remote side introduced itself.
    Handshake {
        peer_id: String,
        display_name: String,
    },
    /// An inbound application frame (status or group heartbeat).
    Message(WireMessage),
    /// An asynchronous transport failure. `peer_id` is `None` when the
    /// failure is not tied to one connection (e.g. the listener).
    Error {
        peer_id: Option<String>,
        error: TransportError,
    },
}

pub type EventReceiver = mpsc::UnboundedReceiver<ChannelEvent>;

/// A black-box connection to a set of directly reachable peers.
///
/// Every method returns immediately. Connection progress and failures
/// after the call returns are reported as [`ChannelEvent`]s; an `Err`
/// from a method only covers what is known synchronously (no route,
/// channel shut down).
pub trait PeerChannel: Send + Sync {
    /// Id this node presents to its peers.
    fn local_id(&self) -> &str;

    /// Start connecting to `peer_id`, presenting ourselves as
    /// `display_name`. A no-op if a connection already exists.
    fn connect(&self, peer_id: &str, display_name: &str) -> Result<()>;

    /// Tear down the connection to `peer_id`, if any.
    fn disconnect(&self, peer_id: &str);

    /// Queue `message` for one connected peer.
    fn send_to(&self, peer_id: &str, message: &WireMessage) -> Result<()>;

    /// Queue `message` for every connected peer. Returns how many peers
    /// it was queued for.
    fn broadcast(&self, message: &WireMessage) -> Result<usize>;

    /// Ids of peers whose connection is currently open.
    fn connected_peers(&self) -> Vec<String>;

    fn broadcast_status(
        &self,
        status: Status,
        display_name: &str,
        note: Option<&str>,
    ) -> Result<usize> {
        let message = WireMessage::status(
            self.local_id(),
            status,
            Some(display_name.to_string()),
            note.map(str::to_string),
        );
        self.broadcast(&message)
    }
}
