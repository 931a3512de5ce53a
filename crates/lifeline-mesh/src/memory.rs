//! In-process peer channel.
//!
//! Every node joined to a [`LoopbackHub`] can connect to any other node on
//! the same hub. Frames are delivered straight onto the receiver's event
//! queue, in send order.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    ChannelEvent, ConnectionState, EventReceiver, PeerChannel, Result, TransportError, WireMessage,
};

struct Node {
    display_name: String,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

#[derive(Default)]
struct HubState {
    nodes: HashMap<String, Node>,
    /// Undirected links, stored with the smaller id first.
    links: BTreeSet<(String, String)>,
}

impl HubState {
    fn emit(&self, to: &str, event: ChannelEvent) {
        if let Some(node) = self.nodes.get(to) {
            let _ = node.events.send(event);
        }
    }

    fn linked(&self, a: &str, b: &str) -> bool {
        self.links.contains(&link_key(a, b))
    }

    fn neighbours(&self, id: &str) -> Vec<String> {
        self.links
            .iter()
            .filter_map(|(a, b)| {
                if a == id {
                    Some(b.clone())
                } else if b == id {
                    Some(a.clone())
                } else {
                    None
                }
            })
            .collect()
    }

    fn unlink(&mut self, a: &str, b: &str) -> bool {
        if !self.links.remove(&link_key(a, b)) {
            return false;
        }
        for (from, to) in [(a, b), (b, a)] {
            self.emit(
                from,
                ChannelEvent::StateChanged {
                    peer_id: to.to_string(),
                    state: ConnectionState::Disconnected,
                },
            );
        }
        true
    }
}

fn link_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Shared switchboard for [`MemoryChannel`]s.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a node to the hub. Joining again under the same id replaces the
    /// previous node's event queue.
    pub fn join(
        &self,
        peer_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> (MemoryChannel, EventReceiver) {
        let peer_id = peer_id.into();
        let (events, rx) = mpsc::unbounded_channel();
        self.lock().nodes.insert(
            peer_id.clone(),
            Node {
                display_name: display_name.into(),
                events,
            },
        );
        (
            MemoryChannel {
                local_id: peer_id,
                hub: self.clone(),
            },
            rx,
        )
    }

    /// Remove a node, dropping every link it had.
    pub fn leave(&self, peer_id: &str) {
        let mut state = self.lock();
        for other in state.neighbours(peer_id) {
            state.unlink(peer_id, &other);
        }
        state.nodes.remove(peer_id);
    }
}

/// One node's handle onto a [`LoopbackHub`].
pub struct MemoryChannel {
    local_id: String,
    hub: LoopbackHub,
}

impl PeerChannel for MemoryChannel {
    fn local_id(&self) -> &str {
        &self.local_id
    }

    fn connect(&self, peer_id: &str, display_name: &str) -> Result<()> {
        let mut state = self.hub.lock();
        if !state.nodes.contains_key(&self.local_id) {
            return Err(TransportError::ChannelClosed);
        }
        if peer_id == self.local_id {
            return Err(TransportError::UnknownPeer(peer_id.to_string()));
        }
        let remote_name = match state.nodes.get(peer_id) {
            Some(node) => node.display_name.clone(),
            None => return Err(TransportError::UnknownPeer(peer_id.to_string())),
        };
        if state.linked(&self.local_id, peer_id) {
            return Ok(());
        }

        state.links.insert(link_key(&self.local_id, peer_id));
        debug!(local = %self.local_id, peer_id, "loopback link up");

        for connection_state in [ConnectionState::Connecting, ConnectionState::Connected] {
            state.emit(
                &self.local_id,
                ChannelEvent::StateChanged {
                    peer_id: peer_id.to_string(),
                    state: connection_state,
                },
            );
        }
        state.emit(
            &self.local_id,
            ChannelEvent::Handshake {
                peer_id: peer_id.to_string(),
                display_name: remote_name,
            },
        );
        state.emit(
            peer_id,
            ChannelEvent::StateChanged {
                peer_id: self.local_id.clone(),
                state: ConnectionState::Connected,
            },
        );
        state.emit(
            peer_id,
            ChannelEvent::Handshake {
                peer_id: self.local_id.clone(),
                display_name: display_name.to_string(),
            },
        );
        Ok(())
    }

    fn disconnect(&self, peer_id: &str) {
        self.hub.lock().unlink(&self.local_id, peer_id);
    }

    fn send_to(&self, peer_id: &str, message: &WireMessage) -> Result<()> {
        let state = self.hub.lock();
        if !state.linked(&self.local_id, peer_id) {
            return Err(TransportError::NotConnected(peer_id.to_string()));
        }
        state.emit(peer_id, ChannelEvent::Message(message.clone()));
        Ok(())
    }

    fn broadcast(&self, message: &WireMessage) -> Result<usize> {
        let state = self.hub.lock();
        if !state.nodes.contains_key(&self.local_id) {
            return Err(TransportError::ChannelClosed);
        }
        let peers = state.neighbours(&self.local_id);
        for peer in &peers {
            state.emit(peer, ChannelEvent::Message(message.clone()));
        }
        Ok(peers.len())
    }

    fn connected_peers(&self) -> Vec<String> {
        self.hub.lock().neighbours(&self.local_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MessageKind, Status};
    use tokio_test::{assert_err, assert_ok};

    fn drain(rx: &mut EventReceiver) -> Vec<ChannelEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn connect_reports_both_sides() {
        let hub = LoopbackHub::new();
        let (a, mut a_rx) = hub.join("a", "Alice");
        let (_b, mut b_rx) = hub.join("b", "Bob");

        assert_ok!(a.connect("b", "Alice"));

        assert_eq!(
            drain(&mut a_rx),
            vec![
                ChannelEvent::StateChanged {
                    peer_id: "b".into(),
                    state: ConnectionState::Connecting
                },
                ChannelEvent::StateChanged {
                    peer_id: "b".into(),
                    state: ConnectionState::Connected
                },
                ChannelEvent::Handshake {
                    peer_id: "b".into(),
                    display_name: "Bob".into()
                },
            ]
        );
        assert_eq!(
            drain(&mut b_rx),
            vec![
                ChannelEvent::StateChanged {
                    peer_id: "a".into(),
                    state: ConnectionState::Connected
                },
                ChannelEvent::Handshake {
                    peer_id: "a".into(),
                    display_name: "Alice".into()
                },
            ]
        );

        // Connecting twice is a no-op.
        assert_ok!(a.connect("b", "Alice"));
        assert!(drain(&mut a_rx).is_empty());
    }

    #[test]
    fn unknown_peer_fails_synchronously() {
        let hub = LoopbackHub::new();
        let (a, _rx) = hub.join("a", "Alice");
        assert_eq!(a.connect("ghost", "Alice"), Err(TransportError::UnknownPeer("ghost".into())));
        assert_eq!(a.connect("a", "Alice"), Err(TransportError::UnknownPeer("a".into())));
    }

    #[test]
    fn broadcast_reaches_only_linked_peers() {
        let hub = LoopbackHub::new();
        let (a, _a_rx) = hub.join("a", "Alice");
        let (_b, mut b_rx) = hub.join("b", "Bob");
        let (_c, mut c_rx) = hub.join("c", "Cat");
        a.connect("b", "Alice").unwrap();
        drain(&mut b_rx);

        assert_eq!(a.broadcast_status(Status::Yellow, "Alice", Some("tired")).unwrap(), 1);

        let events = drain(&mut b_rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ChannelEvent::Message(msg) => {
                assert_eq!(msg.kind, MessageKind::Status);
                assert_eq!(msg.from, "a");
                assert_eq!(msg.payload_status(), Some(Status::Yellow));
                assert_eq!(msg.payload_note(), Some("tired"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(drain(&mut c_rx).is_empty());
        assert_eq!(a.send_to("c", &WireMessage::ping("a")), Err(TransportError::NotConnected("c".into())));
    }

    #[test]
    fn disconnect_and_leave_notify_remote() {
        let hub = LoopbackHub::new();
        let (a, mut a_rx) = hub.join("a", "Alice");
        let (b, mut b_rx) = hub.join("b", "Bob");
        a.connect("b", "Alice").unwrap();
        drain(&mut a_rx);
        drain(&mut b_rx);

        b.disconnect("a");
        let disconnected = ChannelEvent::StateChanged {
            peer_id: "b".into(),
            state: ConnectionState::Disconnected,
        };
        assert_eq!(drain(&mut a_rx), vec![disconnected.clone()]);
        assert!(a.connected_peers().is_empty());

        a.connect("b", "Alice").unwrap();
        drain(&mut a_rx);
        hub.leave("b");
        assert_eq!(drain(&mut a_rx), vec![disconnected]);
        assert_err!(b.connect("a", "Bob"));
        assert_eq!(b.broadcast(&WireMessage::ping("b")), Err(TransportError::ChannelClosed));
    }
}
