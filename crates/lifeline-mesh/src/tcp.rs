//! Newline-delimited JSON peer channel over TCP.
//!
//! The dialing side speaks first with a `handshake` frame; the accepting
//! side learns the peer id from it and answers with its own. After that
//! both sides run the same session loop: inbound frames are decoded and
//! forwarded as events, queued outbound frames are written, and a `ping`
//! goes out every [`PING_INTERVAL_SECS`](crate::PING_INTERVAL_SECS).
//! Pings are answered inside the channel and never reach the owner.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::{
    ChannelEvent, ConnectionCode, ConnectionState, EventReceiver, MessageKind, PeerChannel,
    Result, TransportError, WireMessage, PING_INTERVAL_SECS,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Longest inbound line, newline excluded, before the connection is dropped.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Listener and session settings.
#[derive(Debug, Clone)]
pub struct TcpChannelConfig {
    pub listen_addr: SocketAddr,
    /// Address put into our connection code. Defaults to the bound address.
    pub advertise_addr: Option<SocketAddr>,
    /// Name sent in the handshake answering inbound connections.
    pub display_name: String,
    pub ping_interval: Duration,
    pub max_frame_bytes: usize,
}

impl TcpChannelConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            advertise_addr: None,
            display_name: "User".to_string(),
            ping_interval: Duration::from_secs(PING_INTERVAL_SECS),
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }

    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    #[must_use]
    pub fn with_advertise_addr(mut self, addr: SocketAddr) -> Self {
        self.advertise_addr = Some(addr);
        self
    }

    #[must_use]
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    #[must_use]
    pub fn with_max_frame_bytes(mut self, limit: usize) -> Self {
        self.max_frame_bytes = limit;
        self
    }
}

/// Newline-delimited reader that refuses lines longer than `limit`.
///
/// Partial reads stay in `buf`, so `next_frame` can sit in a `select!`.
struct FrameReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
    limit: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    fn new(reader: R, limit: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            buf: Vec::new(),
            limit,
        }
    }

    /// The next line without its terminator, or `None` at end of stream.
    async fn next_frame(&mut self) -> Result<Option<String>> {
        // One byte of headroom for the newline.
        let budget = (self.limit + 1).saturating_sub(self.buf.len()) as u64;
        let read = (&mut self.inner).take(budget).read_until(b'\n', &mut self.buf).await?;

        if self.buf.last() != Some(&b'\n') {
            if self.buf.len() > self.limit {
                self.buf.clear();
                return Err(TransportError::FrameTooLarge { limit: self.limit });
            }
            if read == 0 && self.buf.is_empty() {
                return Ok(None);
            }
        }
        self.take_frame().map(Some)
    }

    fn take_frame(&mut self) -> Result<String> {
        let bytes = std::mem::take(&mut self.buf);
        let mut line = String::from_utf8(bytes).map_err(|e| TransportError::Codec(e.to_string()))?;
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }
}

struct Connection {
    serial: u64,
    state: ConnectionState,
    /// True when we dialed this connection.
    dialed: bool,
    outbound: mpsc::UnboundedSender<WireMessage>,
    task: Option<AbortHandle>,
}

struct Shared {
    local_id: String,
    display_name: String,
    ping_interval: Duration,
    max_frame_bytes: usize,
    advertise_addr: SocketAddr,
    routes: Mutex<HashMap<String, SocketAddr>>,
    connections: Mutex<HashMap<String, Connection>>,
    next_serial: AtomicU64,
    events: mpsc::UnboundedSender<ChannelEvent>,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn write_frame(writer: &mut OwnedWriteHalf, message: &WireMessage) -> Result<()> {
    let line = message.encode_line()?;
    writer.write_all(line.as_bytes()).await?;
    Ok(())
}

impl Shared {
    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    fn emit_state(&self, peer_id: &str, state: ConnectionState) {
        self.emit(ChannelEvent::StateChanged {
            peer_id: peer_id.to_string(),
            state,
        });
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::ChannelClosed)
        } else {
            Ok(())
        }
    }

    fn attach_task(&self, peer_id: &str, serial: u64, task: AbortHandle) {
        if let Some(conn) = lock(&self.connections).get_mut(peer_id) {
            if conn.serial == serial {
                conn.task = Some(task);
            }
        }
    }

    /// Remove the entry for `peer_id` if it still belongs to `serial`.
    fn remove_if_current(&self, peer_id: &str, serial: u64) -> bool {
        let mut conns = lock(&self.connections);
        match conns.get(peer_id) {
            Some(conn) if conn.serial == serial => {
                conns.remove(peer_id);
                true
            }
            _ => false,
        }
    }

    fn mark_connected(&self, peer_id: &str, serial: u64) {
        let updated = match lock(&self.connections).get_mut(peer_id) {
            Some(conn) if conn.serial == serial => {
                conn.state = ConnectionState::Connected;
                true
            }
            _ => false,
        };
        if updated {
            info!(peer_id, "peer connected");
            self.emit_state(peer_id, ConnectionState::Connected);
        }
    }

    /// A dial that never reached the session loop.
    fn dial_failed(&self, peer_id: &str, serial: u64, error: TransportError) {
        if !self.remove_if_current(peer_id, serial) {
            return;
        }
        warn!(peer_id, error = %error, "connect failed");
        self.emit(ChannelEvent::Error {
            peer_id: Some(peer_id.to_string()),
            error,
        });
        self.emit_state(peer_id, ConnectionState::Error);
    }

    /// Register an accepted connection. Returns `None` when an existing
    /// dial towards the same peer takes precedence.
    ///
    /// Two nodes dialing each other at once keep the connection dialed by
    /// the smaller id.
    fn register_inbound(
        &self,
        peer_id: &str,
        outbound: mpsc::UnboundedSender<WireMessage>,
    ) -> Option<u64> {
        let mut conns = lock(&self.connections);
        if let Some(existing) = conns.get(peer_id) {
            if existing.dialed && self.local_id.as_str() < peer_id {
                return None;
            }
        }
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let replaced = conns.insert(
            peer_id.to_string(),
            Connection {
                serial,
                state: ConnectionState::Connected,
                dialed: false,
                outbound,
                task: None,
            },
        );
        if let Some(task) = replaced.and_then(|old| old.task) {
            task.abort();
        }
        Some(serial)
    }

    /// Handle one inbound line. Returns a frame to write back, if any.
    fn on_frame(&self, peer_id: &str, line: &str) -> Option<WireMessage> {
        if line.trim().is_empty() {
            return None;
        }
        let message = match WireMessage::decode_line(line) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer_id, error = %e, "dropping undecodable frame");
                return None;
            }
        };
        if message.from != peer_id {
            warn!(peer_id, from = %message.from, "dropping frame with mismatched sender");
            return None;
        }

        match message.kind {
            MessageKind::Ping => Some(WireMessage::pong(&self.local_id)),
            MessageKind::Pong => {
                trace!(peer_id, "pong");
                None
            }
            MessageKind::Handshake => {
                let display_name = message.payload_name().unwrap_or(peer_id).to_string();
                self.emit(ChannelEvent::Handshake {
                    peer_id: peer_id.to_string(),
                    display_name,
                });
                None
            }
            MessageKind::Status | MessageKind::GroupHeartbeat => {
                self.emit(ChannelEvent::Message(message));
                None
            }
        }
    }

    async fn run_session(
        &self,
        peer_id: &str,
        serial: u64,
        mut frames: FrameReader<OwnedReadHalf>,
        mut writer: OwnedWriteHalf,
        mut outbound: mpsc::UnboundedReceiver<WireMessage>,
    ) {
        let mut ping = tokio::time::interval(self.ping_interval);
        ping.tick().await;

        let outcome: Result<()> = loop {
            tokio::select! {
                frame = frames.next_frame() => match frame {
                    Ok(Some(line)) => {
                        if let Some(reply) = self.on_frame(peer_id, &line) {
                            if let Err(e) = write_frame(&mut writer, &reply).await {
                                break Err(e);
                            }
                        }
                    }
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                },
                queued = outbound.recv() => match queued {
                    Some(message) => {
                        if let Err(e) = write_frame(&mut writer, &message).await {
                            break Err(e);
                        }
                    }
                    None => break Ok(()),
                },
                _ = ping.tick() => {
                    if let Err(e) = write_frame(&mut writer, &WireMessage::ping(&self.local_id)).await {
                        break Err(e);
                    }
                }
            }
        };

        if !self.remove_if_current(peer_id, serial) {
            return;
        }
        if let Err(error) = outcome {
            warn!(peer_id, error = %error, "peer connection failed");
            self.emit(ChannelEvent::Error {
                peer_id: Some(peer_id.to_string()),
                error,
            });
        }
        info!(peer_id, "peer disconnected");
        self.emit_state(peer_id, ConnectionState::Disconnected);
    }

    async fn dial(
        self: Arc<Self>,
        peer_id: String,
        display_name: String,
        addr: SocketAddr,
        serial: u64,
        outbound: mpsc::UnboundedReceiver<WireMessage>,
    ) {
        let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return self.dial_failed(&peer_id, serial, e.into()),
            Err(_) => {
                let error = TransportError::Io(format!("connect to {} timed out", addr));
                return self.dial_failed(&peer_id, serial, error);
            }
        };
        let (reader, mut writer) = stream.into_split();

        let hello = WireMessage::handshake(&self.local_id, display_name);
        if let Err(e) = write_frame(&mut writer, &hello).await {
            return self.dial_failed(&peer_id, serial, e);
        }
        self.mark_connected(&peer_id, serial);

        let frames = FrameReader::new(reader, self.max_frame_bytes);
        self.run_session(&peer_id, serial, frames, writer, outbound).await;
    }

    async fn accept(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let (reader, mut writer) = stream.into_split();
        let mut frames = FrameReader::new(reader, self.max_frame_bytes);

        let first = match timeout(HANDSHAKE_TIMEOUT, frames.next_frame()).await {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => return,
            Ok(Err(e @ TransportError::FrameTooLarge { .. })) => {
                warn!(%addr, error = %e, "closing connection before handshake");
                return;
            }
            Ok(Err(e)) => {
                debug!(%addr, error = %e, "read error before handshake");
                return;
            }
            Err(_) => {
                debug!(%addr, "no handshake before timeout");
                return;
            }
        };
        let hello = match WireMessage::decode_line(&first) {
            Ok(message) if message.kind == MessageKind::Handshake => message,
            Ok(message) => {
                warn!(%addr, kind = %message.kind, "expected handshake as first frame");
                return;
            }
            Err(e) => {
                warn!(%addr, error = %e, "undecodable handshake");
                return;
            }
        };

        let peer_id = hello.from.clone();
        let display_name = hello.payload_name().unwrap_or(&peer_id).to_string();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let Some(serial) = self.register_inbound(&peer_id, outbound_tx) else {
            debug!(peer_id = %peer_id, %addr, "keeping our own dial, closing inbound duplicate");
            return;
        };

        let reply = WireMessage::handshake(&self.local_id, &self.display_name);
        if let Err(e) = write_frame(&mut writer, &reply).await {
            if self.remove_if_current(&peer_id, serial) {
                warn!(peer_id = %peer_id, error = %e, "handshake reply failed");
            }
            return;
        }

        info!(peer_id = %peer_id, %addr, "accepted peer connection");
        self.emit_state(&peer_id, ConnectionState::Connected);
        self.emit(ChannelEvent::Handshake {
            peer_id: peer_id.clone(),
            display_name,
        });

        self.run_session(&peer_id, serial, frames, writer, outbound_rx).await;
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(%addr, "incoming peer connection");
                    tokio::spawn(Arc::clone(&self).accept(stream, addr));
                }
                Err(e) => self.accept_failed(e).await,
            }
        }
    }

    /// Report a failed `accept` and wait before the next one. Errors such
    /// as EMFILE persist, so the loop must not retry immediately.
    async fn accept_failed(&self, error: std::io::Error) {
        warn!(error = %error, "accept failed");
        self.emit(ChannelEvent::Error {
            peer_id: None,
            error: error.into(),
        });
        tokio::time::sleep(ACCEPT_BACKOFF).await;
    }
}

/// Peer channel over TCP.
///
/// Methods that start I/O spawn onto the current Tokio runtime and must be
/// called from within one.
pub struct TcpPeerChannel {
    shared: Arc<Shared>,
    accept_task: JoinHandle<()>,
}

impl TcpPeerChannel {
    /// Bind the listener and start accepting.
    ///
    /// `local_id` is kept if supplied, otherwise generated.
    pub async fn bind(
        config: TcpChannelConfig,
        local_id: Option<String>,
    ) -> Result<(Self, EventReceiver)> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let bound = listener.local_addr()?;
        let (events, rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            local_id: crate::assign_peer_id(local_id),
            display_name: config.display_name,
            ping_interval: config.ping_interval,
            max_frame_bytes: config.max_frame_bytes,
            advertise_addr: config.advertise_addr.unwrap_or(bound),
            routes: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            next_serial: AtomicU64::new(0),
            events,
            closed: AtomicBool::new(false),
        });
        info!(peer_id = %shared.local_id, addr = %bound, "peer channel listening");

        let accept_task = tokio::spawn(Arc::clone(&shared).accept_loop(listener));
        Ok((Self { shared, accept_task }, rx))
    }

    /// Remember where `peer_id` can be dialed.
    pub fn add_route(&self, peer_id: impl Into<String>, addr: SocketAddr) {
        lock(&self.shared.routes).insert(peer_id.into(), addr);
    }

    pub fn add_connection_code(&self, code: &ConnectionCode) {
        self.add_route(code.peer_id.clone(), code.addr);
    }

    pub fn route(&self, peer_id: &str) -> Option<SocketAddr> {
        lock(&self.shared.routes).get(peer_id).copied()
    }

    /// Our own code, for sharing out of band.
    pub fn connection_code(&self) -> ConnectionCode {
        ConnectionCode::new(self.shared.local_id.clone(), self.shared.advertise_addr)
    }

    pub fn state_of(&self, peer_id: &str) -> Option<ConnectionState> {
        lock(&self.shared.connections).get(peer_id).map(|c| c.state)
    }

    /// Stop accepting and drop every connection. Later calls fail with
    /// [`TransportError::ChannelClosed`].
    pub fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.accept_task.abort();
        let drained: Vec<Connection> = lock(&self.shared.connections)
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for task in drained.into_iter().filter_map(|conn| conn.task) {
            task.abort();
        }
        info!(peer_id = %self.shared.local_id, "peer channel shut down");
    }
}

impl Drop for TcpPeerChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl PeerChannel for TcpPeerChannel {
    fn local_id(&self) -> &str {
        &self.shared.local_id
    }

    fn connect(&self, peer_id: &str, display_name: &str) -> Result<()> {
        self.shared.ensure_open()?;
        let addr = self
            .route(peer_id)
            .ok_or_else(|| TransportError::UnknownPeer(peer_id.to_string()))?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let serial = {
            let mut conns = lock(&self.shared.connections);
            if conns.contains_key(peer_id) {
                return Ok(());
            }
            let serial = self.shared.next_serial.fetch_add(1, Ordering::Relaxed);
            conns.insert(
                peer_id.to_string(),
                Connection {
                    serial,
                    state: ConnectionState::Connecting,
                    dialed: true,
                    outbound: outbound_tx,
                    task: None,
                },
            );
            serial
        };

        debug!(peer_id, %addr, "dialing peer");
        self.shared.emit_state(peer_id, ConnectionState::Connecting);

        let handle = tokio::spawn(Arc::clone(&self.shared).dial(
            peer_id.to_string(),
            display_name.to_string(),
            addr,
            serial,
            outbound_rx,
        ));
        self.shared.attach_task(peer_id, serial, handle.abort_handle());
        Ok(())
    }

    fn disconnect(&self, peer_id: &str) {
        let removed = lock(&self.shared.connections).remove(peer_id);
        if let Some(conn) = removed {
            if let Some(task) = conn.task {
                task.abort();
            }
            info!(peer_id, "peer disconnected by request");
            self.shared.emit_state(peer_id, ConnectionState::Disconnected);
        }
    }

    fn send_to(&self, peer_id: &str, message: &WireMessage) -> Result<()> {
        self.shared.ensure_open()?;
        let conns = lock(&self.shared.connections);
        match conns.get(peer_id) {
            Some(conn) if conn.state == ConnectionState::Connected => conn
                .outbound
                .send(message.clone())
                .map_err(|_| TransportError::NotConnected(peer_id.to_string())),
            _ => Err(TransportError::NotConnected(peer_id.to_string())),
        }
    }

    fn broadcast(&self, message: &WireMessage) -> Result<usize> {
        self.shared.ensure_open()?;
        let conns = lock(&self.shared.connections);
        let queued = conns
            .values()
            .filter(|conn| conn.state == ConnectionState::Connected)
            .filter(|conn| conn.outbound.send(message.clone()).is_ok())
            .count();
        Ok(queued)
    }

    fn connected_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = lock(&self.shared.connections)
            .iter()
            .filter(|(_, conn)| conn.state == ConnectionState::Connected)
            .map(|(id, _)| id.clone())
            .collect();
        peers.sort();
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Status;

    const WAIT: Duration = Duration::from_secs(5);

    async fn bind(id: &str) -> (TcpPeerChannel, EventReceiver) {
        let config = TcpChannelConfig::new("127.0.0.1:0".parse().unwrap()).with_display_name(id.to_uppercase());
        TcpPeerChannel::bind(config, Some(id.to_string())).await.unwrap()
    }

    async fn wait_for<F>(rx: &mut EventReceiver, mut pred: F) -> ChannelEvent
    where
        F: FnMut(&ChannelEvent) -> bool,
    {
        timeout(WAIT, async {
            loop {
                match rx.recv().await {
                    Some(event) if pred(&event) => return event,
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    fn is_state(event: &ChannelEvent, peer: &str, want: ConnectionState) -> bool {
        matches!(event, ChannelEvent::StateChanged { peer_id, state } if peer_id == peer && *state == want)
    }

    #[tokio::test]
    async fn dial_handshake_and_status() {
        let (a, mut a_rx) = bind("a").await;
        let (b, mut b_rx) = bind("b").await;
        a.add_connection_code(&b.connection_code());

        a.connect("b", "Alice").unwrap();
        wait_for(&mut a_rx, |e| is_state(e, "b", ConnectionState::Connected)).await;
        let hello = wait_for(&mut a_rx, |e| matches!(e, ChannelEvent::Handshake { .. })).await;
        assert_eq!(
            hello,
            ChannelEvent::Handshake {
                peer_id: "b".into(),
                display_name: "B".into()
            }
        );

        let hello = wait_for(&mut b_rx, |e| matches!(e, ChannelEvent::Handshake { .. })).await;
        assert_eq!(
            hello,
            ChannelEvent::Handshake {
                peer_id: "a".into(),
                display_name: "Alice".into()
            }
        );
        assert_eq!(b.connected_peers(), vec!["a".to_string()]);

        assert_eq!(a.broadcast_status(Status::Red, "Alice", Some("help")).unwrap(), 1);
        let inbound = wait_for(&mut b_rx, |e| matches!(e, ChannelEvent::Message(_))).await;
        match inbound {
            ChannelEvent::Message(msg) => {
                assert_eq!(msg.from, "a");
                assert_eq!(msg.payload_status(), Some(Status::Red));
                assert_eq!(msg.payload_note(), Some("help"));
            }
            other => panic!("unexpected {:?}", other),
        }

        // And back the other way over the same connection.
        b.send_to("a", &WireMessage::status("b", Status::Green, None, None)).unwrap();
        wait_for(&mut a_rx, |e| matches!(e, ChannelEvent::Message(m) if m.from == "b")).await;
    }

    #[tokio::test]
    async fn unknown_route_fails_synchronously() {
        let (a, _rx) = bind("a").await;
        assert_eq!(a.connect("nobody", "A"), Err(TransportError::UnknownPeer("nobody".into())));
        assert_eq!(
            a.send_to("nobody", &WireMessage::ping("a")),
            Err(TransportError::NotConnected("nobody".into()))
        );
    }

    #[tokio::test]
    async fn refused_dial_reports_error_state() {
        let spare = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = spare.local_addr().unwrap();
        drop(spare);

        let (a, mut a_rx) = bind("a").await;
        a.add_route("b", dead_addr);
        a.connect("b", "A").unwrap();

        wait_for(&mut a_rx, |e| is_state(e, "b", ConnectionState::Error)).await;
        assert_eq!(a.state_of("b"), None);
        assert!(a.connected_peers().is_empty());
    }

    #[tokio::test]
    async fn remote_sees_disconnect() {
        let (a, mut a_rx) = bind("a").await;
        let (b, mut b_rx) = bind("b").await;
        a.add_connection_code(&b.connection_code());
        a.connect("b", "A").unwrap();
        wait_for(&mut a_rx, |e| is_state(e, "b", ConnectionState::Connected)).await;
        wait_for(&mut b_rx, |e| is_state(e, "a", ConnectionState::Connected)).await;

        a.disconnect("b");
        wait_for(&mut a_rx, |e| is_state(e, "b", ConnectionState::Disconnected)).await;
        wait_for(&mut b_rx, |e| is_state(e, "a", ConnectionState::Disconnected)).await;
        drop(b);
    }

    #[tokio::test]
    async fn answers_ping_with_pong() {
        let (b, _b_rx) = bind("b").await;
        let mut raw = TcpStream::connect(b.connection_code().addr).await.unwrap();
        let hello = WireMessage::handshake("raw", "Raw").encode_line().unwrap();
        let ping = WireMessage::ping("raw").encode_line().unwrap();
        raw.write_all(hello.as_bytes()).await.unwrap();
        raw.write_all(ping.as_bytes()).await.unwrap();

        let mut lines = BufReader::new(raw).lines();
        let kinds = timeout(WAIT, async {
            let mut kinds = Vec::new();
            while let Some(line) = lines.next_line().await.unwrap() {
                let msg = WireMessage::decode_line(&line).unwrap();
                kinds.push(msg.kind);
                if msg.kind == MessageKind::Pong {
                    break;
                }
            }
            kinds
        })
        .await
        .unwrap();
        assert_eq!(kinds, vec![MessageKind::Handshake, MessageKind::Pong]);
    }

    async fn bind_capped(id: &str, limit: usize) -> (TcpPeerChannel, EventReceiver) {
        let config = TcpChannelConfig::new("127.0.0.1:0".parse().unwrap()).with_max_frame_bytes(limit);
        TcpPeerChannel::bind(config, Some(id.to_string())).await.unwrap()
    }

    /// Read until the remote closes, ignoring whatever it sent.
    async fn closed_by_remote(raw: &mut TcpStream) -> bool {
        let mut sink = [0u8; 1024];
        timeout(WAIT, async {
            loop {
                match raw.read(&mut sink).await {
                    Ok(0) | Err(_) => return true,
                    Ok(_) => continue,
                }
            }
        })
        .await
        .unwrap_or(false)
    }

    #[tokio::test]
    async fn endless_line_before_handshake_is_cut_off() {
        let (b, _b_rx) = bind_capped("b", 1024).await;
        let mut raw = TcpStream::connect(b.connection_code().addr).await.unwrap();

        // Keep writing past the limit without ever sending a newline.
        let chunk = vec![b'x'; 512];
        for _ in 0..8 {
            if raw.write_all(&chunk).await.is_err() {
                break;
            }
        }
        assert!(closed_by_remote(&mut raw).await);
        assert!(b.connected_peers().is_empty());
    }

    #[tokio::test]
    async fn oversized_frame_drops_session() {
        let (b, mut b_rx) = bind_capped("b", 1024).await;
        let mut raw = TcpStream::connect(b.connection_code().addr).await.unwrap();
        let hello = WireMessage::handshake("raw", "Raw").encode_line().unwrap();
        raw.write_all(hello.as_bytes()).await.unwrap();
        wait_for(&mut b_rx, |e| is_state(e, "raw", ConnectionState::Connected)).await;

        let mut huge = WireMessage::status("raw", Status::Green, None, Some("z".repeat(4096)))
            .encode_line()
            .unwrap();
        huge.truncate(huge.len() - 1);
        let _ = raw.write_all(huge.as_bytes()).await;

        let error = wait_for(&mut b_rx, |e| matches!(e, ChannelEvent::Error { .. })).await;
        assert_eq!(
            error,
            ChannelEvent::Error {
                peer_id: Some("raw".into()),
                error: TransportError::FrameTooLarge { limit: 1024 },
            }
        );
        wait_for(&mut b_rx, |e| is_state(e, "raw", ConnectionState::Disconnected)).await;
        assert!(b.connected_peers().is_empty());
    }

    #[tokio::test]
    async fn frames_within_the_limit_pass() {
        let (b, mut b_rx) = bind_capped("b", 1024).await;
        let mut raw = TcpStream::connect(b.connection_code().addr).await.unwrap();
        let hello = WireMessage::handshake("raw", "Raw").encode_line().unwrap();
        let status = WireMessage::status("raw", Status::Yellow, None, Some("ok".into())).encode_line().unwrap();
        assert!(status.len() - 1 <= 1024);
        raw.write_all(hello.as_bytes()).await.unwrap();
        raw.write_all(status.as_bytes()).await.unwrap();

        let inbound = wait_for(&mut b_rx, |e| matches!(e, ChannelEvent::Message(_))).await;
        match inbound {
            ChannelEvent::Message(msg) => assert_eq!(msg.payload_status(), Some(Status::Yellow)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_accept_backs_off() {
        let (a, mut rx) = bind("a").await;
        let started = tokio::time::Instant::now();
        a.shared.accept_failed(std::io::Error::from_raw_os_error(24)).await;
        assert!(started.elapsed() >= ACCEPT_BACKOFF);

        let event = wait_for(&mut rx, |e| matches!(e, ChannelEvent::Error { .. })).await;
        assert!(matches!(event, ChannelEvent::Error { peer_id: None, error: TransportError::Io(_) }));
    }

    #[tokio::test]
    async fn shutdown_closes_channel() {
        let (a, _rx) = bind("a").await;
        a.shutdown();
        assert_eq!(a.broadcast(&WireMessage::ping("a")), Err(TransportError::ChannelClosed));
        assert_eq!(a.connect("b", "A"), Err(TransportError::ChannelClosed));
    }
}
