//! Lifeline Node - wires the components together.
//!
//! Architecture:
//! - One TCP peer channel, handed to the heartbeat coordinator
//! - One service loop that owns all mutable state
//! - Unix admin socket forwarding commands into that loop

use std::future::Future;
use std::time::Duration;

use lifeline_heartbeat::{
    EscalationDispatcher, HeartbeatConfig, HeartbeatCoordinator, LogNotifier, ReqwestWebhook,
    RetryPolicy,
};
use lifeline_mesh::{PeerChannel, TcpChannelConfig, TcpPeerChannel};
use tokio::sync::mpsc;

use crate::admin_socket::AdminSocket;
use crate::config::NodeConfig;
use crate::error::Result;
use crate::service::HeartbeatService;
use crate::storage::SnapshotStore;

/// Per-attempt webhook timeout.
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Queued admin commands before clients wait.
const ADMIN_QUEUE: usize = 32;

/// A Lifeline node instance.
pub struct LifelineNode {
    config: NodeConfig,
    store: SnapshotStore,
}

impl LifelineNode {
    pub async fn new(config: NodeConfig) -> Result<Self> {
        // Ensure data directory exists
        let store = SnapshotStore::open(&config.data_dir)?;
        Ok(Self { config, store })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Run the node until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let stored_id = self.store.load().and_then(|s| s.my_peer_id);
        let peer_id = self.config.peer_id.clone().or(stored_id);

        let mut channel_config =
            TcpChannelConfig::new(self.config.p2p_addr).with_display_name(self.config.user_name.clone());
        if let Some(addr) = self.config.advertise_addr {
            channel_config = channel_config.with_advertise_addr(addr);
        }
        let (channel, channel_events) = TcpPeerChannel::bind(channel_config, peer_id).await?;

        tracing::info!("Lifeline node starting");
        tracing::info!("  Peer: {}", channel.local_id());
        tracing::info!("  P2P: {}", self.config.p2p_addr);
        tracing::info!("  Code: {}", channel.connection_code().encode());
        tracing::info!("  Admin: {:?}", self.config.admin_socket);
        tracing::info!("  Data: {:?}", self.config.data_dir);

        let heartbeat_config = HeartbeatConfig::default().with_user_name(self.config.user_name.clone());
        let coordinator = HeartbeatCoordinator::new(heartbeat_config, channel, Box::new(LogNotifier::new()));
        let dispatcher = EscalationDispatcher::new(ReqwestWebhook::new(WEBHOOK_TIMEOUT)?, RetryPolicy::default());

        // Start admin socket server in background
        let (admin_tx, admin_rx) = mpsc::channel(ADMIN_QUEUE);
        let admin_socket = AdminSocket::new(self.config.admin_socket.clone(), admin_tx);
        let admin_task = tokio::spawn(async move {
            if let Err(e) = admin_socket.run().await {
                tracing::error!("Admin socket error: {}", e);
            }
        });

        let mut service = HeartbeatService::new(
            coordinator,
            channel_events,
            dispatcher,
            admin_rx,
            self.store,
            self.config.snapshot_interval,
        );
        service.bootstrap(&self.config.peers);
        let result = service.run(shutdown).await;

        admin_task.abort();
        let _ = std::fs::remove_file(&self.config.admin_socket);
        tracing::info!("Lifeline node stopped");
        result
    }
}
