//! The node's event loop.
//!
//! [`HeartbeatService`] owns the coordinator, the cell registry and the
//! coherence estimator, and is the only task that touches them. Everything
//! else (timer, peer channel, dispatcher tasks, admin connections) talks to
//! it over channels.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use lifeline_cells::{GroupId, GroupRegistry};
use lifeline_coherence::CoherenceEstimator;
use lifeline_heartbeat::{
    CoordinatorEvents, DispatchOutcome, EscalationConfig, EscalationDispatcher, EscalationPayload,
    EscalationRequest, HeartbeatCoordinator, WebhookClient,
};
use lifeline_mesh::{ConnectionCode, EventReceiver, MemoryChannel, PeerChannel, TcpPeerChannel};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::admin_socket::{AdminCommand, AdminRequest, AdminResponse};
use crate::error::{Error, Result};
use crate::storage::SnapshotStore;

/// Channels that can learn where a peer lives.
pub trait RouteTable {
    fn add_route(&self, peer_id: &str, addr: SocketAddr);

    /// Our own connection code, when the channel has an address to share.
    fn connection_code(&self) -> Option<ConnectionCode>;
}

impl RouteTable for TcpPeerChannel {
    fn add_route(&self, peer_id: &str, addr: SocketAddr) {
        TcpPeerChannel::add_route(self, peer_id, addr);
    }

    fn connection_code(&self) -> Option<ConnectionCode> {
        Some(TcpPeerChannel::connection_code(self))
    }
}

impl RouteTable for MemoryChannel {
    fn add_route(&self, _peer_id: &str, _addr: SocketAddr) {}

    fn connection_code(&self) -> Option<ConnectionCode> {
        None
    }
}

/// Cell and coherence state that lives next to the coordinator.
#[derive(Debug, Default)]
pub struct NodeContext {
    pub registry: GroupRegistry,
    pub estimator: CoherenceEstimator,
}

pub struct HeartbeatService<C, W> {
    coordinator: HeartbeatCoordinator<C>,
    events: CoordinatorEvents,
    channel_events: EventReceiver,
    dispatcher: Arc<EscalationDispatcher<W>>,
    outcomes_tx: mpsc::UnboundedSender<(EscalationPayload, DispatchOutcome)>,
    outcomes_rx: mpsc::UnboundedReceiver<(EscalationPayload, DispatchOutcome)>,
    admin: mpsc::Receiver<AdminRequest>,
    store: SnapshotStore,
    context: NodeContext,
    snapshot_interval: Duration,
}

impl<C, W> HeartbeatService<C, W>
where
    C: PeerChannel + RouteTable,
    W: WebhookClient,
{
    pub fn new(
        (coordinator, events): (HeartbeatCoordinator<C>, CoordinatorEvents),
        channel_events: EventReceiver,
        dispatcher: EscalationDispatcher<W>,
        admin: mpsc::Receiver<AdminRequest>,
        store: SnapshotStore,
        snapshot_interval: Duration,
    ) -> Self {
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        Self {
            coordinator,
            events,
            channel_events,
            dispatcher: Arc::new(dispatcher),
            outcomes_tx,
            outcomes_rx,
            admin,
            store,
            context: NodeContext::default(),
            snapshot_interval,
        }
    }

    /// Restore the stored snapshot, start the countdown and dial `peers`.
    pub fn bootstrap(&mut self, peers: &[ConnectionCode]) {
        match self.store.load() {
            Some(snapshot) => self.coordinator.restore(snapshot),
            None => info!(path = %self.store.path().display(), "no snapshot, starting fresh"),
        }
        self.coordinator.start();

        for peer in peers {
            self.coordinator.channel().add_route(&peer.peer_id, peer.addr);
            self.coordinator.add_peer(&peer.peer_id, &peer.peer_id);
        }
    }

    pub fn coordinator(&self) -> &HeartbeatCoordinator<C> {
        &self.coordinator
    }

    pub fn context(&self) -> &NodeContext {
        &self.context
    }

    /// Run until `shutdown` resolves, then write a final snapshot.
    pub async fn run<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let mut group_tick = interval(self.coordinator.config().group_heartbeat_period);
        group_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut snapshot_tick = interval(self.snapshot_interval);
        snapshot_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(peer_id = %self.coordinator.local_id(), "heartbeat service running");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }

                Some(event) = self.events.timer.recv() => {
                    self.coordinator.on_timer_event(event);
                }

                Some(event) = self.channel_events.recv() => {
                    self.coordinator.on_channel_event(event, &self.context.registry);
                }

                Some(request) = self.events.escalations.recv() => {
                    self.dispatch(request);
                }

                Some((payload, outcome)) = self.outcomes_rx.recv() => {
                    self.coordinator.record_escalation_outcome(&payload, outcome);
                }

                Some((command, reply)) = self.admin.recv() => {
                    let response = self.execute(command);
                    if reply.send(response).is_err() {
                        debug!("admin client went away before the reply");
                    }
                }

                _ = group_tick.tick() => {
                    self.emit_group_heartbeats();
                }

                _ = snapshot_tick.tick() => {
                    if self.coordinator.take_dirty() {
                        self.flush();
                    }
                }
            }
        }

        self.flush();
        Ok(())
    }

    fn dispatch(&self, request: EscalationRequest) {
        let dispatcher = Arc::clone(&self.dispatcher);
        let outcomes = self.outcomes_tx.clone();
        tokio::spawn(async move {
            let outcome = dispatcher.trigger(&request.config, &request.payload).await;
            if outcomes.send((request.payload, outcome)).is_err() {
                warn!("service stopped before the escalation outcome arrived");
            }
        });
    }

    fn emit_group_heartbeats(&mut self) {
        match self
            .coordinator
            .emit_group_heartbeats(&mut self.context.registry, &self.context.estimator)
        {
            Ok(0) => {}
            Ok(sent) => debug!(sent, "cell heartbeats sent"),
            Err(e) => warn!(error = %e, "cell heartbeat failed"),
        }
    }

    fn flush(&self) {
        if let Err(e) = self.store.save(&self.coordinator.snapshot()) {
            error!(path = %self.store.path().display(), error = %e, "snapshot write failed");
        }
    }

    /// Apply one admin command.
    pub fn execute(&mut self, command: AdminCommand) -> AdminResponse {
        match self.try_execute(command) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "admin command failed");
                AdminResponse::error(e)
            }
        }
    }

    fn try_execute(&mut self, command: AdminCommand) -> Result<AdminResponse> {
        let response = match command {
            AdminCommand::CheckIn { note } => {
                self.coordinator.check_in(note);
                AdminResponse::ok("Checked in")
            }

            AdminCommand::SetStatus { status, note } => {
                self.coordinator.set_status(status, note);
                AdminResponse::ok(format!("Status set to {}", status))
            }

            AdminCommand::SetInterval { interval } => {
                self.coordinator.set_check_in_interval(&interval)?;
                AdminResponse::ok(format!("Check-in interval set to {}", interval))
            }

            AdminCommand::ResetDeadMan => {
                self.coordinator.reset_dead_man();
                AdminResponse::ok("Dead man's switch reset")
            }

            AdminCommand::AddPeer {
                peer_id,
                name,
                addr,
                code,
            } => {
                let peer_id = self.add_peer(peer_id, name, addr, code)?;
                AdminResponse::ok(format!("Connecting to {}", peer_id))
            }

            AdminCommand::RemovePeer { peer_id } => {
                if !self.coordinator.remove_peer(&peer_id) {
                    return Err(Error::InvalidCommand(format!("unknown peer {}", peer_id)));
                }
                AdminResponse::ok(format!("Removed peer {}", peer_id))
            }

            AdminCommand::RegisterGroup { members } => {
                let group = self.context.registry.register(&members)?;
                info!(cell = group.id.short(), "registered cell");
                AdminResponse::data(&group)
            }

            AdminCommand::SetGroupActive { group_id, active } => {
                let id = GroupId::from_hex(group_id);
                self.context.registry.set_active(&id, active)?;
                AdminResponse::ok(format!(
                    "Cell {} {}",
                    id.short(),
                    if active { "activated" } else { "deactivated" }
                ))
            }

            AdminCommand::ListGroups => AdminResponse::data(&self.context.registry.groups()),

            AdminCommand::ValidateTopology => {
                let report = self.context.registry.validate_topology();
                for violation in &report.violations {
                    warn!("{}", violation);
                }
                AdminResponse::data(&report)
            }

            AdminCommand::AddSample { x, y, z } => {
                self.context.estimator.add_sample(x, y, z);
                AdminResponse::data(&self.coherence())
            }

            AdminCommand::Coherence => AdminResponse::data(&self.coherence()),

            AdminCommand::DailyCheckIn { answers } => {
                let record = self
                    .coordinator
                    .submit_daily_check_in(&answers, &chrono::Local::now())?;
                AdminResponse::data(&record)
            }

            AdminCommand::DailySummary => {
                AdminResponse::data(&self.coordinator.daily_history().summary())
            }

            AdminCommand::SetEscalation {
                enabled,
                webhook_url,
                include_location,
            } => {
                self.coordinator.set_escalation_config(EscalationConfig {
                    enabled,
                    webhook_url,
                    include_location,
                });
                AdminResponse::ok(if enabled {
                    "Escalation enabled"
                } else {
                    "Escalation disabled"
                })
            }

            AdminCommand::ExportLog => AdminResponse::ok(self.coordinator.export_log()?),

            AdminCommand::ExportDaily => {
                AdminResponse::ok(self.coordinator.export_daily_history()?)
            }

            AdminCommand::ConnectionCode => match self.coordinator.channel().connection_code() {
                Some(code) => AdminResponse::data(&json!({
                    "code": code.encode(),
                    "route": code.route(),
                })),
                None => AdminResponse::error("this channel has no shareable address"),
            },

            AdminCommand::State => AdminResponse::data(&self.coordinator.view()),

            AdminCommand::Ping => AdminResponse::Pong,
        };
        Ok(response)
    }

    fn add_peer(
        &mut self,
        peer_id: Option<String>,
        name: Option<String>,
        addr: Option<String>,
        code: Option<String>,
    ) -> Result<String> {
        let (peer_id, addr) = match (code, peer_id) {
            (Some(code), _) => {
                let code = ConnectionCode::decode(&code)?;
                (code.peer_id, Some(code.addr))
            }
            (None, Some(peer_id)) => {
                let addr = addr
                    .map(|a| {
                        a.parse::<SocketAddr>()
                            .map_err(|e| Error::InvalidCommand(format!("bad address {:?}: {}", a, e)))
                    })
                    .transpose()?;
                (peer_id, addr)
            }
            (None, None) => {
                return Err(Error::InvalidCommand(
                    "add_peer needs a peer_id or a code".into(),
                ))
            }
        };

        if let Some(addr) = addr {
            self.coordinator.channel().add_route(&peer_id, addr);
        }
        let name = name.unwrap_or_else(|| peer_id.clone());
        self.coordinator.add_peer(&peer_id, &name);
        Ok(peer_id)
    }

    fn coherence(&self) -> serde_json::Value {
        let estimator = &self.context.estimator;
        json!({
            "score": estimator.score(),
            "regime": estimator.regime(),
            "samples": estimator.window().len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lifeline_heartbeat::{
        DispatchError, HeartbeatConfig, LogNotifier, RetryPolicy, Snapshot,
    };
    use lifeline_mesh::{LoopbackHub, Status};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct RecordingWebhook {
        posts: Arc<Mutex<Vec<EscalationPayload>>>,
    }

    impl WebhookClient for RecordingWebhook {
        async fn post(&self, _url: &str, payload: &EscalationPayload) -> std::result::Result<(), DispatchError> {
            self.posts.lock().unwrap().push(payload.clone());
            Ok(())
        }
    }

    fn service(
        hub: &LoopbackHub,
        dir: &TempDir,
        webhook: RecordingWebhook,
    ) -> (HeartbeatService<MemoryChannel, RecordingWebhook>, mpsc::Sender<AdminRequest>) {
        let (channel, channel_events) = hub.join("me", "Me");
        let coordinator = HeartbeatCoordinator::new(
            HeartbeatConfig::default().with_user_name("Me"),
            channel,
            Box::new(LogNotifier::new()),
        );
        let (admin_tx, admin_rx) = mpsc::channel(8);
        let service = HeartbeatService::new(
            coordinator,
            channel_events,
            EscalationDispatcher::new(webhook, RetryPolicy::default()),
            admin_rx,
            SnapshotStore::open(dir.path()).unwrap(),
            Duration::from_secs(5),
        );
        (service, admin_tx)
    }

    async fn ask(admin: &mpsc::Sender<AdminRequest>, command: AdminCommand) -> AdminResponse {
        let (reply, response) = tokio::sync::oneshot::channel();
        admin.send((command, reply)).await.unwrap();
        response.await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn admin_commands_drive_the_coordinator() {
        let hub = LoopbackHub::new();
        let (_friend, _friend_rx) = hub.join("friend", "Friend");
        let dir = TempDir::new().unwrap();
        let (mut service, admin) = service(&hub, &dir, RecordingWebhook::default());

        assert_eq!(service.execute(AdminCommand::Ping), AdminResponse::Pong);
        assert!(matches!(
            service.execute(AdminCommand::SetStatus { status: Status::Yellow, note: None }),
            AdminResponse::Ok { .. }
        ));
        assert_eq!(service.coordinator().status(), Status::Yellow);

        assert!(matches!(
            service.execute(AdminCommand::SetInterval { interval: "5min".into() }),
            AdminResponse::Error { .. }
        ));
        assert!(matches!(
            service.execute(AdminCommand::AddPeer {
                peer_id: Some("friend".into()),
                name: None,
                addr: None,
                code: None,
            }),
            AdminResponse::Ok { .. }
        ));
        assert!(service.coordinator().channel().connected_peers().contains(&"friend".to_string()));
        assert!(matches!(
            service.execute(AdminCommand::AddPeer { peer_id: None, name: None, addr: None, code: None }),
            AdminResponse::Error { .. }
        ));
        assert!(matches!(
            service.execute(AdminCommand::ConnectionCode),
            AdminResponse::Error { .. }
        ));
        drop(admin);
    }

    #[tokio::test(start_paused = true)]
    async fn cells_and_coherence_over_admin() {
        let hub = LoopbackHub::new();
        let dir = TempDir::new().unwrap();
        let (mut service, _admin) = service(&hub, &dir, RecordingWebhook::default());

        let members: Vec<String> = ["me", "b", "c", "d"].map(String::from).to_vec();
        let AdminResponse::Data { data } = service.execute(AdminCommand::RegisterGroup { members: members.clone() }) else {
            panic!("expected cell data");
        };
        let group_id = data["id"].as_str().unwrap().to_string();

        assert!(matches!(
            service.execute(AdminCommand::RegisterGroup { members }),
            AdminResponse::Error { .. }
        ));

        service.execute(AdminCommand::RegisterGroup {
            members: ["me", "e", "f", "g"].map(String::from).to_vec(),
        });
        let AdminResponse::Data { data } = service.execute(AdminCommand::ValidateTopology) else {
            panic!("expected report");
        };
        assert_eq!(data["violations"][0]["peerId"], "me");

        assert!(matches!(
            service.execute(AdminCommand::SetGroupActive { group_id, active: false }),
            AdminResponse::Ok { .. }
        ));
        assert_eq!(service.context().registry.active_groups().len(), 1);

        let AdminResponse::Data { data } = service.execute(AdminCommand::AddSample { x: 0.0, y: 0.0, z: 9.81 }) else {
            panic!("expected coherence");
        };
        assert_eq!(data["samples"], 1);
        assert_eq!(data["regime"], "calibrating");
        assert_eq!(data["score"], 50.0);
    }

    #[tokio::test(start_paused = true)]
    async fn bootstrap_restores_snapshot() {
        let hub = LoopbackHub::new();
        let dir = TempDir::new().unwrap();
        SnapshotStore::open(dir.path())
            .unwrap()
            .save(&Snapshot {
                current_status: Status::Orange,
                check_in_interval: "4hr".into(),
                ..Snapshot::default()
            })
            .unwrap();

        let (mut service, _admin) = service(&hub, &dir, RecordingWebhook::default());
        service.bootstrap(&[]);
        assert_eq!(service.coordinator().status(), Status::Orange);
        assert_eq!(service.coordinator().interval().id, "4hr");
        assert!(service.coordinator().is_dead_man_active());
    }

    #[tokio::test(start_paused = true)]
    async fn loop_escalates_and_flushes_on_shutdown() {
        let hub = LoopbackHub::new();
        let dir = TempDir::new().unwrap();
        let webhook = RecordingWebhook::default();
        let (mut service, admin) = service(&hub, &dir, webhook.clone());
        service.bootstrap(&[]);

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let running = tokio::spawn(service.run(async {
            let _ = stop_rx.await;
        }));

        ask(&admin, AdminCommand::SetEscalation {
            enabled: true,
            webhook_url: Some("https://example.invalid/hook".into()),
            include_location: false,
        })
        .await;
        ask(&admin, AdminCommand::SetInterval { interval: "15min".into() }).await;

        // Three windows pass without a check-in.
        tokio::time::sleep(Duration::from_secs(3 * 15 * 60 + 5)).await;

        let AdminResponse::Data { data } = ask(&admin, AdminCommand::State).await else {
            panic!("expected state");
        };
        assert_eq!(data["missedCheckIns"], 3);
        assert_eq!(data["lastEscalation"]["outcome"]["outcome"], "delivered");
        assert_eq!(webhook.posts.lock().unwrap().len(), 1);

        stop_tx.send(()).unwrap();
        running.await.unwrap().unwrap();

        let stored = SnapshotStore::open(dir.path()).unwrap().load().unwrap();
        assert_eq!(stored.check_in_interval, "15min");
        assert!(stored.escalation_config.enabled);
    }
}
