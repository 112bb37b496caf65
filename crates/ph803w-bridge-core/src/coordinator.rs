//! Connection lifecycle coordinator.
//!
//! A single task owns the [`Registry`]. Discovery notifications, session
//! events and completed requests all arrive as [`Message`]s on one inbox and
//! are applied one at a time, so registry mutations never interleave.
//! Session requests run on spawned tasks and report back through the inbox.

use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::{BridgeConfig, MissingIdPolicy};
use crate::error::SessionError;
use crate::lifecycle::{Effect, LifecycleInput};
use crate::publisher::StatePublisher;
use crate::registry::{DeviceConnection, Registry};
use crate::session::{DeviceSession, SessionEvent, SessionEvents, SessionFactory};
use crate::storage::KnownDeviceStore;
use crate::types::{
    AdmitDecision, Candidate, ConnectionId, ConnectionState, DeviceIdentity, FleetStatus,
    IgnoreReason, ShutdownReport,
};

/// Request whose failure (or success) is reported back to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Connect,
    /// Login followed by the initial data retrieval
    Login { attempt: u64 },
}

#[derive(Debug)]
pub(crate) enum Message {
    Candidate(Candidate),
    DiscoveryError(String),
    Session {
        conn: ConnectionId,
        event: SessionEvent,
    },
    Completed {
        conn: ConnectionId,
        step: Step,
        result: Result<(), SessionError>,
    },
    Status(oneshot::Sender<FleetStatus>),
    Shutdown(oneshot::Sender<ShutdownReport>),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct CoordinatorSettings {
    pub missing_id: MissingIdPolicy,
    pub shutdown_timeout: Duration,
}

impl From<&BridgeConfig> for CoordinatorSettings {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            missing_id: config.missing_id,
            shutdown_timeout: config.shutdown_timeout(),
        }
    }
}

pub(crate) struct Coordinator {
    registry: Registry,
    sessions: Arc<dyn SessionFactory>,
    publisher: Arc<dyn StatePublisher>,
    known: Option<Arc<KnownDeviceStore>>,
    tx: mpsc::UnboundedSender<Message>,
    settings: CoordinatorSettings,
    /// Last fleet connectivity handed to the publisher
    fleet_connected: Option<bool>,
}

impl Coordinator {
    pub fn new(
        settings: CoordinatorSettings,
        sessions: Arc<dyn SessionFactory>,
        publisher: Arc<dyn StatePublisher>,
        known: Option<Arc<KnownDeviceStore>>,
        tx: mpsc::UnboundedSender<Message>,
    ) -> Self {
        Self {
            registry: Registry::new(),
            sessions,
            publisher,
            known,
            tx,
            settings,
            fleet_connected: None,
        }
    }

    /// Process the inbox until shutdown.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Message>) {
        self.refresh_fleet();

        while let Some(message) = rx.recv().await {
            if self.handle(message).await.is_break() {
                break;
            }
        }

        debug!("PH803W coordinator stopped");
    }

    pub async fn handle(&mut self, message: Message) -> ControlFlow<()> {
        match message {
            Message::Candidate(candidate) => {
                self.admit(candidate);
            }
            Message::DiscoveryError(reason) => {
                info!("PH803W discovery error: {}", reason);
            }
            Message::Session { conn, event } => self.on_session_event(conn, event),
            Message::Completed { conn, step, result } => self.on_completed(conn, step, result),
            Message::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Message::Shutdown(reply) => {
                let report = self.shutdown().await;
                let _ = reply.send(report);
                return ControlFlow::Break(());
            }
        }

        self.refresh_fleet();
        ControlFlow::Continue(())
    }

    fn admit(&mut self, candidate: Candidate) -> AdmitDecision {
        let policy = self.settings.missing_id;
        let sessions = &self.sessions;
        let tx = &self.tx;
        let admission = self.registry.admit(&candidate, policy, |identity, conn| {
            sessions.open(identity, SessionEvents::new(conn, tx.clone()))
        });

        match &admission.decision {
            AdmitDecision::Admitted => {
                info!(
                    ip = %candidate.ip,
                    origin = ?candidate.origin,
                    "PH803W device {} admitted",
                    candidate.usable_id().unwrap_or("-")
                );
            }
            AdmitDecision::Replaced { old_ip } => {
                info!(
                    old_ip = %old_ip,
                    "PH803W device {} moved to IP {}, replacing connection",
                    candidate.usable_id().unwrap_or("-"),
                    candidate.ip
                );
            }
            AdmitDecision::Ignored(IgnoreReason::KnownAddress) => {
                debug!(ip = %candidate.ip, "PH803W device already known, ignore");
            }
            AdmitDecision::Ignored(IgnoreReason::MissingId) => {
                info!(
                    ip = %candidate.ip,
                    "PH803W device without id discovered, waiting for next notification"
                );
            }
            AdmitDecision::Ignored(IgnoreReason::ActiveElsewhere { ip }) => {
                info!(
                    active_ip = %ip,
                    "PH803W device {} seen on IP {} but still connected elsewhere, ignore",
                    candidate.usable_id().unwrap_or("-"),
                    candidate.ip
                );
            }
        }

        if let Some(old) = admission.evicted {
            self.teardown(old);
        }
        if let Some(conn) = admission.admitted {
            self.start(conn);
        }

        admission.decision
    }

    fn start(&mut self, conn: ConnectionId) {
        let Some(identity) = self.identity_of(conn) else {
            return;
        };

        self.publisher.prepare_device(&identity);
        self.remember(identity);
        self.apply(conn, LifecycleInput::Start);
    }

    fn remember(&self, identity: DeviceIdentity) {
        let Some(store) = self.known.clone() else {
            return;
        };

        tokio::spawn(async move {
            if let Err(e) = store.remember(&identity).await {
                warn!(device_id = %identity.id, error = %e, "Failed to remember PH803W device");
            }
        });
    }

    fn identity_of(&self, conn: ConnectionId) -> Option<DeviceIdentity> {
        self.registry.get(conn).map(|d| d.identity().clone())
    }

    /// Feed `input` to a connection's state machine and run the effects.
    fn apply(&mut self, conn: ConnectionId, input: LifecycleInput) {
        let mut pending = VecDeque::from([input]);

        while let Some(input) = pending.pop_front() {
            let Some(device) = self.registry.get_mut(conn) else {
                debug!(conn = %conn, ?input, "Input for unknown connection dropped");
                return;
            };

            let Some(transition) = device.state.on(input) else {
                debug!(conn = %conn, state = %device.state, ?input, "Input ignored");
                continue;
            };

            device.state = transition.to;
            if transition.effects.contains(&Effect::RequestLogin) {
                device.login_attempt += 1;
            }
            let attempt = device.login_attempt;
            let identity = device.identity().clone();
            let session = device.session();
            debug!(
                device_id = %identity.id,
                ip = %identity.ip,
                from = %transition.from,
                to = %transition.to,
                "State transition"
            );

            if transition.became_active() {
                info!(
                    "PH803W device {} on IP {} connected and logged in",
                    identity.id, identity.ip
                );
                self.publisher.publish_connectivity(&identity.id, true);
            } else if transition.lost_active() {
                self.publisher.publish_connectivity(&identity.id, false);
            }

            for effect in transition.effects {
                if let Some(next) = self.execute(conn, &identity, &session, attempt, effect) {
                    pending.push_back(next);
                }
            }
        }
    }

    /// Start a request; returns the input to apply once it is issued.
    fn execute(
        &self,
        conn: ConnectionId,
        identity: &DeviceIdentity,
        session: &Arc<dyn DeviceSession>,
        attempt: u64,
        effect: Effect,
    ) -> Option<LifecycleInput> {
        let session = Arc::clone(session);
        let tx = self.tx.clone();

        match effect {
            Effect::RequestConnect => {
                tokio::spawn(async move {
                    if let Err(error) = session.connect().await {
                        let _ = tx.send(Message::Completed {
                            conn,
                            step: Step::Connect,
                            result: Err(error),
                        });
                    }
                });
                None
            }
            Effect::RequestLogin => {
                info!(
                    "Connected to PH803W device {} on IP {}, logging in",
                    identity.id, identity.ip
                );
                tokio::spawn(async move {
                    let result = login_and_retrieve(session.as_ref()).await;
                    let _ = tx.send(Message::Completed {
                        conn,
                        step: Step::Login { attempt },
                        result,
                    });
                });
                Some(LifecycleInput::LoginIssued)
            }
            Effect::ForceClose => {
                let ip = identity.ip.clone();
                tokio::spawn(async move {
                    if let Err(e) = session.close(true).await {
                        debug!(ip = %ip, error = %e, "Forced close failed");
                    }
                });
                None
            }
            Effect::Destroy => {
                let identity = identity.clone();
                tokio::spawn(async move {
                    if let Err(e) = session.destroy().await {
                        debug!(device_id = %identity.id, ip = %identity.ip, error = %e, "Destroy failed");
                    }
                });
                None
            }
        }
    }

    /// Close a connection that has already left the registry.
    fn teardown(&self, mut device: DeviceConnection) {
        info!(
            "Closing PH803W device {} on IP {}",
            device.identity().id,
            device.identity().ip
        );

        let Some(transition) = device.state.on(LifecycleInput::ShutdownRequested) else {
            return;
        };
        device.state = transition.to;

        if transition.lost_active() {
            self.publisher.publish_connectivity(&device.identity().id, false);
        }

        let session = device.session();
        for effect in transition.effects {
            self.execute(
                device.connection(),
                device.identity(),
                &session,
                device.login_attempt,
                effect,
            );
        }
    }

    fn on_session_event(&mut self, conn: ConnectionId, event: SessionEvent) {
        match event {
            SessionEvent::Connected => self.apply(conn, LifecycleInput::TransportConnected),
            SessionEvent::Disconnected => {
                if let Some(identity) = self.identity_of(conn) {
                    info!(
                        "Disconnected from PH803W device {} on IP {}",
                        identity.id, identity.ip
                    );
                }
                self.apply(conn, LifecycleInput::TransportLost);
            }
            SessionEvent::Error(reason) => match self.identity_of(conn) {
                Some(identity) => {
                    error!("PH803W device {} on IP {} error: {}", identity.id, identity.ip, reason)
                }
                None => debug!(conn = %conn, "Error from closed connection: {}", reason),
            },
            SessionEvent::Data(snapshot) => {
                let Some(device) = self.registry.get_mut(conn) else {
                    debug!(conn = %conn, "Data from closed connection dropped");
                    return;
                };
                device.snapshot = Some(snapshot);
                let device_id = device.identity().id.clone();

                debug!(device_id = %device_id, ?snapshot, "PH803W data received");
                self.publisher.publish_snapshot(&device_id, &snapshot);
            }
        }
    }

    fn on_completed(&mut self, conn: ConnectionId, step: Step, result: Result<(), SessionError>) {
        let input = match (step, result) {
            (Step::Connect, Ok(())) => return,
            (Step::Connect, Err(e)) => {
                warn!(conn = %conn, error = %e, "Connecting to PH803W device failed");
                LifecycleInput::ConnectFailed
            }
            (Step::Login { attempt }, _) if !self.is_current_login(conn, attempt) => {
                debug!(conn = %conn, attempt, "Stale login result dropped");
                return;
            }
            (Step::Login { .. }, Ok(())) => LifecycleInput::SessionReady,
            (Step::Login { .. }, Err(e)) => {
                if let Some(identity) = self.identity_of(conn) {
                    info!(
                        "Connection process for PH803W device {} on IP {} was not successful: {}",
                        identity.id, identity.ip, e
                    );
                }
                LifecycleInput::SessionFailed
            }
        };

        self.apply(conn, input);
    }

    fn is_current_login(&self, conn: ConnectionId, attempt: u64) -> bool {
        self.registry
            .get(conn)
            .is_some_and(|d| d.login_attempt == attempt)
    }

    /// Publish fleet connectivity when it changed.
    fn refresh_fleet(&mut self) {
        let connected = self.registry.fleet_connected();
        if self.fleet_connected == Some(connected) {
            return;
        }

        self.fleet_connected = Some(connected);
        debug!(
            connected,
            admitted = self.registry.len(),
            active = self.registry.active_count(),
            "Fleet connectivity changed"
        );
        self.publisher.publish_fleet_connectivity(connected);
    }

    fn status(&self) -> FleetStatus {
        FleetStatus {
            admitted: self.registry.len(),
            active: self.registry.active_count(),
            connected: self.registry.fleet_connected(),
            devices: self.registry.statuses(),
        }
    }

    /// Destroy every session and wait for each (bounded by the timeout).
    async fn shutdown(&mut self) -> ShutdownReport {
        let devices = self.registry.drain();
        let requested = devices.len();
        let limit = self.settings.shutdown_timeout;

        let mut destroys = Vec::with_capacity(requested);
        for mut device in devices {
            if device.state.is_active() {
                self.publisher.publish_connectivity(&device.identity().id, false);
            }
            device.state = ConnectionState::Closing;

            let identity = device.identity().clone();
            let session = device.session();
            destroys.push(async move {
                match timeout(limit, session.destroy()).await {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        debug!(device_id = %identity.id, error = %e, "Destroy failed");
                        false
                    }
                    Err(_) => {
                        debug!(device_id = %identity.id, "Destroy timed out");
                        false
                    }
                }
            });
        }

        let failed = join_all(destroys).await.into_iter().filter(|ok| !ok).count();
        self.refresh_fleet();

        info!(requested, failed, "PH803W bridge shut down");
        ShutdownReport { requested, failed }
    }
}

async fn login_and_retrieve(session: &dyn DeviceSession) -> Result<(), SessionError> {
    session.login().await?;
    session.retrieve_data().await
}
