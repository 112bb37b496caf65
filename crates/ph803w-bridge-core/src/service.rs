//! Bridge startup and host-facing handle.
//!
//! [`Bridge::start`] wires the collaborators to a coordinator task: known
//! devices are admitted first, then discovery is started. The returned
//! [`BridgeHandle`] is the only way to talk to the running bridge.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::coordinator::{Coordinator, CoordinatorSettings, Message};
use crate::discovery::{DiscoveryEvents, DiscoverySource};
use crate::error::{CoreError, Result};
use crate::publisher::StatePublisher;
use crate::session::SessionFactory;
use crate::storage::KnownDeviceStore;
use crate::types::{Candidate, CandidateOrigin, FleetStatus, ShutdownReport};

/// Collaborators of a bridge that has not been started yet.
pub struct Bridge {
    config: BridgeConfig,
    sessions: Arc<dyn SessionFactory>,
    publisher: Arc<dyn StatePublisher>,
    discovery: Option<Arc<dyn DiscoverySource>>,
    known: Option<Arc<KnownDeviceStore>>,
}

impl Bridge {
    pub fn new(
        config: BridgeConfig,
        sessions: Arc<dyn SessionFactory>,
        publisher: Arc<dyn StatePublisher>,
    ) -> Self {
        Self {
            config,
            sessions,
            publisher,
            discovery: None,
            known: None,
        }
    }

    /// Discovery source; only started when `discovery.enabled` is set.
    pub fn with_discovery(mut self, discovery: Arc<dyn DiscoverySource>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Remember admitted devices and admit them again on the next start.
    pub fn with_known_devices(mut self, store: Arc<KnownDeviceStore>) -> Self {
        self.known = Some(store);
        self
    }

    /// Start the coordinator task. Must be called inside a tokio runtime.
    pub async fn start(self) -> Result<BridgeHandle> {
        self.config.validate()?;

        let (tx, rx) = mpsc::unbounded_channel();

        if let Some(store) = &self.known {
            match store.load().await {
                Ok(identities) => {
                    debug!("Init {} known PH803W devices without discovery", identities.len());
                    for identity in identities {
                        let _ = tx.send(Message::Candidate(Candidate::known(identity)));
                    }
                }
                Err(e) => warn!(error = %e, "Failed to load known PH803W devices"),
            }
        }

        let coordinator = Coordinator::new(
            CoordinatorSettings::from(&self.config),
            self.sessions,
            self.publisher,
            self.known,
            tx.clone(),
        );
        let task = tokio::spawn(coordinator.run(rx));

        let discovery = self.discovery.filter(|_| self.config.discovery.enabled);
        if let Some(source) = &discovery {
            // The bridge keeps serving known devices without discovery
            if let Err(e) = source.discover(DiscoveryEvents::new(tx.clone())).await {
                info!("PH803W discovery error: {}", e);
            }
        }

        info!("PH803W bridge started");

        Ok(BridgeHandle {
            tx,
            task,
            discovery,
            stop_timeout: self.config.shutdown_timeout(),
        })
    }
}

/// Handle to a running bridge.
pub struct BridgeHandle {
    tx: mpsc::UnboundedSender<Message>,
    task: JoinHandle<()>,
    discovery: Option<Arc<dyn DiscoverySource>>,
    stop_timeout: Duration,
}

impl BridgeHandle {
    /// Offer a device for admission as if it had been discovered.
    pub fn admit(&self, ip: impl Into<String>, id: Option<String>) -> Result<()> {
        let candidate = Candidate {
            id,
            ip: ip.into(),
            origin: CandidateOrigin::Manual,
        };

        self.tx
            .send(Message::Candidate(candidate))
            .map_err(|_| CoreError::NotRunning)
    }

    pub async fn status(&self) -> Result<FleetStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Message::Status(reply))
            .map_err(|_| CoreError::NotRunning)?;
        rx.await.map_err(|_| CoreError::NotRunning)
    }

    /// Stop discovery and destroy every session.
    pub async fn shutdown(self) -> ShutdownReport {
        let (reply, rx) = oneshot::channel();
        let report = match self.tx.send(Message::Shutdown(reply)) {
            Ok(()) => rx.await.unwrap_or_default(),
            Err(_) => ShutdownReport::default(),
        };
        let _ = self.task.await;

        if let Some(source) = self.discovery {
            match timeout(self.stop_timeout, source.stop()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "Stopping discovery failed"),
                Err(_) => debug!("Stopping discovery timed out"),
            }
        }

        report
    }
}
