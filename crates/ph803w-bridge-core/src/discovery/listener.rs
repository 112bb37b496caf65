//! Discovery collaborator contract.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::coordinator::Message;
use crate::error::DiscoveryError;
use crate::types::Candidate;

/// Source of "device seen" notifications.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    /// Start discovering; notifications go to `events` until [`stop`](Self::stop).
    async fn discover(&self, events: DiscoveryEvents) -> Result<(), DiscoveryError>;

    async fn stop(&self) -> Result<(), DiscoveryError>;
}

/// Forwards discovery notifications to the registry as admission candidates.
#[derive(Debug, Clone)]
pub struct DiscoveryEvents {
    tx: mpsc::UnboundedSender<Message>,
}

impl DiscoveryEvents {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { tx }
    }

    /// A device answered at `ip`, with or without an id.
    pub fn device(&self, ip: impl Into<String>, id: Option<String>) {
        let _ = self
            .tx
            .send(Message::Candidate(Candidate::discovered(ip, id)));
    }

    pub fn error(&self, reason: impl Into<String>) {
        let _ = self.tx.send(Message::DiscoveryError(reason.into()));
    }

    /// False once the bridge has stopped listening.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}
