//! Device session collaborator contract.
//!
//! The PH803W wire protocol (framing, login handshake, data decoding) lives
//! in a device library. The bridge only drives it through [`DeviceSession`]
//! and listens to what it reports through [`SessionEvents`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::coordinator::Message;
use crate::error::SessionError;
use crate::types::{ConnectionId, DeviceIdentity, SensorSnapshot};

/// Asynchronous notification emitted by a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Transport is up
    Connected,
    /// Transport went down
    Disconnected,
    /// Protocol or transport problem; informational
    Error(String),
    /// A complete reading
    Data(SensorSnapshot),
}

/// Protocol session with one device.
///
/// Requests complete asynchronously; their side effects (transport up,
/// readings) are reported through the [`SessionEvents`] handed to
/// [`SessionFactory::open`].
#[async_trait]
pub trait DeviceSession: Send + Sync {
    /// Open the transport. Success is reported later as a `connected` event.
    async fn connect(&self) -> Result<(), SessionError>;

    async fn login(&self) -> Result<(), SessionError>;

    /// Request a reading; the values arrive as a `data` event.
    async fn retrieve_data(&self) -> Result<(), SessionError>;

    async fn close(&self, force: bool) -> Result<(), SessionError>;

    /// Close the transport for good and release every resource.
    async fn destroy(&self) -> Result<(), SessionError>;
}

/// Creates one session per admitted device.
pub trait SessionFactory: Send + Sync {
    fn open(&self, identity: &DeviceIdentity, events: SessionEvents) -> Arc<dyn DeviceSession>;
}

/// Event sink tied to a single connection slot.
#[derive(Debug, Clone)]
pub struct SessionEvents {
    conn: ConnectionId,
    tx: mpsc::UnboundedSender<Message>,
}

impl SessionEvents {
    pub(crate) fn new(conn: ConnectionId, tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { conn, tx }
    }

    pub fn connection(&self) -> ConnectionId {
        self.conn
    }

    pub fn connected(&self) {
        self.emit(SessionEvent::Connected);
    }

    pub fn disconnected(&self) {
        self.emit(SessionEvent::Disconnected);
    }

    pub fn error(&self, reason: impl Into<String>) {
        self.emit(SessionEvent::Error(reason.into()));
    }

    pub fn data(&self, snapshot: SensorSnapshot) {
        self.emit(SessionEvent::Data(snapshot));
    }

    /// Deliver an event; dropped silently once the bridge has stopped.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.tx.send(Message::Session {
            conn: self.conn,
            event,
        });
    }
}
