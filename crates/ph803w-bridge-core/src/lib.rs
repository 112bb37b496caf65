//! PH803W bridge core.
//!
//! Keeps a fleet of PH803W pool monitors connected: discovered devices are
//! admitted into a registry keyed by address, each one is driven through
//! connect/login/retrieve by a single coordinator task, and readings and
//! connectivity are handed to a [`StatePublisher`].
//!
//! The device protocol itself is not part of this crate; hosts plug it in
//! through [`SessionFactory`] and, for discovery payloads, [`ReplyDecoder`].

pub mod config;
pub mod discovery;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod publisher;
pub mod registry;
pub mod service;
pub mod session;
pub mod storage;
pub mod types;

mod coordinator;

#[cfg(test)]
mod testing;

pub use config::{BridgeConfig, DiscoveryConfig, MissingIdPolicy};
pub use discovery::{DiscoveryEvents, DiscoverySource, ReplyDecoder, UdpDiscovery};
pub use error::{CoreError, Result};
pub use publisher::{ObjectTree, StatePublisher};
pub use service::{Bridge, BridgeHandle};
pub use session::{DeviceSession, SessionEvent, SessionEvents, SessionFactory};
pub use storage::KnownDeviceStore;
pub use types::{
    AdmitDecision, ConnectionState, DeviceIdentity, FleetStatus, SensorSnapshot, ShutdownReport,
};
