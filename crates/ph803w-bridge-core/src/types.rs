//! Type definitions shared across the bridge.
//!
//! Identities, readings and connection states are plain records so they can
//! cross the collaborator boundaries (sessions, publishers, storage) as-is.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical identity of a PH803W device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    /// Stable device identifier (from discovery or persisted config)
    pub id: String,
    /// Current network address; may change between discovery events
    pub ip: String,
}

impl DeviceIdentity {
    pub fn new(id: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ip: ip.into(),
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.ip)
    }
}

/// Where an admission candidate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateOrigin {
    /// Broadcast discovery reply
    Discovery,
    /// Persisted identity loaded at startup
    Startup,
    /// Injected by the host
    Manual,
}

/// A device offered to the registry for admission.
///
/// The id is optional because discovery replies do not always carry one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: Option<String>,
    pub ip: String,
    pub origin: CandidateOrigin,
}

impl Candidate {
    pub fn discovered(ip: impl Into<String>, id: Option<String>) -> Self {
        Self {
            id,
            ip: ip.into(),
            origin: CandidateOrigin::Discovery,
        }
    }

    pub fn known(identity: DeviceIdentity) -> Self {
        Self {
            id: Some(identity.id),
            ip: identity.ip,
            origin: CandidateOrigin::Startup,
        }
    }

    /// The candidate id, treating blank strings as missing.
    pub fn usable_id(&self) -> Option<&str> {
        self.id.as_deref().map(str::trim).filter(|id| !id.is_empty())
    }
}

/// One full reading reported by a device.
///
/// Always replaced as a whole, never merged field by field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorSnapshot {
    /// pH value
    pub ph: f64,
    /// Whether the pH relay outlet is switched on
    pub ph_outlet: bool,
    /// Redox (ORP) value in mV
    pub redox: f64,
    /// Whether the redox relay outlet is switched on
    pub redox_outlet: bool,
}

/// Connection state of one admitted device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    LoggingIn,
    Active,
    Closing,
}

impl ConnectionState {
    pub fn is_active(self) -> bool {
        self == ConnectionState::Active
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::LoggingIn => "logging_in",
            ConnectionState::Active => "active",
            ConnectionState::Closing => "closing",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serial number of a connection slot.
///
/// A fresh one is handed out on every admission so that events of a torn
/// down session can never be attributed to its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Outcome of an admission request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitDecision {
    /// A new connection was created for the candidate
    Admitted,
    /// Nothing changed
    Ignored(IgnoreReason),
    /// A stale connection for the same id was torn down in favour of the candidate
    Replaced { old_ip: String },
}

/// Why a candidate was not admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The address already has a connection
    KnownAddress,
    /// The notification carried no id
    MissingId,
    /// The id is served by an active session on another address
    ActiveElsewhere { ip: String },
}

/// Per-device entry of a [`FleetStatus`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub identity: DeviceIdentity,
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SensorSnapshot>,
}

/// Point-in-time view of the whole fleet.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetStatus {
    pub admitted: usize,
    pub active: usize,
    pub connected: bool,
    pub devices: Vec<DeviceStatus>,
}

/// Result of a shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownReport {
    /// Destroy requests issued (one per admitted device)
    pub requested: usize,
    /// Destroy requests that failed or timed out
    pub failed: usize,
}
