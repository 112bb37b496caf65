//! Device registry: identity reconciliation and connection bookkeeping.
//!
//! Keyed by address, at most one connection per ip and at most one per id.
//! Admission rules, in order:
//!
//! 1. address already admitted: ignored
//! 2. no id: ignored, or a synthetic id under [`MissingIdPolicy::Synthesize`]
//! 3. id admitted on another address: a non-active entry is evicted and
//!    replaced, an active one wins and the candidate is ignored
//! 4. otherwise admitted

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::MissingIdPolicy;
use crate::session::DeviceSession;
use crate::types::{
    AdmitDecision, Candidate, ConnectionId, ConnectionState, DeviceIdentity, DeviceStatus,
    IgnoreReason, SensorSnapshot,
};

/// An admitted device and its session.
pub struct DeviceConnection {
    conn: ConnectionId,
    identity: DeviceIdentity,
    pub(crate) state: ConnectionState,
    pub(crate) snapshot: Option<SensorSnapshot>,
    /// Bumped on every login request; older login results are stale
    pub(crate) login_attempt: u64,
    session: Arc<dyn DeviceSession>,
}

impl DeviceConnection {
    pub fn connection(&self) -> ConnectionId {
        self.conn
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn snapshot(&self) -> Option<SensorSnapshot> {
        self.snapshot
    }

    pub fn session(&self) -> Arc<dyn DeviceSession> {
        Arc::clone(&self.session)
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus {
            identity: self.identity.clone(),
            state: self.state,
            snapshot: self.snapshot,
        }
    }
}

impl fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("conn", &self.conn)
            .field("identity", &self.identity)
            .field("state", &self.state)
            .field("snapshot", &self.snapshot)
            .field("login_attempt", &self.login_attempt)
            .finish_non_exhaustive()
    }
}

/// Result of [`Registry::admit`].
#[derive(Debug)]
pub struct Admission {
    pub decision: AdmitDecision,
    /// Slot created for the candidate
    pub admitted: Option<ConnectionId>,
    /// Entry removed to make room; its session still has to be destroyed
    pub evicted: Option<DeviceConnection>,
}

impl Admission {
    fn ignored(reason: IgnoreReason) -> Self {
        Self {
            decision: AdmitDecision::Ignored(reason),
            admitted: None,
            evicted: None,
        }
    }
}

/// Authoritative map from address to connection.
#[derive(Debug, Default)]
pub struct Registry {
    by_ip: HashMap<String, DeviceConnection>,
    ip_of: HashMap<ConnectionId, String>,
    next_conn: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether `candidate` gets a connection slot.
    ///
    /// `open` is called only when a slot is created, with the resolved
    /// identity and the new slot's id.
    pub fn admit<F>(&mut self, candidate: &Candidate, policy: MissingIdPolicy, open: F) -> Admission
    where
        F: FnOnce(&DeviceIdentity, ConnectionId) -> Arc<dyn DeviceSession>,
    {
        if self.by_ip.contains_key(&candidate.ip) {
            return Admission::ignored(IgnoreReason::KnownAddress);
        }

        let id = match (candidate.usable_id(), policy) {
            (Some(id), _) => id.to_string(),
            (None, MissingIdPolicy::Synthesize) => MissingIdPolicy::synthetic_id(&candidate.ip),
            (None, MissingIdPolicy::Ignore) => {
                return Admission::ignored(IgnoreReason::MissingId);
            }
        };

        let mut evicted = None;
        if let Some(existing) = self.by_id(&id) {
            if existing.state.is_active() {
                return Admission::ignored(IgnoreReason::ActiveElsewhere {
                    ip: existing.identity.ip.clone(),
                });
            }
            let conn = existing.conn;
            evicted = self.remove(conn);
        }

        let identity = DeviceIdentity::new(id, candidate.ip.clone());
        let conn = self.allocate();
        let session = open(&identity, conn);
        self.insert(DeviceConnection {
            conn,
            identity,
            state: ConnectionState::Disconnected,
            snapshot: None,
            login_attempt: 0,
            session,
        });

        let decision = match &evicted {
            Some(old) => AdmitDecision::Replaced {
                old_ip: old.identity.ip.clone(),
            },
            None => AdmitDecision::Admitted,
        };

        Admission {
            decision,
            admitted: Some(conn),
            evicted,
        }
    }

    fn allocate(&mut self) -> ConnectionId {
        self.next_conn += 1;
        ConnectionId(self.next_conn)
    }

    fn insert(&mut self, device: DeviceConnection) {
        self.ip_of.insert(device.conn, device.identity.ip.clone());
        self.by_ip.insert(device.identity.ip.clone(), device);
    }

    pub fn get(&self, conn: ConnectionId) -> Option<&DeviceConnection> {
        self.ip_of.get(&conn).and_then(|ip| self.by_ip.get(ip))
    }

    pub fn get_mut(&mut self, conn: ConnectionId) -> Option<&mut DeviceConnection> {
        let ip = self.ip_of.get(&conn)?;
        self.by_ip.get_mut(ip)
    }

    pub fn by_ip(&self, ip: &str) -> Option<&DeviceConnection> {
        self.by_ip.get(ip)
    }

    pub fn by_id(&self, id: &str) -> Option<&DeviceConnection> {
        self.by_ip.values().find(|device| device.identity.id == id)
    }

    pub fn remove(&mut self, conn: ConnectionId) -> Option<DeviceConnection> {
        let ip = self.ip_of.remove(&conn)?;
        self.by_ip.remove(&ip)
    }

    /// Empty the registry, handing every connection to the caller.
    pub fn drain(&mut self) -> Vec<DeviceConnection> {
        self.ip_of.clear();
        let mut devices: Vec<DeviceConnection> = self.by_ip.drain().map(|(_, d)| d).collect();
        devices.sort_by_key(|d| d.conn);
        devices
    }

    pub fn len(&self) -> usize {
        self.by_ip.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ip.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.by_ip.values().filter(|d| d.state.is_active()).count()
    }

    /// True when at least one device is admitted and every one is active.
    pub fn fleet_connected(&self) -> bool {
        !self.is_empty() && self.active_count() == self.len()
    }

    /// Device statuses ordered by address.
    pub fn statuses(&self) -> Vec<DeviceStatus> {
        let mut statuses: Vec<DeviceStatus> = self.by_ip.values().map(|d| d.status()).collect();
        statuses.sort_by(|a, b| a.identity.ip.cmp(&b.identity.ip));
        statuses
    }
}
