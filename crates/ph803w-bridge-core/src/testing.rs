//! Scripted collaborators for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::discovery::{DiscoveryEvents, DiscoverySource};
use crate::error::{DiscoveryError, SessionError};
use crate::publisher::StatePublisher;
use crate::session::{DeviceSession, SessionEvents, SessionFactory};
use crate::types::{DeviceIdentity, SensorSnapshot};

/// Let spawned request tasks run to completion.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

pub fn snapshot(ph: f64, redox: f64) -> SensorSnapshot {
    SensorSnapshot {
        ph,
        ph_outlet: ph > 7.4,
        redox,
        redox_outlet: redox < 650.0,
    }
}

/// How a scripted session answers requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct Script {
    pub fail_connect: bool,
    pub fail_login: bool,
    /// Zero-based login calls that fail
    pub failing_logins: &'static [usize],
    pub fail_retrieve: bool,
    pub fail_destroy: bool,
    pub hang_destroy: bool,
}

#[derive(Debug, Default)]
pub struct Calls {
    pub connect: AtomicUsize,
    pub login: AtomicUsize,
    pub retrieve: AtomicUsize,
    pub close: AtomicUsize,
    pub forced_close: AtomicUsize,
    pub destroy: AtomicUsize,
}

pub fn count(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

#[derive(Debug, Default)]
pub struct ScriptedSession {
    ip: String,
    script: Script,
    pub calls: Calls,
}

impl ScriptedSession {
    pub fn new(ip: &str, script: Script) -> Self {
        Self {
            ip: ip.to_string(),
            script,
            calls: Calls::default(),
        }
    }
}

#[async_trait]
impl DeviceSession for ScriptedSession {
    async fn connect(&self) -> Result<(), SessionError> {
        self.calls.connect.fetch_add(1, Ordering::SeqCst);
        if self.script.fail_connect {
            return Err(SessionError::ConnectFailed {
                ip: self.ip.clone(),
                message: "connection refused".to_string(),
            });
        }
        Ok(())
    }

    async fn login(&self) -> Result<(), SessionError> {
        let call = self.calls.login.fetch_add(1, Ordering::SeqCst);
        if self.script.fail_login || self.script.failing_logins.contains(&call) {
            return Err(SessionError::LoginRejected {
                ip: self.ip.clone(),
                message: "passcode rejected".to_string(),
            });
        }
        Ok(())
    }

    async fn retrieve_data(&self) -> Result<(), SessionError> {
        self.calls.retrieve.fetch_add(1, Ordering::SeqCst);
        if self.script.fail_retrieve {
            return Err(SessionError::Timeout {
                ip: self.ip.clone(),
            });
        }
        Ok(())
    }

    async fn close(&self, force: bool) -> Result<(), SessionError> {
        self.calls.close.fetch_add(1, Ordering::SeqCst);
        if force {
            self.calls.forced_close.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<(), SessionError> {
        self.calls.destroy.fetch_add(1, Ordering::SeqCst);
        if self.script.hang_destroy {
            std::future::pending::<()>().await;
        }
        if self.script.fail_destroy {
            return Err(SessionError::Closed {
                ip: self.ip.clone(),
            });
        }
        Ok(())
    }
}

/// A session handed out by [`ScriptedFactory`].
#[derive(Clone)]
pub struct Opened {
    pub identity: DeviceIdentity,
    pub session: Arc<ScriptedSession>,
    pub events: SessionEvents,
}

#[derive(Default)]
pub struct ScriptedFactory {
    scripts: Mutex<HashMap<String, Script>>,
    opened: Mutex<Vec<Opened>>,
}

impl ScriptedFactory {
    /// Script for sessions opened on `ip` from now on.
    pub fn script(&self, ip: &str, script: Script) {
        self.scripts.lock().unwrap().insert(ip.to_string(), script);
    }

    pub fn opened(&self) -> Vec<Opened> {
        self.opened.lock().unwrap().clone()
    }

    /// Most recent session opened for `ip`.
    pub fn latest(&self, ip: &str) -> Opened {
        self.opened()
            .into_iter()
            .rev()
            .find(|o| o.identity.ip == ip)
            .unwrap_or_else(|| panic!("no session opened for {ip}"))
    }
}

impl SessionFactory for ScriptedFactory {
    fn open(&self, identity: &DeviceIdentity, events: SessionEvents) -> Arc<dyn DeviceSession> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&identity.ip)
            .copied()
            .unwrap_or_default();
        let session = Arc::new(ScriptedSession::new(&identity.ip, script));

        self.opened.lock().unwrap().push(Opened {
            identity: identity.clone(),
            session: Arc::clone(&session),
            events,
        });

        session
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Published {
    Prepared(DeviceIdentity),
    Snapshot(String, SensorSnapshot),
    Connectivity(String, bool),
    Fleet(bool),
}

#[derive(Debug, Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<Published>>,
}

impl RecordingPublisher {
    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }

    pub fn snapshots(&self) -> Vec<(String, SensorSnapshot)> {
        self.published()
            .into_iter()
            .filter_map(|p| match p {
                Published::Snapshot(id, snapshot) => Some((id, snapshot)),
                _ => None,
            })
            .collect()
    }

    pub fn connectivity(&self, device_id: &str) -> Vec<bool> {
        self.published()
            .into_iter()
            .filter_map(|p| match p {
                Published::Connectivity(id, connected) if id == device_id => Some(connected),
                _ => None,
            })
            .collect()
    }

    pub fn fleet(&self) -> Vec<bool> {
        self.published()
            .into_iter()
            .filter_map(|p| match p {
                Published::Fleet(connected) => Some(connected),
                _ => None,
            })
            .collect()
    }

    fn record(&self, published: Published) {
        self.published.lock().unwrap().push(published);
    }
}

impl StatePublisher for RecordingPublisher {
    fn prepare_device(&self, identity: &DeviceIdentity) {
        self.record(Published::Prepared(identity.clone()));
    }

    fn publish_snapshot(&self, device_id: &str, snapshot: &SensorSnapshot) {
        self.record(Published::Snapshot(device_id.to_string(), *snapshot));
    }

    fn publish_connectivity(&self, device_id: &str, connected: bool) {
        self.record(Published::Connectivity(device_id.to_string(), connected));
    }

    fn publish_fleet_connectivity(&self, connected: bool) {
        self.record(Published::Fleet(connected));
    }
}

/// Discovery source that announces a fixed list of devices on start.
#[derive(Default)]
pub struct ScriptedDiscovery {
    pub announce: Vec<(String, Option<String>)>,
    pub fail_start: bool,
    pub started: AtomicUsize,
    pub stopped: AtomicUsize,
    events: Mutex<Option<DiscoveryEvents>>,
}

impl ScriptedDiscovery {
    pub fn announcing(devices: &[(&str, Option<&str>)]) -> Self {
        Self {
            announce: devices
                .iter()
                .map(|(ip, id)| (ip.to_string(), id.map(str::to_string)))
                .collect(),
            ..Self::default()
        }
    }

    /// Discovery source whose start fails.
    pub fn failing() -> Self {
        Self {
            fail_start: true,
            ..Self::default()
        }
    }

    /// Announce another device while running.
    pub fn emit(&self, ip: &str, id: Option<&str>) {
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            events.device(ip, id.map(str::to_string));
        }
    }
}

#[async_trait]
impl DiscoverySource for ScriptedDiscovery {
    async fn discover(&self, events: DiscoveryEvents) -> Result<(), DiscoveryError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        if self.fail_start {
            return Err(DiscoveryError::Bind(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "port in use",
            )));
        }

        for (ip, id) in &self.announce {
            events.device(ip.clone(), id.clone());
        }
        *self.events.lock().unwrap() = Some(events);
        Ok(())
    }

    async fn stop(&self) -> Result<(), DiscoveryError> {
        self.stopped.fetch_add(1, Ordering::SeqCst);
        self.events.lock().unwrap().take();
        Ok(())
    }
}
