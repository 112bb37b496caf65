//! Known-device storage.
//!
//! Every admitted identity is remembered so the next start can connect to
//! it right away instead of waiting for a discovery reply.

use crate::error::StorageError;
use crate::types::DeviceIdentity;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::Mutex;

/// File holding the known devices inside the data directory
pub const KNOWN_DEVICES_FILE: &str = "known-devices.json";

/// Regex for valid device ids: alphanumeric, dash, underscore only
const ID_PATTERN: &str = r"^[a-zA-Z0-9_-]+$";

/// Maximum id length
const MAX_ID_LENGTH: usize = 64;

/// A remembered device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownDevice {
    pub id: String,
    pub ip: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl KnownDevice {
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(self.id.clone(), self.ip.clone())
    }
}

/// Known-device storage service.
///
/// Takes a `PathBuf` in the constructor so each host can provide the
/// correct storage path.
pub struct KnownDeviceStore {
    dir: PathBuf,
    id_regex: Regex,
    /// Serializes read-modify-write cycles on the file
    write_lock: Mutex<()>,
}

impl KnownDeviceStore {
    /// Create a new KnownDeviceStore with the given directory.
    pub fn new(dir: PathBuf) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&dir)
            .map_err(|e| StorageError::DirectoryAccess(format!("{}: {}", dir.display(), e)))?;

        Ok(Self {
            dir,
            id_regex: Regex::new(ID_PATTERN).expect("static pattern"),
            write_lock: Mutex::new(()),
        })
    }

    fn validate_id(&self, id: &str) -> Result<(), StorageError> {
        if id.is_empty() {
            return Err(StorageError::InvalidId("Id cannot be empty".to_string()));
        }

        if id.len() > MAX_ID_LENGTH {
            return Err(StorageError::InvalidId(format!(
                "Id exceeds maximum length of {} characters",
                MAX_ID_LENGTH
            )));
        }

        if !self.id_regex.is_match(id) {
            return Err(StorageError::InvalidId(format!(
                "Id '{}' contains invalid characters. Only alphanumeric, dash, and underscore allowed.",
                id
            )));
        }

        Ok(())
    }

    fn path(&self) -> PathBuf {
        self.dir.join(KNOWN_DEVICES_FILE)
    }

    /// List all remembered devices, sorted by id.
    pub async fn list(&self) -> Result<Vec<KnownDevice>, StorageError> {
        let path = self.path();

        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&path).await?;
        let mut devices: Vec<KnownDevice> = serde_json::from_str(&content)?;
        devices.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(devices)
    }

    /// Identities to admit at startup.
    pub async fn load(&self) -> Result<Vec<DeviceIdentity>, StorageError> {
        Ok(self.list().await?.iter().map(KnownDevice::identity).collect())
    }

    /// Remember an identity; an existing entry with the same id takes the new ip.
    pub async fn remember(&self, identity: &DeviceIdentity) -> Result<(), StorageError> {
        self.validate_id(&identity.id)?;

        let _guard = self.write_lock.lock().await;
        let mut devices = self.list().await?;
        let now = Utc::now();

        match devices.iter_mut().find(|d| d.id == identity.id) {
            Some(device) => {
                device.ip = identity.ip.clone();
                device.last_seen = now;
            }
            None => devices.push(KnownDevice {
                id: identity.id.clone(),
                ip: identity.ip.clone(),
                first_seen: now,
                last_seen: now,
            }),
        }

        self.write(&devices).await
    }

    /// Forget a device.
    pub async fn forget(&self, id: &str) -> Result<(), StorageError> {
        self.validate_id(id)?;

        let _guard = self.write_lock.lock().await;
        let mut devices = self.list().await?;
        let before = devices.len();
        devices.retain(|d| d.id != id);

        if devices.len() == before {
            return Err(StorageError::NotFound(id.to_string()));
        }

        self.write(&devices).await
    }

    async fn write(&self, devices: &[KnownDevice]) -> Result<(), StorageError> {
        let content = serde_json::to_string_pretty(devices)?;
        let tmp = self.dir.join(format!("{}.tmp", KNOWN_DEVICES_FILE));

        fs::write(&tmp, content).await?;
        fs::rename(&tmp, self.path()).await?;

        Ok(())
    }
}
