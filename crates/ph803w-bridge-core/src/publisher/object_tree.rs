//! In-memory hierarchical object/state tree.
//!
//! Mirrors the layout the bridge publishes for every device:
//!
//! ```text
//! <id>                 device   (native: identity)
//! <id>.ph              channel
//! <id>.ph.value        number
//! <id>.ph.outlet       boolean
//! <id>.redox           channel
//! <id>.redox.value     number, mV
//! <id>.redox.outlet    boolean, writable
//! <id>.connected       boolean
//! info.connection      boolean, fleet connectivity
//! ```

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::{Number, Value};
use tracing::warn;

use super::StatePublisher;
use crate::types::{DeviceIdentity, SensorSnapshot};

/// Key of the fleet connectivity state
pub const FLEET_CONNECTION_KEY: &str = "info.connection";

/// Characters allowed in a key segment; everything else becomes `_`
const FORBIDDEN_KEY_CHARS: &str = r"[^A-Za-z0-9_-]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Device,
    Channel,
    State,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Number,
    Boolean,
}

/// Display and access metadata of an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectCommon {
    pub name: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub value_type: Option<ValueType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub read: bool,
    pub write: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectDef {
    #[serde(rename = "type")]
    pub kind: ObjectKind,
    pub common: ObjectCommon,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native: Option<Value>,
}

impl ObjectDef {
    fn device(identity: &DeviceIdentity) -> Self {
        Self {
            kind: ObjectKind::Device,
            common: ObjectCommon {
                name: format!("PH803W device {}", identity.id),
                value_type: None,
                role: None,
                unit: None,
                read: true,
                write: false,
            },
            native: serde_json::to_value(identity).ok(),
        }
    }

    fn channel(name: &str) -> Self {
        Self {
            kind: ObjectKind::Channel,
            common: ObjectCommon {
                name: name.to_string(),
                value_type: None,
                role: None,
                unit: None,
                read: true,
                write: false,
            },
            native: None,
        }
    }

    fn state(name: &str, value_type: ValueType, role: &str, unit: Option<&str>, write: bool) -> Self {
        Self {
            kind: ObjectKind::State,
            common: ObjectCommon {
                name: name.to_string(),
                value_type: Some(value_type),
                role: Some(role.to_string()),
                unit: unit.map(str::to_string),
                read: true,
                write,
            },
            native: None,
        }
    }
}

/// Current value of a state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateValue {
    #[serde(rename = "val")]
    pub value: Value,
    /// Confirmed by the device rather than requested by a user
    pub ack: bool,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct TreeInner {
    objects: BTreeMap<String, ObjectDef>,
    states: BTreeMap<String, StateValue>,
}

/// Thread-safe object tree implementing [`StatePublisher`].
#[derive(Debug)]
pub struct ObjectTree {
    inner: Mutex<TreeInner>,
    forbidden: Regex,
}

impl Default for ObjectTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectTree {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TreeInner::default()),
            forbidden: Regex::new(FORBIDDEN_KEY_CHARS).expect("static pattern"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TreeInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Key segment for a device id.
    pub fn device_key(&self, device_id: &str) -> String {
        self.forbidden.replace_all(device_id, "_").into_owned()
    }

    /// Create or update an object, keeping an existing display name.
    pub fn extend_object(&self, key: &str, mut def: ObjectDef) {
        let mut inner = self.lock();
        if let Some(existing) = inner.objects.get(key) {
            def.common.name = existing.common.name.clone();
        }
        inner.objects.insert(key.to_string(), def);
    }

    /// Rename an object, as a user would from the admin UI.
    pub fn set_object_name(&self, key: &str, name: &str) -> bool {
        match self.lock().objects.get_mut(key) {
            Some(object) => {
                object.common.name = name.to_string();
                true
            }
            None => false,
        }
    }

    pub fn set_state(&self, key: &str, value: impl Into<Value>, ack: bool) {
        self.lock().states.insert(
            key.to_string(),
            StateValue {
                value: value.into(),
                ack,
                ts: Utc::now(),
            },
        );
    }

    /// Set a numeric state; JSON has no NaN or infinity, so those are skipped.
    pub fn set_number(&self, key: &str, value: f64, ack: bool) -> bool {
        match Number::from_f64(value) {
            Some(number) => {
                self.set_state(key, Value::Number(number), ack);
                true
            }
            None => {
                warn!(key, value, "Non-finite value not stored, keeping previous state");
                false
            }
        }
    }

    pub fn object(&self, key: &str) -> Option<ObjectDef> {
        self.lock().objects.get(key).cloned()
    }

    pub fn state(&self, key: &str) -> Option<StateValue> {
        self.lock().states.get(key).cloned()
    }

    /// Current value of a state, without metadata.
    pub fn value(&self, key: &str) -> Option<Value> {
        self.state(key).map(|s| s.value)
    }

    pub fn object_keys(&self) -> Vec<String> {
        self.lock().objects.keys().cloned().collect()
    }

    /// Identities stored in device objects, e.g. to seed the next startup.
    pub fn device_identities(&self) -> Vec<DeviceIdentity> {
        self.lock()
            .objects
            .values()
            .filter(|o| o.kind == ObjectKind::Device)
            .filter_map(|o| o.native.clone())
            .filter_map(|native| serde_json::from_value(native).ok())
            .collect()
    }
}

impl StatePublisher for ObjectTree {
    fn prepare_device(&self, identity: &DeviceIdentity) {
        let base = self.device_key(&identity.id);

        self.extend_object(&base, ObjectDef::device(identity));
        self.extend_object(&format!("{base}.ph"), ObjectDef::channel("PH Data"));
        self.extend_object(&format!("{base}.redox"), ObjectDef::channel("Redox data"));
        self.extend_object(
            &format!("{base}.ph.value"),
            ObjectDef::state("PH Value", ValueType::Number, "value", Some(""), false),
        );
        self.extend_object(
            &format!("{base}.redox.value"),
            ObjectDef::state("Redox Value", ValueType::Number, "value", Some("mV"), false),
        );
        self.extend_object(
            &format!("{base}.ph.outlet"),
            ObjectDef::state("PH Power Outlet", ValueType::Boolean, "indicator", None, false),
        );
        self.extend_object(
            &format!("{base}.redox.outlet"),
            ObjectDef::state("Redox Power Outlet", ValueType::Boolean, "indicator", None, true),
        );
        self.extend_object(
            &format!("{base}.connected"),
            ObjectDef::state("Device connected", ValueType::Boolean, "indicator.connected", None, false),
        );
    }

    fn publish_snapshot(&self, device_id: &str, snapshot: &SensorSnapshot) {
        let base = self.device_key(device_id);
        self.set_number(&format!("{base}.ph.value"), snapshot.ph, true);
        self.set_state(&format!("{base}.ph.outlet"), snapshot.ph_outlet, true);
        self.set_number(&format!("{base}.redox.value"), snapshot.redox, true);
        self.set_state(&format!("{base}.redox.outlet"), snapshot.redox_outlet, true);
    }

    fn publish_connectivity(&self, device_id: &str, connected: bool) {
        let base = self.device_key(device_id);
        self.set_state(&format!("{base}.connected"), connected, true);
    }

    fn publish_fleet_connectivity(&self, connected: bool) {
        self.set_state(FLEET_CONNECTION_KEY, connected, true);
    }
}
