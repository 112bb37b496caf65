//! State publishing boundary.
//!
//! Publishing is fire-and-forget: the bridge never waits on or retries a
//! publish, storage failures belong to the implementation.

pub mod object_tree;

pub use object_tree::ObjectTree;

use crate::types::{DeviceIdentity, SensorSnapshot};

/// Receives everything the bridge makes visible to the outside world.
pub trait StatePublisher: Send + Sync {
    /// Called once per admission, before any value of the device is published.
    fn prepare_device(&self, _identity: &DeviceIdentity) {}

    /// Forward a reading exactly as received.
    fn publish_snapshot(&self, device_id: &str, snapshot: &SensorSnapshot);

    fn publish_connectivity(&self, device_id: &str, connected: bool);

    fn publish_fleet_connectivity(&self, connected: bool);
}
