//! Persistent storage for the bridge.

pub mod known;

pub use known::{KnownDevice, KnownDeviceStore};

/// Get the default data directory for the PH803W bridge.
///
/// Uses the `directories` crate to find the appropriate platform-specific
/// data directory.
pub fn default_data_dir() -> Option<std::path::PathBuf> {
    directories::ProjectDirs::from("", "ph803w", "ph803w-bridge")
        .map(|dirs| dirs.data_dir().to_path_buf())
}
