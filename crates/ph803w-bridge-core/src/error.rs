//! Error types for the PH803W bridge core.

use thiserror::Error;

/// Error returned by the bridge handle.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Bridge is not running")]
    NotRunning,
}

/// Errors reported by a device session collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Connection to {ip} refused: {message}")]
    ConnectFailed { ip: String, message: String },

    #[error("Login rejected by {ip}: {message}")]
    LoginRejected { ip: String, message: String },

    #[error("Data retrieval from {ip} failed: {message}")]
    RetrievalFailed { ip: String, message: String },

    #[error("Request to {ip} timed out")]
    Timeout { ip: String },

    #[error("Session for {ip} is closed")]
    Closed { ip: String },
}

impl SessionError {
    /// Address of the device the error belongs to.
    pub fn ip(&self) -> &str {
        match self {
            SessionError::ConnectFailed { ip, .. }
            | SessionError::LoginRejected { ip, .. }
            | SessionError::RetrievalFailed { ip, .. }
            | SessionError::Timeout { ip }
            | SessionError::Closed { ip } => ip,
        }
    }
}

/// Discovery errors
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Failed to bind discovery socket: {0}")]
    Bind(std::io::Error),

    #[error("Discovery is already running")]
    AlreadyRunning,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Invalid value for {field}: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to access storage directory: {0}")]
    DirectoryAccess(String),

    #[error("Invalid device id: {0}")]
    InvalidId(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_display() {
        let err = SessionError::LoginRejected {
            ip: "10.0.0.1".to_string(),
            message: "bad passcode".to_string(),
        };
        assert_eq!(format!("{}", err), "Login rejected by 10.0.0.1: bad passcode");
        assert_eq!(err.ip(), "10.0.0.1");
    }

    #[test]
    fn test_core_error_from_config_error() {
        let err: CoreError = ConfigError::InvalidField {
            field: "shutdownTimeoutMs".to_string(),
            reason: "must be greater than zero".to_string(),
        }
        .into();
        assert!(matches!(err, CoreError::Config(ConfigError::InvalidField { .. })));
        assert_eq!(
            format!("{}", err),
            "Config error: Invalid value for shutdownTimeoutMs: must be greater than zero"
        );
    }

    #[test]
    fn test_discovery_error_display() {
        let err = DiscoveryError::Bind(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            "port in use",
        ));
        assert_eq!(format!("{}", err), "Failed to bind discovery socket: port in use");
    }

    #[test]
    fn test_config_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: ConfigError = json_err.into();
        assert!(format!("{}", err).starts_with("Failed to parse config"));
    }
}
