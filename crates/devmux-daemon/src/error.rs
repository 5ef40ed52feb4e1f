//! Error types for the devmux daemon.

use std::time::Duration;

use devmux_types::ChannelCode;

/// Errors that can occur in the daemon
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Middleware registration error
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Saved-device store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors from binding connections and channels to middlewares
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Channel type {code} is claimed by both {first} and {second}")]
    DuplicateCode {
        code: ChannelCode,
        first: &'static str,
        second: &'static str,
    },

    #[error("Action {action:?} is claimed by both {first} and {second}")]
    DuplicateAction {
        action: &'static str,
        first: &'static str,
        second: &'static str,
    },

    #[error("Unknown channel type: {0}")]
    UnknownChannelType(ChannelCode),

    #[error("No handler for action {0:?}")]
    UnmatchedRequest(String),
}

/// Errors surfaced by the device registry.
///
/// Cloneable so concurrent `init()` callers can all observe one result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Device bridge unavailable: {0}")]
    DaemonUnavailable(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Command failed: {0}")]
    CommandExecutionFailed(String),
}

/// Errors from the debug-bridge client
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("`{command}` failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("Unexpected bridge output: {0}")]
    Parse(String),
}

/// Errors from the saved-device store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Device not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
