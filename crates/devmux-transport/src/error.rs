//! Error types for the devmux-transport crate.

use tokio_tungstenite::tungstenite;

use crate::frame::FrameError;

/// Errors from sending on a channel
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel closed")]
    Closed,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from client connections
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("Malformed frame: {0}")]
    Frame(#[from] FrameError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Request timeout")]
    Timeout,
}

impl ClientError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}

impl From<ChannelError> for ClientError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Closed => Self::ConnectionClosed,
            ChannelError::Json(e) => Self::Json(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_error_display() {
        assert_eq!(ChannelError::Closed.to_string(), "Channel closed");

        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = ChannelError::from(json_err);
        assert!(err.to_string().starts_with("JSON error"));
    }

    #[test]
    fn test_client_error_from_channel_error() {
        let err: ClientError = ChannelError::Closed.into();
        assert!(matches!(err, ClientError::ConnectionClosed));

        let json_err = serde_json::from_str::<serde_json::Value>("}{").unwrap_err();
        let err: ClientError = ChannelError::Json(json_err).into();
        assert!(matches!(err, ClientError::Json(_)));
    }

    #[test]
    fn test_client_error_display() {
        assert_eq!(ClientError::ConnectionClosed.to_string(), "Connection closed");
        assert_eq!(ClientError::Timeout.to_string(), "Request timeout");

        let err = ClientError::protocol("expected HOSTS");
        assert_eq!(err.to_string(), "Protocol error: expected HOSTS");

        let err = ClientError::from(FrameError::InvalidText { id: 3 });
        assert!(err.to_string().contains("channel 3"));
    }

    #[test]
    fn test_client_error_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: ClientError = io_err.into();
        assert!(matches!(err, ClientError::Io(_)));
        assert!(err.to_string().contains("refused"));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_error() -> Result<i32> {
            Err(ClientError::Timeout)
        }

        assert!(matches!(returns_error(), Err(ClientError::Timeout)));
    }
}
