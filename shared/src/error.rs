//! Link error taxonomy
//!
//! Every variant is recoverable: the manager folds transport failures into a
//! state transition plus one of these values, and always ends up in a
//! restartable state.

use thiserror::Error;

/// Errors surfaced by the connection manager
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("not connected")]
    NotConnected,

    #[error("connection lost: {0}")]
    StreamLost(String),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("listen failed: {0}")]
    ListenFailed(String),

    #[error("connection manager stopped")]
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            LinkError::ConnectFailed("refused".into()).to_string(),
            "connection failed: refused"
        );
        assert_eq!(LinkError::NotConnected.to_string(), "not connected");
        assert_eq!(
            LinkError::StreamLost("peer closed".into()).to_string(),
            "connection lost: peer closed"
        );
    }
}
