use std::io;
use thiserror::Error;
use tracker_core::TrackerError;

/// Coarse classification of an infrastructure failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfraErrorKind {
    Timeout,
    Reset,
    Refused,
    /// Peer closed the connection.
    Closed,
    /// The local side was shut down; nothing will reconnect.
    Shutdown,
    Other,
}

#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct InfraError {
    pub kind: InfraErrorKind,
    pub message: String,
}

impl InfraError {
    pub fn new(kind: InfraErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn shutdown() -> Self {
        Self::new(InfraErrorKind::Shutdown, "connection closed by shutdown")
    }

    /// Timeouts, resets, refusals and dropped connections are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            InfraErrorKind::Timeout | InfraErrorKind::Reset | InfraErrorKind::Refused | InfraErrorKind::Closed
        )
    }
}

impl From<redis::RedisError> for InfraError {
    fn from(err: redis::RedisError) -> Self {
        let kind = if err.is_timeout() {
            InfraErrorKind::Timeout
        } else if err.is_connection_refusal() {
            InfraErrorKind::Refused
        } else if err.is_connection_dropped() {
            InfraErrorKind::Closed
        } else if err.is_io_error() {
            InfraErrorKind::Reset
        } else {
            InfraErrorKind::Other
        };
        Self::new(kind, err.to_string())
    }
}

impl From<io::Error> for InfraError {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => InfraErrorKind::Timeout,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe => {
                InfraErrorKind::Reset
            }
            io::ErrorKind::ConnectionRefused => InfraErrorKind::Refused,
            io::ErrorKind::UnexpectedEof | io::ErrorKind::NotConnected => InfraErrorKind::Closed,
            _ => InfraErrorKind::Other,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for InfraError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::new(InfraErrorKind::Timeout, "operation timed out")
    }
}

impl From<InfraError> for TrackerError {
    fn from(err: InfraError) -> Self {
        if err.is_transient() {
            TrackerError::TransientInfra(err.to_string())
        } else {
            TrackerError::Datastore(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_classification() {
        let reset: InfraError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert_eq!(reset.kind, InfraErrorKind::Reset);
        assert!(reset.is_transient());

        let refused: InfraError = io::Error::from(io::ErrorKind::ConnectionRefused).into();
        assert!(refused.is_transient());

        let other: InfraError = io::Error::from(io::ErrorKind::PermissionDenied).into();
        assert!(!other.is_transient());
    }

    #[test]
    fn test_shutdown_is_not_transient() {
        assert!(!InfraError::shutdown().is_transient());
        let mapped: TrackerError = InfraError::shutdown().into();
        assert!(matches!(mapped, TrackerError::Datastore(_)));

        let mapped: TrackerError = InfraError::new(InfraErrorKind::Timeout, "slow").into();
        assert!(matches!(mapped, TrackerError::TransientInfra(_)));
    }
}
