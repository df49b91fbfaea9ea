//! Remoting error types.
//!
//! Every failure an invocation can surface is a distinct variant so callers
//! can apply different retry policy per kind.

use crate::domain::correlation::CorrelationId;
use std::fmt;

/// Coarse classification of a [`RemotingError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connect,
    Send,
    Timeout,
    TooManyRequests,
    ConnectionLost,
    FrameTooLarge,
    Interrupted,
    Shutdown,
    ServiceState,
    DuplicateCorrelation,
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Connect => "CONNECT",
            ErrorKind::Send => "SEND",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::TooManyRequests => "TOO_MANY_REQUESTS",
            ErrorKind::ConnectionLost => "CONNECTION_LOST",
            ErrorKind::FrameTooLarge => "FRAME_TOO_LARGE",
            ErrorKind::Interrupted => "INTERRUPTED",
            ErrorKind::Shutdown => "SHUTDOWN",
            ErrorKind::ServiceState => "SERVICE_STATE",
            ErrorKind::DuplicateCorrelation => "DUPLICATE_CORRELATION",
            ErrorKind::Config => "CONFIG",
        };
        f.write_str(name)
    }
}

/// Invocation failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemotingError {
    /// No usable connection to the target address
    #[error("connect to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },

    /// Transport refused the write
    #[error("send request to {addr} failed: {reason}")]
    SendRequest { addr: String, reason: String },

    /// No matching response within the bound
    #[error("wait response from {addr} timed out after {timeout_ms}ms")]
    Timeout { addr: String, timeout_ms: u64 },

    /// Admission control rejected the call
    #[error("too many requests: {0}")]
    TooManyRequests(String),

    /// Connection failed after the request was sent
    #[error("connection to {addr} lost")]
    ConnectionLost { addr: String },

    /// Encoded command exceeds the maximum frame size
    #[error("frame of {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    /// Waiter was torn down before any result was delivered
    #[error("wait for response was interrupted")]
    Interrupted,

    /// Pending call cancelled by service shutdown
    #[error("remoting service shut down")]
    Shutdown,

    /// Service not in a state that accepts calls
    #[error("remoting service is {0}")]
    ServiceState(String),

    /// Correlation ID already registered (programming error)
    #[error("duplicate correlation id {0}")]
    DuplicateCorrelation(CorrelationId),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl RemotingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RemotingError::Connect { .. } => ErrorKind::Connect,
            RemotingError::SendRequest { .. } => ErrorKind::Send,
            RemotingError::Timeout { .. } => ErrorKind::Timeout,
            RemotingError::TooManyRequests(_) => ErrorKind::TooManyRequests,
            RemotingError::ConnectionLost { .. } => ErrorKind::ConnectionLost,
            RemotingError::FrameTooLarge { .. } => ErrorKind::FrameTooLarge,
            RemotingError::Interrupted => ErrorKind::Interrupted,
            RemotingError::Shutdown => ErrorKind::Shutdown,
            RemotingError::ServiceState(_) => ErrorKind::ServiceState,
            RemotingError::DuplicateCorrelation(_) => ErrorKind::DuplicateCorrelation,
            RemotingError::Config(_) => ErrorKind::Config,
        }
    }

    pub fn connect(addr: impl Into<String>, reason: impl fmt::Display) -> Self {
        RemotingError::Connect {
            addr: addr.into(),
            reason: reason.to_string(),
        }
    }

    pub fn send(addr: impl Into<String>, reason: impl fmt::Display) -> Self {
        RemotingError::SendRequest {
            addr: addr.into(),
            reason: reason.to_string(),
        }
    }

    pub fn timeout(addr: impl Into<String>, timeout: std::time::Duration) -> Self {
        RemotingError::Timeout {
            addr: addr.into(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Result type for remoting operations
pub type RemotingResult<T> = Result<T, RemotingError>;
