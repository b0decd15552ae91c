//! Error Types
//!
//! Comprehensive error handling for all netbus operations.

use std::io;
use thiserror::Error;

/// Main error type for netbus operations.
#[derive(Error, Debug)]
pub enum BusError {
    /// IO error during socket operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Malformed wire frame (bad length prefix, unknown body-type tag, truncated UTF-8, ...).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Reply timer fired before a reply arrived.
    #[error("reply timed out")]
    Timeout,

    /// `send` target address has no registered handler anywhere reachable.
    #[error("no handlers registered for address")]
    NoHandlers,

    /// The receiving handler explicitly signalled failure via `msg.fail(code, reason)`.
    #[error("recipient failure {code}: {reason}")]
    RecipientFailure {
        /// Application-defined failure code.
        code: i32,
        /// Human-readable failure reason.
        reason: String,
    },

    /// A non-primitive body type had no codec registered, in clustered mode.
    #[error("no codec registered for type {type_name}")]
    CodecMissing {
        /// The runtime type name that had no registered codec.
        type_name: String,
    },

    /// Operation attempted on a bus that has already started (or finished) `close()`.
    #[error("event bus is closed")]
    Closed,
}

/// Result type alias for netbus operations.
pub type Result<T> = std::result::Result<T, BusError>;

impl BusError {
    /// Create a protocol error with a message.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a recipient-failure error.
    pub fn recipient_failure(code: i32, reason: impl Into<String>) -> Self {
        Self::RecipientFailure {
            code,
            reason: reason.into(),
        }
    }

    /// Whether a connection using this error should retry rather than give up permanently.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            Self::Timeout | Self::NoHandlers => true,
            _ => false,
        }
    }

    /// Whether this error reflects the death of a peer connection (as opposed to a
    /// local application-level failure).
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Closed)
    }
}
