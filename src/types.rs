//! Core value types shared across the crate.

use std::fmt;

/// Close code used when the connect-timeout watchdog force-closes a
/// connection that never left the connecting state. Private-use range, so it
/// cannot collide with a code originated by the remote endpoint.
pub const TIMEOUT_CLOSE_CODE: u16 = 4000;

/// Close code used when replaying the outbound buffer fails partway through;
/// the connection is force-closed so the retry loop can deliver the
/// remaining suffix on the next attempt.
pub const FLUSH_FAILURE_CLOSE_CODE: u16 = 4001;

/// Close code synthesized when a connection's event channel ends without a
/// close notification (the abnormal-closure code of RFC 6455).
pub const ABNORMAL_CLOSE_CODE: u16 = 1006;

/// An outbound or inbound payload.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// UTF-8 text payload
    Text(String),
    /// Raw binary payload
    Binary(Vec<u8>),
}

impl Message {
    /// Payload length in bytes, used for buffered-amount accounting.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<Vec<u8>> for Message {
    fn from(b: Vec<u8>) -> Self {
        Self::Binary(b)
    }
}

/// Connection readiness, mirroring the conventional WebSocket state machine.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Handshake in progress
    Connecting,
    /// Connected and able to send
    Open,
    /// Close handshake in progress
    Closing,
    /// Fully closed
    Closed,
}

impl ReadyState {
    /// Check if the connection can accept outbound messages.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }
}

/// Decoding preference for incoming binary frames, applied to every new
/// underlying connection before it becomes visible.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BinaryType {
    /// Deliver binary frames as owned byte buffers (the default)
    #[default]
    ArrayBuffer,
    /// Deliver binary frames as opaque blobs; transports without a blob
    /// notion treat this the same as [`BinaryType::ArrayBuffer`]
    Blob,
}

/// Why a handle stopped reconnecting. Set at most once, immutable thereafter.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationCause {
    /// The retry budget ran out without a sustained open connection
    RetryLimitExceeded,
    /// The application called a permanent close
    UserRequested,
    /// A fault outside the per-attempt scope (provider failure, invalid
    /// endpoint, malformed transport behavior)
    UnknownError,
}

impl fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RetryLimitExceeded => write!(f, "retry limit exceeded"),
            Self::UserRequested => write!(f, "closed by user"),
            Self::UnknownError => write!(f, "unknown error"),
        }
    }
}
