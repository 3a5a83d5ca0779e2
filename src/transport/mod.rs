//! The seam between the reconnection engine and an actual wire protocol.
//!
//! The engine never talks to a socket directly: it asks a [`Transport`] for
//! one [`Connection`] per attempt and then observes that connection's life
//! through a stream of [`TransportEvent`]s. The default implementation is
//! backed by `tokio-tungstenite`; tests substitute scripted implementations
//! through [`Config::transport`](crate::Config).

pub mod tungstenite;

use std::sync::Arc;

use tokio::sync::mpsc;

pub use tungstenite::TungsteniteTransport;

use crate::Result;
use crate::types::{BinaryType, Message, ReadyState};

/// Lifecycle notification from one underlying connection.
///
/// A well-behaved connection emits at most one `Open`, any number of
/// `Message`/`Error`, and ends its stream with exactly one `Close`. The
/// engine tolerates streams that end without a `Close` by synthesizing one.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The connection reached the open state
    Open {
        /// Negotiated sub-protocol, empty if none
        protocol: String,
    },
    /// A payload arrived
    Message(Message),
    /// A transport-level fault that does not by itself end the connection
    Error {
        /// Human-readable description of the fault
        message: String,
    },
    /// The connection is over; always the final event
    Close {
        /// Close code
        code: u16,
        /// Close reason, empty if none
        reason: String,
        /// Whether the close completed as a clean close handshake
        was_clean: bool,
    },
}

/// Receiving half of one connection's notification stream.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Constructor for underlying connections, one call per attempt.
pub trait Transport: Send + Sync + 'static {
    /// Begin connecting to `url`. Returns immediately with a handle in the
    /// connecting state plus its notification stream; the handshake result
    /// arrives as a [`TransportEvent::Open`] or [`TransportEvent::Close`].
    fn connect(
        &self,
        url: &str,
        protocols: &[String],
    ) -> Result<(Arc<dyn Connection>, TransportEvents)>;
}

/// One underlying connection. Owned by the handle for a single attempt and
/// replaced, never reused, on reconnection.
pub trait Connection: Send + Sync {
    /// Current connection state.
    fn ready_state(&self) -> ReadyState;

    /// The endpoint this connection was created for.
    fn url(&self) -> String;

    /// Negotiated sub-protocol, empty until open and when none was agreed.
    fn protocol(&self) -> String;

    /// Negotiated extensions, empty when none.
    fn extensions(&self) -> String;

    /// Bytes accepted by [`Connection::send`] but not yet written out.
    fn buffered_amount(&self) -> u64;

    /// Apply the handle's binary decoding preference.
    fn set_binary_type(&self, binary_type: BinaryType);

    /// Queue one payload for delivery. Fails if the connection is not open.
    fn send(&self, message: Message) -> Result<()>;

    /// Request closure with the given code and reason. Idempotent; closing a
    /// connection that is still connecting aborts the handshake and emits a
    /// synthesized close notification.
    fn close(&self, code: u16, reason: &str);
}
