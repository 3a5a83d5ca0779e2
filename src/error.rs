use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Error related to invalid configuration or invalid state within the
    /// handle (bad endpoint, empty protocol list, ...)
    Validation,
    /// Error originating in the underlying transport
    Transport,
    /// Operation timed out
    Timeout,
    /// Internal error from dependencies or provider callbacks
    Internal,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Validation {
            reason: message.into(),
        }
        .into()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

/// Validation failure in configuration or handle state.
#[non_exhaustive]
#[derive(Debug)]
pub struct Validation {
    pub reason: String,
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid: {}", self.reason)
    }
}

impl StdError for Validation {}

impl From<Validation> for Error {
    fn from(err: Validation) -> Self {
        Self::with_source(Kind::Validation, err)
    }
}

/// Send was attempted while no connection is open.
#[derive(Debug, Clone, Copy)]
pub struct NotConnected;

impl fmt::Display for NotConnected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no open connection")
    }
}

impl StdError for NotConnected {}

impl From<NotConnected> for Error {
    fn from(err: NotConnected) -> Self {
        Self::with_source(Kind::Transport, err)
    }
}

/// The transport closed the connection or its event channel.
#[derive(Debug, Clone, Copy)]
pub struct TransportClosed;

impl fmt::Display for TransportClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport connection closed")
    }
}

impl StdError for TransportClosed {}

impl From<TransportClosed> for Error {
    fn from(err: TransportClosed) -> Self {
        Self::with_source(Kind::Transport, err)
    }
}

/// A url or protocol provider callback failed while being re-evaluated for a
/// new attempt.
#[non_exhaustive]
#[derive(Debug)]
pub struct ProviderFailed {
    pub what: &'static str,
    pub reason: String,
}

impl fmt::Display for ProviderFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} provider failed: {}", self.what, self.reason)
    }
}

impl StdError for ProviderFailed {}

impl From<ProviderFailed> for Error {
    fn from(err: ProviderFailed) -> Self {
        Self::with_source(Kind::Internal, err)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::with_source(Kind::Transport, e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Self::with_source(Kind::Validation, e)
    }
}
