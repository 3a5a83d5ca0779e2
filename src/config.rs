#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::Result;
use crate::error::ProviderFailed;
use crate::transport::Transport;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_DELAY_BASE: Duration = Duration::from_millis(150);
const DEFAULT_DELAY_CAP: Duration = Duration::from_secs(10);

/// Configuration for a [`ReconnectingWebSocket`](crate::ReconnectingWebSocket).
#[non_exhaustive]
#[derive(Clone)]
pub struct Config {
    /// Maximum number of retries after the initial attempt before the handle
    /// terminates with [`TerminationCause::RetryLimitExceeded`](crate::types::TerminationCause)
    pub max_retries: u32,
    /// Time allowed for a connection to leave the connecting state before it
    /// is force-closed. `None` disables the watchdog.
    pub connect_timeout: Option<Duration>,
    /// Inter-attempt delay policy
    pub delay: DelayPolicy,
    /// Underlying-connection constructor override. `None` selects the
    /// default `tokio-tungstenite` transport.
    pub transport: Option<Arc<dyn Transport>>,
}

impl Config {
    /// Configuration with the documented defaults: 3 retries, 10s connect
    /// timeout, capped exponential delay.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("max_retries", &self.max_retries)
            .field("connect_timeout", &self.connect_timeout)
            .field("delay", &self.delay)
            .field("transport", &self.transport.as_ref().map(|_| "<override>"))
            .finish()
    }
}

/// Maps an attempt index to the wait before the next attempt.
///
/// The policy is a pure function of the attempt index so the wait before
/// retry `n + 1` is exactly `delay_for(n)`; it carries no hidden state and
/// no jitter.
#[non_exhaustive]
#[derive(Clone)]
pub enum DelayPolicy {
    /// The same wait between every attempt
    Constant(Duration),
    /// `min(2^attempt * base, cap)`
    Exponential {
        /// Delay before the first retry
        base: Duration,
        /// Upper bound on the computed delay
        cap: Duration,
    },
    /// Caller-supplied attempt-indexed function
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl DelayPolicy {
    /// Compute the wait after a close on attempt `attempt`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            Self::Constant(d) => *d,
            Self::Exponential { base, cap } => {
                let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
                let factor = 1_u64.checked_shl(attempt).unwrap_or(u64::MAX);
                let raw = base_ms.saturating_mul(factor);
                (*cap).min(Duration::from_millis(raw))
            }
            Self::Custom(f) => f(attempt),
        }
    }
}

impl Default for DelayPolicy {
    fn default() -> Self {
        Self::Exponential {
            base: DEFAULT_DELAY_BASE,
            cap: DEFAULT_DELAY_CAP,
        }
    }
}

impl fmt::Debug for DelayPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant(d) => f.debug_tuple("Constant").field(d).finish(),
            Self::Exponential { base, cap } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("cap", cap)
                .finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl From<Duration> for DelayPolicy {
    fn from(d: Duration) -> Self {
        Self::Constant(d)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            delay: DelayPolicy::default(),
            transport: None,
        }
    }
}

/// Endpoint source: a fixed url or a callback re-evaluated on every attempt.
#[non_exhaustive]
#[derive(Clone)]
pub enum UrlProvider {
    /// Fixed endpoint
    Static(String),
    /// Re-evaluated before every connection attempt; an error here
    /// terminates the handle with an unknown-error cause
    Dynamic(Arc<dyn Fn() -> Result<String> + Send + Sync>),
}

impl UrlProvider {
    /// Endpoint callback re-evaluated before every connection attempt.
    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn() -> Result<String> + Send + Sync + 'static,
    {
        Self::Dynamic(Arc::new(f))
    }

    pub(crate) fn resolve(&self) -> Result<String> {
        match self {
            Self::Static(url) => Ok(url.clone()),
            Self::Dynamic(f) => f().map_err(|e| {
                ProviderFailed {
                    what: "url",
                    reason: e.to_string(),
                }
                .into()
            }),
        }
    }
}

impl fmt::Debug for UrlProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(url) => f.debug_tuple("Static").field(url).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

impl From<String> for UrlProvider {
    fn from(url: String) -> Self {
        Self::Static(url)
    }
}

impl From<&str> for UrlProvider {
    fn from(url: &str) -> Self {
        Self::Static(url.to_owned())
    }
}

/// Sub-protocol source: a fixed list or a callback re-evaluated per attempt.
#[non_exhaustive]
#[derive(Clone, Default)]
pub enum ProtocolsProvider {
    /// No sub-protocol negotiation
    #[default]
    None,
    /// Fixed sub-protocol list
    Static(Vec<String>),
    /// Re-evaluated before every connection attempt
    Dynamic(Arc<dyn Fn() -> Result<Vec<String>> + Send + Sync>),
}

impl ProtocolsProvider {
    /// Sub-protocol callback re-evaluated before every connection attempt.
    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn() -> Result<Vec<String>> + Send + Sync + 'static,
    {
        Self::Dynamic(Arc::new(f))
    }

    pub(crate) fn resolve(&self) -> Result<Vec<String>> {
        match self {
            Self::None => Ok(Vec::new()),
            Self::Static(protocols) => Ok(protocols.clone()),
            Self::Dynamic(f) => f().map_err(|e| {
                ProviderFailed {
                    what: "protocols",
                    reason: e.to_string(),
                }
                .into()
            }),
        }
    }
}

impl fmt::Debug for ProtocolsProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Static(protocols) => f.debug_tuple("Static").field(protocols).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

impl From<Vec<String>> for ProtocolsProvider {
    fn from(protocols: Vec<String>) -> Self {
        Self::Static(protocols)
    }
}

impl From<&[&str]> for ProtocolsProvider {
    fn from(protocols: &[&str]) -> Self {
        Self::Static(protocols.iter().map(|p| (*p).to_owned()).collect())
    }
}
