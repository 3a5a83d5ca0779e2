//! The application-facing handle and the reconnection lifecycle engine.
//!
//! One [`ReconnectingWebSocket`] spans arbitrarily many underlying
//! connections. A single long-lived task drives the engine: construct a
//! connection, await its life, consult the retry budget and delay policy,
//! repeat, until a permanent termination ends the loop. All listener state,
//! the outbound buffer and the binary-type preference live on the handle, so
//! nothing needs re-registration across attempts.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::Result;
use crate::buffer::OutboundBuffer;
use crate::config::{Config, ProtocolsProvider, UrlProvider};
use crate::error::{Error, NotConnected};
use crate::event::{
    Callback, CloseEvent, ErrorEvent, Event, EventKind, EventSurface, ListenerOptions,
    MessageEvent, OpenEvent, TerminatedEvent,
};
use crate::transport::{
    Connection, Transport, TransportEvent, TransportEvents, TungsteniteTransport,
};
use crate::types::{
    ABNORMAL_CLOSE_CODE, BinaryType, FLUSH_FAILURE_CLOSE_CODE, Message, ReadyState,
    TIMEOUT_CLOSE_CODE, TerminationCause,
};

/// Grace window between a forced close and the synthesized close
/// notification, for transports that emit the natural one late.
const CLOSE_GRACE: Duration = Duration::from_millis(250);

const NORMAL_CLOSE_CODE: u16 = 1000;

/// An auto-reconnecting WebSocket handle.
///
/// The handle is cheap to clone; all clones share one reconnection engine.
/// Reconnection runs until the handle permanently terminates (exhausted
/// retry budget, an explicit permanent close, or an unrecoverable fault),
/// which fires exactly one [`EventKind::Terminated`] event.
///
/// # Example
///
/// ```no_run
/// use reconnecting_ws::{Config, ReconnectingWebSocket};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let socket = ReconnectingWebSocket::new("wss://example.com/feed", Config::default())?;
///     let mut events = socket.subscribe();
///     socket.send("hello")?;
///     while let Ok(event) = events.recv().await {
///         println!("{event:?}");
///     }
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct ReconnectingWebSocket {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ReconnectingWebSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectingWebSocket")
            .finish_non_exhaustive()
    }
}

struct Inner {
    config: Config,
    url: UrlProvider,
    protocols: ProtocolsProvider,
    transport: Arc<dyn Transport>,
    surface: EventSurface,
    shared: Mutex<Shared>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Shared {
    /// Consecutive failed attempts since the last successful open
    attempt: u32,
    binary_type: BinaryType,
    buffer: OutboundBuffer,
    /// The at-most-one active underlying connection. Kept after permanent
    /// termination so late sends observe the dead connection's own failure.
    conn: Option<Arc<dyn Connection>>,
    terminated: Option<TerminationCause>,
}

impl ReconnectingWebSocket {
    /// Create a handle and start connecting. Must be called within a tokio
    /// runtime; the reconnection engine is spawned immediately.
    pub fn new<U>(url: U, config: Config) -> Result<Self>
    where
        U: Into<UrlProvider>,
    {
        Self::with_protocols(url, ProtocolsProvider::None, config)
    }

    /// Like [`ReconnectingWebSocket::new`] with a sub-protocol list or
    /// provider, re-resolved on every attempt.
    pub fn with_protocols<U, P>(url: U, protocols: P, config: Config) -> Result<Self>
    where
        U: Into<UrlProvider>,
        P: Into<ProtocolsProvider>,
    {
        let url = url.into();
        if let UrlProvider::Static(endpoint) = &url {
            // Dynamic providers are validated per attempt instead.
            validate_endpoint(endpoint)?;
        }

        let transport = config
            .transport
            .clone()
            .unwrap_or_else(|| Arc::new(TungsteniteTransport));

        let inner = Arc::new(Inner {
            config,
            url,
            protocols: protocols.into(),
            transport,
            surface: EventSurface::new(),
            shared: Mutex::new(Shared::default()),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(run_loop(Arc::downgrade(&inner)));

        Ok(Self { inner })
    }

    /// Send a payload, or queue it if no connection is currently open.
    ///
    /// Queued payloads are replayed in order on the next successful open.
    /// After permanent termination nothing is queued: the payload is handed
    /// straight to the dead connection so the caller observes the same
    /// failure the transport itself produces for a closed connection.
    pub fn send<M>(&self, message: M) -> Result<()>
    where
        M: Into<Message>,
    {
        let message = message.into();
        let mut shared = lock(&self.inner.shared);
        if shared.terminated.is_some() {
            return match &shared.conn {
                Some(conn) => conn.send(message),
                None => Err(NotConnected.into()),
            };
        }
        match &shared.conn {
            Some(conn) if conn.ready_state().is_open() => conn.send(message),
            _ => {
                shared.buffer.push(message);
                Ok(())
            }
        }
    }

    /// Close the active connection and permanently terminate the handle
    /// with [`TerminationCause::UserRequested`]. No further attempts occur;
    /// idempotent.
    pub fn close(&self, code: Option<u16>, reason: Option<&str>) {
        self.close_current(code, reason);
        self.inner
            .terminate(TerminationCause::UserRequested, None);
    }

    /// Close only the current attempt; the engine then reconnects as for
    /// any other close, with the usual budget and delay. Never terminates
    /// the handle.
    pub fn reconnect(&self, code: Option<u16>, reason: Option<&str>) {
        self.close_current(code, reason);
    }

    fn close_current(&self, code: Option<u16>, reason: Option<&str>) {
        let conn = lock(&self.inner.shared).conn.clone();
        if let Some(conn) = conn {
            conn.close(code.unwrap_or(NORMAL_CLOSE_CODE), reason.unwrap_or(""));
        }
    }

    /// Endpoint of the active underlying connection, empty when none.
    #[must_use]
    pub fn url(&self) -> String {
        lock(&self.inner.shared)
            .conn
            .as_ref()
            .map(|c| c.url())
            .unwrap_or_default()
    }

    /// State of the active underlying connection. Between attempts the
    /// handle reports [`ReadyState::Connecting`] (a retry is pending) unless
    /// it already terminated.
    #[must_use]
    pub fn ready_state(&self) -> ReadyState {
        let shared = lock(&self.inner.shared);
        match &shared.conn {
            Some(conn) => conn.ready_state(),
            None if shared.terminated.is_some() => ReadyState::Closed,
            None => ReadyState::Connecting,
        }
    }

    /// Bytes not yet handed to the wire: the transport's own backlog plus
    /// everything queued in the outbound buffer.
    #[must_use]
    pub fn buffered_amount(&self) -> u64 {
        let shared = lock(&self.inner.shared);
        let transport_backlog = shared
            .conn
            .as_ref()
            .map(|c| c.buffered_amount())
            .unwrap_or_default();
        transport_backlog + shared.buffer.byte_len()
    }

    /// Negotiated sub-protocol of the active connection, empty when none.
    #[must_use]
    pub fn protocol(&self) -> String {
        lock(&self.inner.shared)
            .conn
            .as_ref()
            .map(|c| c.protocol())
            .unwrap_or_default()
    }

    /// Negotiated extensions of the active connection, empty when none.
    #[must_use]
    pub fn extensions(&self) -> String {
        lock(&self.inner.shared)
            .conn
            .as_ref()
            .map(|c| c.extensions())
            .unwrap_or_default()
    }

    /// Current binary decoding preference.
    #[must_use]
    pub fn binary_type(&self) -> BinaryType {
        lock(&self.inner.shared).binary_type
    }

    /// Set the binary decoding preference. Applied to the active connection
    /// immediately and to every future connection before it opens.
    pub fn set_binary_type(&self, binary_type: BinaryType) {
        let conn = {
            let mut shared = lock(&self.inner.shared);
            shared.binary_type = binary_type;
            shared.conn.clone()
        };
        if let Some(conn) = conn {
            conn.set_binary_type(binary_type);
        }
    }

    /// Whether the handle permanently terminated.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        lock(&self.inner.shared).terminated.is_some()
    }

    /// The termination cause, once set.
    #[must_use]
    pub fn termination_cause(&self) -> Option<TerminationCause> {
        lock(&self.inner.shared).terminated
    }

    /// A cancellation token that fires on permanent termination, for
    /// composing with other tasks. The returned token cannot cancel the
    /// handle.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.child_token()
    }

    /// Register a listener with default options. Registering the identical
    /// (kind, callback, capture) combination twice is a no-op; returns
    /// whether the registration was added.
    pub fn add_listener(&self, kind: EventKind, callback: Callback) -> bool {
        self.inner
            .surface
            .add_listener(kind, callback, ListenerOptions::default())
    }

    /// Register a listener with explicit options. A `once` listener fires on
    /// the next matching event across any number of reconnections, then
    /// removes itself.
    pub fn add_listener_with(
        &self,
        kind: EventKind,
        callback: Callback,
        options: ListenerOptions,
    ) -> bool {
        self.inner.surface.add_listener(kind, callback, options)
    }

    /// Remove a listener registered without the capture flag. Idempotent.
    pub fn remove_listener(&self, kind: EventKind, callback: &Callback) {
        self.inner.surface.remove_listener(kind, callback, false);
    }

    /// Remove a listener registered with an explicit capture flag.
    pub fn remove_listener_with(&self, kind: EventKind, callback: &Callback, capture: bool) {
        self.inner.surface.remove_listener(kind, callback, capture);
    }

    /// Set or clear the single-slot open handler.
    pub fn set_on_open(&self, callback: Option<Callback>) {
        self.inner.surface.set_attribute(EventKind::Open, callback);
    }

    /// Set or clear the single-slot message handler.
    pub fn set_on_message(&self, callback: Option<Callback>) {
        self.inner
            .surface
            .set_attribute(EventKind::Message, callback);
    }

    /// Set or clear the single-slot error handler.
    pub fn set_on_error(&self, callback: Option<Callback>) {
        self.inner.surface.set_attribute(EventKind::Error, callback);
    }

    /// Set or clear the single-slot close handler.
    pub fn set_on_close(&self, callback: Option<Callback>) {
        self.inner.surface.set_attribute(EventKind::Close, callback);
    }

    /// Subscribe to the broadcast fan-out of all events. Each receiver is
    /// independent; slow receivers observe lag, not backpressure.
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.inner.surface.subscribe()
    }
}

impl Inner {
    fn is_terminated(&self) -> bool {
        lock(&self.shared).terminated.is_some()
    }

    fn emit(&self, event: &Event) {
        self.surface.emit(event);
    }

    /// One-way transition. Clears the buffer, unblocks any pending backoff
    /// wait, and fires the terminated event exactly once.
    fn terminate(&self, cause: TerminationCause, error: Option<Error>) {
        let conn = {
            let mut shared = lock(&self.shared);
            if shared.terminated.is_some() {
                return;
            }
            shared.terminated = Some(cause);
            shared.buffer.clear();
            shared.conn.clone()
        };

        if let Some(conn) = conn
            && !matches!(conn.ready_state(), ReadyState::Closing | ReadyState::Closed)
        {
            conn.close(NORMAL_CLOSE_CODE, "");
        }
        self.cancel.cancel();

        #[cfg(feature = "tracing")]
        tracing::warn!(%cause, "handle permanently terminated");

        self.emit(&Event::Terminated(TerminatedEvent {
            cause,
            error: error.map(Arc::new),
        }));
    }
}

fn validate_endpoint(endpoint: &str) -> Result<()> {
    let parsed = Url::parse(endpoint)?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(Error::validation(format!(
            "endpoint scheme must be ws or wss, got {other}"
        ))),
    }
}

/// The reconnection loop. Holds only a weak handle between iterations so an
/// abandoned handle stops reconnecting once its last clone drops.
async fn run_loop(inner: Weak<Inner>) {
    loop {
        let Some(inner) = inner.upgrade() else {
            return;
        };

        if let Err(e) = run_attempt(&inner).await {
            inner.terminate(TerminationCause::UnknownError, Some(e));
            return;
        }
        if inner.is_terminated() {
            return;
        }

        let attempt = lock(&inner.shared).attempt;
        if attempt >= inner.config.max_retries {
            inner.terminate(TerminationCause::RetryLimitExceeded, None);
            return;
        }

        let delay = inner.config.delay.delay_for(attempt);
        lock(&inner.shared).attempt = attempt + 1;

        #[cfg(feature = "tracing")]
        tracing::debug!(attempt, ?delay, "scheduling reconnect");

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = inner.cancel.cancelled() => return,
        }
    }
}

/// One attempt: factory, watchdog, lifecycle. Recoverable per-attempt
/// failures come back as `Ok` after the close event; only faults outside
/// the attempt scope (providers, invalid endpoint) return `Err`.
async fn run_attempt(inner: &Arc<Inner>) -> Result<()> {
    let endpoint = inner.url.resolve()?;
    validate_endpoint(&endpoint)?;
    let protocols = inner.protocols.resolve()?;

    let (conn, mut events) = inner.transport.connect(&endpoint, &protocols)?;

    // Apply the decoding preference before the connection becomes visible,
    // so no message can arrive with the wrong mode.
    let binary_type = lock(&inner.shared).binary_type;
    conn.set_binary_type(binary_type);

    {
        let mut shared = lock(&inner.shared);
        if shared.terminated.is_some() {
            drop(shared);
            conn.close(NORMAL_CLOSE_CODE, "");
            return Ok(());
        }
        shared.conn = Some(Arc::clone(&conn));
    }

    let watchdog = inner
        .config
        .connect_timeout
        .map(|timeout| Watchdog::arm(Arc::clone(&conn), timeout));

    await_lifecycle(inner, &conn, &mut events, watchdog).await;

    let mut shared = lock(&inner.shared);
    if shared.terminated.is_none() {
        shared.conn = None;
    }
    Ok(())
}

/// Independent per-attempt timer that force-closes a connection still in the
/// connecting state at the deadline. Aborted, not merely ignored, once the
/// attempt leaves that state, so a stale timer can never fire against a
/// later attempt.
struct Watchdog {
    handle: JoinHandle<()>,
    fired: oneshot::Receiver<()>,
}

impl Watchdog {
    fn arm(conn: Arc<dyn Connection>, timeout: Duration) -> Self {
        let (tx, fired) = oneshot::channel();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if conn.ready_state() == ReadyState::Connecting {
                conn.close(TIMEOUT_CLOSE_CODE, "connection timed out");
                drop(tx.send(()));
            }
        });
        Self { handle, fired }
    }

    fn disarm(&self) {
        self.handle.abort();
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

enum Step {
    Event(Option<TransportEvent>),
    TimedOut,
    WatchdogDone,
}

/// Await one connection's life: translate its notifications into public
/// events and resolve exactly when its close fires, naturally or
/// synthesized. Dropping the receiver on return detaches this attempt, so a
/// late natural close after a synthesized one goes nowhere.
async fn await_lifecycle(
    inner: &Arc<Inner>,
    conn: &Arc<dyn Connection>,
    events: &mut TransportEvents,
    mut watchdog: Option<Watchdog>,
) {
    loop {
        let step = match watchdog.as_mut() {
            Some(active) => tokio::select! {
                event = events.recv() => Step::Event(event),
                fired = &mut active.fired => match fired {
                    Ok(()) => Step::TimedOut,
                    Err(_) => Step::WatchdogDone,
                },
            },
            None => Step::Event(events.recv().await),
        };

        match step {
            Step::WatchdogDone => {
                // The timer ran out after the attempt had already left the
                // connecting state; nothing to enforce.
                watchdog = None;
            }
            Step::TimedOut => {
                // The watchdog force-closed the connection. Give the natural
                // close notification a grace window, then synthesize one;
                // some transports never emit a close for a connection closed
                // while still connecting.
                let close = tokio::time::timeout(CLOSE_GRACE, wait_for_close(events))
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or(CloseEvent {
                        code: TIMEOUT_CLOSE_CODE,
                        reason: "connection timed out".to_owned(),
                        was_clean: false,
                    });
                inner.emit(&Event::Close(close));
                return;
            }
            Step::Event(None) => {
                // Transport dropped its channel without a close; synthesize
                // an abnormal one so the attempt still resolves exactly once.
                inner.emit(&Event::Close(CloseEvent {
                    code: ABNORMAL_CLOSE_CODE,
                    reason: "transport channel closed".to_owned(),
                    was_clean: false,
                }));
                return;
            }
            Step::Event(Some(TransportEvent::Open { protocol })) => {
                if let Some(active) = watchdog.take() {
                    active.disarm();
                }
                lock(&inner.shared).attempt = 0;
                match flush_buffer(inner, conn) {
                    FlushOutcome::Flushed => {
                        inner.emit(&Event::Open(OpenEvent { protocol }));
                    }
                    FlushOutcome::Failed => {
                        // The sent prefix is already off the buffer; close
                        // so the next attempt delivers the suffix. No open
                        // event for this attempt.
                        conn.close(FLUSH_FAILURE_CLOSE_CODE, "outbound replay failed");
                    }
                }
            }
            Step::Event(Some(TransportEvent::Message(data))) => {
                inner.emit(&Event::Message(MessageEvent {
                    data,
                    origin: conn.url(),
                }));
            }
            Step::Event(Some(TransportEvent::Error { message })) => {
                inner.emit(&Event::Error(ErrorEvent { message }));
            }
            Step::Event(Some(TransportEvent::Close {
                code,
                reason,
                was_clean,
            })) => {
                if let Some(active) = watchdog.take() {
                    active.disarm();
                }
                inner.emit(&Event::Close(CloseEvent {
                    code,
                    reason,
                    was_clean,
                }));
                return;
            }
        }
    }
}

/// Drain the event stream until its close notification, discarding
/// everything else; used after a forced close has already failed the
/// attempt.
async fn wait_for_close(events: &mut TransportEvents) -> Option<CloseEvent> {
    while let Some(event) = events.recv().await {
        if let TransportEvent::Close {
            code,
            reason,
            was_clean,
        } = event
        {
            return Some(CloseEvent {
                code,
                reason,
                was_clean,
            });
        }
    }
    None
}

enum FlushOutcome {
    Flushed,
    Failed,
}

/// Replay the outbound buffer in FIFO order, one payload at a time. Each
/// entry leaves the buffer only after its send succeeded, so a mid-flush
/// failure preserves exactly the unsent suffix.
fn flush_buffer(inner: &Arc<Inner>, conn: &Arc<dyn Connection>) -> FlushOutcome {
    loop {
        let next = lock(&inner.shared).buffer.front();
        let Some(message) = next else {
            return FlushOutcome::Flushed;
        };
        match conn.send(message) {
            Ok(()) => {
                lock(&inner.shared).buffer.pop_front();
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    pending = lock(&inner.shared).buffer.len(),
                    error = %_e,
                    "outbound replay failed; retrying the suffix on the next attempt"
                );
                return FlushOutcome::Failed;
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
