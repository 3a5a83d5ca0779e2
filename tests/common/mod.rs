#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]
#![allow(
    unused,
    reason = "Not every test binary exercises every helper"
)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reconnecting_ws::error::{NotConnected, TransportClosed};
use reconnecting_ws::transport::{Connection, Transport, TransportEvent, TransportEvents};
use reconnecting_ws::{BinaryType, Event, Message, ReadyState};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

const CONNECTING: u8 = 0;
const OPEN: u8 = 1;
const CLOSED: u8 = 3;

/// Scripted behavior for one connection attempt.
#[derive(Clone, Copy, Debug)]
pub enum Plan {
    /// Open as soon as the attempt starts
    Open,
    /// Open, but reject outbound sends after the given number of accepted
    /// payloads
    OpenFailingSendsAfter(u32),
    /// Emit an abnormal close immediately, like a refused connection
    FailWith(u16),
    /// Stay in the connecting state until the test opens or closes it
    Manual,
}

/// Transport whose connections follow a per-attempt script, falling back to
/// one plan once the script runs out. Every created connection is retained
/// for inspection.
pub struct MockTransport {
    plans: Mutex<VecDeque<Plan>>,
    fallback: Plan,
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockTransport {
    pub fn scripted(plans: impl IntoIterator<Item = Plan>, fallback: Plan) -> Arc<Self> {
        Arc::new(Self {
            plans: Mutex::new(plans.into_iter().collect()),
            fallback,
            connections: Mutex::new(Vec::new()),
        })
    }

    pub fn always(plan: Plan) -> Arc<Self> {
        Self::scripted([], plan)
    }

    /// Number of attempts made so far.
    pub fn connects(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn connection(&self, index: usize) -> Arc<MockConnection> {
        Arc::clone(&self.connections.lock().unwrap()[index])
    }
}

impl Transport for MockTransport {
    fn connect(
        &self,
        url: &str,
        protocols: &[String],
    ) -> reconnecting_ws::Result<(Arc<dyn Connection>, TransportEvents)> {
        let plan = self
            .plans
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(MockConnection {
            url: url.to_owned(),
            protocol: protocols.first().cloned().unwrap_or_default(),
            state: AtomicU8::new(CONNECTING),
            sent: Mutex::new(Vec::new()),
            ok_sends_left: AtomicU32::new(u32::MAX),
            binary_type: Mutex::new(None),
            event_tx,
        });

        match plan {
            Plan::Open => conn.complete_open(),
            Plan::OpenFailingSendsAfter(n) => {
                conn.ok_sends_left.store(n, Ordering::SeqCst);
                conn.complete_open();
            }
            Plan::FailWith(code) => {
                conn.state.store(CLOSED, Ordering::SeqCst);
                drop(conn.event_tx.send(TransportEvent::Close {
                    code,
                    reason: "connection refused".to_owned(),
                    was_clean: false,
                }));
            }
            Plan::Manual => {}
        }

        self.connections.lock().unwrap().push(Arc::clone(&conn));
        Ok((conn, event_rx))
    }
}

pub struct MockConnection {
    url: String,
    protocol: String,
    state: AtomicU8,
    sent: Mutex<Vec<Message>>,
    ok_sends_left: AtomicU32,
    binary_type: Mutex<Option<BinaryType>>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl MockConnection {
    /// Transition a `Manual` connection to open.
    pub fn complete_open(&self) {
        self.state.store(OPEN, Ordering::SeqCst);
        drop(self.event_tx.send(TransportEvent::Open {
            protocol: self.protocol.clone(),
        }));
    }

    /// Simulate the peer delivering a payload.
    pub fn deliver(&self, message: Message) {
        drop(self.event_tx.send(TransportEvent::Message(message)));
    }

    /// Simulate the peer closing the connection cleanly.
    pub fn server_close(&self, code: u16) {
        if self.state.swap(CLOSED, Ordering::SeqCst) == CLOSED {
            return;
        }
        drop(self.event_tx.send(TransportEvent::Close {
            code,
            reason: String::new(),
            was_clean: true,
        }));
    }

    /// Everything accepted by [`Connection::send`] so far.
    pub fn sent_messages(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }

    /// The binary-type preference applied to this connection, if any.
    pub fn applied_binary_type(&self) -> Option<BinaryType> {
        *self.binary_type.lock().unwrap()
    }
}

impl Connection for MockConnection {
    fn ready_state(&self) -> ReadyState {
        match self.state.load(Ordering::SeqCst) {
            CONNECTING => ReadyState::Connecting,
            OPEN => ReadyState::Open,
            _ => ReadyState::Closed,
        }
    }

    fn url(&self) -> String {
        self.url.clone()
    }

    fn protocol(&self) -> String {
        if self.ready_state().is_open() {
            self.protocol.clone()
        } else {
            String::new()
        }
    }

    fn extensions(&self) -> String {
        String::new()
    }

    fn buffered_amount(&self) -> u64 {
        0
    }

    fn set_binary_type(&self, binary_type: BinaryType) {
        *self.binary_type.lock().unwrap() = Some(binary_type);
    }

    fn send(&self, message: Message) -> reconnecting_ws::Result<()> {
        if !self.ready_state().is_open() {
            return Err(NotConnected.into());
        }
        let left = self.ok_sends_left.load(Ordering::SeqCst);
        if left == 0 {
            return Err(TransportClosed.into());
        }
        if left != u32::MAX {
            self.ok_sends_left.store(left - 1, Ordering::SeqCst);
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    fn close(&self, code: u16, reason: &str) {
        if self.state.swap(CLOSED, Ordering::SeqCst) == CLOSED {
            return;
        }
        drop(self.event_tx.send(TransportEvent::Close {
            code,
            reason: reason.to_owned(),
            was_clean: false,
        }));
    }
}

/// Receive the next event or panic after two seconds.
pub async fn next_event(events: &mut broadcast::Receiver<Event>) -> Event {
    timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Collect events until (and including) the terminated event.
pub async fn collect_until_terminated(events: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut collected = Vec::new();
    loop {
        let event = next_event(events).await;
        let done = matches!(event, Event::Terminated(_));
        collected.push(event);
        if done {
            return collected;
        }
    }
}
