//! Default transport backed by `tokio-tungstenite`.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::{SinkExt as _, StreamExt as _};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::handshake::client::{Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use super::{Connection, Transport, TransportEvent, TransportEvents};
use crate::Result;
use crate::error::{Error, NotConnected, TransportClosed};
use crate::types::{ABNORMAL_CLOSE_CODE, BinaryType, Message, ReadyState};

const STATE_CONNECTING: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_CLOSING: u8 = 2;
const STATE_CLOSED: u8 = 3;

#[derive(Debug)]
struct CloseCommand {
    code: u16,
    reason: String,
}

#[derive(Debug, Default)]
struct Negotiated {
    protocol: String,
    extensions: String,
}

/// WebSocket transport over `tokio_tungstenite::connect_async`.
///
/// Each [`Transport::connect`] call spawns one task that performs the
/// handshake and then drives the read/write halves of the socket, turning
/// frames into [`TransportEvent`]s. Closing while the handshake is still in
/// flight drops the handshake future and synthesizes the close notification,
/// since no frame will ever arrive for a connection that never opened.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteTransport;

impl Transport for TungsteniteTransport {
    fn connect(
        &self,
        url: &str,
        protocols: &[String],
    ) -> Result<(Arc<dyn Connection>, TransportEvents)> {
        let mut request = url.into_client_request()?;
        if !protocols.is_empty() {
            let joined = protocols.join(", ");
            let value =
                HeaderValue::from_str(&joined).map_err(|e| Error::validation(e.to_string()))?;
            request.headers_mut().insert("Sec-WebSocket-Protocol", value);
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = mpsc::unbounded_channel();

        let state = Arc::new(AtomicU8::new(STATE_CONNECTING));
        let negotiated = Arc::new(Mutex::new(Negotiated::default()));
        let buffered = Arc::new(AtomicU64::new(0));

        let conn = Arc::new(TungsteniteConnection {
            url: url.to_owned(),
            state: Arc::clone(&state),
            negotiated: Arc::clone(&negotiated),
            buffered: Arc::clone(&buffered),
            outbound_tx,
            close_tx,
        });

        let driver = ConnectionDriver {
            request,
            state,
            negotiated,
            buffered,
            event_tx,
            outbound_rx,
            close_rx,
        };
        tokio::spawn(driver.run());

        Ok((conn, event_rx))
    }
}

struct TungsteniteConnection {
    url: String,
    state: Arc<AtomicU8>,
    negotiated: Arc<Mutex<Negotiated>>,
    buffered: Arc<AtomicU64>,
    outbound_tx: mpsc::UnboundedSender<Message>,
    close_tx: mpsc::UnboundedSender<CloseCommand>,
}

impl Connection for TungsteniteConnection {
    fn ready_state(&self) -> ReadyState {
        decode_state(self.state.load(Ordering::SeqCst))
    }

    fn url(&self) -> String {
        self.url.clone()
    }

    fn protocol(&self) -> String {
        lock_negotiated(&self.negotiated).protocol.clone()
    }

    fn extensions(&self) -> String {
        lock_negotiated(&self.negotiated).extensions.clone()
    }

    fn buffered_amount(&self) -> u64 {
        self.buffered.load(Ordering::SeqCst)
    }

    fn set_binary_type(&self, _binary_type: BinaryType) {
        // Binary frames are always delivered as owned buffers here; the
        // preference only matters for transports with more than one binary
        // representation.
    }

    fn send(&self, message: Message) -> Result<()> {
        if !self.ready_state().is_open() {
            return Err(NotConnected.into());
        }
        self.buffered
            .fetch_add(message.len() as u64, Ordering::SeqCst);
        self.outbound_tx
            .send(message)
            .map_err(|_e| TransportClosed.into())
    }

    fn close(&self, code: u16, reason: &str) {
        // Ignored if the driver already exited; the connection is closed
        // either way.
        drop(self.close_tx.send(CloseCommand {
            code,
            reason: reason.to_owned(),
        }));
    }
}

fn decode_state(raw: u8) -> ReadyState {
    match raw {
        STATE_CONNECTING => ReadyState::Connecting,
        STATE_OPEN => ReadyState::Open,
        STATE_CLOSING => ReadyState::Closing,
        _ => ReadyState::Closed,
    }
}

fn lock_negotiated(negotiated: &Mutex<Negotiated>) -> std::sync::MutexGuard<'_, Negotiated> {
    negotiated.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

struct ConnectionDriver {
    request: Request,
    state: Arc<AtomicU8>,
    negotiated: Arc<Mutex<Negotiated>>,
    buffered: Arc<AtomicU64>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    outbound_rx: mpsc::UnboundedReceiver<Message>,
    close_rx: mpsc::UnboundedReceiver<CloseCommand>,
}

impl ConnectionDriver {
    async fn run(mut self) {
        let ws = tokio::select! {
            result = connect_async(self.request) => match result {
                Ok((ws, response)) => {
                    let protocol = header_str(&response, "Sec-WebSocket-Protocol");
                    {
                        let mut negotiated = lock_negotiated(&self.negotiated);
                        negotiated.protocol = protocol.clone();
                        negotiated.extensions = header_str(&response, "Sec-WebSocket-Extensions");
                    }
                    self.state.store(STATE_OPEN, Ordering::SeqCst);
                    drop(self.event_tx.send(TransportEvent::Open { protocol }));
                    ws
                }
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %e, "websocket handshake failed");
                    self.state.store(STATE_CLOSED, Ordering::SeqCst);
                    drop(self.event_tx.send(TransportEvent::Error {
                        message: e.to_string(),
                    }));
                    drop(self.event_tx.send(TransportEvent::Close {
                        code: ABNORMAL_CLOSE_CODE,
                        reason: e.to_string(),
                        was_clean: false,
                    }));
                    return;
                }
            },
            Some(cmd) = self.close_rx.recv() => {
                // Force-closed while still connecting: the handshake future
                // is dropped and the close notification synthesized.
                self.state.store(STATE_CLOSED, Ordering::SeqCst);
                drop(self.event_tx.send(TransportEvent::Close {
                    code: cmd.code,
                    reason: cmd.reason,
                    was_clean: false,
                }));
                return;
            }
        };

        let (mut sink, mut stream) = ws.split();
        let mut close_sent = false;
        let mut close_received = false;
        let mut result = (ABNORMAL_CLOSE_CODE, String::new(), false);

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        drop(self.event_tx.send(TransportEvent::Message(
                            Message::Text(text.as_str().to_owned()),
                        )));
                    }
                    Some(Ok(WsMessage::Binary(bytes))) => {
                        drop(self.event_tx.send(TransportEvent::Message(
                            Message::Binary(bytes.to_vec()),
                        )));
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        self.state.store(STATE_CLOSING, Ordering::SeqCst);
                        close_received = true;
                        result = match frame {
                            Some(f) => (u16::from(f.code), f.reason.as_str().to_owned(), true),
                            None => (1000, String::new(), true),
                        };
                        // tungstenite completes the close handshake; keep
                        // polling until the stream ends.
                    }
                    Some(Ok(_)) => {
                        // Ping/pong handled by tungstenite internally.
                    }
                    Some(Err(e)) => {
                        if !close_received && !close_sent {
                            drop(self.event_tx.send(TransportEvent::Error {
                                message: e.to_string(),
                            }));
                        }
                        break;
                    }
                    None => break,
                },
                Some(message) = self.outbound_rx.recv() => {
                    self.buffered.fetch_sub(message.len() as u64, Ordering::SeqCst);
                    let frame = match message {
                        Message::Text(text) => WsMessage::Text(text.into()),
                        Message::Binary(bytes) => WsMessage::Binary(bytes.into()),
                    };
                    if let Err(e) = sink.send(frame).await {
                        drop(self.event_tx.send(TransportEvent::Error {
                            message: e.to_string(),
                        }));
                        break;
                    }
                }
                Some(cmd) = self.close_rx.recv(), if !close_sent => {
                    close_sent = true;
                    self.state.store(STATE_CLOSING, Ordering::SeqCst);
                    result = (cmd.code, cmd.reason.clone(), false);
                    let frame = CloseFrame {
                        code: CloseCode::from(cmd.code),
                        reason: cmd.reason.into(),
                    };
                    // A send failure here just means the peer beat us to it.
                    drop(sink.send(WsMessage::Close(Some(frame))).await);
                }
            }
        }

        self.state.store(STATE_CLOSED, Ordering::SeqCst);
        let (code, reason, was_clean) = result;
        drop(self.event_tx.send(TransportEvent::Close {
            code,
            reason,
            was_clean,
        }));
    }
}

fn header_str(response: &Response, name: &str) -> String {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned()
}
