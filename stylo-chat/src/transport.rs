//! Socket transports behind the connection manager.
//!
//! A [`Connector`] starts a connection and hands back a [`Transport`] used to
//! write frames and close. Everything the socket reports (open, frames,
//! errors, close) is pushed into an [`EventSink`] tagged with the owning
//! [`ConnectionId`], so the session can ignore events from connections it has
//! already released.
//!
//! - [`WsConnector`]: real WebSocket via tokio-tungstenite
//! - [`MemoryConnector`]: in-process transport driven by hand, for tests and
//!   headless embedding

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::error::ChatError;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// No close frame was received (abnormal closure).
pub const CLOSE_ABNORMAL: u16 = 1006;

/// How long a socket task waits for the peer's close reply after its handle
/// is dropped.
const CLOSE_LINGER: Duration = Duration::from_secs(2);

/// Identity of one opened connection within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Lifecycle events reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The socket is open and writable.
    Opened,
    /// A text frame arrived.
    Frame(String),
    /// A transport error. Does not by itself close the connection.
    Error(String),
    /// The socket closed.
    Closed { code: u16, reason: String },
}

/// Where transports report their events.
#[derive(Debug, Clone)]
pub struct EventSink {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<(ConnectionId, TransportEvent)>,
}

impl EventSink {
    pub fn new(id: ConnectionId, tx: mpsc::UnboundedSender<(ConnectionId, TransportEvent)>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Report an event. Returns `false` once the session is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send((self.id, event)).is_ok()
    }
}

/// Write half of an established (or establishing) connection.
pub trait Transport: Send {
    /// Queue a text frame for transmission.
    fn send_text(&mut self, frame: String) -> Result<(), ChatError>;

    /// Start closing the socket.
    fn close(&mut self, code: u16, reason: &str);
}

/// Starts connections.
pub trait Connector {
    /// Begin connecting to `uri`. Returns immediately; readiness is reported
    /// as [`TransportEvent::Opened`] on `events`.
    fn connect(&mut self, uri: &str, events: EventSink) -> Box<dyn Transport>;
}

// ───────────────────────────────────────────────────────────────────
// WebSocket transport
// ───────────────────────────────────────────────────────────────────

enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// Connector for real WebSocket endpoints.
///
/// `connect` spawns the socket task, so it must be called from inside a
/// tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&mut self, uri: &str, events: EventSink) -> Box<dyn Transport> {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_socket(uri.to_string(), outgoing_rx, events));
        Box::new(WsTransport { outgoing: outgoing_tx })
    }
}

struct WsTransport {
    outgoing: mpsc::UnboundedSender<Outbound>,
}

impl Transport for WsTransport {
    fn send_text(&mut self, frame: String) -> Result<(), ChatError> {
        self.outgoing
            .send(Outbound::Text(frame))
            .map_err(|_| ChatError::Transport("socket task has stopped".into()))
    }

    fn close(&mut self, code: u16, reason: &str) {
        let _ = self.outgoing.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

/// Socket task: one per connection.
///
/// Ends when the peer closes or the socket fails. A dropped transport handle
/// ends it once the peer answers the close, or after [`CLOSE_LINGER`].
async fn run_socket(
    uri: String,
    mut outgoing: mpsc::UnboundedReceiver<Outbound>,
    events: EventSink,
) {
    let ws_stream = match tokio_tungstenite::connect_async(uri.as_str()).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            log::warn!("{}: connect to {uri} failed: {e}", events.id());
            events.emit(TransportEvent::Error(e.to_string()));
            events.emit(TransportEvent::Closed {
                code: CLOSE_ABNORMAL,
                reason: "connect failed".into(),
            });
            return;
        }
    };
    log::debug!("{}: socket open", events.id());
    events.emit(TransportEvent::Opened);

    let (mut writer, mut reader) = ws_stream.split();
    let mut close_sent = false;
    let mut linger: Option<Instant> = None;
    loop {
        tokio::select! {
            out = outgoing.recv(), if linger.is_none() => match out {
                Some(Outbound::Text(frame)) if !close_sent => {
                    if let Err(e) = writer.send(WsMessage::Text(frame.into())).await {
                        events.emit(TransportEvent::Error(e.to_string()));
                    }
                }
                Some(Outbound::Text(_)) => {
                    log::debug!("{}: dropping frame queued after close", events.id());
                }
                Some(Outbound::Close { code, reason }) => {
                    if !close_sent {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        let _ = writer.send(WsMessage::Close(Some(frame))).await;
                        close_sent = true;
                    }
                }
                None => {
                    // Handle dropped. Close unless `close()` already did, then
                    // give the peer a moment to answer.
                    if !close_sent {
                        let _ = writer.send(WsMessage::Close(None)).await;
                        close_sent = true;
                    }
                    linger = Some(Instant::now() + CLOSE_LINGER);
                }
            },
            _ = time::sleep_until(linger.unwrap_or_else(Instant::now)), if linger.is_some() => {
                log::debug!("{}: no close reply from peer", events.id());
                break;
            }
            incoming = reader.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    events.emit(TransportEvent::Frame(text.as_str().to_owned()));
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.as_str().to_owned()))
                        .unwrap_or((CLOSE_NORMAL, String::new()));
                    events.emit(TransportEvent::Closed { code, reason });
                    // Push out the close reply queued by the protocol layer.
                    let _ = writer.flush().await;
                    break;
                }
                Some(Ok(WsMessage::Binary(data))) => {
                    log::debug!("{}: ignoring {}-byte binary frame", events.id(), data.len());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    events.emit(TransportEvent::Error(e.to_string()));
                    events.emit(TransportEvent::Closed {
                        code: CLOSE_ABNORMAL,
                        reason: String::new(),
                    });
                    break;
                }
                None => {
                    events.emit(TransportEvent::Closed {
                        code: CLOSE_ABNORMAL,
                        reason: "stream ended".into(),
                    });
                    break;
                }
            },
        }
    }
    log::debug!("{}: socket task finished", events.id());
}

// ───────────────────────────────────────────────────────────────────
// In-memory transport
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct LinkState {
    sent: Vec<String>,
    close_calls: usize,
    close_frame: Option<(u16, String)>,
}

/// Test-side handle of one in-memory connection.
///
/// Drives the connection's lifecycle by hand and records what the client
/// wrote.
#[derive(Debug, Clone)]
pub struct MemoryLink {
    uri: String,
    sink: EventSink,
    state: Arc<Mutex<LinkState>>,
}

impl MemoryLink {
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn id(&self) -> ConnectionId {
        self.sink.id()
    }

    /// Report the socket as open.
    pub fn open(&self) {
        self.sink.emit(TransportEvent::Opened);
    }

    /// Deliver an inbound text frame.
    pub fn deliver(&self, frame: impl Into<String>) {
        self.sink.emit(TransportEvent::Frame(frame.into()));
    }

    /// Report a transport error.
    pub fn fail(&self, error: impl Into<String>) {
        self.sink.emit(TransportEvent::Error(error.into()));
    }

    /// Close from the server side.
    pub fn close_remote(&self, code: u16, reason: impl Into<String>) {
        self.sink.emit(TransportEvent::Closed {
            code,
            reason: reason.into(),
        });
    }

    /// Frames written by the client, in order.
    pub fn sent(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }

    /// How many times the client closed this transport.
    pub fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }

    /// Code and reason of the client's close, if any.
    pub fn close_frame(&self) -> Option<(u16, String)> {
        self.state.lock().close_frame.clone()
    }
}

/// Connector producing in-memory transports.
///
/// Clones share the same link list, so a test can keep one clone while the
/// session owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    links: Arc<Mutex<Vec<MemoryLink>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every link created so far, oldest first.
    pub fn links(&self) -> Vec<MemoryLink> {
        self.links.lock().clone()
    }

    pub fn last_link(&self) -> Option<MemoryLink> {
        self.links.lock().last().cloned()
    }
}

impl Connector for MemoryConnector {
    fn connect(&mut self, uri: &str, events: EventSink) -> Box<dyn Transport> {
        let state = Arc::new(Mutex::new(LinkState::default()));
        self.links.lock().push(MemoryLink {
            uri: uri.to_string(),
            sink: events,
            state: state.clone(),
        });
        Box::new(MemoryTransport { state })
    }
}

struct MemoryTransport {
    state: Arc<Mutex<LinkState>>,
}

impl Transport for MemoryTransport {
    fn send_text(&mut self, frame: String) -> Result<(), ChatError> {
        self.state.lock().sent.push(frame);
        Ok(())
    }

    fn close(&mut self, code: u16, reason: &str) {
        let mut state = self.state.lock();
        state.close_calls += 1;
        state.close_frame = Some((code, reason.to_string()));
    }
}
