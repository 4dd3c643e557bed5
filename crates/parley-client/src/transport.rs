//! WebSocket transport for the client.
//!
//! A thin layer that moves text frames: every protocol decision stays in the
//! Sans-IO [`parley_sync::SyncEngine`]. Each [`Transport::open`] spawns a
//! reader task that performs the handshake, hands the write half back, and
//! forwards frames over a channel. Events are tagged with the generation of
//! the connection that produced them, so frames from a torn-down connection
//! never reach the engine.

use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use parley_core::ConnectionError;
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream,
    tungstenite::{Error as WsError, Message},
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Transport outcome reported to the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Handshake completed; writes are possible
    Opened,
    /// Text frame
    Text(String),
    /// Binary frame
    Binary(Vec<u8>),
    /// Answer to our ping
    Pong,
    /// Peer closed the connection
    Closed,
    /// Handshake or read failed
    Failed(ConnectionError),
}

enum ReaderEvent {
    Opened(WsSink),
    Frame(TransportEvent),
}

struct Tagged {
    generation: u64,
    event: ReaderEvent,
}

/// Single WebSocket connection slot.
pub struct Transport {
    generation: u64,
    sink: Option<WsSink>,
    reader: Option<JoinHandle<()>>,
    events_tx: mpsc::UnboundedSender<Tagged>,
    events_rx: mpsc::UnboundedReceiver<Tagged>,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport {
    /// Empty slot; nothing is connected.
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self { generation: 0, sink: None, reader: None, events_tx, events_rx }
    }

    /// Whether writes are possible.
    pub fn is_open(&self) -> bool {
        self.sink.is_some()
    }

    /// Start connecting to `url`, replacing any current connection.
    pub fn open(&mut self, url: String) {
        self.abandon();
        let generation = self.generation;
        let events = self.events_tx.clone();
        tracing::debug!(generation, "opening transport");
        self.reader = Some(tokio::spawn(run_reader(url, generation, events)));
    }

    /// Tear down the current connection, sending a close frame if open.
    pub async fn close(&mut self) {
        let sink = self.sink.take();
        self.abandon();
        if let Some(mut sink) = sink
            && let Err(error) = sink.close().await
        {
            tracing::debug!(%error, "close frame not delivered");
        }
    }

    /// Write a text frame.
    pub async fn send_text(&mut self, text: String) -> Result<(), ConnectionError> {
        self.write(Message::Text(text.into())).await
    }

    /// Write a ping frame.
    pub async fn send_ping(&mut self) -> Result<(), ConnectionError> {
        self.write(Message::Ping(Vec::new().into())).await
    }

    /// Next event of the current connection. Stale events are skipped.
    ///
    /// Cancel safe.
    pub async fn recv(&mut self) -> TransportEvent {
        loop {
            let Some(tagged) = self.events_rx.recv().await else {
                return TransportEvent::Closed;
            };
            if let Some(event) = self.accept(tagged) {
                return event;
            }
        }
    }

    fn accept(&mut self, tagged: Tagged) -> Option<TransportEvent> {
        if tagged.generation != self.generation {
            tracing::trace!(stale = tagged.generation, current = self.generation, "dropping stale event");
            return None;
        }

        match tagged.event {
            ReaderEvent::Opened(sink) => {
                self.sink = Some(sink);
                Some(TransportEvent::Opened)
            },
            ReaderEvent::Frame(event) => {
                if matches!(event, TransportEvent::Closed | TransportEvent::Failed(_)) {
                    self.sink = None;
                    self.reader = None;
                }
                Some(event)
            },
        }
    }

    async fn write(&mut self, message: Message) -> Result<(), ConnectionError> {
        let Some(sink) = self.sink.as_mut() else {
            return Err(ConnectionError::Closed);
        };
        sink.send(message).await.map_err(map_error)
    }

    /// Invalidate the current generation and stop its reader.
    fn abandon(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.sink = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

async fn run_reader(url: String, generation: u64, events: mpsc::UnboundedSender<Tagged>) {
    let send = |event: ReaderEvent| events.send(Tagged { generation, event }).is_ok();

    let stream = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(error) => {
            let error = map_error(error);
            tracing::warn!(%error, "handshake failed");
            send(ReaderEvent::Frame(TransportEvent::Failed(error)));
            return;
        },
    };

    let (sink, stream) = stream.split();
    if !send(ReaderEvent::Opened(sink)) {
        return;
    }

    let last = forward_frames(stream, &send).await;
    send(ReaderEvent::Frame(last));
}

/// Forward frames until the stream ends. Returns the terminal event.
async fn forward_frames(
    mut stream: SplitStream<WsStream>,
    send: &impl Fn(ReaderEvent) -> bool,
) -> TransportEvent {
    while let Some(frame) = stream.next().await {
        let event = match frame {
            Ok(Message::Text(text)) => TransportEvent::Text(text.as_str().to_owned()),
            Ok(Message::Binary(bytes)) => TransportEvent::Binary(bytes.to_vec()),
            Ok(Message::Pong(_)) => TransportEvent::Pong,
            Ok(Message::Close(frame)) => {
                tracing::debug!(?frame, "peer closed");
                return TransportEvent::Closed;
            },
            // Pings are answered by tungstenite
            Ok(Message::Ping(_) | Message::Frame(_)) => continue,
            Err(error) => return TransportEvent::Failed(map_error(error)),
        };
        if !send(ReaderEvent::Frame(event)) {
            return TransportEvent::Closed;
        }
    }
    TransportEvent::Closed
}

/// Map a WebSocket error onto the connection error taxonomy.
///
/// A 401/403 handshake response means the token was rejected.
pub fn map_error(error: WsError) -> ConnectionError {
    match error {
        WsError::Http(response) => {
            let status = response.status();
            if matches!(status.as_u16(), 401 | 403) {
                ConnectionError::AuthRejected(format!("handshake rejected with {status}"))
            } else {
                ConnectionError::Transport(format!("handshake failed with {status}"))
            }
        },
        WsError::Io(error) => ConnectionError::from(error),
        WsError::ConnectionClosed | WsError::AlreadyClosed => ConnectionError::Closed,
        WsError::Url(error) => ConnectionError::InvalidEndpoint(error.to_string()),
        other => ConnectionError::Transport(other.to_string()),
    }
}
