//! Reconnecting signaling socket
//!
//! Wraps a bidirectional text channel to the room's signaling endpoint.
//! Outbound frames sent while the channel is down are queued and flushed in
//! FIFO order once it reopens. While the session is wanted, every close
//! schedules a single redial after a fixed delay, indefinitely.

use super::protocol::SignalingMessage;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

/// Outbound half of an established channel
pub type FrameSink = Pin<Box<dyn Sink<String, Error = Error> + Send>>;

/// Inbound half of an established channel
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Opens the underlying channel
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<(FrameSink, FrameStream)>;
}

/// Connector dialing a WebSocket endpoint with tokio-tungstenite
pub struct WebSocketConnector {
    url: Url,
}

impl WebSocketConnector {
    pub fn new(url: Url) -> Self {
        Self { url }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<(FrameSink, FrameStream)> {
        info!("Connecting to signaling server: {}", self.url);

        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| Error::WebSocketError(format!("Failed to connect: {}", e)))?;

        let (write, read) = ws_stream.split();

        let sink = write
            .with(|text: String| {
                futures::future::ready(Ok::<_, tokio_tungstenite::tungstenite::Error>(
                    Message::Text(text),
                ))
            })
            .sink_map_err(|e: tokio_tungstenite::tungstenite::Error| {
                Error::WebSocketError(format!("Failed to send: {}", e))
            });

        let stream = read.filter_map(|msg| {
            futures::future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(bytes)) => Some(
                    String::from_utf8(bytes)
                        .map_err(|e| Error::WebSocketError(format!("Non UTF-8 frame: {}", e))),
                ),
                Ok(_) => None,
                Err(e) => Some(Err(Error::WebSocketError(e.to_string()))),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

/// Observable socket status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketStatus {
    /// Never connected, or explicitly disconnected
    Idle,
    /// Dial in progress
    Connecting,
    /// Channel open, queue flushed
    Open,
    /// Channel closed; a redial may be pending
    Closed,
    /// Transient connection error; reconnection continues
    Error(String),
}

enum Phase {
    Idle,
    Connecting,
    Open { writer: mpsc::UnboundedSender<String> },
    Closed,
}

struct SocketState {
    phase: Phase,
    queue: VecDeque<String>,
    wanted: bool,
    /// Bumped by every dial and by disconnect; tasks from older dials are ignored
    epoch: u64,
    receiver: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    dials: u64,
}

struct Shared {
    connector: Arc<dyn Connector>,
    reconnect_delay: Duration,
    state: Mutex<SocketState>,
    status_tx: watch::Sender<SocketStatus>,
    inbound_tx: mpsc::UnboundedSender<Value>,
}

/// Reconnecting, queuing signaling socket
///
/// Cheap to clone; all clones drive the same channel.
#[derive(Clone)]
pub struct SignalingSocket {
    shared: Arc<Shared>,
}

impl SignalingSocket {
    /// Create a socket over `connector`
    ///
    /// Returns the socket and the receiver of decoded inbound JSON frames.
    /// Nothing is dialed until [`connect`](Self::connect) is called.
    pub fn new(
        connector: Arc<dyn Connector>,
        reconnect_delay: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<Value>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(SocketStatus::Idle);

        let shared = Arc::new(Shared {
            connector,
            reconnect_delay,
            state: Mutex::new(SocketState {
                phase: Phase::Idle,
                queue: VecDeque::new(),
                wanted: false,
                epoch: 0,
                receiver: None,
                reconnect_timer: None,
                dials: 0,
            }),
            status_tx,
            inbound_tx,
        });

        (Self { shared }, inbound_rx)
    }

    /// Socket dialing the room endpoint over WebSocket
    pub fn websocket(url: Url, reconnect_delay: Duration) -> (Self, mpsc::UnboundedReceiver<Value>) {
        Self::new(Arc::new(WebSocketConnector::new(url)), reconnect_delay)
    }

    /// Open the channel
    ///
    /// No-op while a channel is open or a dial is in progress.
    pub fn connect(&self) {
        Shared::connect(&self.shared);
    }

    /// Send a frame
    ///
    /// Returns `true` if the frame was handed to an open channel. `false`
    /// means it was queued and will be delivered after the next successful
    /// open, not that it was lost.
    pub fn send(&self, frame: &Value) -> bool {
        Shared::send(&self.shared, frame.to_string())
    }

    /// Close the channel and stop reconnecting
    ///
    /// Cancels any pending redial and discards queued frames.
    pub fn disconnect(&self) {
        let mut state = self.shared.state.lock();

        state.wanted = false;
        state.epoch += 1;
        if let Some(timer) = state.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(receiver) = state.receiver.take() {
            receiver.abort();
        }

        let dropped = state.queue.len();
        state.queue.clear();
        // Dropping the writer ends the sender task, which closes the sink
        state.phase = Phase::Idle;
        drop(state);

        info!("Signaling socket disconnected ({} queued frames dropped)", dropped);
        self.shared.status_tx.send_replace(SocketStatus::Idle);
    }

    /// Current status
    pub fn status(&self) -> SocketStatus {
        self.shared.status_tx.borrow().clone()
    }

    /// Subscribe to status changes
    pub fn subscribe_status(&self) -> watch::Receiver<SocketStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Whether a channel is currently open
    pub fn is_open(&self) -> bool {
        matches!(self.shared.state.lock().phase, Phase::Open { .. })
    }

    /// Number of frames waiting for the channel to open
    pub fn queued(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Number of dials started so far
    pub fn dial_count(&self) -> u64 {
        self.shared.state.lock().dials
    }

    /// Whether a redial timer is pending
    pub fn reconnect_pending(&self) -> bool {
        self.shared.state.lock().reconnect_timer.is_some()
    }
}

impl Shared {
    fn connect(this: &Arc<Self>) {
        let mut state = this.state.lock();

        if matches!(state.phase, Phase::Connecting | Phase::Open { .. }) {
            debug!("Signaling socket already open or connecting");
            return;
        }

        state.wanted = true;
        Self::dial(this, &mut state);
    }

    /// Start a dial; caller holds the lock and has checked the phase
    fn dial(this: &Arc<Self>, state: &mut SocketState) {
        if let Some(timer) = state.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(receiver) = state.receiver.take() {
            receiver.abort();
        }

        state.epoch += 1;
        state.dials += 1;
        state.phase = Phase::Connecting;
        this.status_tx.send_replace(SocketStatus::Connecting);

        let epoch = state.epoch;
        let shared = Arc::clone(this);
        state.receiver = Some(tokio::spawn(async move {
            match shared.connector.connect().await {
                Ok((sink, stream)) => {
                    if !Self::opened(&shared, epoch, sink) {
                        return;
                    }
                    Self::receiver_task(&shared, epoch, stream).await;
                    Self::closed(&shared, epoch, false);
                }
                Err(e) => {
                    warn!("Signaling connection failed: {}", e);
                    shared.status_tx.send_replace(SocketStatus::Error(e.to_string()));
                    Self::closed(&shared, epoch, false);
                }
            }
        }));
    }

    /// Install the writer and flush the queue. Returns false if the dial is stale.
    fn opened(this: &Arc<Self>, epoch: u64, sink: FrameSink) -> bool {
        let mut state = this.state.lock();
        if state.epoch != epoch || !state.wanted {
            debug!("Discarding stale signaling connection");
            return false;
        }

        let (writer, rx) = mpsc::unbounded_channel();
        let flushed = state.queue.len();
        for frame in state.queue.drain(..) {
            // rx is alive in this scope, send cannot fail
            let _ = writer.send(frame);
        }
        state.phase = Phase::Open { writer };
        drop(state);

        tokio::spawn(Self::sender_task(Arc::clone(this), epoch, sink, rx));

        info!("Signaling socket open ({} queued frames flushed)", flushed);
        this.status_tx.send_replace(SocketStatus::Open);
        true
    }

    /// Sender task: writes frames from the channel to the sink
    async fn sender_task(
        this: Arc<Self>,
        epoch: u64,
        mut sink: FrameSink,
        mut rx: mpsc::UnboundedReceiver<String>,
    ) {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sink.send(frame.clone()).await {
                warn!("Failed to send signaling frame, requeueing: {}", e);

                let mut unsent = vec![frame];
                while let Ok(next) = rx.try_recv() {
                    unsent.push(next);
                }
                Self::requeue(&this, epoch, unsent);
                Self::closed(&this, epoch, true);
                return;
            }
        }

        let _ = sink.close().await;
        debug!("Signaling sender task terminated");
    }

    /// Receiver task: decodes inbound frames until the stream ends
    async fn receiver_task(this: &Arc<Self>, epoch: u64, mut stream: FrameStream) {
        while let Some(item) = stream.next().await {
            match item {
                Ok(text) => match serde_json::from_str::<Value>(&text) {
                    Ok(value) => {
                        if this.state.lock().epoch != epoch {
                            break;
                        }
                        let _ = this.inbound_tx.send(value);
                    }
                    Err(e) => warn!("Dropping malformed signaling payload: {}", e),
                },
                Err(e) => {
                    warn!("Signaling channel error: {}", e);
                    this.status_tx.send_replace(SocketStatus::Error(e.to_string()));
                    break;
                }
            }
        }

        debug!("Signaling receiver task terminated");
    }

    fn requeue(this: &Arc<Self>, epoch: u64, unsent: Vec<String>) {
        let mut state = this.state.lock();
        if state.epoch != epoch {
            return;
        }
        for frame in unsent.into_iter().rev() {
            state.queue.push_front(frame);
        }
    }

    /// Mark the channel closed and schedule a redial if still wanted
    fn closed(this: &Arc<Self>, epoch: u64, abort_receiver: bool) {
        let mut state = this.state.lock();
        if state.epoch != epoch || matches!(state.phase, Phase::Closed | Phase::Idle) {
            return;
        }

        state.phase = Phase::Closed;
        let receiver = state.receiver.take();
        if abort_receiver {
            if let Some(receiver) = receiver {
                receiver.abort();
            }
        }

        if !matches!(*this.status_tx.borrow(), SocketStatus::Error(_)) {
            this.status_tx.send_replace(SocketStatus::Closed);
        }

        if state.wanted {
            Self::schedule_reconnect(this, &mut state);
        }
    }

    fn schedule_reconnect(this: &Arc<Self>, state: &mut SocketState) {
        if state.reconnect_timer.is_some() {
            return;
        }

        info!(
            "Signaling socket closed, reconnecting in {:?}",
            this.reconnect_delay
        );

        let shared = Arc::clone(this);
        let delay = this.reconnect_delay;
        state.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let mut state = shared.state.lock();
            // Detach our own handle so dial() does not abort this task
            state.reconnect_timer = None;
            if state.wanted && matches!(state.phase, Phase::Closed | Phase::Idle) {
                Self::dial(&shared, &mut state);
            }
        }));
    }

    fn send(this: &Arc<Self>, mut frame: String) -> bool {
        let mut state = this.state.lock();

        if let Phase::Open { writer } = &state.phase {
            match writer.send(frame) {
                Ok(()) => return true,
                Err(mpsc::error::SendError(unsent)) => frame = unsent,
            }
            // Sender task is gone
            state.phase = Phase::Closed;
        }

        state.queue.push_back(frame);
        debug!("Signaling frame queued ({} pending)", state.queue.len());

        if state.wanted && matches!(state.phase, Phase::Closed) {
            Self::dial(this, &mut state);
        }

        false
    }
}

/// Outbound path for signaling envelopes
pub trait SignalingSink: Send + Sync {
    /// Send an envelope; `false` means queued for later delivery
    fn send_signal(&self, msg: &SignalingMessage) -> bool;
}

impl SignalingSink for SignalingSocket {
    fn send_signal(&self, msg: &SignalingMessage) -> bool {
        match msg.to_value() {
            Ok(value) => self.send(&value),
            Err(e) => {
                warn!("Dropping unserializable signaling message: {}", e);
                false
            }
        }
    }
}
