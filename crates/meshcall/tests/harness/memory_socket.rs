//! In-memory signaling transport
//!
//! `MemoryConnector` hands the client side of each dial to the socket under
//! test and the server side ([`ServerEnd`]) to the test.

use async_trait::async_trait;
use futures::channel::mpsc as chan;
use futures::{SinkExt, StreamExt};
use meshcall::signaling::{Connector, FrameSink, FrameStream, SignalingMessage, SignalingSink};
use meshcall::{Error, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// Server side of one in-memory connection
pub struct ServerEnd {
    incoming: chan::UnboundedReceiver<String>,
    outgoing: chan::UnboundedSender<String>,
}

impl ServerEnd {
    /// Next frame written by the client
    pub async fn recv(&mut self) -> Option<Value> {
        let text = tokio::time::timeout(Duration::from_secs(5), self.incoming.next())
            .await
            .ok()??;
        serde_json::from_str(&text).ok()
    }

    /// Frame written by the client, if one is already buffered
    pub fn try_recv(&mut self) -> Option<Value> {
        let text = self.incoming.try_next().ok()??;
        serde_json::from_str(&text).ok()
    }

    pub fn send(&self, frame: &Value) {
        let _ = self.outgoing.unbounded_send(frame.to_string());
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.outgoing.unbounded_send(text.to_string());
    }
}

/// Connector over in-memory channels
pub struct MemoryConnector {
    ends: mpsc::UnboundedSender<ServerEnd>,
    attempts: AtomicUsize,
    refuse: AtomicBool,
}

impl MemoryConnector {
    /// Returns the connector and the stream of accepted server ends
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerEnd>) {
        let (ends, rx) = mpsc::unbounded_channel();
        (
            Self {
                ends,
                attempts: AtomicUsize::new(0),
                refuse: AtomicBool::new(false),
            },
            rx,
        )
    }

    /// Fail every dial while set
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<(FrameSink, FrameStream)> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::WebSocketError("connection refused".to_string()));
        }

        let (client_tx, server_rx) = chan::unbounded::<String>();
        let (server_tx, client_rx) = chan::unbounded::<String>();

        self.ends
            .send(ServerEnd {
                incoming: server_rx,
                outgoing: server_tx,
            })
            .map_err(|_| Error::WebSocketError("test dropped the server side".to_string()))?;

        let sink: FrameSink =
            Box::pin(client_tx.sink_map_err(|e| Error::WebSocketError(e.to_string())));
        let stream: FrameStream = Box::pin(client_rx.map(Ok));
        Ok((sink, stream))
    }
}

/// Wait for the next dial to reach the connector
pub async fn accept(ends: &mut mpsc::UnboundedReceiver<ServerEnd>) -> ServerEnd {
    tokio::time::timeout(Duration::from_secs(5), ends.recv())
        .await
        .expect("no connection within 5s")
        .expect("connector dropped")
}

/// Signaling sink that records outbound envelopes
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<SignalingMessage>>,
    offline: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report frames as queued instead of delivered
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Drain recorded envelopes
    pub fn take(&self) -> Vec<SignalingMessage> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn sent(&self) -> Vec<SignalingMessage> {
        self.sent.lock().clone()
    }
}

impl SignalingSink for RecordingSink {
    fn send_signal(&self, msg: &SignalingMessage) -> bool {
        self.sent.lock().push(msg.clone());
        !self.offline.load(Ordering::SeqCst)
    }
}
