//! Call session actor
//!
//! A single task owns the [`MeshManager`] and multiplexes every input onto it:
//! inbound signaling frames, connection and timer events, local media changes
//! and commands from [`CallHandle`]s. After each step it republishes the
//! [`CallSnapshot`].

use crate::config::MeshCallConfig;
use crate::media::LocalMediaState;
use crate::peer::lifecycle::RecoveryPolicy;
use crate::peer::{CallSnapshot, MeshEvent, MeshManager, PeerFactory, SessionContext, WebRtcPeerFactory};
use crate::signaling::protocol::{ChatMessage, InboundFrame};
use crate::signaling::socket::{Connector, SignalingSocket, SocketStatus, WebSocketConnector};
use crate::{Error, Result};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

enum Command {
    StartCall {
        target: Option<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    EndCall {
        reply: oneshot::Sender<()>,
    },
    SendChat {
        text: String,
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running call session
///
/// Cheap to clone. Every method fails with [`Error::SessionClosed`] once the
/// session task has stopped.
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<CallSnapshot>,
    chat: watch::Receiver<Vec<ChatMessage>>,
    status: watch::Receiver<SocketStatus>,
}

impl CallHandle {
    /// Offer to one peer, or to every roster peer we initiate with
    pub async fn start_call(&self, target: Option<&str>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::StartCall {
            target: target.map(str::to_string),
            reply,
        })?;
        rx.await.map_err(|_| closed())?
    }

    /// Leave the call, closing every peer connection
    pub async fn end_call(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::EndCall { reply })?;
        rx.await.map_err(|_| closed())
    }

    /// Post a chat message to the room
    ///
    /// Returns `true` if the frame went out on an open socket; `false` if the
    /// text was blank or the frame was queued for the next reconnect.
    pub async fn send_chat(&self, text: &str) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::SendChat {
            text: text.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| closed())
    }

    /// End the call, close the signaling socket and stop the session task
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Shutdown { reply })?;
        rx.await.map_err(|_| closed())
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    /// Chat log in arrival order, de-duplicated by message id
    pub fn chat_log(&self) -> Vec<ChatMessage> {
        self.chat.borrow().clone()
    }

    pub fn subscribe_chat(&self) -> watch::Receiver<Vec<ChatMessage>> {
        self.chat.clone()
    }

    pub fn signaling_status(&self) -> SocketStatus {
        self.status.borrow().clone()
    }

    fn request(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| closed())
    }
}

fn closed() -> Error {
    Error::SessionClosed
}

/// Call session task state
pub struct CallSession {
    manager: MeshManager,
    socket: SignalingSocket,
    inbound: mpsc::UnboundedReceiver<Value>,
    events: mpsc::UnboundedReceiver<MeshEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    media: watch::Receiver<LocalMediaState>,
    snapshot_tx: watch::Sender<CallSnapshot>,
    chat_tx: watch::Sender<Vec<ChatMessage>>,
    seen_chat: HashSet<String>,
    display_name: String,
}

impl CallSession {
    /// Join the configured room over WebSocket with real peer connections
    pub fn websocket(
        config: &MeshCallConfig,
        media: watch::Receiver<LocalMediaState>,
    ) -> Result<CallHandle> {
        let url = config.room_socket_url()?;
        Self::spawn(
            config,
            Arc::new(WebRtcPeerFactory::new(config.clone())),
            Arc::new(WebSocketConnector::new(url)),
            media,
        )
    }

    /// Start the session task and dial the signaling channel
    pub fn spawn(
        config: &MeshCallConfig,
        factory: Arc<dyn PeerFactory>,
        connector: Arc<dyn Connector>,
        media: watch::Receiver<LocalMediaState>,
    ) -> Result<CallHandle> {
        config.validate()?;

        let (socket, inbound) =
            SignalingSocket::new(connector, config.options.signaling_reconnect_delay());
        let (manager, events) = MeshManager::new(
            SessionContext::new(&config.room_id, &config.display_name),
            factory,
            Arc::new(socket.clone()),
            RecoveryPolicy::from(&config.options),
        );

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot) = watch::channel(manager.snapshot());
        let (chat_tx, chat) = watch::channel(Vec::new());
        let status = socket.subscribe_status();

        let session = CallSession {
            manager,
            socket: socket.clone(),
            inbound,
            events,
            commands,
            media,
            snapshot_tx,
            chat_tx,
            seen_chat: HashSet::new(),
            display_name: config.display_name.clone(),
        };

        tokio::spawn(session.run());
        socket.connect();

        info!(
            "Joining room {} as {}",
            config.room_id, config.display_name
        );

        Ok(CallHandle {
            commands: commands_tx,
            snapshot,
            chat,
            status,
        })
    }

    async fn run(mut self) {
        let initial = self.media.borrow_and_update().effective_stream();
        self.manager.set_local_stream(initial).await;
        self.publish();

        let mut media_open = true;

        loop {
            tokio::select! {
                Some(frame) = self.inbound.recv() => {
                    self.on_frame(frame).await;
                }
                Some(event) = self.events.recv() => {
                    self.manager.handle_event(event).await;
                }
                changed = self.media.changed(), if media_open => {
                    if changed.is_err() {
                        debug!("Local media source dropped");
                        media_open = false;
                        continue;
                    }
                    let stream = self.media.borrow_and_update().effective_stream();
                    self.manager.set_local_stream(stream).await;
                }
                command = self.commands.recv() => {
                    match command {
                        Some(command) => {
                            if !self.on_command(command).await {
                                break;
                            }
                        }
                        None => {
                            // Every handle dropped
                            self.stop().await;
                            break;
                        }
                    }
                }
            }

            self.publish();
        }

        self.publish();
        info!("Call session stopped");
    }

    async fn on_frame(&mut self, frame: Value) {
        match InboundFrame::from_value(frame) {
            Ok(InboundFrame::Signal(msg)) => {
                if let Err(e) = self.manager.handle_signaling(msg).await {
                    error!("Failed to apply signaling message: {}", e);
                }
            }
            Ok(InboundFrame::Chat(chat)) => self.record_chat(chat),
            Err(e) => warn!("Dropping malformed frame: {}", e),
        }
    }

    /// Returns false when the session should stop
    async fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::StartCall { target, reply } => {
                let result = self.manager.start_call(target.as_deref()).await;
                let _ = reply.send(result);
            }
            Command::EndCall { reply } => {
                self.manager.end_call().await;
                let _ = reply.send(());
            }
            Command::SendChat { text, reply } => {
                let _ = reply.send(self.send_chat(&text));
            }
            Command::Shutdown { reply } => {
                self.stop().await;
                self.publish();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn send_chat(&mut self, text: &str) -> bool {
        let Some(chat) = ChatMessage::compose(&self.display_name, text) else {
            return false;
        };

        let frame = match chat.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping chat message: {}", e);
                return false;
            }
        };

        let sent = self.socket.send(&frame);
        if !sent {
            debug!("Chat message queued until signaling reconnects");
        }
        self.record_chat(chat);
        sent
    }

    fn record_chat(&mut self, chat: ChatMessage) {
        if !self.seen_chat.insert(chat.id.clone()) {
            debug!("Ignoring duplicate chat message {}", chat.id);
            return;
        }
        self.chat_tx.send_modify(|log| log.push(chat));
    }

    async fn stop(&mut self) {
        self.manager.end_call().await;
        self.socket.disconnect();
    }

    fn publish(&self) {
        let next = self.manager.snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}
