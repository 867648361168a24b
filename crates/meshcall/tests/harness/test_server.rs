//! Minimal WebSocket echo server on a random local port

use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use url::Url;

/// Echoes every text frame back to its sender
pub struct EchoServer {
    port: u16,
    connections: Arc<AtomicUsize>,
    kick: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl EchoServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind echo server");
        let port = listener.local_addr().expect("local addr").port();

        let connections = Arc::new(AtomicUsize::new(0));
        let (kick, _) = broadcast::channel(4);

        let accepted = Arc::clone(&connections);
        let kicker = kick.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, addr)) = listener.accept().await {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                accepted.fetch_add(1, Ordering::SeqCst);
                debug!("Echo server accepted {}", addr);

                let mut kicked = kicker.subscribe();
                tokio::spawn(async move {
                    let (mut write, mut read) = ws.split();
                    loop {
                        tokio::select! {
                            _ = kicked.recv() => {
                                let _ = write.close().await;
                                break;
                            }
                            msg = read.next() => match msg {
                                Some(Ok(Message::Text(text))) => {
                                    if write.send(Message::Text(text)).await.is_err() {
                                        break;
                                    }
                                }
                                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                                Some(Ok(_)) => {}
                            }
                        }
                    }
                });
            }
        });

        Self {
            port,
            connections,
            kick,
            task,
        }
    }

    pub fn url(&self) -> Url {
        Url::parse(&format!("ws://127.0.0.1:{}/api/rooms/test/ws", self.port)).expect("url")
    }

    /// Connections accepted so far
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Close every open connection from the server side
    pub fn kick_all(&self) {
        let _ = self.kick.send(());
    }

    pub fn shutdown(self) {
        self.task.abort();
    }
}
