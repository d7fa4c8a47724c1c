// WebSocket push server. Each connected client becomes a subscriber and
// receives one text frame per published sample.

use super::Broadcaster;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

/// Port subscribers connect to by default.
pub const DEFAULT_PUSH_PORT: u16 = 9000;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Outcome of binding the push listener.
pub enum PushServerStatus {
    Listening(PushServer),
    /// The port is taken, most likely by another relay instance.
    AlreadyRunning,
}

/// Running accept loop plus its subscriber sessions.
pub struct PushServer {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl PushServer {
    /// Bind `addr` and start accepting subscribers on the current runtime.
    pub async fn bind(
        addr: SocketAddr,
        broadcaster: Arc<Broadcaster>,
    ) -> io::Result<PushServerStatus> {
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                warn!(
                    "[PUSH] Port {} already bound - assuming a server is already running",
                    addr.port()
                );
                return Ok(PushServerStatus::AlreadyRunning);
            }
            Err(e) => return Err(e),
        };

        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!("[PUSH] Listening for subscribers on ws://{}", local_addr);
        let accept_task = tokio::spawn(accept_loop(listener, broadcaster, shutdown_rx));

        Ok(PushServerStatus::Listening(Self {
            local_addr,
            shutdown_tx,
            accept_task,
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, close every session and wait briefly for the loop.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);

        let mut accept_task = self.accept_task;
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut accept_task)
            .await
            .is_err()
        {
            warn!("[PUSH] Accept loop did not stop in time - aborting");
            accept_task.abort();
        }
        info!("[PUSH] Server on {} stopped", self.local_addr);
    }
}

async fn accept_loop(
    listener: TcpListener,
    broadcaster: Arc<Broadcaster>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(serve_subscriber(
                        stream,
                        peer,
                        Arc::clone(&broadcaster),
                        shutdown_rx.clone(),
                    ));
                }
                Err(e) => {
                    warn!("[PUSH] Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            },
        }
    }

    debug!("[PUSH] Accept loop finished");
}

/// Forward queued messages to one client until either side goes away.
async fn serve_subscriber(
    stream: TcpStream,
    peer: SocketAddr,
    broadcaster: Arc<Broadcaster>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let socket = match tokio_tungstenite::accept_async(stream).await {
        Ok(socket) => socket,
        Err(e) => {
            debug!("[PUSH] Handshake with {} failed: {}", peer, e);
            return;
        }
    };

    let (mut sink, mut incoming) = socket.split();
    let mut subscription = broadcaster.subscribe_peer(peer);
    let id = subscription.id();
    info!("[PUSH] Subscriber {} connected from {}", id, peer);

    loop {
        tokio::select! {
            message = subscription.recv() => match message {
                Some(text) => {
                    if let Err(e) = sink.send(Message::text(text.to_string())).await {
                        debug!("[PUSH] Write to {} failed: {}", peer, e);
                        break;
                    }
                }
                // Removed by the broadcaster after a failed delivery.
                None => break,
            },

            frame = incoming.next() => match frame {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("[PUSH] Read from {} failed: {}", peer, e);
                    break;
                }
            },

            _ = shutdown_rx.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }

    broadcaster.unsubscribe(id);
    let _ = sink.close().await;
    info!("[PUSH] Subscriber {} from {} disconnected", id, peer);
}
