//! Transport boundary and the WebSocket transport.
//!
//! The node only needs "send these bytes to that address" and "give me the
//! bytes that arrive". [`WsTransport`] provides both over WebSocket binary
//! frames: a server accepts neighbors' connections and forwards every frame
//! they send into one channel, and outbound connections are dialed lazily
//! and cached per address until a send on them fails.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, accept_async, connect_async};
use tracing::{debug, error, info, warn};

use crate::error::NetworkError;

/// Capacity of the inbound frame channel.
pub const INBOUND_CHANNEL_CAPACITY: usize = 256;

/// A bound transport endpoint.
#[derive(Debug)]
pub struct Bound {
    /// The address peers should use to reach us (port resolved if `:0`).
    pub local_addr: String,
    /// Every frame received from any neighbor.
    pub frames: mpsc::Receiver<Vec<u8>>,
}

/// Point-to-point byte transport between directly reachable peers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start listening on `addr`.
    async fn bind(&self, addr: &str) -> Result<Bound, NetworkError>;

    /// Deliver one frame to the neighbor at `addr`.
    ///
    /// Fails with [`NetworkError::PeerUnreachable`] when the neighbor cannot
    /// be reached. Callers bound the wait with their own timeout.
    async fn send(&self, addr: &str, frame: Vec<u8>) -> Result<(), NetworkError>;

    /// Stop listening and drop every connection.
    async fn close(&self);
}

// ---------------------------------------------------------------------------
// WebSocket transport
// ---------------------------------------------------------------------------

type ClientWsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// WebSocket implementation of [`Transport`].
pub struct WsTransport {
    outbound: parking_lot::Mutex<HashMap<String, Arc<AsyncMutex<ClientWsSink>>>>,
    shutdown_tx: broadcast::Sender<()>,
    server: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl WsTransport {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            outbound: parking_lot::Mutex::new(HashMap::new()),
            shutdown_tx,
            server: parking_lot::Mutex::new(None),
        }
    }

    /// Return the cached connection to `addr`, dialing if needed.
    async fn connection(&self, addr: &str) -> Result<Arc<AsyncMutex<ClientWsSink>>, NetworkError> {
        if let Some(conn) = self.outbound.lock().get(addr) {
            return Ok(Arc::clone(conn));
        }

        let url = if addr.starts_with("ws://") || addr.starts_with("wss://") {
            addr.to_string()
        } else {
            format!("ws://{addr}")
        };
        let (ws_stream, _) = connect_async(&url)
            .await
            .map_err(|e| NetworkError::PeerUnreachable(format!("{addr}: {e}")))?;
        let (sink, mut stream) = ws_stream.split();

        // Neighbors answer over their own outbound connection, so anything
        // arriving here is only drained to keep the socket healthy.
        let peer = addr.to_string();
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                if let Err(e) = msg {
                    debug!("Outbound connection to {peer} closed: {e}");
                    break;
                }
            }
        });

        debug!("Dialed {addr}");
        let conn = Arc::new(AsyncMutex::new(sink));
        let mut outbound = self.outbound.lock();
        Ok(Arc::clone(
            outbound.entry(addr.to_string()).or_insert(conn),
        ))
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn bind(&self, addr: &str) -> Result<Bound, NetworkError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?.to_string();
        info!("WebSocket transport listening on {local_addr}");

        let (frames_tx, frames) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(accept_loop(listener, frames_tx, shutdown));
        if let Some(old) = self.server.lock().replace(handle) {
            old.abort();
        }

        Ok(Bound { local_addr, frames })
    }

    async fn send(&self, addr: &str, frame: Vec<u8>) -> Result<(), NetworkError> {
        let conn = self.connection(addr).await?;
        let result = conn.lock().await.send(Message::Binary(frame.into())).await;
        if let Err(e) = result {
            self.outbound.lock().remove(addr);
            return Err(NetworkError::PeerUnreachable(format!("{addr}: {e}")));
        }
        Ok(())
    }

    async fn close(&self) {
        let _ = self.shutdown_tx.send(());
        let conns: Vec<_> = self.outbound.lock().drain().collect();
        for (addr, conn) in conns {
            debug!("Closing connection to {addr}");
            let _ = conn.lock().await.send(Message::Close(None)).await;
        }
        let server = self.server.lock().take();
        if let Some(handle) = server {
            let _ = handle.await;
        }
    }
}

/// Accept neighbors until shutdown; each connection gets its own read loop.
async fn accept_loop(
    listener: TcpListener,
    frames_tx: mpsc::Sender<Vec<u8>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        let frames_tx = frames_tx.clone();
                        let shutdown = shutdown.resubscribe();
                        tokio::spawn(async move {
                            match accept_async(stream).await {
                                Ok(ws_stream) => read_loop(ws_stream, peer_addr, frames_tx, shutdown).await,
                                Err(e) => warn!("WebSocket accept failed for {peer_addr}: {e}"),
                            }
                        });
                    }
                    Err(e) => {
                        error!("TCP accept failed: {e}");
                    }
                }
            }
            _ = shutdown.recv() => {
                info!("WebSocket transport shutting down");
                break;
            }
        }
    }
}

async fn read_loop(
    ws_stream: WebSocketStream<TcpStream>,
    peer_addr: std::net::SocketAddr,
    frames_tx: mpsc::Sender<Vec<u8>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let (_sink, mut stream) = ws_stream.split();
    loop {
        tokio::select! {
            msg = stream.next() => {
                let frame = match msg {
                    Some(Ok(Message::Binary(data))) => data.to_vec(),
                    Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Peer {peer_addr} disconnected");
                        break;
                    }
                    Some(Ok(_)) => continue, // ping/pong
                    Some(Err(e)) => {
                        debug!("Read error from {peer_addr}: {e}");
                        break;
                    }
                };
                if frames_tx.send(frame).await.is_err() {
                    break;
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
