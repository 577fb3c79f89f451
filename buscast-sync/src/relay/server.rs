//! WebSocket relay holding the authoritative collections.
//!
//! Architecture:
//! ```text
//! Broadcaster A ──put──┐
//!                      ├── CollectionRoom ("locations")
//! Broadcaster B ──del──┘        │  CollectionState (last-write-wins per id,
//!                               │  server timestamp on every put)
//!                               │
//!                               ▼  full snapshot after every change
//!                      broadcast::Sender<Arc<Vec<u8>>>
//!                    ┌──────────┼───────────┐
//!                    ▼          ▼           ▼
//!                 Viewer 1   Viewer 2   Broadcaster A
//! ```
//!
//! Snapshots are encoded once per change and fanned out as shared bytes.
//! A lagging subscriber skips snapshots; the next one it receives is
//! complete. A connection may subscribe to several collections; each gets
//! its own forwarder onto the connection's outgoing queue.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{MessageType, RelayMessage, Snapshot};
use crate::store::{server_timestamp, CollectionState};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Snapshots buffered per subscriber before it lags
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_collections: usize,
    pub puts: u64,
    pub deletes: u64,
}

/// One collection: its records and the fan-out channel.
struct CollectionRoom {
    state: CollectionState,
    sender: broadcast::Sender<Arc<Vec<u8>>>,
}

impl CollectionRoom {
    fn new(capacity: usize) -> Self {
        Self {
            state: CollectionState::new(),
            sender: broadcast::channel(capacity.max(1)).0,
        }
    }

    fn encoded_snapshot(&self, collection: &str) -> Option<Arc<Vec<u8>>> {
        match RelayMessage::snapshot(collection, &self.state.snapshot()).and_then(|m| m.encode()) {
            Ok(bytes) => Some(Arc::new(bytes)),
            Err(e) => {
                log::error!("Failed to encode snapshot of {collection}: {e}");
                None
            }
        }
    }

    fn publish(&self, collection: &str) {
        if let Some(bytes) = self.encoded_snapshot(collection) {
            let receivers = self.sender.send(bytes).unwrap_or(0);
            log::trace!("Snapshot of {collection} sent to {receivers} subscribers");
        }
    }
}

type Collections = Arc<RwLock<HashMap<String, CollectionRoom>>>;

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    collections: Collections,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            collections: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address and serve until an accept error.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        log::info!("Relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let collections = self.collections.clone();
            let stats = self.stats.clone();
            let capacity = self.config.broadcast_capacity;

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, collections, stats.clone(), capacity).await {
                    log::error!("Connection error from {addr}: {e}");
                }
                stats.write().await.active_connections -= 1;
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        collections: Collections,
        stats: Arc<RwLock<RelayStats>>,
        capacity: usize,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        // One forwarder per subscribed collection, all feeding this socket.
        let (snapshot_tx, mut snapshot_rx) = mpsc::unbounded_channel::<Arc<Vec<u8>>>();
        let mut forwarders: HashMap<String, JoinHandle<()>> = HashMap::new();

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            let relay_msg = match RelayMessage::decode(&bytes) {
                                Ok(m) => m,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    continue;
                                }
                            };

                            match relay_msg.msg_type {
                                MessageType::Subscribe => {
                                    let collection = relay_msg.collection;
                                    let (rx, initial) = {
                                        let mut rooms = collections.write().await;
                                        let room = rooms
                                            .entry(collection.clone())
                                            .or_insert_with(|| CollectionRoom::new(capacity));
                                        let rx = room.sender.subscribe();
                                        let initial = room.encoded_snapshot(&collection);
                                        stats.write().await.active_collections = rooms.len();
                                        (rx, initial)
                                    };
                                    if !forwarders.contains_key(&collection) {
                                        let forwarder = Self::spawn_forwarder(rx, snapshot_tx.clone(), addr);
                                        forwarders.insert(collection.clone(), forwarder);
                                    }
                                    if let Some(bytes) = initial {
                                        ws_sender.send(Message::Binary(bytes.to_vec().into())).await?;
                                    }
                                    log::info!("{addr} subscribed to {collection}");
                                }

                                MessageType::Put => {
                                    let fields = match relay_msg.fields() {
                                        Ok(f) => f,
                                        Err(e) => {
                                            let reply = RelayMessage::error(&relay_msg.collection, &e.to_string());
                                            ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                            continue;
                                        }
                                    };
                                    {
                                        let mut rooms = collections.write().await;
                                        let room = rooms
                                            .entry(relay_msg.collection.clone())
                                            .or_insert_with(|| CollectionRoom::new(capacity));
                                        room.state.put(&relay_msg.id, fields, relay_msg.merge, server_timestamp());
                                        room.publish(&relay_msg.collection);
                                        let mut s = stats.write().await;
                                        s.puts += 1;
                                        s.active_collections = rooms.len();
                                    }
                                    log::trace!("Put {}/{} (merge: {})", relay_msg.collection, relay_msg.id, relay_msg.merge);
                                }

                                MessageType::Delete => {
                                    let mut rooms = collections.write().await;
                                    if let Some(room) = rooms.get_mut(&relay_msg.collection) {
                                        if room.state.delete(&relay_msg.id) {
                                            log::info!("Record {}/{} removed", relay_msg.collection, relay_msg.id);
                                        }
                                        room.publish(&relay_msg.collection);
                                    }
                                    stats.write().await.deletes += 1;
                                }

                                MessageType::Ping => {
                                    let pong = RelayMessage::pong().encode()?;
                                    ws_sender.send(Message::Binary(pong.into())).await?;
                                }

                                _ => {
                                    log::debug!("Unhandled message type: {:?}", relay_msg.msg_type);
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing snapshot
                Some(data) = snapshot_rx.recv() => {
                    ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                }
            }
        }

        for (_, forwarder) in forwarders.drain() {
            forwarder.abort();
        }
        Ok(())
    }

    /// Copy one collection's snapshots onto a connection's outgoing queue.
    fn spawn_forwarder(
        mut rx: broadcast::Receiver<Arc<Vec<u8>>>,
        out: mpsc::UnboundedSender<Arc<Vec<u8>>>,
        addr: SocketAddr,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(data) => {
                        if out.send(data).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Subscriber {addr} lagged by {n} snapshots");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Current contents of a collection.
    pub async fn snapshot(&self, collection: &str) -> Snapshot {
        self.collections
            .read()
            .await
            .get(collection)
            .map(|room| room.state.snapshot())
            .unwrap_or_default()
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }
}
