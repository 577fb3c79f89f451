//! WebSocket client exposing a relay as a [`SyncStore`].
//!
//! Writes are queued on an outgoing channel drained by a writer task, so
//! `put` and `delete` never block. A reader task turns incoming snapshots
//! into [`SnapshotEvent`]s on a per-collection broadcast channel. When the
//! connection drops, every subscriber gets `StoreError::Closed` and its
//! stream ends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::error::StoreError;
use crate::protocol::{Fields, MessageType, RelayMessage};
use crate::store::{SnapshotEvent, SnapshotReceiver, SyncStore};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

type Subscribers = Arc<Mutex<HashMap<String, broadcast::Sender<SnapshotEvent>>>>;

/// Store backed by a remote relay.
pub struct RelayStore {
    url: String,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: mpsc::UnboundedSender<Vec<u8>>,
    subscribers: Subscribers,
    capacity: usize,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RelayStore {
    /// Connect to a relay at `url` (e.g. `ws://127.0.0.1:9090`).
    pub async fn connect(url: impl Into<String>) -> Result<Self, StoreError> {
        let url = url.into();
        let state = Arc::new(RwLock::new(ConnectionState::Connecting));

        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| StoreError::Connect(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        set_state(&state, ConnectionState::Connected);

        // Writer task: forward outgoing channel to WebSocket
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let writer_state = state.clone();
        let writer = tokio::spawn(async move {
            while let Some(data) = outgoing_rx.recv().await {
                if let Err(e) = ws_writer.send(Message::Binary(data.into())).await {
                    log::warn!("Relay write failed: {e}");
                    break;
                }
            }
            set_state(&writer_state, ConnectionState::Disconnected);
            let _ = ws_writer.close().await;
        });

        // Reader task: decode snapshots and fan them out locally
        let subscribers: Subscribers = Arc::new(Mutex::new(HashMap::new()));
        let reader_subscribers = subscribers.clone();
        let reader_state = state.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match RelayMessage::decode(&bytes) {
                            Ok(relay_msg) => dispatch(&reader_subscribers, relay_msg),
                            Err(e) => log::warn!("Undecodable relay message: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            set_state(&reader_state, ConnectionState::Disconnected);
            log::warn!("Relay connection lost");
            let mut subs = lock(&reader_subscribers);
            for sender in subs.values() {
                let _ = sender.send(SnapshotEvent::Error(StoreError::Closed));
            }
            // Dropping the senders ends every subscriber stream.
            subs.clear();
        });

        log::info!("Connected to relay at {url}");

        Ok(Self {
            url,
            state,
            outgoing_tx,
            subscribers,
            capacity: 64,
            reader,
            writer,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Heartbeat; the relay answers with a pong.
    pub fn ping(&self) -> Result<(), StoreError> {
        self.send(RelayMessage::ping())
    }

    fn send(&self, msg: RelayMessage) -> Result<(), StoreError> {
        if self.state() != ConnectionState::Connected {
            return Err(StoreError::Closed);
        }
        let encoded = msg.encode()?;
        self.outgoing_tx.send(encoded).map_err(|_| StoreError::Closed)
    }
}

impl SyncStore for RelayStore {
    fn subscribe(&self, collection: &str) -> Result<SnapshotReceiver, StoreError> {
        let rx = {
            let mut subs = lock(&self.subscribers);
            let capacity = self.capacity;
            subs.entry(collection.to_string())
                .or_insert_with(|| broadcast::channel(capacity).0)
                .subscribe()
        };
        // The relay answers every subscribe with the current snapshot.
        self.send(RelayMessage::subscribe(collection))
            .map_err(|e| StoreError::Subscription(e.to_string()))?;
        Ok(rx)
    }

    fn put(&self, collection: &str, id: &str, fields: Fields, merge: bool) -> Result<(), StoreError> {
        self.send(RelayMessage::put(collection, id, &fields, merge)?)
    }

    fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        self.send(RelayMessage::delete(collection, id))
    }
}

impl Drop for RelayStore {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

fn dispatch(subscribers: &Subscribers, msg: RelayMessage) {
    let event = match msg.msg_type {
        MessageType::Snapshot => match msg.snapshot_payload() {
            Ok(snapshot) => SnapshotEvent::Snapshot(snapshot),
            Err(e) => SnapshotEvent::Error(StoreError::Protocol(e)),
        },
        MessageType::Error => SnapshotEvent::Error(StoreError::Rejected(msg.error_reason())),
        MessageType::Pong => {
            log::trace!("Pong from relay");
            return;
        }
        other => {
            log::debug!("Ignoring relay message {other:?}");
            return;
        }
    };
    let subs = lock(subscribers);
    if let Some(sender) = subs.get(&msg.collection) {
        let _ = sender.send(event);
    }
}

fn set_state(state: &RwLock<ConnectionState>, next: ConnectionState) {
    *state.write().unwrap_or_else(|e| e.into_inner()) = next;
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
