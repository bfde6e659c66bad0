//! Transport seam between client caches and the authoritative store.
//!
//! A cache speaks three verbs — ReadAll, Update, Subscribe — against
//! the [`Transport`] trait and never cares where the store lives:
//!
//! - [`LocalTransport`] wires straight into an in-process
//!   [`PrefStore`]; the single-process deployment and the test
//!   harness.
//! - [`WsTransport`] speaks the binary frame protocol over a
//!   WebSocket to a [`crate::server::PrefServer`] in another process.
//!
//! The transport is assumed reliable and ordered per channel;
//! delivery is at-least-once. A write failure always surfaces to the
//! caller; a missed notification is recovered by an explicit reload.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{ChangeRecord, ClientFrame, ServerFrame, UpdateAction, WireEntry};
use crate::store::{PrefStore, SyncError};

/// Stream of change records for one subscribed namespace.
///
/// Unifies an in-process broadcast subscription and a remote feed. A
/// lagged broadcast subscriber skips the dropped records and keeps
/// going; resynchronization is the cache's job.
pub struct ChangeStream(StreamInner);

enum StreamInner {
    Broadcast(broadcast::Receiver<ChangeRecord>),
    Channel(mpsc::Receiver<ChangeRecord>),
}

impl ChangeStream {
    pub fn from_broadcast(rx: broadcast::Receiver<ChangeRecord>) -> Self {
        Self(StreamInner::Broadcast(rx))
    }

    pub fn from_channel(rx: mpsc::Receiver<ChangeRecord>) -> Self {
        Self(StreamInner::Channel(rx))
    }

    /// Next record, or `None` once the stream is closed.
    pub async fn recv(&mut self) -> Option<ChangeRecord> {
        match &mut self.0 {
            StreamInner::Broadcast(rx) => loop {
                match rx.recv().await {
                    Ok(record) => return Some(record),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Change stream lagged, {n} records dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
            StreamInner::Channel(rx) => rx.recv().await,
        }
    }
}

/// The three-verb RPC surface a cache needs.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Snapshot a namespace: its current sequence and all entries.
    async fn read_all(&self, namespace: &str) -> Result<(u64, Vec<WireEntry>), SyncError>;

    /// Apply one mutation; returns the store-assigned sequence.
    async fn update(
        &self,
        namespace: &str,
        action: UpdateAction,
        change_id: Uuid,
    ) -> Result<u64, SyncError>;

    /// Subscribe to a namespace's change records.
    async fn subscribe(&self, namespace: &str) -> Result<ChangeStream, SyncError>;
}

/// Direct wiring to an in-process store.
pub struct LocalTransport {
    store: Arc<PrefStore>,
}

impl LocalTransport {
    pub fn new(store: Arc<PrefStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn read_all(&self, namespace: &str) -> Result<(u64, Vec<WireEntry>), SyncError> {
        self.store.read_all(namespace).await
    }

    async fn update(
        &self,
        namespace: &str,
        action: UpdateAction,
        change_id: Uuid,
    ) -> Result<u64, SyncError> {
        self.store.apply(namespace, action, change_id).await
    }

    async fn subscribe(&self, namespace: &str) -> Result<ChangeStream, SyncError> {
        Ok(ChangeStream::from_broadcast(
            self.store.bus().subscribe(namespace).await,
        ))
    }
}

#[derive(Debug)]
enum Reply {
    Entries { seq: u64, entries: Vec<WireEntry> },
    Ack { seq: u64 },
    Pong,
}

type PendingMap = HashMap<u64, oneshot::Sender<Result<Reply, SyncError>>>;
type SubscriptionMap = HashMap<String, mpsc::Sender<ChangeRecord>>;

/// WebSocket client for a store in another process.
///
/// One connection multiplexes every namespace: a writer task drains
/// the outgoing channel, a reader task routes replies to their
/// waiting request by id and change records to their namespace's
/// subscription channel.
pub struct WsTransport {
    outgoing: mpsc::Sender<Vec<u8>>,
    pending: Arc<std::sync::Mutex<PendingMap>>,
    subscriptions: Arc<std::sync::Mutex<SubscriptionMap>>,
    next_request: AtomicU64,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl WsTransport {
    /// Connect to a preference server.
    pub async fn connect(server_url: impl Into<String>) -> Result<Self, SyncError> {
        let url = server_url.into();
        let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);

        // Writer task: forward outgoing frames to the socket.
        let writer = tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
        });

        let pending: Arc<std::sync::Mutex<PendingMap>> = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let subscriptions: Arc<std::sync::Mutex<SubscriptionMap>> =
            Arc::new(std::sync::Mutex::new(HashMap::new()));

        // Reader task: route incoming frames.
        let reader = {
            let pending = pending.clone();
            let subscriptions = subscriptions.clone();
            tokio::spawn(async move {
                while let Some(msg) = ws_reader.next().await {
                    match msg {
                        Ok(Message::Binary(data)) => {
                            let bytes: Vec<u8> = data.into();
                            match ServerFrame::decode(&bytes) {
                                Ok(frame) => {
                                    Self::route(frame, &pending, &subscriptions).await;
                                }
                                Err(e) => {
                                    log::warn!("Failed to decode server frame: {e}");
                                }
                            }
                        }
                        Ok(Message::Close(_)) | Err(_) => break,
                        _ => {}
                    }
                }

                // Connection lost: fail every in-flight request and
                // end all change streams.
                log::info!("Connection to preference server closed");
                let waiters: Vec<_> = pending.lock().unwrap().drain().collect();
                for (_, tx) in waiters {
                    let _ = tx.send(Err(SyncError::Transport(
                        "connection closed".to_string(),
                    )));
                }
                subscriptions.lock().unwrap().clear();
            })
        };

        Ok(Self {
            outgoing: out_tx,
            pending,
            subscriptions,
            next_request: AtomicU64::new(0),
            reader,
            writer,
        })
    }

    async fn route(
        frame: ServerFrame,
        pending: &Arc<std::sync::Mutex<PendingMap>>,
        subscriptions: &Arc<std::sync::Mutex<SubscriptionMap>>,
    ) {
        let complete = |request_id: u64, result: Result<Reply, SyncError>| {
            let waiter = pending.lock().unwrap().remove(&request_id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(result);
                }
                None => log::warn!("Reply for unknown request {request_id}"),
            }
        };

        match frame {
            ServerFrame::Entries {
                request_id,
                seq,
                entries,
            } => complete(request_id, Ok(Reply::Entries { seq, entries })),
            ServerFrame::Ack { request_id, seq } => complete(request_id, Ok(Reply::Ack { seq })),
            ServerFrame::Pong { request_id } => complete(request_id, Ok(Reply::Pong)),
            ServerFrame::Error { request_id, error } => {
                complete(request_id, Err(SyncError::from(error)))
            }
            ServerFrame::Change(record) => {
                let sender = subscriptions.lock().unwrap().get(&record.namespace).cloned();
                if let Some(tx) = sender {
                    let namespace = record.namespace.clone();
                    if tx.send(record).await.is_err() {
                        // Receiver detached; drop the subscription.
                        subscriptions.lock().unwrap().remove(&namespace);
                    }
                } else {
                    log::debug!(
                        "Change record for unsubscribed namespace {}",
                        record.namespace
                    );
                }
            }
        }
    }

    async fn request(
        &self,
        build: impl FnOnce(u64) -> ClientFrame,
    ) -> Result<Reply, SyncError> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(request_id, tx);

        let encoded = build(request_id).encode()?;
        if self.outgoing.send(encoded).await.is_err() {
            self.pending.lock().unwrap().remove(&request_id);
            return Err(SyncError::Transport("connection closed".to_string()));
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Transport("connection closed".to_string())),
        }
    }

    /// Round-trip a heartbeat.
    pub async fn ping(&self) -> Result<(), SyncError> {
        match self
            .request(|request_id| ClientFrame::Ping { request_id })
            .await?
        {
            Reply::Pong => Ok(()),
            other => Err(SyncError::Transport(format!("unexpected reply: {other:?}"))),
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn read_all(&self, namespace: &str) -> Result<(u64, Vec<WireEntry>), SyncError> {
        match self
            .request(|request_id| ClientFrame::ReadAll {
                request_id,
                namespace: namespace.to_string(),
            })
            .await?
        {
            Reply::Entries { seq, entries } => Ok((seq, entries)),
            other => Err(SyncError::Transport(format!("unexpected reply: {other:?}"))),
        }
    }

    async fn update(
        &self,
        namespace: &str,
        action: UpdateAction,
        change_id: Uuid,
    ) -> Result<u64, SyncError> {
        match self
            .request(|request_id| ClientFrame::Update {
                request_id,
                namespace: namespace.to_string(),
                action: action.clone(),
                change_id,
            })
            .await?
        {
            Reply::Ack { seq } => Ok(seq),
            other => Err(SyncError::Transport(format!("unexpected reply: {other:?}"))),
        }
    }

    async fn subscribe(&self, namespace: &str) -> Result<ChangeStream, SyncError> {
        let (tx, rx) = mpsc::channel(256);
        // Register before the request goes out, so a record published
        // between the ack and our bookkeeping cannot slip past.
        self.subscriptions
            .lock()
            .unwrap()
            .insert(namespace.to_string(), tx);

        let result = self
            .request(|request_id| ClientFrame::Subscribe {
                request_id,
                namespace: namespace.to_string(),
            })
            .await;

        match result {
            Ok(Reply::Ack { .. }) => Ok(ChangeStream::from_channel(rx)),
            Ok(other) => {
                self.subscriptions.lock().unwrap().remove(namespace);
                Err(SyncError::Transport(format!("unexpected reply: {other:?}")))
            }
            Err(e) => {
                self.subscriptions.lock().unwrap().remove(namespace);
                Err(e)
            }
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}
