//! WebSocket server exposing the authoritative store to other
//! processes.
//!
//! Architecture:
//! ```text
//! Process A ──┐
//!             ├── PrefServer ── PrefStore ── ChangeBus
//! Process B ──┘        │            │
//!                      │            └── PrefStorage (RocksDB / memory)
//!                      │
//!             per-connection handler:
//!               socket ──► ReadAll / Update / Subscribe / Ping
//!               socket ◄── Entries / Ack / Error / Change / Pong
//! ```
//!
//! Each connection multiplexes any number of namespaces; one
//! forwarder task per subscription pumps that namespace's change
//! records into the connection's outgoing channel.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use prefsync_core::{AccessPolicy, AllowAll};

use crate::broadcast::ChangeBus;
use crate::protocol::{ClientFrame, ServerFrame, WireError};
use crate::storage::{MemoryFactory, RocksConfig, RocksFactory, StorageError, StorageFactory};
use crate::store::PrefStore;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Change-record buffer capacity per subscriber
    pub broadcast_capacity: usize,
    /// Persistence path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7464".to_string(),
            broadcast_capacity: 256,
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
}

/// The preference server: one authoritative store per process,
/// served to any number of client processes.
pub struct PrefServer {
    config: ServerConfig,
    store: Arc<PrefStore>,
    stats: Arc<RwLock<ServerStats>>,
}

impl PrefServer {
    /// Create a server with the given config and access policy.
    ///
    /// Opens RocksDB storage when a path is configured, otherwise the
    /// store is memory-only.
    pub fn new(config: ServerConfig, policy: Arc<dyn AccessPolicy>) -> Result<Self, StorageError> {
        let factory: Box<dyn StorageFactory> = match &config.storage_path {
            Some(path) => Box::new(RocksFactory::open(RocksConfig {
                path: path.clone(),
                ..RocksConfig::default()
            })?),
            None => Box::new(MemoryFactory::new()),
        };
        let bus = Arc::new(ChangeBus::new(config.broadcast_capacity));
        let store = Arc::new(PrefStore::new(factory, policy, bus));

        Ok(Self {
            config,
            store,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        })
    }

    /// In-memory server with a permissive policy.
    pub fn with_defaults() -> Self {
        // Memory factory cannot fail to open.
        Self::new(ServerConfig::default(), Arc::new(AllowAll))
            .expect("in-memory server construction cannot fail")
    }

    /// The authoritative store, for clients living in the serving
    /// process itself (wire them up with a `LocalTransport`).
    pub fn store(&self) -> Arc<PrefStore> {
        self.store.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Preference server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let store = self.store.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, store, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single client connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        store: Arc<PrefStore>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("Client connected from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Change records from subscription forwarders funnel through
        // this channel into the socket.
        let (change_tx, mut change_rx) = mpsc::channel::<ServerFrame>(256);
        let mut forwarders: Vec<tokio::task::JoinHandle<()>> = Vec::new();
        let mut subscribed: Vec<String> = Vec::new();

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_frames += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            let frame = match ClientFrame::decode(&bytes) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    log::warn!("Undecodable frame from {addr}: {e}");
                                    continue;
                                }
                            };

                            let reply = match frame {
                                ClientFrame::ReadAll { request_id, namespace } => {
                                    match store.read_all(&namespace).await {
                                        Ok((seq, entries)) => ServerFrame::Entries {
                                            request_id,
                                            seq,
                                            entries,
                                        },
                                        Err(e) => ServerFrame::Error {
                                            request_id,
                                            error: WireError::from(&e),
                                        },
                                    }
                                }
                                ClientFrame::Update { request_id, namespace, action, change_id } => {
                                    match store.apply(&namespace, action, change_id).await {
                                        Ok(seq) => ServerFrame::Ack { request_id, seq },
                                        Err(e) => ServerFrame::Error {
                                            request_id,
                                            error: WireError::from(&e),
                                        },
                                    }
                                }
                                ClientFrame::Subscribe { request_id, namespace } => {
                                    if !subscribed.contains(&namespace) {
                                        let mut rx = store.bus().subscribe(&namespace).await;
                                        let tx = change_tx.clone();
                                        forwarders.push(tokio::spawn(async move {
                                            loop {
                                                match rx.recv().await {
                                                    Ok(record) => {
                                                        if tx.send(ServerFrame::Change(record)).await.is_err() {
                                                            break;
                                                        }
                                                    }
                                                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                                        log::warn!("Subscriber lagged by {n} records");
                                                    }
                                                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                                                }
                                            }
                                        }));
                                        subscribed.push(namespace.clone());
                                        log::debug!("{addr} subscribed to {namespace}");
                                    }
                                    ServerFrame::Ack { request_id, seq: 0 }
                                }
                                ClientFrame::Ping { request_id } => ServerFrame::Pong { request_id },
                            };

                            let encoded = reply.encode()?;
                            ws_sender.send(Message::Binary(encoded.into())).await?;
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

                change = change_rx.recv() => {
                    if let Some(frame) = change {
                        let encoded = frame.encode()?;
                        ws_sender.send(Message::Binary(encoded.into())).await?;
                    }
                }
            }
        }

        // Cleanup: stop forwarding into a dead socket.
        for forwarder in forwarders {
            forwarder.abort();
        }
        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
        }

        Ok(())
    }
}
