//! # prefsync-ipc — cross-process preference synchronization
//!
//! A shared, mutable key-value store usable concurrently from several
//! processes of one application. Each process keeps a full local
//! mirror of a namespace and stays consistent through a
//! change-notification channel; a process never reacts to the echo of
//! its own write.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ReadAll / Update    ┌──────────────┐
//! │ SharedPrefs  │ ◄───────────────────► │  PrefStore   │
//! │ (per process)│      WebSocket /      │ (authority)  │
//! └──────┬───────┘      in-process       └──────┬───────┘
//!        │                                      │
//!        ▼                                      ▼
//! ┌──────────────┐                       ┌──────────────┐
//! │ local mirror │                       │ PrefStorage  │
//! │ + pending ids│                       │ (RocksDB/mem)│
//! └──────────────┘                       └──────┬───────┘
//!                                               │
//!                                       ┌───────┴──────┐
//!                                       │  ChangeBus   │
//!                                       │  (fan-out)   │
//!                                       └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — binary wire frames and [`protocol::ChangeRecord`]
//! - [`broadcast`] — per-namespace change-record fan-out
//! - [`storage`] — injected persistence (memory, RocksDB)
//! - [`store`] — the authoritative, lock-protected table
//! - [`transport`] — RPC seam: in-process and WebSocket
//! - [`server`] — the serving process's socket frontend
//! - [`client`] — the per-process cache, editor, and echo suppression
//! - [`registry`] — one cache per namespace per process

pub mod broadcast;
pub mod client;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod storage;
pub mod store;
pub mod transport;

// Re-exports for convenience
pub use broadcast::{ChangeBus, ChangeTopic, TopicStats};
pub use client::{Editor, ListenerId, SharedPrefs};
pub use protocol::{
    ChangeKind, ChangeRecord, ClientFrame, ProtocolError, ServerFrame, UpdateAction, WireEntry,
    WireError,
};
pub use registry::PrefsRegistry;
pub use server::{PrefServer, ServerConfig, ServerStats};
pub use storage::{
    MemoryFactory, MemoryStorage, PrefStorage, RocksConfig, RocksFactory, RocksStorage,
    StorageError, StorageFactory,
};
pub use store::{PrefStore, SyncError};
pub use transport::{ChangeStream, LocalTransport, Transport, WsTransport};
