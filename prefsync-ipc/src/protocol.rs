//! Binary protocol between preference clients and the store.
//!
//! Three verbs cross the process boundary:
//!
//! ```text
//! ┌────────────┐  ReadAll / Update / Subscribe   ┌────────────┐
//! │  client    │ ──────────────────────────────► │  store     │
//! │  cache     │ ◄────────────────────────────── │ (authority)│
//! └────────────┘  Entries / Ack / ChangeRecord   └────────────┘
//! ```
//!
//! Frames are bincode-encoded. A [`ChangeRecord`] carries the
//! originating change id so the committer can recognize the echo of
//! its own write, and the store-assigned per-namespace sequence so a
//! cache can order foreign records against its own optimistic applies.
//! `ChangeKind::Clear` is the whole-namespace sentinel; because the
//! kinds are a tagged union, "no payload" and "empty string payload"
//! can never be confused.

use prefsync_core::PrefType;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One encoded entry, as returned by `ReadAll`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEntry {
    pub key: String,
    pub pref_type: PrefType,
    pub value: String,
}

impl WireEntry {
    pub fn new(key: impl Into<String>, pref_type: PrefType, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            pref_type,
            value: value.into(),
        }
    }
}

/// What a mutation did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChangeKind {
    Put {
        key: String,
        pref_type: PrefType,
        value: String,
    },
    Remove {
        key: String,
    },
    /// Whole-namespace clear (the ALL sentinel).
    Clear,
}

/// Notification describing one store mutation.
///
/// Published for every mutation, including removes of an already
/// absent key, so caches can reconcile unconditionally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub namespace: String,
    /// Store-assigned sequence, monotonic per namespace. Mirrors the
    /// store's serialized mutation order.
    pub seq: u64,
    /// Id minted by the committing cache, unique for its process
    /// lifetime.
    pub change_id: Uuid,
    pub kind: ChangeKind,
}

impl ChangeRecord {
    pub fn put(
        namespace: impl Into<String>,
        seq: u64,
        change_id: Uuid,
        key: impl Into<String>,
        pref_type: PrefType,
        value: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            seq,
            change_id,
            kind: ChangeKind::Put {
                key: key.into(),
                pref_type,
                value: value.into(),
            },
        }
    }

    pub fn remove(
        namespace: impl Into<String>,
        seq: u64,
        change_id: Uuid,
        key: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            seq,
            change_id,
            kind: ChangeKind::Remove { key: key.into() },
        }
    }

    pub fn clear(namespace: impl Into<String>, seq: u64, change_id: Uuid) -> Self {
        Self {
            namespace: namespace.into(),
            seq,
            change_id,
            kind: ChangeKind::Clear,
        }
    }

    /// The affected key, or `None` for the whole-namespace sentinel.
    pub fn key(&self) -> Option<&str> {
        match &self.kind {
            ChangeKind::Put { key, .. } | ChangeKind::Remove { key } => Some(key),
            ChangeKind::Clear => None,
        }
    }
}

/// A staged mutation, as carried by an `Update` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UpdateAction {
    Put {
        key: String,
        pref_type: PrefType,
        value: String,
    },
    Remove {
        key: String,
    },
    Clear,
}

/// Client → store frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientFrame {
    ReadAll {
        request_id: u64,
        namespace: String,
    },
    Update {
        request_id: u64,
        namespace: String,
        action: UpdateAction,
        change_id: Uuid,
    },
    Subscribe {
        request_id: u64,
        namespace: String,
    },
    Ping {
        request_id: u64,
    },
}

impl ClientFrame {
    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(frame)
    }
}

/// Store → client frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerFrame {
    Entries {
        request_id: u64,
        /// Namespace sequence at snapshot time; buffered records at or
        /// below it are already reflected in `entries`.
        seq: u64,
        entries: Vec<WireEntry>,
    },
    Ack {
        request_id: u64,
        /// Sequence assigned to the acknowledged mutation (0 for
        /// non-mutating requests).
        seq: u64,
    },
    Error {
        request_id: u64,
        error: WireError,
    },
    Change(ChangeRecord),
    Pong {
        request_id: u64,
    },
}

impl ServerFrame {
    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(frame)
    }
}

/// Store-side failure reported across the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireError {
    PermissionDenied { namespace: String, key: String },
    Format { detail: String },
    Storage { detail: String },
    Unsupported { detail: String },
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
