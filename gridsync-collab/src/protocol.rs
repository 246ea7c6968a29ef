//! Wire protocol for revision synchronization.
//!
//! Every message is a bincode-encoded [`StateUpdateMessage`] carrying an
//! explicit `version` field. Receivers ignore messages whose version they
//! do not recognize, so the schema can evolve without breaking running
//! sessions mid-edit.
//!
//! Content messages (revisions, undo/redo, snapshots) are chained: each
//! names the `server_revision_id` it was built on and the
//! `next_revision_id` the shared log advances to if the message is
//! accepted. Presence messages are unchained and always deliverable.

use serde::{Deserialize, Serialize};

use gridsync_core::{ClientId, Command, RevisionId, WorkbookData};

use crate::presence::{Client, ClientPosition};

/// Current wire schema version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Everything a session can put on, or take off, the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StateUpdateMessage {
    RemoteRevision {
        version: u32,
        next_revision_id: RevisionId,
        server_revision_id: RevisionId,
        client_id: ClientId,
        commands: Vec<Command>,
    },
    RevisionUndone {
        version: u32,
        next_revision_id: RevisionId,
        server_revision_id: RevisionId,
        undone_revision_id: RevisionId,
    },
    RevisionRedone {
        version: u32,
        next_revision_id: RevisionId,
        server_revision_id: RevisionId,
        redone_revision_id: RevisionId,
    },
    /// Full document state, LZ4-compressed bincode [`WorkbookData`].
    /// Sent by a client requesting log compaction, and served to late
    /// joiners as the first fast-forward message.
    Snapshot {
        version: u32,
        next_revision_id: RevisionId,
        server_revision_id: RevisionId,
        data: Vec<u8>,
    },
    /// Broadcast once a snapshot was accepted: history before
    /// `next_revision_id` no longer exists.
    SnapshotCreated {
        version: u32,
        next_revision_id: RevisionId,
        server_revision_id: RevisionId,
    },
    ClientJoined {
        version: u32,
        client: Client,
        position: ClientPosition,
    },
    ClientMoved {
        version: u32,
        client: Client,
        position: ClientPosition,
    },
    ClientLeft {
        version: u32,
        client_id: ClientId,
    },
}

impl StateUpdateMessage {
    pub fn remote_revision(
        next_revision_id: RevisionId,
        server_revision_id: RevisionId,
        client_id: ClientId,
        commands: Vec<Command>,
    ) -> Self {
        Self::RemoteRevision {
            version: PROTOCOL_VERSION,
            next_revision_id,
            server_revision_id,
            client_id,
            commands,
        }
    }

    pub fn revision_undone(
        next_revision_id: RevisionId,
        server_revision_id: RevisionId,
        undone_revision_id: RevisionId,
    ) -> Self {
        Self::RevisionUndone {
            version: PROTOCOL_VERSION,
            next_revision_id,
            server_revision_id,
            undone_revision_id,
        }
    }

    pub fn revision_redone(
        next_revision_id: RevisionId,
        server_revision_id: RevisionId,
        redone_revision_id: RevisionId,
    ) -> Self {
        Self::RevisionRedone {
            version: PROTOCOL_VERSION,
            next_revision_id,
            server_revision_id,
            redone_revision_id,
        }
    }

    pub fn snapshot(
        next_revision_id: RevisionId,
        server_revision_id: RevisionId,
        data: Vec<u8>,
    ) -> Self {
        Self::Snapshot {
            version: PROTOCOL_VERSION,
            next_revision_id,
            server_revision_id,
            data,
        }
    }

    pub fn snapshot_created(next_revision_id: RevisionId, server_revision_id: RevisionId) -> Self {
        Self::SnapshotCreated {
            version: PROTOCOL_VERSION,
            next_revision_id,
            server_revision_id,
        }
    }

    pub fn client_joined(client: Client, position: ClientPosition) -> Self {
        Self::ClientJoined {
            version: PROTOCOL_VERSION,
            client,
            position,
        }
    }

    pub fn client_moved(client: Client, position: ClientPosition) -> Self {
        Self::ClientMoved {
            version: PROTOCOL_VERSION,
            client,
            position,
        }
    }

    pub fn client_left(client_id: ClientId) -> Self {
        Self::ClientLeft {
            version: PROTOCOL_VERSION,
            client_id,
        }
    }

    pub fn version(&self) -> u32 {
        match self {
            Self::RemoteRevision { version, .. }
            | Self::RevisionUndone { version, .. }
            | Self::RevisionRedone { version, .. }
            | Self::Snapshot { version, .. }
            | Self::SnapshotCreated { version, .. }
            | Self::ClientJoined { version, .. }
            | Self::ClientMoved { version, .. }
            | Self::ClientLeft { version, .. } => *version,
        }
    }

    /// Presence messages bypass revision sequencing.
    pub fn is_presence(&self) -> bool {
        matches!(
            self,
            Self::ClientJoined { .. } | Self::ClientMoved { .. } | Self::ClientLeft { .. }
        )
    }

    /// The id the shared log advances to when this message is accepted.
    pub fn chain_id(&self) -> Option<RevisionId> {
        match self {
            Self::RemoteRevision {
                next_revision_id, ..
            }
            | Self::RevisionUndone {
                next_revision_id, ..
            }
            | Self::RevisionRedone {
                next_revision_id, ..
            }
            | Self::Snapshot {
                next_revision_id, ..
            }
            | Self::SnapshotCreated {
                next_revision_id, ..
            } => Some(*next_revision_id),
            _ => None,
        }
    }

    /// The log position this message was built on.
    pub fn based_on(&self) -> Option<RevisionId> {
        match self {
            Self::RemoteRevision {
                server_revision_id, ..
            }
            | Self::RevisionUndone {
                server_revision_id, ..
            }
            | Self::RevisionRedone {
                server_revision_id, ..
            }
            | Self::Snapshot {
                server_revision_id, ..
            }
            | Self::SnapshotCreated {
                server_revision_id, ..
            } => Some(*server_revision_id),
            _ => None,
        }
    }

    /// Rebase a buffered content message onto a newer log position.
    pub fn set_based_on(&mut self, id: RevisionId) {
        match self {
            Self::RemoteRevision {
                server_revision_id, ..
            }
            | Self::RevisionUndone {
                server_revision_id, ..
            }
            | Self::RevisionRedone {
                server_revision_id, ..
            }
            | Self::Snapshot {
                server_revision_id, ..
            }
            | Self::SnapshotCreated {
                server_revision_id, ..
            } => *server_revision_id = id,
            _ => {}
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

/// Compress a workbook export into a snapshot payload.
pub fn encode_snapshot_data(data: &WorkbookData) -> Result<Vec<u8>, ProtocolError> {
    let raw = bincode::serde::encode_to_vec(data, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&raw))
}

/// Decompress and decode a snapshot payload.
pub fn decode_snapshot_data(payload: &[u8]) -> Result<WorkbookData, ProtocolError> {
    let raw = lz4_flex::decompress_size_prepended(payload)
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    let (data, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(data)
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
