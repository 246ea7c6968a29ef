//! # gridsync-collab — collaborative revision engine
//!
//! Real-time multi-client editing for a shared workbook, built on
//! optimistic replication: every client applies its own commands
//! immediately, a sequencer assigns one total order, and command
//! transformation rewrites concurrent work until every replica converges
//! on the same document.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   StateUpdateMessage   ┌──────────────┐
//! │ Model        │ ◄────────────────────► │  Sequencer   │
//! │  Workbook    │    (loopback or WS)    │  (chain tip, │
//! │  Session ────┼──┐                     │   history)   │
//! └──────────────┘  │                     └──────┬───────┘
//!                   │                            │ fan-out
//!        ┌──────────┴─────────┐          ┌───────┴───────┐
//!        │ RevisionLog        │          │ other Models  │
//!        │  append / undo     │          │ (transform +  │
//!        │  transform/replay  │          │  replay)      │
//!        └────────────────────┘          └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — versioned wire messages (bincode, LZ4 snapshots)
//! - [`transport`] — the message-bus seam: loopback sequencer, read-only
//!   filter
//! - [`revision`] — the shared revision log with selective undo/redo
//! - [`transform`] — pairwise command transformation (conflict resolution)
//! - [`session`] — per-client state machine, presence, events
//! - [`recovery`] — buffered in-order resend across disconnects
//! - [`model`] — host façade (dispatch, export, pump)
//! - [`server`] / [`client`] — WebSocket sequencer and client transport
//!
//! ## Guarantees
//!
//! | Property | Mechanism |
//! |----------|-----------|
//! | Convergence | single accepted order + remote-wins transforms |
//! | Idempotent replay | duplicate chain ids are no-ops |
//! | Atomic revisions | a batch applies, transforms and drops as one |
//! | Offline editing | resend queue, one in flight, causal order kept |

pub mod client;
pub mod model;
pub mod presence;
pub mod protocol;
pub mod recovery;
pub mod revision;
pub mod server;
pub mod session;
pub mod transform;
pub mod transport;

// Re-exports for convenience
pub use client::WsTransport;
pub use model::{Model, ModelConfig};
pub use presence::{Client, ClientPosition, ClientRegistry, Debounce, MOVE_DEBOUNCE_WINDOW};
pub use protocol::{
    decode_snapshot_data, encode_snapshot_data, ProtocolError, StateUpdateMessage,
    PROTOCOL_VERSION,
};
pub use recovery::ResendQueue;
pub use revision::{Revision, RevisionLog, INITIAL_SERVER_REVISION_ID};
pub use server::{CollabServer, ServerConfig, ServerStats};
pub use session::{CollabEvent, ConcurrencyState, Session};
pub use transform::{invert_for_transform, transform, transform_revision, transform_through};
pub use transport::{LoopbackBus, ReadOnlyTransport, Transport, TransportError};
