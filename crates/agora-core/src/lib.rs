//! Agora Core Protocol Implementation
//!
//! Replicated state reconciliation for decentralized Q&A sessions over a
//! generic publish/subscribe transport. This crate turns an incoming stream
//! of signed, unordered, at-least-once-delivered messages into a consistent
//! local projection (session metadata, questions, answers, upvotes,
//! moderation flags, polls) and compacts that projection into signed,
//! verifiable snapshots for cold-start bootstrapping and cross-peer
//! catch-up.
//!
//! The transport, signing identity, and blob storage are external
//! collaborators, consumed through the traits in [`transport`].

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod errors;
pub mod events;
pub mod message;
pub mod registry;
pub mod snapshot;
pub mod state;
pub mod transport;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{AgoraConfig, SessionConfig, SnapshotConfig};
pub use errors::{
    AgoraError, Rejection, Result, SessionError, SnapshotError, StorageError, TransportError,
};
pub use events::DomainEvent;
pub use message::{
    session_topic, snapshot_topic, MessageKind, SessionDescriptor, SignedEnvelope,
    SnapshotAnnounce, StoredMessage,
};
pub use registry::{PollSpec, SessionHandle, SessionOptions, SessionRegistry};
pub use snapshot::{PersistentSnapshot, SnapshotManager, SnapshotRecord};
pub use state::{PollRecord, Projection, QuestionRecord};
pub use transport::{
    BlobStore, EncryptionMode, Signer, SnapshotRecordStore, SymmetricKey, Transport,
};
pub use types::{Address, ContentHash, SessionId, SystemTimeSource, TimeSource, Timestamp};
