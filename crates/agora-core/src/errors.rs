//! Error types for the Agora protocol
//!
//! This module contains all error types used throughout the crate, including
//! per-message rejection reasons, transport and storage errors, snapshot
//! integrity errors, and the main AgoraError type that unifies them all.
//!
//! Rejections are deliberately separate from errors: a rejected message is a
//! normal, expected outcome of processing untrusted remote input. It never
//! aborts the consumer loop and never partially mutates state.

use crate::types::{ContentHash, SessionId, Timestamp};

// ----------------------------------------------------------------------------
// Message Rejection
// ----------------------------------------------------------------------------

/// Named reason a message was rejected by a state-engine handler
///
/// Every variant is a discrete, observable condition. The same taxonomy
/// covers unauthorized signers, duplicates, and programmer-invariant checks
/// such as an out-of-range poll option, because the same code path processes
/// untrusted remote input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("unauthorized signer")]
    Unauthorized,

    #[error("duplicate message")]
    Duplicate,

    #[error("unknown target")]
    UnknownTarget,

    #[error("closed session")]
    SessionClosed,

    #[error("poll is not active")]
    PollInactive,

    #[error("question already answered")]
    AlreadyAnswered,

    #[error("question is moderated")]
    Moderated,

    #[error("option index out of range")]
    OptionOutOfRange,

    /// A descriptor revision with `updated_at` at or before the accepted one.
    /// Benign under replay and out-of-order delivery; logged at debug level.
    #[error("stale revision")]
    StaleRevision,

    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl Rejection {
    /// Whether this rejection is an expected consequence of at-least-once,
    /// unordered delivery rather than a misbehaving peer
    pub fn is_benign(&self) -> bool {
        matches!(self, Rejection::Duplicate | Rejection::StaleRevision)
    }
}

// ----------------------------------------------------------------------------
// Transport Errors
// ----------------------------------------------------------------------------

/// Errors surfaced by the external transport collaborator
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind topic {topic}: {reason}")]
    Bind { topic: String, reason: String },

    #[error("topic {topic} is not bound")]
    NotBound { topic: String },

    #[error("publish failed on topic {topic}: {reason}")]
    Publish { topic: String, reason: String },

    #[error("store query failed on topic {topic}: {reason}")]
    Query { topic: String, reason: String },

    #[error("message decode failed: {reason}")]
    Decode { reason: String },

    #[error("encryption mode mismatch on topic {topic}")]
    EncryptionMismatch { topic: String },
}

impl TransportError {
    /// Create a decode error with a reason
    pub fn decode<R: Into<String>>(reason: R) -> Self {
        TransportError::Decode {
            reason: reason.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Storage Errors
// ----------------------------------------------------------------------------

/// Errors surfaced by the external blob store collaborator
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("upload failed: {reason}")]
    Upload { reason: String },

    #[error("download of {cid} failed: {reason}")]
    Download { cid: String, reason: String },

    #[error("blob not found: {cid}")]
    NotFound { cid: String },
}

// ----------------------------------------------------------------------------
// Snapshot Errors
// ----------------------------------------------------------------------------

/// Failures of a single snapshot publish or import attempt
///
/// Integrity variants are always fatal to that one attempt and never applied
/// partially; anti-regression variants are the guards against resurrecting
/// old state.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot {hash} was already imported")]
    AlreadySeen { hash: ContentHash },

    #[error("announcement at {announced:?} does not advance past {current:?}")]
    Regression {
        announced: Timestamp,
        current: Timestamp,
    },

    #[error("announcement is older than the staleness window")]
    StaleAnnouncement,

    #[error("snapshot payload digest does not match announced hash")]
    HashMismatch,

    #[error("first snapshot message is not a session descriptor")]
    InvalidLeadMessage,

    #[error("descriptor signer does not match declared snapshot owner")]
    OwnerMismatch,

    #[error("recomputed session id does not match {expected}")]
    SessionIdMismatch { expected: SessionId },

    #[error("snapshot or import already in flight for session {session}")]
    InFlight { session: SessionId },

    #[error("session log is empty")]
    EmptyLog,
}

// ----------------------------------------------------------------------------
// Session Errors
// ----------------------------------------------------------------------------

/// Session registry lifecycle errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not found: {id}")]
    NotFound { id: SessionId },

    #[error("session already exists: {id}")]
    AlreadyExists { id: SessionId },
}

// ----------------------------------------------------------------------------
// Unified Error Type
// ----------------------------------------------------------------------------

/// Core error type for the Agora protocol
#[derive(Debug, thiserror::Error)]
pub enum AgoraError {
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("malformed data: {reason}")]
    Malformed { reason: String },
}

impl AgoraError {
    /// Create a malformed-data error with a reason
    pub fn malformed<R: Into<String>>(reason: R) -> Self {
        AgoraError::Malformed {
            reason: reason.into(),
        }
    }

    /// Create a session-not-found error
    pub fn session_not_found(id: SessionId) -> Self {
        AgoraError::Session(SessionError::NotFound { id })
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, AgoraError>;
