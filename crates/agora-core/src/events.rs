//! Domain events emitted by the state engine
//!
//! One typed event per accepted mutation, delivered to observers through a
//! broadcast channel per session. There is no callback registry; consumers
//! subscribe to the channel and drop out by dropping the receiver.

use crate::snapshot::SnapshotRecord;
use crate::types::{Address, ContentHash, SessionId};

// ----------------------------------------------------------------------------
// Domain Events
// ----------------------------------------------------------------------------

/// Event produced for every accepted projection mutation
#[derive(Debug, Clone)]
pub enum DomainEvent {
    /// First descriptor accepted for the session
    SessionCreated { id: SessionId },
    /// Descriptor replaced by a newer owner revision
    SessionUpdated { id: SessionId },
    QuestionCreated { hash: ContentHash },
    QuestionUpvoted { hash: ContentHash, upvotes: u64 },
    QuestionAnswered {
        hash: ContentHash,
        responder: Address,
    },
    QuestionModerated { hash: ContentHash, moderated: bool },
    PollCreated { id: ContentHash },
    PollVoted { id: ContentHash, votes: u64 },
    PollActiveChanged { id: ContentHash, active: bool },
    /// Local snapshot published and announced
    SnapshotPublished { record: SnapshotRecord },
    /// Foreign snapshot imported and replayed
    SnapshotImported {
        hash: ContentHash,
        messages: usize,
    },
}
