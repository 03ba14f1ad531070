//! Message codec for the Agora protocol
//!
//! Defines the canonical shapes of every wire message, the signed envelope
//! that carries them, and the content-topic scheme. The canonical byte form
//! of a payload is its bincode encoding: every payload is a closed struct,
//! so field order is fixed by the type and equal logical values always
//! serialize to equal bytes.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::Rejection;
use crate::transport::Signer;
use crate::types::{Address, ContentHash, SessionId, Timestamp};
use crate::Result;

// ----------------------------------------------------------------------------
// Content Topics
// ----------------------------------------------------------------------------

/// Content topic carrying a session's regular message log
pub fn session_topic(id: &SessionId) -> String {
    format!("agora/1/{}", id)
}

/// Dedicated ephemeral topic for snapshot announcements
pub fn snapshot_topic(id: &SessionId) -> String {
    format!("agora/1/{}/snapshot", id)
}

// ----------------------------------------------------------------------------
// Message Kinds
// ----------------------------------------------------------------------------

/// Type tag of a wire message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    SessionDescriptor,
    QuestionSubmit,
    Upvote,
    Answer,
    Moderate,
    PollCreate,
    PollVote,
    PollSetActive,
    /// Snapshot announcement on the dedicated ephemeral topic
    SnapshotAnnounce,
    /// Snapshot announcement persisted into the regular session log
    SnapshotPersist,
}

impl MessageKind {
    /// Whether messages of this kind mutate the projection
    ///
    /// Snapshot kinds are routed to the snapshot manager instead of the
    /// state engine, both on live delivery and during replay.
    pub fn is_projection(&self) -> bool {
        !matches!(
            self,
            MessageKind::SnapshotAnnounce | MessageKind::SnapshotPersist
        )
    }
}

// ----------------------------------------------------------------------------
// Payloads
// ----------------------------------------------------------------------------

/// Authoritative metadata record for a session ("control" record)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub title: String,
    pub description: String,
    /// Derived identifier; recomputable from `(title, created_at, owner)`
    pub id: SessionId,
    /// Immutable after first acceptance
    pub owner: Address,
    pub admins: Vec<Address>,
    pub enabled: bool,
    pub moderation_enabled: bool,
    pub created_at: Timestamp,
    /// Revision clock; only strictly greater revisions replace the record
    pub updated_at: Timestamp,
}

impl SessionDescriptor {
    /// Recompute the identifier this descriptor should carry
    pub fn derived_id(&self, protected: bool) -> SessionId {
        SessionId::derive(&self.title, self.created_at, &self.owner, protected)
    }

    /// Whether the signer is the owner or one of the admins
    pub fn is_admin(&self, signer: &Address) -> bool {
        self.owner == *signer || self.admins.contains(signer)
    }
}

/// New question submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionSubmit {
    pub question: String,
    pub timestamp: Timestamp,
}

impl QuestionSubmit {
    /// Content-derived identity of this question (collision domain is the
    /// session: the same text at the same timestamp is the same question)
    pub fn question_hash(&self) -> Result<ContentHash> {
        ContentHash::of(self)
    }
}

/// Upvote on an existing question
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upvote {
    pub hash: ContentHash,
}

/// Answer to an existing question
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub hash: ContentHash,
    pub text: String,
}

/// Moderation flag change on an existing question
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Moderate {
    pub hash: ContentHash,
    pub moderated: bool,
}

/// One choice in a poll
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollOption {
    pub title: String,
}

/// Poll creation, issued by the session owner or an admin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollCreate {
    pub creator: Address,
    pub title: Option<String>,
    pub question: String,
    pub options: Vec<PollOption>,
    pub active: bool,
    pub timestamp: Timestamp,
}

impl PollCreate {
    /// Content-derived identity of this poll
    pub fn poll_id(&self) -> Result<ContentHash> {
        ContentHash::of(self)
    }
}

/// Vote for one option of an existing poll
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollVote {
    pub id: ContentHash,
    pub option: usize,
}

/// Activation flag change on an existing poll
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSetActive {
    pub id: ContentHash,
    pub active: bool,
}

/// Announcement of a published snapshot
///
/// `hash` authenticates the snapshot content; `cid` only locates it in the
/// blob store. The two are never interchangeable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotAnnounce {
    pub hash: ContentHash,
    pub cid: String,
    pub timestamp: Timestamp,
}

// ----------------------------------------------------------------------------
// Signed Envelope
// ----------------------------------------------------------------------------

/// A decoded application message as delivered by the transport
///
/// The transport has already authenticated `signer` against `signature`
/// before delivery; handlers treat the signer address as trusted input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub kind: MessageKind,
    /// Canonical bincode bytes of the typed payload
    pub payload: Vec<u8>,
    pub signer: Address,
    pub signature: Vec<u8>,
    /// Transport delivery timestamp
    pub timestamp: Timestamp,
}

impl SignedEnvelope {
    /// Build and sign an envelope around a typed payload
    pub fn signed<T: Serialize>(
        kind: MessageKind,
        payload: &T,
        signer: &dyn Signer,
        timestamp: Timestamp,
    ) -> Result<Self> {
        let payload = bincode::serialize(payload)?;
        let signature = signer.sign(&Self::signing_bytes(kind, &payload, timestamp)?);
        Ok(Self {
            kind,
            payload,
            signer: signer.address(),
            signature,
            timestamp,
        })
    }

    /// The byte string covered by the signature
    pub fn signing_bytes(
        kind: MessageKind,
        payload: &[u8],
        timestamp: Timestamp,
    ) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&(kind, payload, timestamp))?)
    }

    /// The byte string this envelope's signature covers
    pub fn signed_bytes(&self) -> Result<Vec<u8>> {
        Self::signing_bytes(self.kind, &self.payload, self.timestamp)
    }

    /// Decode the typed payload, reporting failures as a rejection so a
    /// garbled message from one peer never aborts the consumer loop
    pub fn decode_payload<T: DeserializeOwned>(&self) -> core::result::Result<T, Rejection> {
        bincode::deserialize(&self.payload).map_err(|e| Rejection::Malformed(e.to_string()))
    }
}

// ----------------------------------------------------------------------------
// Stored Message
// ----------------------------------------------------------------------------

/// An opaque (possibly encrypted) message as held by the transport's store
///
/// Snapshots carry stored messages verbatim so that import can verify the
/// payload decrypts under the encryption mode the session expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub payload: Vec<u8>,
    pub timestamp: Timestamp,
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_question_hash_deterministic() {
        let a = QuestionSubmit {
            question: "What is the roadmap?".to_string(),
            timestamp: Timestamp::new(1001),
        };
        let b = a.clone();
        assert_eq!(a.question_hash().unwrap(), b.question_hash().unwrap());

        let c = QuestionSubmit {
            question: "What is the roadmap?".to_string(),
            timestamp: Timestamp::new(1002),
        };
        assert_ne!(a.question_hash().unwrap(), c.question_hash().unwrap());
    }

    #[test]
    fn test_poll_id_covers_options() {
        let base = PollCreate {
            creator: Address::new("0xA"),
            title: None,
            question: "Snacks?".to_string(),
            options: vec![
                PollOption {
                    title: "yes".to_string(),
                },
                PollOption {
                    title: "no".to_string(),
                },
            ],
            active: true,
            timestamp: Timestamp::new(7),
        };
        let mut reordered = base.clone();
        reordered.options.reverse();
        assert_ne!(base.poll_id().unwrap(), reordered.poll_id().unwrap());
    }

    #[test]
    fn test_projection_kinds() {
        assert!(MessageKind::QuestionSubmit.is_projection());
        assert!(MessageKind::SessionDescriptor.is_projection());
        assert!(!MessageKind::SnapshotAnnounce.is_projection());
        assert!(!MessageKind::SnapshotPersist.is_projection());
    }

    #[test]
    fn test_topic_scheme() {
        let id = SessionId::parse("deadbeefdeadbeef");
        assert_eq!(session_topic(&id), "agora/1/deadbeefdeadbeef");
        assert_eq!(snapshot_topic(&id), "agora/1/deadbeefdeadbeef/snapshot");
    }
}
