//! Replicated state engine
//!
//! One handler per message kind, each a pure function of
//! `(projection, payload, signer, delivery metadata)` that either mutates
//! the projection and yields a domain event, or rejects the message with a
//! named reason. Handlers never panic on remote input and never partially
//! mutate state: every validation runs before the first write.
//!
//! The projection is exclusively owned by one engine instance per session.
//! Records are indexed by stable identifiers (question hash, poll id) and
//! mutated only through [`Projection::apply`]; no raw mutable references
//! cross the handler boundary.

use std::collections::{HashMap, HashSet};

use crate::errors::Rejection;
use crate::events::DomainEvent;
use crate::message::{
    Answer, MessageKind, Moderate, PollCreate, PollOption, PollSetActive, PollVote,
    QuestionSubmit, SessionDescriptor, SignedEnvelope, Upvote,
};
use crate::types::{Address, ContentHash, SessionId, Timestamp};

// ----------------------------------------------------------------------------
// Projection Records
// ----------------------------------------------------------------------------

/// Accepted answer attached to a question
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerRecord {
    pub text: String,
    pub responder: Address,
}

/// One question and its accumulated reactions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestionRecord {
    /// Content-derived identifier, unique within the session
    pub hash: ContentHash,
    pub question: String,
    pub timestamp: Timestamp,
    pub answer: Option<AnswerRecord>,
    pub moderated: bool,
    pub upvote_count: u64,
    pub upvoters: HashSet<Address>,
}

impl QuestionRecord {
    /// Whether an answer has been accepted
    pub fn is_answered(&self) -> bool {
        self.answer.is_some()
    }
}

/// One poll and its tallies
///
/// Voter sets are fully initialized at creation time, one per option, so
/// vote handling never has to materialize missing slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollRecord {
    pub id: ContentHash,
    pub creator: Address,
    pub title: Option<String>,
    pub question: String,
    pub options: Vec<PollOption>,
    pub active: bool,
    pub vote_count: u64,
    /// Per-option voter sets, same length as `options`
    pub voters: Vec<HashSet<Address>>,
}

impl PollRecord {
    /// Whether the signer has already voted for any option
    pub fn has_voted(&self, signer: &Address) -> bool {
        self.voters.iter().any(|set| set.contains(signer))
    }
}

// ----------------------------------------------------------------------------
// Projection
// ----------------------------------------------------------------------------

/// Authoritative in-memory projection of one session
#[derive(Debug)]
pub struct Projection {
    session_id: SessionId,
    descriptor: Option<SessionDescriptor>,
    questions: HashMap<ContentHash, QuestionRecord>,
    question_order: Vec<ContentHash>,
    polls: HashMap<ContentHash, PollRecord>,
    poll_order: Vec<ContentHash>,
}

impl Projection {
    /// Create an empty projection scoped to one session identifier
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            descriptor: None,
            questions: HashMap::new(),
            question_order: Vec::new(),
            polls: HashMap::new(),
            poll_order: Vec::new(),
        }
    }

    /// The session this projection belongs to
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// The accepted session descriptor, if any
    pub fn descriptor(&self) -> Option<&SessionDescriptor> {
        self.descriptor.as_ref()
    }

    /// Questions in arrival order
    pub fn questions(&self) -> impl Iterator<Item = &QuestionRecord> {
        self.question_order
            .iter()
            .filter_map(|hash| self.questions.get(hash))
    }

    /// Look up one question by its content hash
    pub fn question(&self, hash: &ContentHash) -> Option<&QuestionRecord> {
        self.questions.get(hash)
    }

    /// Number of accepted questions
    pub fn question_count(&self) -> usize {
        self.questions.len()
    }

    /// Polls in arrival order
    pub fn polls(&self) -> impl Iterator<Item = &PollRecord> {
        self.poll_order
            .iter()
            .filter_map(|id| self.polls.get(id))
    }

    /// Look up one poll by its content-derived identifier
    pub fn poll(&self, id: &ContentHash) -> Option<&PollRecord> {
        self.polls.get(id)
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    /// Apply one decoded message to the projection
    ///
    /// Returns the domain event for an accepted mutation, or the named
    /// rejection reason. Rejections leave the projection untouched.
    pub fn apply(&mut self, envelope: &SignedEnvelope) -> Result<DomainEvent, Rejection> {
        let signer = envelope.signer.clone();
        match envelope.kind {
            MessageKind::SessionDescriptor => {
                self.handle_descriptor(envelope.decode_payload()?, &signer)
            }
            MessageKind::QuestionSubmit => {
                self.handle_question(envelope.decode_payload()?)
            }
            MessageKind::Upvote => self.handle_upvote(envelope.decode_payload()?, &signer),
            MessageKind::Answer => self.handle_answer(envelope.decode_payload()?, &signer),
            MessageKind::Moderate => self.handle_moderate(envelope.decode_payload()?, &signer),
            MessageKind::PollCreate => {
                self.handle_poll_create(envelope.decode_payload()?, &signer)
            }
            MessageKind::PollVote => self.handle_poll_vote(envelope.decode_payload()?, &signer),
            MessageKind::PollSetActive => {
                self.handle_poll_set_active(envelope.decode_payload()?, &signer)
            }
            MessageKind::SnapshotAnnounce | MessageKind::SnapshotPersist => Err(
                Rejection::Malformed("snapshot messages do not mutate the projection".into()),
            ),
        }
    }

    // ------------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------------

    fn handle_descriptor(
        &mut self,
        descriptor: SessionDescriptor,
        signer: &Address,
    ) -> Result<DomainEvent, Rejection> {
        if descriptor.title.is_empty() {
            return Err(Rejection::Malformed("descriptor title is empty".into()));
        }
        if *signer != descriptor.owner {
            return Err(Rejection::Unauthorized);
        }
        if descriptor.id != self.session_id {
            return Err(Rejection::UnknownTarget);
        }

        match &self.descriptor {
            None => {
                self.descriptor = Some(descriptor);
                Ok(DomainEvent::SessionCreated {
                    id: self.session_id.clone(),
                })
            }
            Some(current) => {
                // Owner is immutable after first acceptance
                if descriptor.owner != current.owner {
                    return Err(Rejection::Unauthorized);
                }
                // Strict > required: ties lose so replay cannot regress state
                if descriptor.updated_at <= current.updated_at {
                    return Err(Rejection::StaleRevision);
                }
                self.descriptor = Some(descriptor);
                Ok(DomainEvent::SessionUpdated {
                    id: self.session_id.clone(),
                })
            }
        }
    }

    fn handle_question(&mut self, submit: QuestionSubmit) -> Result<DomainEvent, Rejection> {
        self.enabled_descriptor()?;
        if submit.question.is_empty() {
            return Err(Rejection::Malformed("question text is empty".into()));
        }
        let hash = submit
            .question_hash()
            .map_err(|e| Rejection::Malformed(e.to_string()))?;
        if self.questions.contains_key(&hash) {
            return Err(Rejection::Duplicate);
        }

        self.questions.insert(
            hash,
            QuestionRecord {
                hash,
                question: submit.question,
                timestamp: submit.timestamp,
                answer: None,
                moderated: false,
                upvote_count: 0,
                upvoters: HashSet::new(),
            },
        );
        self.question_order.push(hash);
        Ok(DomainEvent::QuestionCreated { hash })
    }

    fn handle_upvote(&mut self, upvote: Upvote, signer: &Address) -> Result<DomainEvent, Rejection> {
        self.enabled_descriptor()?;
        let question = self
            .questions
            .get(&upvote.hash)
            .ok_or(Rejection::UnknownTarget)?;
        if question.is_answered() {
            return Err(Rejection::AlreadyAnswered);
        }
        if question.moderated {
            return Err(Rejection::Moderated);
        }
        if question.upvoters.contains(signer) {
            return Err(Rejection::Duplicate);
        }

        let question = self
            .questions
            .get_mut(&upvote.hash)
            .ok_or(Rejection::UnknownTarget)?;
        question.upvoters.insert(signer.clone());
        question.upvote_count += 1;
        Ok(DomainEvent::QuestionUpvoted {
            hash: upvote.hash,
            upvotes: question.upvote_count,
        })
    }

    fn handle_answer(&mut self, answer: Answer, signer: &Address) -> Result<DomainEvent, Rejection> {
        self.require_admin(signer)?;
        let question = self
            .questions
            .get(&answer.hash)
            .ok_or(Rejection::UnknownTarget)?;
        if question.is_answered() {
            return Err(Rejection::AlreadyAnswered);
        }

        let question = self
            .questions
            .get_mut(&answer.hash)
            .ok_or(Rejection::UnknownTarget)?;
        question.answer = Some(AnswerRecord {
            text: answer.text,
            responder: signer.clone(),
        });
        Ok(DomainEvent::QuestionAnswered {
            hash: answer.hash,
            responder: signer.clone(),
        })
    }

    fn handle_moderate(
        &mut self,
        moderate: Moderate,
        signer: &Address,
    ) -> Result<DomainEvent, Rejection> {
        self.require_admin(signer)?;
        // No answered-state restriction: an answered abusive question can
        // still be hidden.
        let question = self
            .questions
            .get_mut(&moderate.hash)
            .ok_or(Rejection::UnknownTarget)?;
        question.moderated = moderate.moderated;
        Ok(DomainEvent::QuestionModerated {
            hash: moderate.hash,
            moderated: moderate.moderated,
        })
    }

    fn handle_poll_create(
        &mut self,
        create: PollCreate,
        signer: &Address,
    ) -> Result<DomainEvent, Rejection> {
        self.require_admin(signer)?;
        if *signer != create.creator {
            return Err(Rejection::Unauthorized);
        }
        if create.options.is_empty() {
            return Err(Rejection::Malformed("poll has no options".into()));
        }
        let id = create
            .poll_id()
            .map_err(|e| Rejection::Malformed(e.to_string()))?;
        if self.polls.contains_key(&id) {
            return Err(Rejection::Duplicate);
        }

        let voters = vec![HashSet::new(); create.options.len()];
        self.polls.insert(
            id,
            PollRecord {
                id,
                creator: create.creator,
                title: create.title,
                question: create.question,
                options: create.options,
                active: create.active,
                vote_count: 0,
                voters,
            },
        );
        self.poll_order.push(id);
        Ok(DomainEvent::PollCreated { id })
    }

    fn handle_poll_vote(
        &mut self,
        vote: PollVote,
        signer: &Address,
    ) -> Result<DomainEvent, Rejection> {
        let poll = self.polls.get(&vote.id).ok_or(Rejection::UnknownTarget)?;
        if !poll.active {
            return Err(Rejection::PollInactive);
        }
        if vote.option >= poll.options.len() {
            return Err(Rejection::OptionOutOfRange);
        }
        if poll.has_voted(signer) {
            return Err(Rejection::Duplicate);
        }

        let poll = self.polls.get_mut(&vote.id).ok_or(Rejection::UnknownTarget)?;
        poll.voters[vote.option].insert(signer.clone());
        poll.vote_count += 1;
        Ok(DomainEvent::PollVoted {
            id: vote.id,
            votes: poll.vote_count,
        })
    }

    fn handle_poll_set_active(
        &mut self,
        set_active: PollSetActive,
        signer: &Address,
    ) -> Result<DomainEvent, Rejection> {
        self.require_admin(signer)?;
        let poll = self
            .polls
            .get_mut(&set_active.id)
            .ok_or(Rejection::UnknownTarget)?;
        poll.active = set_active.active;
        Ok(DomainEvent::PollActiveChanged {
            id: set_active.id,
            active: set_active.active,
        })
    }

    // ------------------------------------------------------------------------
    // Shared Checks
    // ------------------------------------------------------------------------

    /// The descriptor of an enabled session, or the closed-session rejection
    fn enabled_descriptor(&self) -> Result<&SessionDescriptor, Rejection> {
        match &self.descriptor {
            Some(descriptor) if descriptor.enabled => Ok(descriptor),
            _ => Err(Rejection::SessionClosed),
        }
    }

    /// Require the signer to be the session owner or one of the admins
    fn require_admin(&self, signer: &Address) -> Result<(), Rejection> {
        match &self.descriptor {
            Some(descriptor) if descriptor.is_admin(signer) => Ok(()),
            Some(_) => Err(Rejection::Unauthorized),
            None => Err(Rejection::SessionClosed),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    const OWNER: &str = "0xA";

    fn descriptor_payload(enabled: bool, updated_at: u64) -> SessionDescriptor {
        let owner = Address::new(OWNER);
        let created_at = Timestamp::new(1000);
        SessionDescriptor {
            title: "Town Hall".to_string(),
            description: "weekly".to_string(),
            id: SessionId::derive("Town Hall", created_at, &owner, false),
            owner,
            admins: vec![Address::new("0xAD")],
            enabled,
            moderation_enabled: true,
            created_at,
            updated_at: Timestamp::new(updated_at),
        }
    }

    fn envelope<T: Serialize>(kind: MessageKind, payload: &T, signer: &str, ts: u64) -> SignedEnvelope {
        SignedEnvelope {
            kind,
            payload: bincode::serialize(payload).unwrap(),
            signer: Address::new(signer),
            signature: Vec::new(),
            timestamp: Timestamp::new(ts),
        }
    }

    fn projection_with_session() -> Projection {
        let descriptor = descriptor_payload(true, 1000);
        let mut projection = Projection::new(descriptor.id.clone());
        projection
            .apply(&envelope(
                MessageKind::SessionDescriptor,
                &descriptor,
                OWNER,
                1000,
            ))
            .unwrap();
        projection
    }

    fn submit_question(projection: &mut Projection, text: &str, ts: u64) -> ContentHash {
        let submit = QuestionSubmit {
            question: text.to_string(),
            timestamp: Timestamp::new(ts),
        };
        let hash = submit.question_hash().unwrap();
        projection
            .apply(&envelope(MessageKind::QuestionSubmit, &submit, "0xQ", ts))
            .unwrap();
        hash
    }

    fn poll_payload(active: bool) -> PollCreate {
        PollCreate {
            creator: Address::new(OWNER),
            title: None,
            question: "Pizza or tacos?".to_string(),
            options: vec![
                PollOption {
                    title: "pizza".to_string(),
                },
                PollOption {
                    title: "tacos".to_string(),
                },
            ],
            active,
            timestamp: Timestamp::new(2000),
        }
    }

    #[test]
    fn test_descriptor_creates_session() {
        let mut projection = projection_with_session();
        let descriptor = projection.descriptor().unwrap();
        assert!(descriptor.enabled);
        assert_eq!(descriptor.owner, Address::new(OWNER));

        // A later revision from the owner replaces the record wholesale
        let revision = descriptor_payload(false, 1005);
        let event = projection
            .apply(&envelope(MessageKind::SessionDescriptor, &revision, OWNER, 1005))
            .unwrap();
        assert!(matches!(event, DomainEvent::SessionUpdated { .. }));
        assert!(!projection.descriptor().unwrap().enabled);
    }

    #[test]
    fn test_descriptor_rejects_forged_owner() {
        let mut projection = projection_with_session();
        let forged = descriptor_payload(false, 2000);
        let result = projection.apply(&envelope(
            MessageKind::SessionDescriptor,
            &forged,
            "0xEVIL",
            2000,
        ));
        assert_eq!(result.unwrap_err(), Rejection::Unauthorized);
    }

    #[test]
    fn test_descriptor_monotonic_out_of_order() {
        // t=5 disables, t=3 enables, delivered in reverse order: t=5 wins
        let mut projection = projection_with_session();
        let disable = descriptor_payload(false, 1005);
        let enable = descriptor_payload(true, 1003);

        projection
            .apply(&envelope(MessageKind::SessionDescriptor, &disable, OWNER, 1005))
            .unwrap();
        let result = projection.apply(&envelope(
            MessageKind::SessionDescriptor,
            &enable,
            OWNER,
            1003,
        ));
        assert_eq!(result.unwrap_err(), Rejection::StaleRevision);
        assert!(!projection.descriptor().unwrap().enabled);
    }

    #[test]
    fn test_descriptor_equal_timestamp_loses() {
        let mut projection = projection_with_session();
        let tie = descriptor_payload(false, 1000);
        let result = projection.apply(&envelope(
            MessageKind::SessionDescriptor,
            &tie,
            OWNER,
            1000,
        ));
        assert_eq!(result.unwrap_err(), Rejection::StaleRevision);
    }

    #[test]
    fn test_descriptor_wrong_session_id() {
        let mut projection = Projection::new(SessionId::parse("0000000000000000"));
        let descriptor = descriptor_payload(true, 1000);
        let result = projection.apply(&envelope(
            MessageKind::SessionDescriptor,
            &descriptor,
            OWNER,
            1000,
        ));
        assert_eq!(result.unwrap_err(), Rejection::UnknownTarget);
    }

    #[test]
    fn test_question_lifecycle_scenario() {
        // Session by 0xA at t=1000, Q1 at t=1001, upvote rules around answering
        let mut projection = projection_with_session();
        let h1 = submit_question(&mut projection, "Q1", 1001);

        let upvote = Upvote { hash: h1 };
        let event = projection
            .apply(&envelope(MessageKind::Upvote, &upvote, "0xB", 1002))
            .unwrap();
        assert!(matches!(event, DomainEvent::QuestionUpvoted { upvotes: 1, .. }));

        // Second upvote from the same signer is rejected, count unchanged
        let result = projection.apply(&envelope(MessageKind::Upvote, &upvote, "0xB", 1003));
        assert_eq!(result.unwrap_err(), Rejection::Duplicate);
        assert_eq!(projection.question(&h1).unwrap().upvote_count, 1);

        let answer = Answer {
            hash: h1,
            text: "shipping next week".to_string(),
        };
        projection
            .apply(&envelope(MessageKind::Answer, &answer, OWNER, 1004))
            .unwrap();
        assert!(projection.question(&h1).unwrap().is_answered());

        // Upvotes after the answer are rejected even from fresh signers
        let result = projection.apply(&envelope(MessageKind::Upvote, &upvote, "0xC", 1005));
        assert_eq!(result.unwrap_err(), Rejection::AlreadyAnswered);
        assert_eq!(projection.question(&h1).unwrap().upvote_count, 1);
    }

    #[test]
    fn test_upvote_exclusivity_invariant() {
        let mut projection = projection_with_session();
        let h1 = submit_question(&mut projection, "counts", 1001);

        for signer in ["0xB", "0xC", "0xD", "0xB"] {
            let _ = projection.apply(&envelope(
                MessageKind::Upvote,
                &Upvote { hash: h1 },
                signer,
                1002,
            ));
        }
        let question = projection.question(&h1).unwrap();
        assert_eq!(question.upvote_count, 3);
        assert_eq!(question.upvote_count as usize, question.upvoters.len());
    }

    #[test]
    fn test_question_rejected_when_disabled() {
        let mut projection = projection_with_session();
        let disable = descriptor_payload(false, 1005);
        projection
            .apply(&envelope(MessageKind::SessionDescriptor, &disable, OWNER, 1005))
            .unwrap();

        let submit = QuestionSubmit {
            question: "too late".to_string(),
            timestamp: Timestamp::new(1010),
        };
        let result = projection.apply(&envelope(MessageKind::QuestionSubmit, &submit, "0xQ", 1010));
        assert_eq!(result.unwrap_err(), Rejection::SessionClosed);
    }

    #[test]
    fn test_question_rejects_empty_and_duplicate() {
        let mut projection = projection_with_session();

        let empty = QuestionSubmit {
            question: String::new(),
            timestamp: Timestamp::new(1001),
        };
        assert!(matches!(
            projection
                .apply(&envelope(MessageKind::QuestionSubmit, &empty, "0xQ", 1001))
                .unwrap_err(),
            Rejection::Malformed(_)
        ));

        let submit = QuestionSubmit {
            question: "once".to_string(),
            timestamp: Timestamp::new(1001),
        };
        projection
            .apply(&envelope(MessageKind::QuestionSubmit, &submit, "0xQ", 1001))
            .unwrap();
        let result = projection.apply(&envelope(MessageKind::QuestionSubmit, &submit, "0xR", 1002));
        assert_eq!(result.unwrap_err(), Rejection::Duplicate);
        assert_eq!(projection.question_count(), 1);
    }

    #[test]
    fn test_answer_requires_owner_or_admin() {
        let mut projection = projection_with_session();
        let h1 = submit_question(&mut projection, "who may answer", 1001);

        let answer = Answer {
            hash: h1,
            text: "me".to_string(),
        };
        let result = projection.apply(&envelope(MessageKind::Answer, &answer, "0xB", 1002));
        assert_eq!(result.unwrap_err(), Rejection::Unauthorized);

        // Admins listed in the descriptor may answer
        projection
            .apply(&envelope(MessageKind::Answer, &answer, "0xAD", 1003))
            .unwrap();
        assert_eq!(
            projection.question(&h1).unwrap().answer.as_ref().unwrap().responder,
            Address::new("0xAD")
        );
    }

    #[test]
    fn test_answer_finality() {
        let mut projection = projection_with_session();
        let h1 = submit_question(&mut projection, "answer once", 1001);

        let answer = Answer {
            hash: h1,
            text: "first".to_string(),
        };
        projection
            .apply(&envelope(MessageKind::Answer, &answer, OWNER, 1002))
            .unwrap();

        let second = Answer {
            hash: h1,
            text: "second".to_string(),
        };
        let result = projection.apply(&envelope(MessageKind::Answer, &second, OWNER, 1003));
        assert_eq!(result.unwrap_err(), Rejection::AlreadyAnswered);
        assert_eq!(
            projection.question(&h1).unwrap().answer.as_ref().unwrap().text,
            "first"
        );
    }

    #[test]
    fn test_moderation_allowed_after_answer() {
        let mut projection = projection_with_session();
        let h1 = submit_question(&mut projection, "rude but answered", 1001);
        projection
            .apply(&envelope(
                MessageKind::Answer,
                &Answer {
                    hash: h1,
                    text: "noted".to_string(),
                },
                OWNER,
                1002,
            ))
            .unwrap();

        projection
            .apply(&envelope(
                MessageKind::Moderate,
                &Moderate {
                    hash: h1,
                    moderated: true,
                },
                OWNER,
                1003,
            ))
            .unwrap();
        assert!(projection.question(&h1).unwrap().moderated);
    }

    #[test]
    fn test_moderation_gates() {
        let mut projection = projection_with_session();
        let h1 = submit_question(&mut projection, "moderate me", 1001);

        let moderate = Moderate {
            hash: h1,
            moderated: true,
        };
        let result = projection.apply(&envelope(MessageKind::Moderate, &moderate, "0xB", 1002));
        assert_eq!(result.unwrap_err(), Rejection::Unauthorized);

        projection
            .apply(&envelope(MessageKind::Moderate, &moderate, OWNER, 1003))
            .unwrap();

        // Upvotes on a moderated question are rejected
        let result = projection.apply(&envelope(
            MessageKind::Upvote,
            &Upvote { hash: h1 },
            "0xB",
            1004,
        ));
        assert_eq!(result.unwrap_err(), Rejection::Moderated);

        // The flag is a toggle; clearing it reopens upvotes
        projection
            .apply(&envelope(
                MessageKind::Moderate,
                &Moderate {
                    hash: h1,
                    moderated: false,
                },
                "0xAD",
                1005,
            ))
            .unwrap();
        projection
            .apply(&envelope(MessageKind::Upvote, &Upvote { hash: h1 }, "0xB", 1006))
            .unwrap();
    }

    #[test]
    fn test_poll_create_authorization() {
        let mut projection = projection_with_session();
        let create = poll_payload(true);

        // Outsider cannot create polls
        let result = projection.apply(&envelope(MessageKind::PollCreate, &create, "0xB", 2000));
        assert_eq!(result.unwrap_err(), Rejection::Unauthorized);

        // Admin cannot impersonate the declared creator
        let result = projection.apply(&envelope(MessageKind::PollCreate, &create, "0xAD", 2000));
        assert_eq!(result.unwrap_err(), Rejection::Unauthorized);

        let id = create.poll_id().unwrap();
        projection
            .apply(&envelope(MessageKind::PollCreate, &create, OWNER, 2000))
            .unwrap();

        // Tallies are fully initialized at creation, one set per option
        let poll = projection.poll(&id).unwrap();
        assert_eq!(poll.voters.len(), poll.options.len());
        assert_eq!(poll.vote_count, 0);

        // Re-creation of the same poll is a duplicate
        let result = projection.apply(&envelope(MessageKind::PollCreate, &create, OWNER, 2001));
        assert_eq!(result.unwrap_err(), Rejection::Duplicate);
    }

    #[test]
    fn test_poll_vote_rules() {
        let mut projection = projection_with_session();
        let create = poll_payload(true);
        let id = create.poll_id().unwrap();
        projection
            .apply(&envelope(MessageKind::PollCreate, &create, OWNER, 2000))
            .unwrap();

        // Out-of-range option index is always rejected
        let result = projection.apply(&envelope(
            MessageKind::PollVote,
            &PollVote { id, option: 2 },
            "0xB",
            2001,
        ));
        assert_eq!(result.unwrap_err(), Rejection::OptionOutOfRange);

        projection
            .apply(&envelope(
                MessageKind::PollVote,
                &PollVote { id, option: 0 },
                "0xB",
                2002,
            ))
            .unwrap();

        // One vote per signer per poll, even for a different option
        let result = projection.apply(&envelope(
            MessageKind::PollVote,
            &PollVote { id, option: 1 },
            "0xB",
            2003,
        ));
        assert_eq!(result.unwrap_err(), Rejection::Duplicate);
        assert_eq!(projection.poll(&id).unwrap().vote_count, 1);

        // Unknown poll
        let result = projection.apply(&envelope(
            MessageKind::PollVote,
            &PollVote {
                id: ContentHash::digest(b"no such poll"),
                option: 0,
            },
            "0xB",
            2004,
        ));
        assert_eq!(result.unwrap_err(), Rejection::UnknownTarget);
    }

    #[test]
    fn test_poll_activation() {
        let mut projection = projection_with_session();
        let create = poll_payload(false);
        let id = create.poll_id().unwrap();
        projection
            .apply(&envelope(MessageKind::PollCreate, &create, OWNER, 2000))
            .unwrap();

        // Votes on an inactive poll are rejected
        let result = projection.apply(&envelope(
            MessageKind::PollVote,
            &PollVote { id, option: 0 },
            "0xB",
            2001,
        ));
        assert_eq!(result.unwrap_err(), Rejection::PollInactive);

        // Only owner/admins may flip the flag
        let flip = PollSetActive { id, active: true };
        let result = projection.apply(&envelope(MessageKind::PollSetActive, &flip, "0xB", 2002));
        assert_eq!(result.unwrap_err(), Rejection::Unauthorized);

        projection
            .apply(&envelope(MessageKind::PollSetActive, &flip, "0xAD", 2003))
            .unwrap();
        projection
            .apply(&envelope(
                MessageKind::PollVote,
                &PollVote { id, option: 0 },
                "0xB",
                2004,
            ))
            .unwrap();
    }

    #[test]
    fn test_replay_idempotence() {
        // Applying the same valid message twice leaves the projection as if
        // applied once; the second application is a benign rejection
        let mut projection = projection_with_session();
        let submit = QuestionSubmit {
            question: "replayed".to_string(),
            timestamp: Timestamp::new(1001),
        };
        let env = envelope(MessageKind::QuestionSubmit, &submit, "0xQ", 1001);

        projection.apply(&env).unwrap();
        let second = projection.apply(&env).unwrap_err();
        assert!(second.is_benign());
        assert_eq!(projection.question_count(), 1);
    }

    #[test]
    fn test_garbled_payload_is_rejected_not_fatal() {
        let mut projection = projection_with_session();
        let garbled = SignedEnvelope {
            kind: MessageKind::Upvote,
            payload: vec![0xFF; 3],
            signer: Address::new("0xB"),
            signature: Vec::new(),
            timestamp: Timestamp::new(1002),
        };
        assert!(matches!(
            projection.apply(&garbled).unwrap_err(),
            Rejection::Malformed(_)
        ));
        // Engine still processes subsequent unrelated messages
        submit_question(&mut projection, "still alive", 1003);
    }
}
