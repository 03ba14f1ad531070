//! Session registry
//!
//! Keyed collection of active sessions. Each session owns exactly one
//! projection, one transport binding per topic, and one consumer task — the
//! single logical consumer through which every message for that session is
//! applied. The registry also exposes the local author operations that
//! build, sign, and publish messages for the local identity.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AgoraConfig;
use crate::errors::SessionError;
use crate::events::DomainEvent;
use crate::message::{
    session_topic, snapshot_topic, Answer, MessageKind, Moderate, PollCreate, PollOption,
    PollSetActive, PollVote, QuestionSubmit, SessionDescriptor, SignedEnvelope, SnapshotAnnounce,
    StoredMessage, Upvote,
};
use crate::snapshot::SnapshotManager;
use crate::state::{PollRecord, Projection, QuestionRecord};
use crate::transport::{
    BlobStore, EncryptionMode, Signer, SnapshotRecordStore, SymmetricKey, Transport,
};
use crate::types::{Address, ContentHash, SessionId, TimeSource};
use crate::{AgoraError, Result};

// ----------------------------------------------------------------------------
// Replay
// ----------------------------------------------------------------------------

/// Outcome of replaying a topic's local store through the handlers
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplayStats {
    /// Messages accepted by the engine
    pub applied: usize,
    /// Messages rejected (duplicates under at-least-once delivery are
    /// expected here)
    pub rejected: usize,
}

/// Replay a topic's local store through the normal per-type handlers
///
/// This is the only way state enters a projection outside live delivery:
/// session bootstrap and snapshot import both funnel through here, so the
/// import path can never bypass handler invariants.
pub(crate) async fn replay_into(
    transport: &dyn Transport,
    topic: &str,
    projection: &Mutex<Projection>,
    events: Option<&broadcast::Sender<DomainEvent>>,
) -> Result<ReplayStats> {
    let messages = transport.query_local(topic).await?;
    let mut stats = ReplayStats::default();
    let mut accepted = Vec::new();
    {
        let mut projection = projection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for message in &messages {
            let envelope = match transport.decode(topic, message) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(topic, error = %e, "skipping undecodable stored message");
                    stats.rejected += 1;
                    continue;
                }
            };
            if !envelope.kind.is_projection() {
                continue;
            }
            match projection.apply(&envelope) {
                Ok(event) => {
                    stats.applied += 1;
                    accepted.push(event);
                }
                Err(rejection) if rejection.is_benign() => {
                    stats.rejected += 1;
                    debug!(topic, %rejection, "replayed message dropped");
                }
                Err(rejection) => {
                    stats.rejected += 1;
                    warn!(topic, %rejection, "replayed message rejected");
                }
            }
        }
    }
    if let Some(events) = events {
        for event in accepted {
            let _ = events.send(event);
        }
    }
    Ok(stats)
}

// ----------------------------------------------------------------------------
// Session Options
// ----------------------------------------------------------------------------

/// Parameters for creating a new session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub title: String,
    pub description: String,
    /// Installing a passphrase derives a symmetric topic key and marks the
    /// session identifier as protected
    pub passphrase: Option<String>,
    pub enabled: bool,
    pub moderation_enabled: bool,
    pub admins: Vec<Address>,
}

impl SessionOptions {
    /// Options for an open, enabled session with the given title
    pub fn new<S: Into<String>>(title: S) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            passphrase: None,
            enabled: true,
            moderation_enabled: false,
            admins: Vec::new(),
        }
    }
}

/// Specification of a new poll
#[derive(Debug, Clone)]
pub struct PollSpec {
    pub title: Option<String>,
    pub question: String,
    pub options: Vec<String>,
    pub active: bool,
}

// ----------------------------------------------------------------------------
// Session Handle
// ----------------------------------------------------------------------------

/// One live session: projection, event channel, and its background tasks
pub struct SessionHandle {
    id: SessionId,
    projection: Arc<Mutex<Projection>>,
    events: broadcast::Sender<DomainEvent>,
    consumer: JoinHandle<()>,
    publisher: JoinHandle<()>,
}

impl SessionHandle {
    /// The session's derived identifier
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Subscribe to the session's domain events
    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.events.subscribe()
    }

    /// The accepted descriptor, if any
    pub fn descriptor(&self) -> Option<SessionDescriptor> {
        self.lock_projection().descriptor().cloned()
    }

    /// Questions in arrival order
    pub fn questions(&self) -> Vec<QuestionRecord> {
        self.lock_projection().questions().cloned().collect()
    }

    /// Look up one question
    pub fn question(&self, hash: &ContentHash) -> Option<QuestionRecord> {
        self.lock_projection().question(hash).cloned()
    }

    /// Polls in arrival order
    pub fn polls(&self) -> Vec<PollRecord> {
        self.lock_projection().polls().cloned().collect()
    }

    /// Look up one poll
    pub fn poll(&self, id: &ContentHash) -> Option<PollRecord> {
        self.lock_projection().poll(id).cloned()
    }

    fn lock_projection(&self) -> std::sync::MutexGuard<'_, Projection> {
        self.projection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ----------------------------------------------------------------------------
// Session Registry
// ----------------------------------------------------------------------------

/// Creates, attaches, and tears down sessions
pub struct SessionRegistry {
    transport: Arc<dyn Transport>,
    signer: Arc<dyn Signer>,
    snapshots: Arc<SnapshotManager>,
    time: Arc<dyn TimeSource>,
    config: AgoraConfig,
    sessions: Mutex<HashMap<SessionId, Arc<SessionHandle>>>,
}

impl SessionRegistry {
    /// Create a registry over the external collaborators
    pub fn new(
        transport: Arc<dyn Transport>,
        blob_store: Arc<dyn BlobStore>,
        signer: Arc<dyn Signer>,
        records: Arc<dyn SnapshotRecordStore>,
        time: Arc<dyn TimeSource>,
        config: AgoraConfig,
    ) -> Self {
        let snapshots = Arc::new(SnapshotManager::new(
            Arc::clone(&transport),
            blob_store,
            Arc::clone(&signer),
            records,
            Arc::clone(&time),
            config.snapshot.clone(),
        ));
        Self {
            transport,
            signer,
            snapshots,
            time,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Identifiers of all live sessions
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.lock_sessions().keys().cloned().collect()
    }

    /// The snapshot manager shared by all sessions of this registry
    pub fn snapshots(&self) -> &Arc<SnapshotManager> {
        &self.snapshots
    }

    /// Look up a live session
    pub fn session(&self, id: &SessionId) -> Result<Arc<SessionHandle>> {
        self.lock_sessions()
            .get(id)
            .cloned()
            .ok_or_else(|| AgoraError::session_not_found(id.clone()))
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Create a new session owned by the local identity
    ///
    /// Derives the identifier, publishes the first descriptor, binds the
    /// topics, and starts the consumer and snapshot loops.
    pub async fn create_session(&self, options: SessionOptions) -> Result<Arc<SessionHandle>> {
        let now = self.time.now();
        let owner = self.signer.address();
        let id = SessionId::derive(&options.title, now, &owner, options.passphrase.is_some());
        if self.lock_sessions().contains_key(&id) {
            return Err(SessionError::AlreadyExists { id }.into());
        }

        let descriptor = SessionDescriptor {
            title: options.title,
            description: options.description,
            id: id.clone(),
            owner,
            admins: options.admins,
            enabled: options.enabled,
            moderation_enabled: options.moderation_enabled,
            created_at: now,
            updated_at: now,
        };
        let envelope =
            SignedEnvelope::signed(MessageKind::SessionDescriptor, &descriptor, &*self.signer, now)?;

        self.open_session(id, options.passphrase, Some(envelope)).await
    }

    /// Attach to an existing session by identifier
    ///
    /// The descriptor arrives through replay or live delivery; a protected
    /// identifier requires the matching passphrase.
    pub async fn attach_session(
        &self,
        id: SessionId,
        passphrase: Option<String>,
    ) -> Result<Arc<SessionHandle>> {
        if id.is_protected() && passphrase.is_none() {
            return Err(AgoraError::malformed(
                "protected session requires a passphrase",
            ));
        }
        if self.lock_sessions().contains_key(&id) {
            return Err(SessionError::AlreadyExists { id }.into());
        }
        self.open_session(id, passphrase, None).await
    }

    /// Tear down a session: unbind the transport, stop the tasks, and drop
    /// the projection. In-flight snapshot work is left to finish and its
    /// results are discarded with the handle.
    pub async fn close_session(&self, id: &SessionId) -> Result<()> {
        let handle = self
            .lock_sessions()
            .remove(id)
            .ok_or_else(|| AgoraError::session_not_found(id.clone()))?;
        handle.consumer.abort();
        handle.publisher.abort();
        self.transport.unbind(&session_topic(id)).await?;
        self.transport.unbind(&snapshot_topic(id)).await?;
        info!(session = %id, "session closed");
        Ok(())
    }

    async fn open_session(
        &self,
        id: SessionId,
        passphrase: Option<String>,
        first_descriptor: Option<SignedEnvelope>,
    ) -> Result<Arc<SessionHandle>> {
        let mode = match passphrase {
            Some(passphrase) => {
                EncryptionMode::Symmetric(SymmetricKey::from_passphrase(&passphrase))
            }
            None => EncryptionMode::None,
        };
        let topic = session_topic(&id);
        let receiver = self.transport.bind(&topic, mode.clone()).await?;
        let snapshot_receiver = self.transport.bind(&snapshot_topic(&id), mode).await?;

        if let Some(envelope) = first_descriptor {
            self.transport.publish(&topic, &envelope).await?;
        }

        let projection = Arc::new(Mutex::new(Projection::new(id.clone())));
        let (events, _) = broadcast::channel(self.config.session.event_buffer_size);

        // Bootstrap from the local store; go to the network only when local
        // replay yields no questions.
        let stats = replay_into(&*self.transport, &topic, &projection, None).await?;
        debug!(session = %id, applied = stats.applied, "local replay complete");
        let empty = {
            let projection = projection
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            projection.question_count() == 0
        };
        if empty && self.config.session.network_fallback {
            let remote = self.transport.query_network(&topic).await?;
            if !remote.is_empty() {
                self.transport.import_local(&topic, remote).await?;
                let stats = replay_into(&*self.transport, &topic, &projection, None).await?;
                debug!(session = %id, applied = stats.applied, "network replay complete");
            }
        }

        let consumer = self.spawn_consumer(
            id.clone(),
            receiver,
            snapshot_receiver,
            Arc::clone(&projection),
            events.clone(),
        );
        let publisher = self.snapshots.spawn_publish_loop(id.clone(), events.clone());

        let handle = Arc::new(SessionHandle {
            id: id.clone(),
            projection,
            events,
            consumer,
            publisher,
        });
        self.lock_sessions().insert(id.clone(), Arc::clone(&handle));
        info!(session = %id, "session open");
        Ok(handle)
    }

    /// The session's single consumer: applies projection messages in arrival
    /// order and routes snapshot announcements to the snapshot manager
    fn spawn_consumer(
        &self,
        id: SessionId,
        mut receiver: UnboundedReceiver<StoredMessage>,
        mut snapshot_receiver: UnboundedReceiver<StoredMessage>,
        projection: Arc<Mutex<Projection>>,
        events: broadcast::Sender<DomainEvent>,
    ) -> JoinHandle<()> {
        let transport = Arc::clone(&self.transport);
        let snapshots = Arc::clone(&self.snapshots);
        let topic = session_topic(&id);
        let ephemeral_topic = snapshot_topic(&id);
        tokio::spawn(async move {
            loop {
                let (message, topic) = tokio::select! {
                    Some(message) = receiver.recv() => (message, &topic),
                    Some(message) = snapshot_receiver.recv() => (message, &ephemeral_topic),
                    else => break,
                };
                let envelope = match transport.decode(topic, &message) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(session = %id, error = %e, "dropping undecodable message");
                        continue;
                    }
                };
                if envelope.kind.is_projection() {
                    let result = {
                        let mut projection = projection
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner());
                        projection.apply(&envelope)
                    };
                    match result {
                        Ok(event) => {
                            let _ = events.send(event);
                        }
                        Err(rejection) if rejection.is_benign() => {
                            debug!(session = %id, %rejection, "message dropped")
                        }
                        Err(rejection) => {
                            warn!(session = %id, signer = %envelope.signer, %rejection, "message rejected")
                        }
                    }
                } else {
                    let announce: SnapshotAnnounce = match envelope.decode_payload() {
                        Ok(announce) => announce,
                        Err(rejection) => {
                            warn!(session = %id, %rejection, "malformed snapshot announcement");
                            continue;
                        }
                    };
                    match snapshots
                        .handle_announce(&id, &announce, &envelope.signer, &projection, &events)
                        .await
                    {
                        Ok(_) => {}
                        // Anti-regression rejections are routine chatter
                        Err(AgoraError::Snapshot(e)) => {
                            debug!(session = %id, error = %e, "snapshot announcement skipped")
                        }
                        Err(e) => {
                            warn!(session = %id, error = %e, "snapshot import failed")
                        }
                    }
                }
            }
        })
    }

    // ------------------------------------------------------------------------
    // Local Author Operations
    // ------------------------------------------------------------------------

    /// Submit a question to a session, returning its content hash
    pub async fn submit_question(&self, id: &SessionId, text: &str) -> Result<ContentHash> {
        self.session(id)?;
        let submit = QuestionSubmit {
            question: text.to_string(),
            timestamp: self.time.now(),
        };
        let hash = submit.question_hash()?;
        self.publish_to_session(id, MessageKind::QuestionSubmit, &submit)
            .await?;
        Ok(hash)
    }

    /// Upvote a question
    pub async fn upvote(&self, id: &SessionId, hash: ContentHash) -> Result<()> {
        self.session(id)?;
        self.publish_to_session(id, MessageKind::Upvote, &Upvote { hash })
            .await
    }

    /// Answer a question (accepted only if the local identity is the owner
    /// or an admin)
    pub async fn answer(&self, id: &SessionId, hash: ContentHash, text: &str) -> Result<()> {
        self.session(id)?;
        let answer = Answer {
            hash,
            text: text.to_string(),
        };
        self.publish_to_session(id, MessageKind::Answer, &answer).await
    }

    /// Set or clear a question's moderation flag
    pub async fn moderate(&self, id: &SessionId, hash: ContentHash, moderated: bool) -> Result<()> {
        self.session(id)?;
        self.publish_to_session(id, MessageKind::Moderate, &Moderate { hash, moderated })
            .await
    }

    /// Create a poll, returning its content-derived identifier
    pub async fn create_poll(&self, id: &SessionId, spec: PollSpec) -> Result<ContentHash> {
        self.session(id)?;
        let create = PollCreate {
            creator: self.signer.address(),
            title: spec.title,
            question: spec.question,
            options: spec
                .options
                .into_iter()
                .map(|title| PollOption { title })
                .collect(),
            active: spec.active,
            timestamp: self.time.now(),
        };
        let poll_id = create.poll_id()?;
        self.publish_to_session(id, MessageKind::PollCreate, &create)
            .await?;
        Ok(poll_id)
    }

    /// Vote for one option of a poll
    pub async fn vote(&self, id: &SessionId, poll: ContentHash, option: usize) -> Result<()> {
        self.session(id)?;
        self.publish_to_session(id, MessageKind::PollVote, &PollVote { id: poll, option })
            .await
    }

    /// Flip a poll's active flag
    pub async fn set_poll_active(
        &self,
        id: &SessionId,
        poll: ContentHash,
        active: bool,
    ) -> Result<()> {
        self.session(id)?;
        self.publish_to_session(
            id,
            MessageKind::PollSetActive,
            &PollSetActive { id: poll, active },
        )
        .await
    }

    /// Publish an owner revision enabling or disabling the session
    pub async fn set_enabled(&self, id: &SessionId, enabled: bool) -> Result<()> {
        self.revise_descriptor(id, |descriptor| descriptor.enabled = enabled)
            .await
    }

    /// Publish an owner revision replacing the admin list
    pub async fn set_admins(&self, id: &SessionId, admins: Vec<Address>) -> Result<()> {
        self.revise_descriptor(id, |descriptor| descriptor.admins = admins)
            .await
    }

    async fn revise_descriptor(
        &self,
        id: &SessionId,
        mutate: impl FnOnce(&mut SessionDescriptor),
    ) -> Result<()> {
        let handle = self.session(id)?;
        let mut descriptor = handle
            .descriptor()
            .ok_or_else(|| AgoraError::malformed("session has no descriptor yet"))?;
        mutate(&mut descriptor);
        descriptor.updated_at = self.time.now();
        self.publish_to_session(id, MessageKind::SessionDescriptor, &descriptor)
            .await
    }

    async fn publish_to_session<T: serde::Serialize>(
        &self,
        id: &SessionId,
        kind: MessageKind,
        payload: &T,
    ) -> Result<()> {
        let envelope = SignedEnvelope::signed(kind, payload, &*self.signer, self.time.now())?;
        self.transport
            .publish(&session_topic(id), &envelope)
            .await?;
        Ok(())
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, Arc<SessionHandle>>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
