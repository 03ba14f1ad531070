//! Snapshot subsystem
//!
//! Compacts a session's message log into a portable, verifiable artifact and
//! imports artifacts announced by peers. Export reads the transport's local
//! store; import feeds the store and replays it through the normal handlers,
//! so the live path and the import path share invariant enforcement.
//!
//! Publish and import are mutually exclusive within a session: a per-session
//! in-flight guard is acquired before any network or storage call and
//! released on every exit path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SnapshotConfig;
use crate::errors::SnapshotError;
use crate::events::DomainEvent;
use crate::message::{
    session_topic, snapshot_topic, MessageKind, SessionDescriptor, SignedEnvelope,
    SnapshotAnnounce, StoredMessage,
};
use crate::registry::replay_into;
use crate::state::Projection;
use crate::transport::{BlobStore, Signer, SnapshotRecordStore, Transport};
use crate::types::{Address, ContentHash, SessionId, TimeSource, Timestamp};
use crate::Result;

// ----------------------------------------------------------------------------
// Snapshot Artifacts
// ----------------------------------------------------------------------------

/// The published snapshot payload
///
/// `hash` is the content digest of the serialized message list; `messages`
/// are the raw stored messages sufficient to reconstruct the projection via
/// replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentSnapshot {
    pub hash: ContentHash,
    pub owner: Address,
    pub messages: Vec<StoredMessage>,
}

impl PersistentSnapshot {
    /// Digest a message log the way snapshots do
    pub fn digest_messages(messages: &[StoredMessage]) -> Result<ContentHash> {
        let body = bincode::serialize(messages)?;
        Ok(ContentHash::digest(&body))
    }
}

/// Last-known published snapshot of a session, persisted by the host
///
/// `cid` locates the payload; `hash` authenticates it. Only the timestamp is
/// consulted for staleness decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub cid: String,
    pub hash: ContentHash,
    pub timestamp: Timestamp,
}

// ----------------------------------------------------------------------------
// In-flight Guard
// ----------------------------------------------------------------------------

/// What a session's snapshot machinery is currently doing
enum Flight {
    Publishing,
    Importing(ContentHash),
}

impl Flight {
    fn describe(&self) -> String {
        match self {
            Flight::Publishing => "publish".to_string(),
            Flight::Importing(hash) => format!("import of {hash}"),
        }
    }
}

/// RAII release of the per-session in-flight entry
struct FlightGuard<'a> {
    manager: &'a SnapshotManager,
    session: SessionId,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.manager.in_flight.lock() {
            in_flight.remove(&self.session);
        }
    }
}

/// Anti-regression mark left by a successful import
#[derive(Debug, Clone)]
struct ImportMark {
    hash: ContentHash,
    timestamp: Timestamp,
}

// ----------------------------------------------------------------------------
// Snapshot Manager
// ----------------------------------------------------------------------------

/// Publishes local snapshots and imports foreign ones
pub struct SnapshotManager {
    transport: Arc<dyn Transport>,
    blob_store: Arc<dyn BlobStore>,
    signer: Arc<dyn Signer>,
    records: Arc<dyn SnapshotRecordStore>,
    time: Arc<dyn TimeSource>,
    config: SnapshotConfig,
    /// Per-session mutual exclusion between publish and import
    in_flight: Mutex<HashMap<SessionId, Flight>>,
    /// Last successfully imported snapshot per session
    imported: Mutex<HashMap<SessionId, ImportMark>>,
}

impl SnapshotManager {
    /// Create a new snapshot manager over the external collaborators
    pub fn new(
        transport: Arc<dyn Transport>,
        blob_store: Arc<dyn BlobStore>,
        signer: Arc<dyn Signer>,
        records: Arc<dyn SnapshotRecordStore>,
        time: Arc<dyn TimeSource>,
        config: SnapshotConfig,
    ) -> Self {
        Self {
            transport,
            blob_store,
            signer,
            records,
            time,
            config,
            in_flight: Mutex::new(HashMap::new()),
            imported: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the in-flight slot for a session, or report what holds it
    fn begin_flight(&self, session: &SessionId, flight: Flight) -> Result<FlightGuard<'_>> {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = in_flight.get(session) {
            debug!(%session, in_flight = %existing.describe(), "snapshot work already in flight");
            return Err(SnapshotError::InFlight {
                session: session.clone(),
            }
            .into());
        }
        in_flight.insert(session.clone(), flight);
        Ok(FlightGuard {
            manager: self,
            session: session.clone(),
        })
    }

    // ------------------------------------------------------------------------
    // Publish
    // ------------------------------------------------------------------------

    /// Serialize the session's local message log, upload it, and announce it
    ///
    /// Returns `None` when the log is empty (nothing worth publishing).
    /// Duplicate triggers in close succession are wasteful but not unsafe;
    /// a concurrent publish or import for the same session yields
    /// [`SnapshotError::InFlight`].
    pub async fn publish(&self, session: &SessionId) -> Result<Option<SnapshotRecord>> {
        let _guard = self.begin_flight(session, Flight::Publishing)?;

        let topic = session_topic(session);
        let messages = self.transport.query_local(&topic).await?;
        if messages.is_empty() {
            debug!(%session, "skipping snapshot of empty session log");
            return Ok(None);
        }

        let hash = PersistentSnapshot::digest_messages(&messages)?;
        let snapshot = PersistentSnapshot {
            hash,
            owner: self.signer.address(),
            messages,
        };
        let payload = bincode::serialize(&snapshot)?;
        let cid = self.blob_store.upload(payload).await?;

        let now = self.time.now();
        let announce = SnapshotAnnounce {
            hash,
            cid: cid.clone(),
            timestamp: now,
        };

        // Announce on the dedicated ephemeral topic and persist the same
        // record into the regular session log for late joiners.
        let ephemeral =
            SignedEnvelope::signed(MessageKind::SnapshotAnnounce, &announce, &*self.signer, now)?;
        self.transport
            .publish(&snapshot_topic(session), &ephemeral)
            .await?;
        let persisted =
            SignedEnvelope::signed(MessageKind::SnapshotPersist, &announce, &*self.signer, now)?;
        self.transport.publish(&topic, &persisted).await?;

        let record = SnapshotRecord {
            cid,
            hash,
            timestamp: now,
        };
        self.records.store(session, record.clone());
        info!(%session, hash = %record.hash, cid = %record.cid, "published snapshot");
        Ok(Some(record))
    }

    /// Publish immediately if the last local record is older than the
    /// publish interval (or absent). Used on session resume.
    pub async fn publish_if_stale(&self, session: &SessionId) -> Result<Option<SnapshotRecord>> {
        let interval_ms = self.config.publish_interval.as_millis() as u64;
        let stale = match self.records.load(session) {
            Some(record) => self.time.now().millis_since(record.timestamp) > interval_ms,
            None => true,
        };
        if !stale {
            return Ok(None);
        }
        self.publish(session).await
    }

    /// Spawn the fixed-interval publish loop for a session
    ///
    /// Publishes immediately when the last record is stale, then on every
    /// tick. The handle is aborted by the registry on teardown.
    pub fn spawn_publish_loop(
        self: &Arc<Self>,
        session: SessionId,
        events: broadcast::Sender<DomainEvent>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            match manager.publish_if_stale(&session).await {
                Ok(Some(record)) => {
                    let _ = events.send(DomainEvent::SnapshotPublished { record });
                }
                Ok(None) => {}
                Err(e) => warn!(%session, error = %e, "snapshot publish on resume failed"),
            }

            let mut ticker = tokio::time::interval(manager.config.publish_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of a tokio interval completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match manager.publish(&session).await {
                    Ok(Some(record)) => {
                        let _ = events.send(DomainEvent::SnapshotPublished { record });
                    }
                    Ok(None) => {}
                    // Retried on the next natural tick, never in a tight loop
                    Err(e) => warn!(%session, error = %e, "periodic snapshot publish failed"),
                }
            }
        })
    }

    // ------------------------------------------------------------------------
    // Import
    // ------------------------------------------------------------------------

    /// Import a snapshot announced by a peer
    ///
    /// Returns `Ok(false)` when the announcement is our own. All integrity
    /// failures abandon the attempt without mutating committed state; the
    /// in-flight guard is released on every exit path.
    pub async fn handle_announce(
        &self,
        session: &SessionId,
        announce: &SnapshotAnnounce,
        author: &Address,
        projection: &Mutex<Projection>,
        events: &broadcast::Sender<DomainEvent>,
    ) -> Result<bool> {
        if *author == self.signer.address() {
            return Ok(false);
        }
        self.check_regression(session, announce)?;

        // Acquired before any network or storage call; also serializes
        // against a same-session publish.
        let _guard = self.begin_flight(session, Flight::Importing(announce.hash))?;

        let bytes = self.blob_store.download(&announce.cid).await?;
        let snapshot: PersistentSnapshot = bincode::deserialize(&bytes)?;
        self.verify_snapshot(session, announce, &snapshot)?;

        let topic = session_topic(session);
        let imported_count = snapshot.messages.len();
        self.transport
            .import_local(&topic, snapshot.messages)
            .await?;
        // Imported messages may be re-seen live; the wire-level duplicate
        // filter must not swallow them.
        self.transport.clear_dedup_cache(&topic).await;

        let stats = replay_into(&*self.transport, &topic, projection, Some(events)).await?;
        self.imported
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(
                session.clone(),
                ImportMark {
                    hash: announce.hash,
                    timestamp: announce.timestamp,
                },
            );

        info!(
            %session,
            hash = %announce.hash,
            messages = imported_count,
            applied = stats.applied,
            "imported snapshot"
        );
        let _ = events.send(DomainEvent::SnapshotImported {
            hash: announce.hash,
            messages: imported_count,
        });
        Ok(true)
    }

    /// Anti-regression guards: previously seen, non-advancing, or stale
    /// announcements must never resurrect old state
    fn check_regression(&self, session: &SessionId, announce: &SnapshotAnnounce) -> Result<()> {
        if let Some(record) = self.records.load(session) {
            if record.hash == announce.hash {
                return Err(SnapshotError::AlreadySeen {
                    hash: announce.hash,
                }
                .into());
            }
        }
        let imported = self
            .imported
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(mark) = imported.get(session) {
            if mark.hash == announce.hash {
                return Err(SnapshotError::AlreadySeen {
                    hash: announce.hash,
                }
                .into());
            }
            if announce.timestamp <= mark.timestamp {
                return Err(SnapshotError::Regression {
                    announced: announce.timestamp,
                    current: mark.timestamp,
                }
                .into());
            }
        }
        let window_ms = self.config.staleness_window.as_millis() as u64;
        if self.time.now().millis_since(announce.timestamp) > window_ms {
            return Err(SnapshotError::StaleAnnouncement.into());
        }
        Ok(())
    }

    /// Integrity checks on a downloaded snapshot payload
    ///
    /// The lead message must decode under the session's configured
    /// encryption mode, be a descriptor signed by the declared owner, and
    /// re-derive to the identifier of the session being imported into —
    /// otherwise a peer could redirect one session's history into another's
    /// namespace.
    fn verify_snapshot(
        &self,
        session: &SessionId,
        announce: &SnapshotAnnounce,
        snapshot: &PersistentSnapshot,
    ) -> Result<()> {
        let digest = PersistentSnapshot::digest_messages(&snapshot.messages)?;
        if digest != snapshot.hash || digest != announce.hash {
            return Err(SnapshotError::HashMismatch.into());
        }

        let first = snapshot.messages.first().ok_or(SnapshotError::EmptyLog)?;
        let topic = session_topic(session);
        let envelope = self.transport.decode(&topic, first)?;
        if envelope.kind != MessageKind::SessionDescriptor {
            return Err(SnapshotError::InvalidLeadMessage.into());
        }
        let descriptor: SessionDescriptor = envelope
            .decode_payload()
            .map_err(|_| SnapshotError::InvalidLeadMessage)?;
        if envelope.signer != snapshot.owner {
            return Err(SnapshotError::OwnerMismatch.into());
        }

        let derived = descriptor.derived_id(session.is_protected());
        if derived != descriptor.id || derived != *session {
            return Err(SnapshotError::SessionIdMismatch {
                expected: session.clone(),
            }
            .into());
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
