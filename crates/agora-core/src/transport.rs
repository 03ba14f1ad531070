//! External collaborator contracts
//!
//! The engine consumes, but never implements, the transport, identity, blob
//! storage, and snapshot-record collaborators. Each is a trait seam so hosts
//! can bind real backends and tests can bind in-memory ones.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::errors::{StorageError, TransportError};
use crate::message::{SignedEnvelope, StoredMessage};
use crate::snapshot::SnapshotRecord;
use crate::types::{Address, SessionId};

// ----------------------------------------------------------------------------
// Encryption Mode
// ----------------------------------------------------------------------------

/// Symmetric key installed on a topic at bind time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymmetricKey([u8; 32]);

impl SymmetricKey {
    /// Create a key from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive a key from a session access passphrase
    pub fn from_passphrase(passphrase: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(passphrase.as_bytes());
        let digest = hasher.finalize();
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self(key)
    }

    /// Get the raw key bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Per-topic encryption configuration, fixed at bind time
///
/// The same mode governs publish, live decode, and the decryption check on
/// snapshot import.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EncryptionMode {
    #[default]
    None,
    Symmetric(SymmetricKey),
}

// ----------------------------------------------------------------------------
// Transport Contract
// ----------------------------------------------------------------------------

/// Publish/subscribe transport with a local historical store
///
/// The transport signs nothing and authenticates everything: envelopes it
/// delivers or decodes have already had their signatures verified against
/// the signer address. Delivery is at-least-once and unordered; the store
/// deduplicates at the wire level.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Bind a topic with the given encryption mode and start receiving its
    /// messages. The returned channel yields stored (opaque) messages;
    /// callers decode them via [`Transport::decode`].
    async fn bind(
        &self,
        topic: &str,
        mode: EncryptionMode,
    ) -> Result<mpsc::UnboundedReceiver<StoredMessage>, TransportError>;

    /// Unbind a topic and stop delivery
    async fn unbind(&self, topic: &str) -> Result<(), TransportError>;

    /// Encode, encrypt per the topic's mode, and publish an envelope
    async fn publish(&self, topic: &str, envelope: &SignedEnvelope)
        -> Result<(), TransportError>;

    /// Read the full local message log for a topic
    async fn query_local(&self, topic: &str) -> Result<Vec<StoredMessage>, TransportError>;

    /// Ask the wider network for a topic's history
    async fn query_network(&self, topic: &str) -> Result<Vec<StoredMessage>, TransportError>;

    /// Feed externally obtained messages into the local store
    async fn import_local(
        &self,
        topic: &str,
        messages: Vec<StoredMessage>,
    ) -> Result<(), TransportError>;

    /// Drop the wire-level duplicate-suppression cache for a topic, so
    /// imported messages are not swallowed when re-seen live
    async fn clear_dedup_cache(&self, topic: &str);

    /// Decrypt (per the topic's bound mode) and decode a stored message
    fn decode(&self, topic: &str, message: &StoredMessage)
        -> Result<SignedEnvelope, TransportError>;
}

// ----------------------------------------------------------------------------
// Identity Contract
// ----------------------------------------------------------------------------

/// External signing identity
///
/// Deterministic and stateless from the engine's point of view.
pub trait Signer: Send + Sync {
    /// The stable public address of this identity
    fn address(&self) -> Address;

    /// Sign an arbitrary byte payload
    fn sign(&self, bytes: &[u8]) -> Vec<u8>;
}

// ----------------------------------------------------------------------------
// Blob Store Contract
// ----------------------------------------------------------------------------

/// Content storage backend hosting snapshot payloads
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload bytes, returning their storage location (`cid`)
    async fn upload(&self, bytes: Vec<u8>) -> Result<String, StorageError>;

    /// Download bytes by storage location
    async fn download(&self, cid: &str) -> Result<Vec<u8>, StorageError>;
}

// ----------------------------------------------------------------------------
// Snapshot Record Contract
// ----------------------------------------------------------------------------

/// Host-owned persistence of the last published snapshot per session
///
/// Used only to decide whether the local snapshot is stale; the storage
/// medium is the host application's concern.
pub trait SnapshotRecordStore: Send + Sync {
    /// Load the last-known record for a session
    fn load(&self, session: &SessionId) -> Option<SnapshotRecord>;

    /// Replace the record for a session
    fn store(&self, session: &SessionId, record: SnapshotRecord);
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passphrase_key_derivation() {
        let a = SymmetricKey::from_passphrase("hunter2");
        let b = SymmetricKey::from_passphrase("hunter2");
        assert_eq!(a, b);

        let c = SymmetricKey::from_passphrase("hunter3");
        assert_ne!(a, c);
    }
}
