//! In-memory publish/subscribe transport
//!
//! A [`MemoryNetwork`] plays the shared pub/sub fabric plus store node;
//! every [`MemoryTransport`] attached to it is one peer with its own local
//! store, wire-level duplicate filter, and per-topic encryption modes.
//! Envelopes are signature-checked on decode, so the engine only ever sees
//! authenticated signer addresses — the same division of labor the real
//! transport contract promises.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand_core::{OsRng, RngCore};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use agora_core::{
    ContentHash, EncryptionMode, SignedEnvelope, StoredMessage, Transport, TransportError,
};

use crate::identity::verify_address_signature;

const NONCE_LEN: usize = 12;

// ----------------------------------------------------------------------------
// Memory Network
// ----------------------------------------------------------------------------

/// Shared fabric connecting several in-memory transports
pub struct MemoryNetwork {
    /// Full message history per topic, as a store node would hold it
    store: Mutex<HashMap<String, Vec<StoredMessage>>>,
    peers: Mutex<Vec<Weak<MemoryTransport>>>,
}

impl MemoryNetwork {
    /// Create a new empty network
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            store: Mutex::new(HashMap::new()),
            peers: Mutex::new(Vec::new()),
        })
    }

    /// Attach a new peer transport to this network
    pub fn transport(self: &Arc<Self>) -> Arc<MemoryTransport> {
        let transport = Arc::new(MemoryTransport {
            network: Arc::clone(self),
            topics: Mutex::new(HashMap::new()),
        });
        self.peers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::downgrade(&transport));
        transport
    }

    fn broadcast(&self, topic: &str, message: StoredMessage) {
        self.store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(topic.to_string())
            .or_default()
            .push(message.clone());
        let peers: Vec<_> = self
            .peers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for peer in peers {
            peer.deliver(topic, message.clone());
        }
    }

    fn history(&self, topic: &str) -> Vec<StoredMessage> {
        self.store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// Memory Transport
// ----------------------------------------------------------------------------

struct TopicBinding {
    mode: EncryptionMode,
    /// This peer's local store for the topic
    log: Vec<StoredMessage>,
    /// Wire-level duplicate filter, keyed by payload digest
    dedup: HashSet<ContentHash>,
    sender: UnboundedSender<StoredMessage>,
}

/// One peer's transport endpoint
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    topics: Mutex<HashMap<String, TopicBinding>>,
}

impl MemoryTransport {
    fn deliver(&self, topic: &str, message: StoredMessage) {
        let mut topics = self
            .topics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(binding) = topics.get_mut(topic) {
            let hash = ContentHash::digest(&message.payload);
            if binding.dedup.insert(hash) {
                binding.log.push(message.clone());
                let _ = binding.sender.send(message);
            }
        }
    }

    fn encrypt(mode: &EncryptionMode, plaintext: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        match mode {
            EncryptionMode::None => Ok(plaintext),
            EncryptionMode::Symmetric(key) => {
                let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
                let mut nonce = [0u8; NONCE_LEN];
                OsRng.fill_bytes(&mut nonce);
                let ciphertext = cipher
                    .encrypt(Nonce::from_slice(&nonce), plaintext.as_ref())
                    .map_err(|_| TransportError::decode("encryption failed"))?;
                let mut out = nonce.to_vec();
                out.extend_from_slice(&ciphertext);
                Ok(out)
            }
        }
    }

    fn decrypt(mode: &EncryptionMode, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        match mode {
            EncryptionMode::None => Ok(payload.to_vec()),
            EncryptionMode::Symmetric(key) => {
                if payload.len() < NONCE_LEN {
                    return Err(TransportError::decode("payload shorter than nonce"));
                }
                let (nonce, ciphertext) = payload.split_at(NONCE_LEN);
                let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
                cipher
                    .decrypt(Nonce::from_slice(nonce), ciphertext)
                    .map_err(|_| TransportError::decode("decryption failed"))
            }
        }
    }

    fn with_binding<R>(
        &self,
        topic: &str,
        f: impl FnOnce(&mut TopicBinding) -> R,
    ) -> Result<R, TransportError> {
        let mut topics = self
            .topics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match topics.get_mut(topic) {
            Some(binding) => Ok(f(binding)),
            None => Err(TransportError::NotBound {
                topic: topic.to_string(),
            }),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn bind(
        &self,
        topic: &str,
        mode: EncryptionMode,
    ) -> Result<UnboundedReceiver<StoredMessage>, TransportError> {
        let mut topics = self
            .topics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if topics.contains_key(topic) {
            return Err(TransportError::Bind {
                topic: topic.to_string(),
                reason: "already bound".to_string(),
            });
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        topics.insert(
            topic.to_string(),
            TopicBinding {
                mode,
                log: Vec::new(),
                dedup: HashSet::new(),
                sender,
            },
        );
        Ok(receiver)
    }

    async fn unbind(&self, topic: &str) -> Result<(), TransportError> {
        self.topics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(topic);
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        envelope: &SignedEnvelope,
    ) -> Result<(), TransportError> {
        let plaintext = bincode::serialize(envelope).map_err(|e| TransportError::Publish {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;
        let (payload, timestamp) = {
            let mode = self.with_binding(topic, |binding| binding.mode.clone())?;
            (Self::encrypt(&mode, plaintext)?, envelope.timestamp)
        };
        self.network.broadcast(topic, StoredMessage { payload, timestamp });
        Ok(())
    }

    async fn query_local(&self, topic: &str) -> Result<Vec<StoredMessage>, TransportError> {
        self.with_binding(topic, |binding| binding.log.clone())
    }

    async fn query_network(&self, topic: &str) -> Result<Vec<StoredMessage>, TransportError> {
        Ok(self.network.history(topic))
    }

    async fn import_local(
        &self,
        topic: &str,
        messages: Vec<StoredMessage>,
    ) -> Result<(), TransportError> {
        self.with_binding(topic, |binding| {
            for message in messages {
                let hash = ContentHash::digest(&message.payload);
                if binding.dedup.insert(hash) {
                    binding.log.push(message);
                }
            }
        })
    }

    async fn clear_dedup_cache(&self, topic: &str) {
        let _ = self.with_binding(topic, |binding| binding.dedup.clear());
    }

    fn decode(
        &self,
        topic: &str,
        message: &StoredMessage,
    ) -> Result<SignedEnvelope, TransportError> {
        let mode = self.with_binding(topic, |binding| binding.mode.clone())?;
        let plaintext = Self::decrypt(&mode, &message.payload)?;
        let envelope: SignedEnvelope =
            bincode::deserialize(&plaintext).map_err(|e| TransportError::decode(e.to_string()))?;
        let signed = envelope
            .signed_bytes()
            .map_err(|e| TransportError::decode(e.to_string()))?;
        verify_address_signature(&envelope.signer, &signed, &envelope.signature)
            .map_err(TransportError::decode)?;
        Ok(envelope)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemorySigner;
    use agora_core::{MessageKind, SymmetricKey, Timestamp};

    fn envelope(signer: &MemorySigner) -> SignedEnvelope {
        SignedEnvelope::signed(
            MessageKind::QuestionSubmit,
            &"payload".to_string(),
            signer,
            Timestamp::new(1),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_publish_reaches_all_bound_peers() {
        let network = MemoryNetwork::new();
        let alice = network.transport();
        let bob = network.transport();
        let signer = MemorySigner::generate();

        let mut rx_alice = alice.bind("t", EncryptionMode::None).await.unwrap();
        let mut rx_bob = bob.bind("t", EncryptionMode::None).await.unwrap();

        alice.publish("t", &envelope(&signer)).await.unwrap();

        let got_alice = rx_alice.recv().await.unwrap();
        let got_bob = rx_bob.recv().await.unwrap();
        assert_eq!(got_alice, got_bob);
        assert_eq!(alice.query_local("t").await.unwrap().len(), 1);
        assert_eq!(bob.query_local("t").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_wire_level_dedup_and_cache_clear() {
        let network = MemoryNetwork::new();
        let alice = network.transport();
        let signer = MemorySigner::generate();
        let mut rx = alice.bind("t", EncryptionMode::None).await.unwrap();

        let env = envelope(&signer);
        alice.publish("t", &env).await.unwrap();
        let message = rx.recv().await.unwrap();

        // Re-importing an already seen message is filtered
        alice.import_local("t", vec![message.clone()]).await.unwrap();
        assert_eq!(alice.query_local("t").await.unwrap().len(), 1);

        // After clearing the cache it is accepted again
        alice.clear_dedup_cache("t").await;
        alice.import_local("t", vec![message]).await.unwrap();
        assert_eq!(alice.query_local("t").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_symmetric_mode_round_trip_and_mismatch() {
        let network = MemoryNetwork::new();
        let alice = network.transport();
        let bob = network.transport();
        let signer = MemorySigner::generate();

        let key = SymmetricKey::from_passphrase("sekrit");
        let mut rx = alice
            .bind("t", EncryptionMode::Symmetric(key.clone()))
            .await
            .unwrap();
        bob.bind("t", EncryptionMode::Symmetric(SymmetricKey::from_passphrase("wrong")))
            .await
            .unwrap();

        let env = envelope(&signer);
        alice.publish("t", &env).await.unwrap();
        let message = rx.recv().await.unwrap();

        let decoded = alice.decode("t", &message).unwrap();
        assert_eq!(decoded, env);
        assert!(bob.decode("t", &message).is_err());
    }

    #[tokio::test]
    async fn test_decode_rejects_forged_signature() {
        let network = MemoryNetwork::new();
        let alice = network.transport();
        let signer = MemorySigner::generate();
        let mut rx = alice.bind("t", EncryptionMode::None).await.unwrap();

        let mut env = envelope(&signer);
        env.signature[0] ^= 0xFF;
        alice.publish("t", &env).await.unwrap();
        let message = rx.recv().await.unwrap();
        assert!(alice.decode("t", &message).is_err());
    }
}
