//! Core types for the Agora protocol
//!
//! This module defines the fundamental identifier and time types used
//! throughout the crate, using newtype patterns for semantic validation
//! and type safety.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::AgoraError;

// ----------------------------------------------------------------------------
// Signer Address
// ----------------------------------------------------------------------------

/// Stable public address of a signer, as produced by the external identity
/// layer. Opaque to the engine: it is only ever compared for equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(String);

impl Address {
    /// Create an address from its string form
    pub fn new<S: Into<String>>(address: S) -> Self {
        Self(address.into())
    }

    /// Get the string form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ----------------------------------------------------------------------------
// Content Hash
// ----------------------------------------------------------------------------

/// SHA-256 digest over canonical message bytes
///
/// Used for question/poll identity, deduplication filters, and snapshot
/// integrity. Identical logical payloads always hash identically because
/// every wire payload is a closed struct whose field order is fixed by the
/// type, making the bincode encoding canonical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Create a content hash from raw digest bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Digest arbitrary bytes
    pub fn digest(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let result = hasher.finalize();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&result);
        Self(hash)
    }

    /// Digest the canonical (bincode) encoding of a serializable value
    pub fn of<T: Serialize>(value: &T) -> Result<Self, AgoraError> {
        let bytes = bincode::serialize(value)?;
        Ok(Self::digest(&bytes))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string for display
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = AgoraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let clean = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(clean)
            .map_err(|_| AgoraError::malformed("invalid hex in content hash"))?;
        if bytes.len() != 32 {
            return Err(AgoraError::malformed("content hash must be exactly 32 bytes"));
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes);
        Ok(Self(hash))
    }
}

// ----------------------------------------------------------------------------
// Session Identifier
// ----------------------------------------------------------------------------

/// Reserved marker prefixed to identifiers of passphrase-protected sessions
/// so consumers can distinguish them without decrypting anything. Plain
/// identifiers are lowercase hex, so the marker cannot collide.
pub const PROTECTED_SESSION_MARKER: char = 'x';

/// Number of digest bytes kept in a session identifier
const SESSION_ID_BYTES: usize = 8;

/// Derived identifier of one Q&A session
///
/// Computed once at creation time as a truncated digest over
/// `(title, creation timestamp, owner address)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Derive the identifier for a session created with the given metadata
    pub fn derive(title: &str, created_at: Timestamp, owner: &Address, protected: bool) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(title.as_bytes());
        hasher.update(created_at.as_millis().to_be_bytes());
        hasher.update(owner.as_str().as_bytes());
        let digest = hasher.finalize();
        let id = hex::encode(&digest[..SESSION_ID_BYTES]);
        if protected {
            Self(format!("{}{}", PROTECTED_SESSION_MARKER, id))
        } else {
            Self(id)
        }
    }

    /// Parse an identifier received from a peer
    pub fn parse<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    /// Whether the session was created with an access passphrase
    pub fn is_protected(&self) -> bool {
        self.0.starts_with(PROTECTED_SESSION_MARKER)
    }

    /// Get the string form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp since Unix epoch
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Create a new timestamp
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Get the raw milliseconds
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Milliseconds elapsed since another timestamp (saturating)
    pub fn millis_since(&self, other: Self) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

// ----------------------------------------------------------------------------
// Time Source
// ----------------------------------------------------------------------------

/// Trait for providing the current wall-clock time
///
/// The engine never reads the clock directly; snapshot staleness checks and
/// locally-authored timestamps go through this seam so tests can pin time.
pub trait TimeSource: Send + Sync {
    /// Get the current timestamp
    fn now(&self) -> Timestamp;
}

/// Standard library implementation of TimeSource
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp::new(duration.as_millis() as u64)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_deterministic() {
        let a = ContentHash::digest(b"the same bytes");
        let b = ContentHash::digest(b"the same bytes");
        assert_eq!(a, b);

        let c = ContentHash::digest(b"different bytes");
        assert_ne!(a, c);
    }

    #[test]
    fn test_content_hash_hex_round_trip() {
        let hash = ContentHash::digest(b"round trip");
        let parsed: ContentHash = hash.to_hex().parse().unwrap();
        assert_eq!(hash, parsed);
    }

    #[test]
    fn test_session_id_derivation() {
        let owner = Address::new("0xA");
        let id1 = SessionId::derive("Town Hall", Timestamp::new(1000), &owner, false);
        let id2 = SessionId::derive("Town Hall", Timestamp::new(1000), &owner, false);
        assert_eq!(id1, id2);

        // Any component changing changes the identifier
        let id3 = SessionId::derive("Town Hall", Timestamp::new(1001), &owner, false);
        assert_ne!(id1, id3);
        let id4 = SessionId::derive("Town Hall", Timestamp::new(1000), &Address::new("0xB"), false);
        assert_ne!(id1, id4);
    }

    #[test]
    fn test_protected_session_marker() {
        let owner = Address::new("0xA");
        let open = SessionId::derive("AMA", Timestamp::new(42), &owner, false);
        let locked = SessionId::derive("AMA", Timestamp::new(42), &owner, true);

        assert!(!open.is_protected());
        assert!(locked.is_protected());
        assert_eq!(locked.as_str().len(), open.as_str().len() + 1);
        assert!(locked.as_str().starts_with(PROTECTED_SESSION_MARKER));
    }
}
