//! In-memory signing identity
//!
//! An Ed25519 keypair whose address is the hex-encoded verifying key, so a
//! transport can recover the key from the address and authenticate
//! envelopes.

use ed25519_dalek::{Signature, Signer as DalekSigner, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;

use agora_core::{Address, Signer};

// ----------------------------------------------------------------------------
// Memory Signer
// ----------------------------------------------------------------------------

/// Ed25519-backed signer for tests
pub struct MemorySigner {
    key: SigningKey,
}

impl MemorySigner {
    /// Generate a fresh random identity
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Deterministic identity from seed bytes (stable addresses in tests)
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(&seed),
        }
    }
}

impl Signer for MemorySigner {
    fn address(&self) -> Address {
        Address::new(format!(
            "0x{}",
            hex::encode(self.key.verifying_key().to_bytes())
        ))
    }

    fn sign(&self, bytes: &[u8]) -> Vec<u8> {
        self.key.sign(bytes).to_bytes().to_vec()
    }
}

// ----------------------------------------------------------------------------
// Verification Helper
// ----------------------------------------------------------------------------

/// Verify a signature against the verifying key encoded in an address
pub(crate) fn verify_address_signature(
    address: &Address,
    bytes: &[u8],
    signature: &[u8],
) -> Result<(), String> {
    let hex_key = address
        .as_str()
        .strip_prefix("0x")
        .ok_or_else(|| "address missing 0x prefix".to_string())?;
    let key_bytes = hex::decode(hex_key).map_err(|e| e.to_string())?;
    let key_bytes: [u8; 32] = key_bytes
        .try_into()
        .map_err(|_| "address is not a 32-byte key".to_string())?;
    let key = VerifyingKey::from_bytes(&key_bytes).map_err(|e| e.to_string())?;
    let signature = Signature::from_slice(signature).map_err(|e| e.to_string())?;
    key.verify(bytes, &signature).map_err(|e| e.to_string())
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let signer = MemorySigner::generate();
        let signature = signer.sign(b"payload");
        verify_address_signature(&signer.address(), b"payload", &signature).unwrap();

        let other = MemorySigner::generate();
        assert!(verify_address_signature(&other.address(), b"payload", &signature).is_err());
        assert!(verify_address_signature(&signer.address(), b"tampered", &signature).is_err());
    }

    #[test]
    fn test_seeded_identity_is_stable() {
        let a = MemorySigner::from_seed([7u8; 32]);
        let b = MemorySigner::from_seed([7u8; 32]);
        assert_eq!(a.address(), b.address());
    }
}
