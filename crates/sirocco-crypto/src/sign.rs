//! Ed25519 signatures over persisted versions.
//!
//! When the signed-log feature is configured, every persisted version is
//! signed by its local node and the signature is published in the shared
//! state table so peers can verify it. This module wraps `ed25519-dalek`
//! behind the two operations the engine needs: sign a version digest and
//! verify a peer's signature over the same digest.

use std::fs;
use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

/// Length in bytes of one version signature.
pub const SIGNATURE_LENGTH: usize = ed25519_dalek::SIGNATURE_LENGTH;

/// Errors from loading or using signing material.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("failed to read private key file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("private key file {path} is {len} bytes, expected {expected}")]
    BadLength {
        path: String,
        len: usize,
        expected: usize,
    },

    #[error("peer public key is malformed")]
    BadPublicKey,

    #[error("signature verification failed")]
    BadSignature,
}

/// A node's signing identity: the private key plus its public half.
#[derive(Debug)]
pub struct SigningIdentity {
    key: SigningKey,
}

impl SigningIdentity {
    /// Loads a raw 32-byte Ed25519 seed from `path`.
    pub fn from_key_file(path: &Path) -> Result<Self, KeyError> {
        let bytes = fs::read(path).map_err(|source| KeyError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| KeyError::BadLength {
            path: path.display().to_string(),
            len: bytes.len(),
            expected: 32,
        })?;
        Ok(Self {
            key: SigningKey::from_bytes(&seed),
        })
    }

    /// Generates a fresh identity. Used by tests and by nodes configured
    /// without a key file.
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Signs `message`, returning the raw signature bytes.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        self.key.sign(message).to_bytes()
    }

    pub fn verifying_identity(&self) -> VerifyingIdentity {
        VerifyingIdentity {
            key: self.key.verifying_key(),
        }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.key.verifying_key().to_bytes()
    }

    /// The raw 32-byte seed, in the format [`Self::from_key_file`]
    /// reads. Provisioning tooling writes this to the key file.
    pub fn seed_bytes(&self) -> [u8; 32] {
        self.key.to_bytes()
    }
}

/// The public half of a signing identity, used to check peers'
/// signatures.
#[derive(Debug, Clone)]
pub struct VerifyingIdentity {
    key: VerifyingKey,
}

impl VerifyingIdentity {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, KeyError> {
        let key = VerifyingKey::from_bytes(bytes).map_err(|_| KeyError::BadPublicKey)?;
        Ok(Self { key })
    }

    /// Verifies `signature` over `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), KeyError> {
        let sig_bytes: [u8; SIGNATURE_LENGTH] =
            signature.try_into().map_err(|_| KeyError::BadSignature)?;
        let signature = Signature::from_bytes(&sig_bytes);
        self.key
            .verify(message, &signature)
            .map_err(|_| KeyError::BadSignature)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.key.to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_round_trip() {
        let identity = SigningIdentity::generate();
        let sig = identity.sign(b"version 42");
        identity
            .verifying_identity()
            .verify(b"version 42", &sig)
            .unwrap();
    }

    #[test]
    fn tampered_message_rejected() {
        let identity = SigningIdentity::generate();
        let sig = identity.sign(b"version 42");
        assert!(matches!(
            identity.verifying_identity().verify(b"version 43", &sig),
            Err(KeyError::BadSignature)
        ));
    }

    #[test]
    fn all_zero_signature_rejected() {
        let identity = SigningIdentity::generate();
        let zeros = [0u8; SIGNATURE_LENGTH];
        assert!(identity
            .verifying_identity()
            .verify(b"anything", &zeros)
            .is_err());
    }

    #[test]
    fn key_file_round_trip() {
        let dir = std::env::temp_dir().join("sirocco-crypto-test-key");
        let seed = SigningKey::generate(&mut OsRng).to_bytes();
        fs::write(&dir, seed).unwrap();
        let loaded = SigningIdentity::from_key_file(&dir).unwrap();
        let sig = loaded.sign(b"m");
        loaded.verifying_identity().verify(b"m", &sig).unwrap();
        let _ = fs::remove_file(&dir);
    }
}
