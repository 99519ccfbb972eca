use std::fmt;

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// SHA-256 digest, used for ledger hashes and content-addressed storage keys.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    /// Hashes a sequence of chunks, each prefixed with its length so that
    /// chunk boundaries are part of the digest.
    pub fn of_chunks<'a>(chunks: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut hasher = Sha256::new();
        for chunk in chunks {
            hasher.update((chunk.len() as u64).to_be_bytes());
            hasher.update(chunk);
        }
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", &self.to_hex()[..12])
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(Vec<u8>);

impl Signature {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Placeholder carried by unsigned values before signing.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = hex::encode(&self.0);
        write!(f, "Signature({})", &encoded[..encoded.len().min(12)])
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", &hex::encode(self.0)[..12])
    }
}

/// Signing capability of the local identity plus signature verification
/// against arbitrary keys.
pub trait Crypto: Send + Sync {
    fn sign(&self, bytes: &[u8]) -> Signature;

    fn verify(&self, bytes: &[u8], signature: &Signature, key: &PublicKey) -> bool;

    fn public_key(&self) -> PublicKey;
}

pub struct Ed25519Crypto {
    signing_key: SigningKey,
}

impl Ed25519Crypto {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }
}

impl Crypto for Ed25519Crypto {
    fn sign(&self, bytes: &[u8]) -> Signature {
        Signature(self.signing_key.sign(bytes).to_bytes().to_vec())
    }

    fn verify(&self, bytes: &[u8], signature: &Signature, key: &PublicKey) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(&key.0) else {
            return false;
        };
        let Ok(raw) = <[u8; 64]>::try_from(signature.as_bytes()) else {
            return false;
        };
        let signature = ed25519_dalek::Signature::from_bytes(&raw);
        verifying_key.verify(bytes, &signature).is_ok()
    }

    fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key().to_bytes())
    }
}
