//! Commit-reveal hashing.
//!
//! A commitment is `sha256(key || move)` where `key` is 32 fresh random bytes. The
//! hash is published when the user commits; the key stays local until reveal.

use crate::game::Move;
use commonware_cryptography::{
    sha256::{Digest, Sha256},
    Hasher,
};
use commonware_utils::{from_hex, hex};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

pub const HASH_KEY_LENGTH: usize = 32;

/// Secret nonce bound into a commitment.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct HashKey([u8; HASH_KEY_LENGTH]);

impl HashKey {
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut key = [0u8; HASH_KEY_LENGTH];
        rng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; HASH_KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_KEY_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex(&self.0)
    }

    pub fn from_hex(value: &str) -> Option<Self> {
        let bytes = from_hex(value)?;
        let key: [u8; HASH_KEY_LENGTH] = bytes.try_into().ok()?;
        Some(Self(key))
    }
}

impl fmt::Debug for HashKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HashKey(<redacted>)")
    }
}

impl Serialize for HashKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for HashKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Self::from_hex(&value)
            .ok_or_else(|| serde::de::Error::custom("expected 32 hex encoded bytes"))
    }
}

/// Hash binding `key` to `selection`.
pub fn commitment_hash(key: &HashKey, selection: Move) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update(selection.as_str().as_bytes());
    hasher.finalize()
}

/// A published hash together with the key needed to open it.
#[derive(Clone, Debug)]
pub struct Commitment {
    pub hash: Digest,
    pub key: HashKey,
}

impl Commitment {
    /// Whether `(key, selection)` opens `hash`.
    pub fn verify(hash: &Digest, key: &HashKey, selection: Move) -> bool {
        &commitment_hash(key, selection) == hash
    }
}

/// Commit to `selection` under a fresh key.
pub fn hash_selection<R: RngCore + CryptoRng>(selection: Move, rng: &mut R) -> Commitment {
    let key = HashKey::random(rng);
    Commitment {
        hash: commitment_hash(&key, selection),
        key,
    }
}
