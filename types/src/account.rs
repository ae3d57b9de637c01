use crate::NAMESPACE;
use commonware_codec::{DecodeExt, Encode};
use commonware_cryptography::{
    ed25519::{PrivateKey, PublicKey, Signature},
    sha256::Sha256,
    Hasher, Signer, Verifier,
};
use commonware_math::algebra::Random;
use commonware_utils::{from_hex, hex};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

const ACCOUNT_PREFIX: &str = "ak_";
const CONTRACT_PREFIX: &str = "ct_";

/// Identifier of a channel participant or of a contract deployed inside a channel.
///
/// Accounts are `ak_` followed by the hex encoded ed25519 public key. Contracts are
/// `ct_` followed by the hex encoded digest of their deployer and creation round.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn from_public_key(public: &PublicKey) -> Self {
        Self(format!("{ACCOUNT_PREFIX}{}", hex(&public.encode())))
    }

    /// Derive the address of a contract deployed by `owner` at channel `round`.
    pub fn contract(owner: &Address, round: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(owner.as_str().as_bytes());
        hasher.update(&round.to_be_bytes());
        let digest = hasher.finalize();
        Self(format!("{CONTRACT_PREFIX}{}", hex(digest.as_ref())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_contract(&self) -> bool {
        self.0.starts_with(CONTRACT_PREFIX)
    }

    /// Recover the public key behind an account address.
    pub fn public_key(&self) -> Option<PublicKey> {
        let raw = self.0.strip_prefix(ACCOUNT_PREFIX)?;
        let bytes = from_hex(raw)?;
        PublicKey::decode(bytes.as_ref()).ok()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Check `signature` over `payload` against the key behind `address`.
pub fn verify_signature(address: &Address, payload: &[u8], signature: &Signature) -> bool {
    address
        .public_key()
        .is_some_and(|public| public.verify(NAMESPACE, payload, signature))
}

/// Account keypair used to co-sign channel updates.
#[derive(Clone)]
pub struct Keypair {
    private: PrivateKey,
    address: Address,
}

impl Keypair {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self::from_private(PrivateKey::random(rng))
    }

    pub fn from_seed(seed: u64) -> Self {
        Self::from_private(PrivateKey::from_seed(seed))
    }

    pub fn from_private(private: PrivateKey) -> Self {
        let address = Address::from_public_key(&private.public_key());
        Self { private, address }
    }

    pub fn from_secret_hex(secret: &str) -> Option<Self> {
        let bytes = from_hex(secret.trim_start_matches("0x"))?;
        let private = PrivateKey::decode(bytes.as_ref()).ok()?;
        Some(Self::from_private(private))
    }

    pub fn secret_hex(&self) -> String {
        hex(&self.private.encode())
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn public_key(&self) -> PublicKey {
        self.private.public_key()
    }

    pub fn sign(&self, payload: &[u8]) -> Signature {
        self.private.sign(NAMESPACE, payload)
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("address", &self.address)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

impl PartialEq for Keypair {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Keypair {}

#[derive(Serialize, Deserialize)]
struct KeypairRepr {
    #[serde(rename = "secretKey")]
    secret_key: String,
    #[serde(rename = "publicKey")]
    public_key: Address,
}

impl Serialize for Keypair {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        KeypairRepr {
            secret_key: self.secret_hex(),
            public_key: self.address.clone(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Keypair {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let repr = KeypairRepr::deserialize(deserializer)?;
        let keypair = Keypair::from_secret_hex(&repr.secret_key)
            .ok_or_else(|| serde::de::Error::custom("expected a hex encoded ed25519 secret key"))?;
        if keypair.address != repr.public_key {
            return Err(serde::de::Error::custom(
                "public key does not match secret key",
            ));
        }
        Ok(keypair)
    }
}
