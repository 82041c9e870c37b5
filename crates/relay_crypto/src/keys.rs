//! Agent key material
//!
//! Every key an agent uses for envelopes is an Ed25519 key pair. On the
//! wire the public half ("verkey") travels in one of two encodings:
//!
//! - raw base58, e.g. `8HH5gYEeNc3z7PYXmd54d4x6qAfCNrqQqEB3nS7Zfu7K`
//! - `did:key`, i.e. `did:key:z` + base58btc(0xed 0x01 ‖ key)
//!
//! [`PublicKey::parse`] accepts either and is the one place keys are
//! normalised. Serialisation always emits raw base58.

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::{convert, error::CryptoError};

pub const DID_KEY_PREFIX: &str = "did:key:";
const ED25519_MULTICODEC: [u8; 2] = [0xed, 0x01];

// ── Public key ────────────────────────────────────────────────────────────────

/// 32-byte Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!("Public key must be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_base58(s: &str) -> Result<Self, CryptoError> {
        let bytes = bs58::decode(s).into_vec()?;
        Self::from_bytes(&bytes)
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(self.0).into_string()
    }

    /// Parse `did:key:z6Mk…`, ignoring any `#fragment`.
    pub fn from_did_key(did: &str) -> Result<Self, CryptoError> {
        let without_fragment = did.split('#').next().unwrap_or(did);
        let multibase = without_fragment
            .strip_prefix(DID_KEY_PREFIX)
            .ok_or_else(|| CryptoError::UnsupportedKeyEncoding(did.to_string()))?;
        let encoded = multibase
            .strip_prefix('z')
            .ok_or_else(|| CryptoError::UnsupportedKeyEncoding(format!("not base58btc: {did}")))?;
        let bytes = bs58::decode(encoded).into_vec()?;
        if bytes.len() != 34 || bytes[..2] != ED25519_MULTICODEC {
            return Err(CryptoError::UnsupportedKeyEncoding(format!(
                "not an ed25519 did:key: {did}"
            )));
        }
        Self::from_bytes(&bytes[2..])
    }

    pub fn to_did_key(&self) -> String {
        let mut prefixed = Vec::with_capacity(34);
        prefixed.extend_from_slice(&ED25519_MULTICODEC);
        prefixed.extend_from_slice(&self.0);
        format!("{DID_KEY_PREFIX}z{}", bs58::encode(prefixed).into_string())
    }

    /// Accept either encoding.
    pub fn parse(s: &str) -> Result<Self, CryptoError> {
        if is_did_key(s) {
            Self::from_did_key(s)
        } else {
            Self::from_base58(s)
        }
    }

    pub fn to_x25519(&self) -> Result<X25519Public, CryptoError> {
        convert::ed25519_pub_to_x25519(&self.0)
    }

    /// Short BLAKE3 fingerprint used in logs.
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(&self.0);
        hex::encode(&hash.as_bytes()[..8])
    }

    pub fn verify(&self, msg: &[u8], sig_bytes: &[u8]) -> Result<(), CryptoError> {
        let vk = VerifyingKey::from_bytes(&self.0).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let sig = Signature::from_bytes(
            sig_bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKey("Bad sig len".into()))?,
        );
        vk.verify(msg, &sig).map_err(|_| CryptoError::SignatureVerification)
    }
}

pub fn is_did_key(s: &str) -> bool {
    s.starts_with(DID_KEY_PREFIX)
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_base58())
    }
}

impl FromStr for PublicKey {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base58())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// ── Key pair ──────────────────────────────────────────────────────────────────

/// Ed25519 key pair.  Drop clears the seed via ZeroizeOnDrop.
#[derive(ZeroizeOnDrop)]
pub struct KeyPair {
    #[zeroize(skip)]
    public: PublicKey,
    secret_bytes: [u8; 32],
}

impl KeyPair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self {
            public: PublicKey(signing_key.verifying_key().to_bytes()),
            secret_bytes: signing_key.to_bytes(),
        }
    }

    /// Deterministic key pair from a 32-byte seed.
    pub fn from_seed(seed: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 32] = seed
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("Seed must be 32 bytes, got {}", seed.len())))?;
        let signing_key = SigningKey::from_bytes(&arr);
        Ok(Self {
            public: PublicKey(signing_key.verifying_key().to_bytes()),
            secret_bytes: arr,
        })
    }

    pub fn public(&self) -> PublicKey {
        self.public
    }

    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        SigningKey::from_bytes(&self.secret_bytes).sign(msg).to_bytes().to_vec()
    }

    pub fn x25519_secret(&self) -> StaticSecret {
        convert::ed25519_secret_to_x25519(&self.secret_bytes)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair").field("public", &self.public).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn did_key_and_base58_name_the_same_key() {
        let pair = KeyPair::generate();
        let key = pair.public();
        let did = key.to_did_key();
        assert!(did.starts_with("did:key:z6Mk"));
        assert_eq!(PublicKey::parse(&did).unwrap(), key);
        assert_eq!(PublicKey::parse(&key.to_base58()).unwrap(), key);
        assert_eq!(PublicKey::parse(&format!("{did}#{}", &did[8..])).unwrap(), key);
    }

    #[test]
    fn known_did_key_vector() {
        // did:key test vector from the did:key method specification
        let key = PublicKey::from_did_key("did:key:z6MkiTBz1ymuepAQ4HEHYSF1H8quG5GLVVQR3djdX3mDooWp").unwrap();
        assert_eq!(key.to_did_key(), "did:key:z6MkiTBz1ymuepAQ4HEHYSF1H8quG5GLVVQR3djdX3mDooWp");
    }

    #[test]
    fn rejects_foreign_multicodec() {
        // secp256k1 did:key
        let err = PublicKey::from_did_key("did:key:zQ3shokFTS3brHcDQrn82RUDfCZESWL1ZdCEJwekUDPQiYBme");
        assert!(err.is_err());
    }

    #[test]
    fn serde_normalises_to_base58() {
        let key = KeyPair::generate().public();
        let json = serde_json::to_string(&key.to_did_key()).unwrap();
        let parsed: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(serde_json::to_string(&parsed).unwrap(), format!("\"{}\"", key.to_base58()));
    }

    #[test]
    fn sign_and_verify() {
        let pair = KeyPair::from_seed(&[9u8; 32]).unwrap();
        let sig = pair.sign(b"payload");
        assert!(pair.public().verify(b"payload", &sig).is_ok());
        assert!(pair.public().verify(b"tampered", &sig).is_err());
    }
}
