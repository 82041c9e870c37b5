//! relay_crypto: key material and primitives for the relay transport layer
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Secrets stay behind [`KeyStore`]; callers pass public keys around.
//!
//! # Module layout
//! - `keys`: Ed25519 public keys (base58 / did:key) and key pairs
//! - `convert`: Ed25519 → X25519 conversion for key agreement
//! - `aead`: XChaCha20-Poly1305 encrypt/decrypt helpers
//! - `kdf`: HKDF-SHA256 derivations
//! - `boxes`: anonymous and sender-authenticated key-wrapping boxes
//! - `keystore`: secret-key lookup trait + in-memory implementation
//! - `error`: unified error type

pub mod aead;
pub mod boxes;
pub mod convert;
pub mod error;
pub mod kdf;
pub mod keys;
pub mod keystore;

pub use error::CryptoError;
pub use keys::{KeyPair, PublicKey};
pub use keystore::{InMemoryKeyStore, KeyStore};
