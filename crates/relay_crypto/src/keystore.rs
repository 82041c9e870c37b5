//! Secret-key lookup boundary.
//!
//! The envelope codec never owns secrets; it asks a [`KeyStore`] for the
//! key pair matching a public key. Wallet backends implement the trait;
//! [`InMemoryKeyStore`] covers embedding and tests.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::keys::{KeyPair, PublicKey};

pub trait KeyStore: Send + Sync {
    /// Key pair whose public half is `public`, if held locally.
    fn key_pair(&self, public: &PublicKey) -> Option<Arc<KeyPair>>;

    /// Take ownership of `pair`, returning its public key.
    fn insert(&self, pair: KeyPair) -> PublicKey;

    fn create_key(&self) -> PublicKey {
        self.insert(KeyPair::generate())
    }

    fn contains(&self, public: &PublicKey) -> bool {
        self.key_pair(public).is_some()
    }
}

#[derive(Default)]
pub struct InMemoryKeyStore {
    keys: RwLock<HashMap<PublicKey, Arc<KeyPair>>>,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }
}

impl KeyStore for InMemoryKeyStore {
    fn key_pair(&self, public: &PublicKey) -> Option<Arc<KeyPair>> {
        self.keys.read().get(public).cloned()
    }

    fn insert(&self, pair: KeyPair) -> PublicKey {
        let public = pair.public();
        self.keys.write().insert(public, Arc::new(pair));
        public
    }
}
