//! Mediation record persistence.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use relay_crypto::PublicKey;

use crate::{
    error::StoreError,
    models::{MediationRecord, MediationRole},
};

#[async_trait]
pub trait MediationRepository: Send + Sync {
    /// Insert or replace by id.
    async fn save(&self, record: &MediationRecord) -> Result<(), StoreError>;

    /// Fails with [`StoreError::NotFound`] for unknown ids.
    async fn get_by_id(&self, id: &str) -> Result<MediationRecord, StoreError>;

    async fn find_by_connection_id(&self, connection_id: &str) -> Result<Option<MediationRecord>, StoreError>;

    async fn find_by_recipient_key(
        &self,
        role: MediationRole,
        key: &PublicKey,
    ) -> Result<Option<MediationRecord>, StoreError>;

    async fn find_default(&self) -> Result<Option<MediationRecord>, StoreError>;

    async fn get_all(&self) -> Result<Vec<MediationRecord>, StoreError>;
}

#[derive(Default)]
pub struct InMemoryMediationRepository {
    records: RwLock<HashMap<String, MediationRecord>>,
}

impl InMemoryMediationRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MediationRepository for InMemoryMediationRepository {
    async fn save(&self, record: &MediationRecord) -> Result<(), StoreError> {
        self.records.write().insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> Result<MediationRecord, StoreError> {
        self.records
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("mediation record {id}")))
    }

    async fn find_by_connection_id(&self, connection_id: &str) -> Result<Option<MediationRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .values()
            .find(|r| r.connection_id == connection_id)
            .cloned())
    }

    async fn find_by_recipient_key(
        &self,
        role: MediationRole,
        key: &PublicKey,
    ) -> Result<Option<MediationRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .values()
            .find(|r| r.role == role && r.recipient_keys.contains(key))
            .cloned())
    }

    async fn find_default(&self) -> Result<Option<MediationRecord>, StoreError> {
        Ok(self.records.read().values().find(|r| r.is_default).cloned())
    }

    async fn get_all(&self) -> Result<Vec<MediationRecord>, StoreError> {
        let mut all: Vec<_> = self.records.read().values().cloned().collect();
        all.sort_by_key(|r| r.created_at);
        Ok(all)
    }
}
