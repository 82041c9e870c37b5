//! SQLite backend via sqlx.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use relay_crypto::PublicKey;
use relay_proto::EncryptedMessage;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use tracing::{debug, info};

use crate::{
    error::StoreError,
    mediation::MediationRepository,
    models::{
        MediationRecord, MediationRecordRow, MediationRole, QueueScope, QueuedMessage,
        QueuedMessageRow, QueuedMessageState, TakeOptions,
    },
    queue::MessageQueueStore,
};

const QUEUE_COLUMNS: &str = "id, connection_id, recipient_dids, encrypted_message, received_at, state";
const QUEUE_SCOPE: &str = "(?1 IS NULL OR connection_id = ?1) \
     AND (?2 IS NULL OR EXISTS (SELECT 1 FROM json_each(queued_messages.recipient_dids) WHERE json_each.value = ?2))";
const MEDIATION_COLUMNS: &str = "id, connection_id, thread_id, role, state, recipient_keys, routing_keys, \
     endpoint, is_default, created_at, updated_at";

/// Central store handle.  Cheap to clone (Arc internally).
#[derive(Clone)]
pub struct SqliteStore {
    pub pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the SQLite database at `db_path`.
    /// Runs all pending migrations automatically.
    ///
    /// WAL journal mode is configured at connection time; SQLite refuses to
    /// change `journal_mode` inside the transaction a migration runs in.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StoreError::Migration(format!("create {}: {e}", parent.display())))?;
            }
        }

        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(opts).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        info!(path = %db_path.display(), "relay store opened");
        Ok(Self { pool })
    }
}

fn limit_param(limit: Option<usize>) -> i64 {
    // SQLite treats a negative LIMIT as "no limit".
    limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX)).unwrap_or(-1)
}

// ── Queue ────────────────────────────────────────────────────────────────────

#[async_trait]
impl MessageQueueStore for SqliteStore {
    async fn add_message(
        &self,
        connection_id: &str,
        recipient_dids: &[String],
        payload: &EncryptedMessage,
    ) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO queued_messages (id, connection_id, recipient_dids, encrypted_message, received_at, state) \
             VALUES (?, ?, ?, ?, ?, 'pending')",
        )
        .bind(&id)
        .bind(connection_id)
        .bind(serde_json::to_string(recipient_dids)?)
        .bind(serde_json::to_string(payload)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        debug!(connection_id, message_id = %id, "queued message");
        Ok(id)
    }

    async fn take_from_queue(&self, options: TakeOptions) -> Result<Vec<QueuedMessage>, StoreError> {
        options.scope.ensure_scoped()?;
        let mut tx = self.pool.begin().await?;

        let rows: Vec<QueuedMessageRow> = sqlx::query_as(&format!(
            "SELECT {QUEUE_COLUMNS} FROM queued_messages WHERE {QUEUE_SCOPE} ORDER BY seq LIMIT ?3"
        ))
        .bind(options.scope.connection_id.as_deref())
        .bind(options.scope.recipient_did.as_deref())
        .bind(limit_param(options.limit))
        .fetch_all(&mut *tx)
        .await?;

        let mut taken = Vec::with_capacity(rows.len());
        for row in rows {
            let mut message = QueuedMessage::try_from(row)?;
            let statement = if options.delete_messages {
                "DELETE FROM queued_messages WHERE id = ?"
            } else {
                "UPDATE queued_messages SET state = 'sending' WHERE id = ?"
            };
            sqlx::query(statement).bind(&message.id).execute(&mut *tx).await?;
            message.state = QueuedMessageState::Sending;
            taken.push(message);
        }

        tx.commit().await?;
        Ok(taken)
    }

    async fn get_available_message_count(&self, scope: &QueueScope) -> Result<usize, StoreError> {
        scope.ensure_scoped()?;
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM queued_messages WHERE {QUEUE_SCOPE}"))
            .bind(scope.connection_id.as_deref())
            .bind(scope.recipient_did.as_deref())
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    async fn remove_messages(&self, scope: &QueueScope, message_ids: &[String]) -> Result<(), StoreError> {
        scope.ensure_scoped()?;
        let mut tx = self.pool.begin().await?;
        for id in message_ids {
            sqlx::query(&format!("DELETE FROM queued_messages WHERE {QUEUE_SCOPE} AND id = ?3"))
                .bind(scope.connection_id.as_deref())
                .bind(scope.recipient_did.as_deref())
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

// ── Mediation records ────────────────────────────────────────────────────────

impl SqliteStore {
    async fn fetch_mediation(&self, clause: &str, bind: &str) -> Result<Vec<MediationRecord>, StoreError> {
        let rows: Vec<MediationRecordRow> = sqlx::query_as(&format!(
            "SELECT {MEDIATION_COLUMNS} FROM mediation_records WHERE {clause} ORDER BY created_at"
        ))
        .bind(bind)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(MediationRecord::try_from).collect()
    }
}

#[async_trait]
impl MediationRepository for SqliteStore {
    async fn save(&self, record: &MediationRecord) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO mediation_records ({MEDIATION_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
               connection_id = excluded.connection_id, thread_id = excluded.thread_id, \
               role = excluded.role, state = excluded.state, \
               recipient_keys = excluded.recipient_keys, routing_keys = excluded.routing_keys, \
               endpoint = excluded.endpoint, is_default = excluded.is_default, \
               updated_at = excluded.updated_at"
        ))
        .bind(&record.id)
        .bind(&record.connection_id)
        .bind(&record.thread_id)
        .bind(record.role.as_str())
        .bind(record.state.as_str())
        .bind(serde_json::to_string(&record.recipient_keys)?)
        .bind(serde_json::to_string(&record.routing_keys)?)
        .bind(record.endpoint.as_deref())
        .bind(record.is_default)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> Result<MediationRecord, StoreError> {
        self.fetch_mediation("id = ?", id)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound(format!("mediation record {id}")))
    }

    async fn find_by_connection_id(&self, connection_id: &str) -> Result<Option<MediationRecord>, StoreError> {
        Ok(self
            .fetch_mediation("connection_id = ?", connection_id)
            .await?
            .into_iter()
            .next())
    }

    async fn find_by_recipient_key(
        &self,
        role: MediationRole,
        key: &PublicKey,
    ) -> Result<Option<MediationRecord>, StoreError> {
        let candidates = self
            .fetch_mediation(
                "EXISTS (SELECT 1 FROM json_each(mediation_records.recipient_keys) WHERE json_each.value = ?)",
                &key.to_base58(),
            )
            .await?;
        Ok(candidates.into_iter().find(|r| r.role == role))
    }

    async fn find_default(&self) -> Result<Option<MediationRecord>, StoreError> {
        let rows: Vec<MediationRecordRow> = sqlx::query_as(&format!(
            "SELECT {MEDIATION_COLUMNS} FROM mediation_records WHERE is_default = 1 LIMIT 1"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().next().map(MediationRecord::try_from).transpose()
    }

    async fn get_all(&self) -> Result<Vec<MediationRecord>, StoreError> {
        let rows: Vec<MediationRecordRow> = sqlx::query_as(&format!(
            "SELECT {MEDIATION_COLUMNS} FROM mediation_records ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(MediationRecord::try_from).collect()
    }
}
