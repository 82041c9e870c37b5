use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Queue scope must name a connection or a recipient DID")]
    UnscopedQueueAccess,

    #[error("Corrupt column {column}: {value}")]
    Corrupt { column: &'static str, value: String },
}
