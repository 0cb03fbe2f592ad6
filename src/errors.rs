use thiserror::Error;

use crate::sjson::SjsonError;

/// Backend error kinds consumed by the command layer.
///
/// The first group is stable and inspected by callers; everything else wraps a
/// driver or codec failure and is only ever logged.
#[derive(Debug, Error)]
pub enum StoatDBError {
    #[error("database does not exist: {0}")]
    DatabaseDoesNotExist(String),

    #[error("collection does not exist: {0}")]
    CollectionDoesNotExist(String),

    #[error("collection already exists: {0}")]
    CollectionAlreadyExists(String),

    #[error("duplicate _id value on insert")]
    InsertDuplicateId,

    #[error("index already exists: {0}")]
    IndexAlreadyExists(String),

    #[error("unique constraint violation")]
    UniqueViolation,

    #[error("invalid connection uri: {0}")]
    InvalidUri(String),

    #[error("invalid collection metadata: {0}")]
    InvalidMetadata(String),

    #[error("unsupported backend setting {name} = {value:?}")]
    UnsupportedSetting { name: String, value: String },

    #[error("sjson error: {0}")]
    Sjson(#[from] SjsonError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl StoatDBError {
    /// Remaps a driver error raised by a unique index into the stable
    /// `UniqueViolation` kind; everything else is wrapped unchanged.
    pub fn from_pg(err: tokio_postgres::Error) -> Self {
        if is_unique_violation(&err) {
            return StoatDBError::UniqueViolation;
        }
        StoatDBError::Postgres(err)
    }
}

/// True if the error carries SQLSTATE 23505 (unique_violation).
pub(crate) fn is_unique_violation(err: &tokio_postgres::Error) -> bool {
    err.code() == Some(&tokio_postgres::error::SqlState::UNIQUE_VIOLATION)
}
