//! Error types for prism-state

use thiserror::Error;

/// Errors raised while connecting to or preparing the shared store.
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

/// Errors produced by the storage trait implementations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// A keyed record does not exist.
    #[error("record not found: {key}")]
    NotFound { key: String },

    /// The backend rejected or failed the operation.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// A payload could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A stored row violates the record contract.
    #[error("invalid record for {key}: {reason}")]
    InvalidRecord { key: String, reason: String },
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
