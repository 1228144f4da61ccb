//! Error types for arena-state

use thiserror::Error;
use uuid::Uuid;

/// Errors raised while connecting to or preparing the database
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

/// Errors returned by the store traits.
///
/// "Not found" and "precondition failed" are not errors at this layer:
/// lookups return `Option` and conditional updates return `Ok(None)` when
/// no row matched, leaving the interpretation to the caller.
#[derive(Error, Debug)]
pub enum StorageError {
    /// A record with the same identifier already exists
    #[error("{table} record already exists: {id}")]
    Duplicate { table: &'static str, id: String },

    /// A stored row could not be mapped back into a record
    #[error("corrupt {field} in stored row: {value}")]
    Corrupt { field: &'static str, value: String },

    /// A concurrent transaction touched the same record and this write was
    /// rolled back. Nothing was applied; the caller may re-read and retry.
    #[error("{entity} {id} was written concurrently, retry")]
    Conflict { entity: &'static str, id: Uuid },

    /// Backend-level failure (query, transport, serialization)
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}
