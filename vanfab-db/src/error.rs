//! Error types for database operations

use thiserror::Error;

/// Main error type for database operations
#[derive(Error, Debug)]
pub enum DbError {
    /// Underlying driver or connection failure
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// A row that a caller required was not present
    #[error("Not found: {what}")]
    NotFound { what: String },

    /// A stored enumeration column held an unknown value
    #[error("Invalid enum value for {column}: {value}")]
    InvalidEnum { column: String, value: String },

    /// JSON column contents did not match the expected shape
    #[error("Malformed JSON column {column}: {message}")]
    MalformedColumn { column: String, message: String },
}

impl DbError {
    pub fn not_found(what: impl Into<String>) -> Self {
        DbError::NotFound { what: what.into() }
    }
}

/// Result type alias for database operations
pub type DbResult<T> = Result<T, DbError>;
