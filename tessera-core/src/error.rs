//! Error types for Tessera operations

use serde_json::{Map, Value};
use thiserror::Error;

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StorageError {
    /// A conditional write found the stored item in an unexpected state.
    /// `current` is the item image at the time of the check, if any.
    #[error("Condition check failed on {table}")]
    ConditionFailed {
        table: String,
        current: Option<Map<String, Value>>,
    },

    #[error("Backend error on {table}: {reason}")]
    Backend { table: String, reason: String },

    #[error("Malformed item {key}: {reason}")]
    Codec { key: String, reason: String },

    #[error("Invalid update on {key}: {reason}")]
    InvalidUpdate { key: String, reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,

    #[error("Request dropped before dispatch: {reason}")]
    DispatchDropped { reason: String },
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Type not registered: {type_name}")]
    UnknownType { type_name: String },

    #[error("Organisation id {organisation_id} is reserved or malformed")]
    ReservedOrganisation { organisation_id: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Master error type for all Tessera errors.
#[derive(Debug, Clone, Error)]
pub enum TesseraError {
    /// The stored revision did not match the revision the caller held.
    #[error("Revision mismatch on {type_name}:{id}: held {expected}, stored {actual}")]
    Concurrency {
        type_name: String,
        id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Write to {type_name} forbidden for organisation {organisation_id}")]
    Forbidden {
        organisation_id: String,
        type_name: String,
        id: Option<String>,
    },

    #[error("{type_name}:{id} still links to {link_types:?}; unlink first or cascade")]
    DanglingLinks {
        type_name: String,
        id: String,
        link_types: Vec<String>,
    },

    #[error("Expected at most one {type_name} for {lookup}, found {count}")]
    Multiplicity {
        type_name: String,
        lookup: String,
        count: usize,
    },

    #[error("Unsupported operation on {type_name}: {reason}")]
    Unsupported { type_name: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl TesseraError {
    /// Whether re-reading the record and retrying can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Concurrency { .. })
    }

    pub fn unsupported(type_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unsupported {
            type_name: type_name.into(),
            reason: reason.into(),
        }
    }

    pub fn codec(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Storage(StorageError::Codec {
            key: key.into(),
            reason: reason.into(),
        })
    }
}

impl From<serde_json::Error> for TesseraError {
    fn from(err: serde_json::Error) -> Self {
        TesseraError::Validation(ValidationError::InvalidValue {
            field: "item".to_string(),
            reason: err.to_string(),
        })
    }
}

/// Result type alias for Tessera operations.
pub type TesseraResult<T> = Result<T, TesseraError>;

// =============================================================================
// TESTS
// =============================================================================
