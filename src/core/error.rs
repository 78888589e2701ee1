//! Error types for storage providers and the migration job.

use thiserror::Error;

/// Errors returned by a [`StorageProvider`](crate::core::storage::StorageProvider).
#[derive(Debug, Error)]
pub enum StorageError {
    /// Key is malformed or would resolve outside the provider namespace
    #[error("invalid object key '{key}': {reason}")]
    InvalidKey { key: String, reason: &'static str },

    #[error("object not found: {0}")]
    NotFound(String),

    /// Connectivity or authentication failure against the backend
    #[error("storage backend unreachable: {0}")]
    Unreachable(String),

    #[error("I/O error on '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    /// Any other error reported by the backend
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn invalid_key(key: &str, reason: &'static str) -> Self {
        StorageError::InvalidKey {
            key: key.to_string(),
            reason,
        }
    }

    /// Map an I/O error for `key`, folding `NotFound` into [`StorageError::NotFound`].
    pub fn from_io(key: &str, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(key.to_string())
        } else {
            StorageError::Io {
                key: key.to_string(),
                source,
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

/// Errors surfaced by the migration job to its callers.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Another migration is in flight; callers should treat this as a conflict
    #[error("a migration is already running")]
    AlreadyRunning,

    #[error("incomplete destination configuration: {0}")]
    IncompleteConfig(String),

    #[error("destination is the active storage configuration")]
    DestinationIsSource,

    #[error("source storage unreachable: {0}")]
    SourceUnreachable(String),

    #[error("destination storage unreachable: {0}")]
    DestinationUnreachable(String),

    /// One object failed to copy. Recorded and counted, never fatal to the run
    #[error("failed to copy '{key}': {cause}")]
    PerObjectCopy { key: String, cause: String },

    #[error("migration aborted")]
    Aborted,

    #[error("failed to enumerate source objects: {0}")]
    Enumeration(String),
}

/// Errors from the settings store.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings database error: {0}")]
    Database(String),

    #[error("invalid value for setting '{key}': {value}")]
    InvalidValue { key: String, value: String },
}

impl SettingsError {
    pub fn database(e: impl std::fmt::Display) -> Self {
        SettingsError::Database(e.to_string())
    }
}

/// Errors from resolving the active storage provider.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("failed to build storage provider: {0}")]
    Build(#[from] StorageError),

    #[error("invalid storage configuration: {0}")]
    InvalidConfig(String),
}
