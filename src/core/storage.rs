//! Storage provider abstraction.
//!
//! Every backend that can hold application objects implements
//! [`StorageProvider`]. The local filesystem and S3-compatible buckets are the
//! two production backends; [`InMemoryProvider`] shares the same contract and
//! supports fault injection.

pub mod local;
pub mod memory;
pub mod remote;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::sync::Arc;

use super::error::StorageError;
use super::models::{ConnectionReport, ObjectInfo, ObjectStat, StorageConfig};

pub use local::LocalProvider;
pub use memory::InMemoryProvider;
pub use remote::S3Provider;

/// Lazily produced listing. Each call to `list` starts a fresh enumeration.
pub type ObjectStream = BoxStream<'static, Result<ObjectInfo, StorageError>>;

#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Backend name, e.g. "local" or "s3".
    fn kind(&self) -> &'static str;

    /// Where this provider points, safe to log.
    fn describe(&self) -> String;

    /// Write an object, replacing any existing object under `key`.
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<(), StorageError>;

    async fn get(&self, key: &str) -> Result<Bytes, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Remove an object. Removing an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Enumerate objects whose key starts with `prefix`.
    fn list(&self, prefix: &str) -> ObjectStream;

    async fn stat(&self, key: &str) -> Result<ObjectStat, StorageError>;

    /// Cheap, read-only round trip to the backend.
    async fn test_connection(&self) -> ConnectionReport;
}

/// Builds providers from configuration.
///
/// The registry and the migration job build every provider through this seam
/// so tests can substitute their own backends.
pub trait ProviderFactory: Send + Sync {
    fn build(&self, config: &StorageConfig) -> Result<Arc<dyn StorageProvider>, StorageError>;
}

/// Factory for the production backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultProviderFactory;

impl ProviderFactory for DefaultProviderFactory {
    fn build(&self, config: &StorageConfig) -> Result<Arc<dyn StorageProvider>, StorageError> {
        create_provider(config)
    }
}

/// Factory function to create a provider from a storage config.
pub fn create_provider(config: &StorageConfig) -> Result<Arc<dyn StorageProvider>, StorageError> {
    match config {
        StorageConfig::Local { root } => Ok(Arc::new(LocalProvider::new(root.clone()))),
        StorageConfig::S3(s3) => Ok(Arc::new(S3Provider::new(s3)?)),
    }
}

/// Checks shared by every backend: non-empty, no NUL bytes.
pub(crate) fn check_key(key: &str) -> Result<(), StorageError> {
    if key.trim().is_empty() {
        return Err(StorageError::invalid_key(key, "empty key"));
    }
    if key.contains('\0') {
        return Err(StorageError::invalid_key(key, "contains NUL byte"));
    }
    Ok(())
}

/// Best-effort content type from the key's extension.
pub fn guess_content_type(key: &str) -> &'static str {
    let ext = key
        .rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase());

    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("pdf") => "application/pdf",
        Some("json") => "application/json",
        Some("csv") => "text/csv",
        Some("txt") | Some("log") => "text/plain",
        Some("html") | Some("htm") => "text/html",
        Some("zip") => "application/zip",
        Some("gz") => "application/gzip",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_from_extension() {
        assert_eq!(guess_content_type("case/42/photo.JPG"), "image/jpeg");
        assert_eq!(guess_content_type("exports/report.csv"), "text/csv");
        assert_eq!(guess_content_type("blob"), "application/octet-stream");
        assert_eq!(guess_content_type("dir.d/blob"), "application/octet-stream");
    }

    #[test]
    fn check_key_rejects_empty_and_nul() {
        assert!(check_key("").is_err());
        assert!(check_key("  ").is_err());
        assert!(check_key("a\0b").is_err());
        assert!(check_key("a/b").is_ok());
    }

    #[test]
    fn create_provider_matches_kind() {
        let local = create_provider(&StorageConfig::Local {
            root: "/tmp/blobshift-test".into(),
        })
        .unwrap();
        assert_eq!(local.kind(), "local");
    }
}
