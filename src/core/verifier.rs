use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::error::StorageError;
use super::storage::StorageProvider;

/// How a copied object is checked at the destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyMode {
    /// Trust the write
    None,
    /// `stat` the destination and compare sizes
    #[default]
    Size,
    /// Re-read the destination and compare BLAKE3 hashes
    Checksum,
}

/// What the destination must match.
#[derive(Debug, Clone)]
pub struct ObjectDigest {
    pub size: u64,
    pub hash: Option<blake3::Hash>,
}

impl ObjectDigest {
    /// Describe `data`, hashing it only when the mode needs a checksum.
    pub async fn compute(data: &Bytes, mode: VerifyMode) -> Self {
        let size = data.len() as u64;
        let hash = match mode {
            VerifyMode::Checksum => Some(hash_bytes(data.clone()).await),
            VerifyMode::None | VerifyMode::Size => None,
        };
        Self { size, hash }
    }
}

/// Reason a copied object failed verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MismatchReason {
    SizeMismatch { expected: u64, actual: u64 },
    HashMismatch,
    MissingInDestination,
}

impl std::fmt::Display for MismatchReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MismatchReason::SizeMismatch { expected, actual } => {
                write!(f, "size mismatch (expected {} bytes, found {})", expected, actual)
            }
            MismatchReason::HashMismatch => f.write_str("hash mismatch"),
            MismatchReason::MissingInDestination => f.write_str("missing in destination"),
        }
    }
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("verification failed for '{key}': {reason}")]
    Mismatch { key: String, reason: MismatchReason },

    #[error("verification could not read destination: {0}")]
    Storage(#[from] StorageError),
}

/// Check that `key` on `destination` matches `expected`.
pub async fn verify_object(
    destination: &dyn StorageProvider,
    key: &str,
    expected: &ObjectDigest,
    mode: VerifyMode,
) -> Result<(), VerifyError> {
    let mismatch = |reason| VerifyError::Mismatch {
        key: key.to_string(),
        reason,
    };

    match mode {
        VerifyMode::None => Ok(()),
        VerifyMode::Size => {
            let stat = match destination.stat(key).await {
                Ok(stat) => stat,
                Err(StorageError::NotFound(_)) => {
                    return Err(mismatch(MismatchReason::MissingInDestination));
                }
                Err(e) => return Err(e.into()),
            };
            if stat.size != expected.size {
                return Err(mismatch(MismatchReason::SizeMismatch {
                    expected: expected.size,
                    actual: stat.size,
                }));
            }
            debug!(key = %key, size = stat.size, "Size verified");
            Ok(())
        }
        VerifyMode::Checksum => {
            let data = match destination.get(key).await {
                Ok(data) => data,
                Err(StorageError::NotFound(_)) => {
                    return Err(mismatch(MismatchReason::MissingInDestination));
                }
                Err(e) => return Err(e.into()),
            };
            if data.len() as u64 != expected.size {
                return Err(mismatch(MismatchReason::SizeMismatch {
                    expected: expected.size,
                    actual: data.len() as u64,
                }));
            }
            let actual = hash_bytes(data).await;
            match expected.hash {
                Some(hash) if hash == actual => {
                    debug!(key = %key, hash = %actual.to_hex(), "Checksum verified");
                    Ok(())
                }
                _ => Err(mismatch(MismatchReason::HashMismatch)),
            }
        }
    }
}

/// Hash object bytes on the blocking pool; objects may be large.
async fn hash_bytes(data: Bytes) -> blake3::Hash {
    match tokio::task::spawn_blocking({
        let data = data.clone();
        move || blake3::hash(&data)
    })
    .await
    {
        Ok(hash) => hash,
        // Blocking pool unavailable (runtime shutting down): hash inline
        Err(_) => blake3::hash(&data),
    }
}
