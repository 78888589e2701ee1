use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream;
use serde_json::json;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ObjectStream, StorageProvider, check_key};
use crate::core::error::StorageError;
use crate::core::models::{ConnectionReport, ObjectInfo, ObjectStat};

/// Prefix for in-flight writes. Such files are never listed.
const TEMP_PREFIX: &str = ".blobshift-tmp-";

/// Filesystem-backed provider rooted at a directory.
///
/// Keys map to paths below `root`. Any key that would resolve outside the
/// root is rejected with [`StorageError::InvalidKey`].
pub struct LocalProvider {
    root: PathBuf,
}

impl LocalProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to a path under the root.
    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        check_key(key)?;
        if key.contains('\\') {
            return Err(StorageError::invalid_key(key, "backslash separator"));
        }

        let mut path = self.root.clone();
        let mut depth = 0usize;
        for component in Path::new(key).components() {
            match component {
                Component::Normal(part) => {
                    path.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    return Err(StorageError::invalid_key(key, "path traversal"));
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(StorageError::invalid_key(key, "absolute path"));
                }
            }
        }

        if depth == 0 {
            return Err(StorageError::invalid_key(key, "no path segments"));
        }
        Ok(path)
    }

    /// Resolve `key` and refuse any path that passes through a symlink below
    /// the root, since following it could leave the root.
    async fn resolve_contained(&self, key: &str) -> Result<PathBuf, StorageError> {
        let path = self.resolve(key)?;
        let relative = path.strip_prefix(&self.root).unwrap_or_else(|_| Path::new(""));

        let mut current = self.root.clone();
        for part in relative.components() {
            current.push(part);
            match fs::symlink_metadata(&current).await {
                Ok(meta) if meta.file_type().is_symlink() => {
                    return Err(StorageError::invalid_key(key, "path crosses a symlink"));
                }
                Ok(_) => {}
                // Nothing below a missing component can be a link
                Err(e) if e.kind() == ErrorKind::NotFound => break,
                Err(e) => return Err(StorageError::from_io(key, e)),
            }
        }
        Ok(path)
    }
}

#[async_trait]
impl StorageProvider for LocalProvider {
    fn kind(&self) -> &'static str {
        "local"
    }

    fn describe(&self) -> String {
        format!("local:{}", self.root.display())
    }

    async fn put(&self, key: &str, data: Bytes, _content_type: &str) -> Result<(), StorageError> {
        let path = self.resolve_contained(key).await?;
        let parent = path
            .parent()
            .ok_or_else(|| StorageError::invalid_key(key, "no parent directory"))?;

        fs::create_dir_all(parent)
            .await
            .map_err(|e| StorageError::from_io(key, e))?;

        // Write beside the target and rename so readers never see a partial object
        let temp_path = parent.join(format!("{}{}", TEMP_PREFIX, Uuid::now_v7()));
        let write = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            fs::rename(&temp_path, &path).await
        };

        if let Err(e) = write.await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::Io {
                key: key.to_string(),
                source: e,
            });
        }

        debug!(key = %key, bytes = data.len(), "Wrote local object");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        let path = self.resolve_contained(key).await?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(StorageError::NotFound(key.to_string())),
            Err(e) => return Err(StorageError::from_io(key, e)),
        }

        let data = fs::read(&path)
            .await
            .map_err(|e| StorageError::from_io(key, e))?;
        Ok(Bytes::from(data))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.resolve_contained(key).await?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::from_io(key, e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.resolve_contained(key).await?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::from_io(key, e)),
        }
    }

    fn list(&self, prefix: &str) -> ObjectStream {
        let walk = Walk {
            root: self.root.clone(),
            prefix: prefix.trim_start_matches('/').to_string(),
            pending_dirs: vec![self.root.clone()],
            current: None,
        };

        stream::try_unfold(walk, |mut walk| async move {
            let next = walk.next_object().await?;
            Ok(next.map(|info| (info, walk)))
        })
        .boxed()
    }

    async fn stat(&self, key: &str) -> Result<ObjectStat, StorageError> {
        let path = self.resolve_contained(key).await?;
        let meta = fs::metadata(&path)
            .await
            .map_err(|e| StorageError::from_io(key, e))?;
        if !meta.is_file() {
            return Err(StorageError::NotFound(key.to_string()));
        }

        Ok(ObjectStat {
            size: meta.len(),
            last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
        })
    }

    async fn test_connection(&self) -> ConnectionReport {
        let details = json!({ "root": self.root.display().to_string() });

        match fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => {
                let read_only = meta.permissions().readonly();
                ConnectionReport::ok(
                    "Storage directory is accessible",
                    json!({
                        "root": self.root.display().to_string(),
                        "read_only": read_only,
                    }),
                )
            }
            Ok(_) => ConnectionReport::failed("Storage root is not a directory", details),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                ConnectionReport::failed("Storage directory does not exist", details)
            }
            Err(e) => ConnectionReport::failed(
                format!("Storage directory is not accessible: {}", e),
                details,
            ),
        }
    }
}

/// Depth-first directory walk that yields one object at a time.
struct Walk {
    root: PathBuf,
    prefix: String,
    pending_dirs: Vec<PathBuf>,
    current: Option<fs::ReadDir>,
}

impl Walk {
    async fn next_object(&mut self) -> Result<Option<ObjectInfo>, StorageError> {
        loop {
            let Some(entries) = self.current.as_mut() else {
                let Some(dir) = self.pending_dirs.pop() else {
                    return Ok(None);
                };
                match fs::read_dir(&dir).await {
                    Ok(entries) => self.current = Some(entries),
                    // Missing root lists as empty; a directory removed mid-walk is skipped
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => return Err(StorageError::from_io(&dir.to_string_lossy(), e)),
                }
                continue;
            };

            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    self.current = None;
                    continue;
                }
                Err(e) => return Err(StorageError::Unreachable(e.to_string())),
            };

            let path = entry.path();
            let file_type = match entry.file_type().await {
                Ok(ft) => ft,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
                    continue;
                }
            };

            if file_type.is_dir() {
                self.pending_dirs.push(path);
                continue;
            }
            // Skip symlinks and other special files
            if !file_type.is_file() {
                continue;
            }

            let Some(key) = key_for(&self.root, &path) else {
                warn!(path = %path.display(), "Skipping file with non UTF-8 name");
                continue;
            };
            if is_temp_file(&key) || !key.starts_with(&self.prefix) {
                continue;
            }

            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                // Removed between readdir and stat
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::from_io(&key, e)),
            };

            return Ok(Some(ObjectInfo {
                key,
                size: meta.len(),
                last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
            }));
        }
    }
}

fn key_for(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join("/"))
}

fn is_temp_file(key: &str) -> bool {
    key.rsplit('/')
        .next()
        .is_some_and(|name| name.starts_with(TEMP_PREFIX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use tempfile::tempdir;

    #[test]
    fn resolve_rejects_traversal() {
        let provider = LocalProvider::new("/srv/objects");

        for key in ["../etc/passwd", "a/../../b", "a/..", "/etc/passwd", "", "./", "a\\..\\b"] {
            let err = provider.resolve(key).unwrap_err();
            assert!(
                matches!(err, StorageError::InvalidKey { .. }),
                "expected InvalidKey for {:?}, got {:?}",
                key,
                err
            );
        }
    }

    #[test]
    fn resolve_accepts_nested_keys() {
        let provider = LocalProvider::new("/srv/objects");
        let path = provider.resolve("cases/7/./evidence.bin").unwrap();
        assert_eq!(path, PathBuf::from("/srv/objects/cases/7/evidence.bin"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinked_directory_cannot_escape_root() {
        let temp = tempdir().unwrap();
        let root = temp.path().join("objects");
        let outside = temp.path().join("outside");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&outside).unwrap();
        std::fs::write(outside.join("secret.txt"), b"keep out").unwrap();
        std::os::unix::fs::symlink(&outside, root.join("link")).unwrap();

        let provider = LocalProvider::new(&root);
        let err = provider
            .put("link/planted.txt", Bytes::from_static(b"x"), "text/plain")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey { .. }), "{}", err);
        assert!(!outside.join("planted.txt").exists());

        assert!(matches!(
            provider.get("link/secret.txt").await,
            Err(StorageError::InvalidKey { .. })
        ));
        assert!(provider.delete("link/secret.txt").await.is_err());
        assert!(outside.join("secret.txt").exists());

        // Ordinary nested keys are unaffected
        provider
            .put("real/dir/a.txt", Bytes::from_static(b"ok"), "text/plain")
            .await
            .unwrap();
        assert!(provider.exists("real/dir/a.txt").await.unwrap());
    }

    #[tokio::test]
    async fn put_leaves_no_temp_files() {
        let temp = tempdir().unwrap();
        let provider = LocalProvider::new(temp.path());

        provider
            .put("a/b.txt", Bytes::from_static(b"hello"), "text/plain")
            .await
            .unwrap();

        let names: Vec<_> = std::fs::read_dir(temp.path().join("a"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["b.txt".to_string()]);
    }

    #[tokio::test]
    async fn list_filters_prefix_and_temp_files() {
        let temp = tempdir().unwrap();
        let provider = LocalProvider::new(temp.path());

        provider.put("img/1.png", Bytes::from_static(b"1"), "image/png").await.unwrap();
        provider.put("img/2.png", Bytes::from_static(b"22"), "image/png").await.unwrap();
        provider.put("doc/a.pdf", Bytes::from_static(b"333"), "application/pdf").await.unwrap();
        std::fs::write(temp.path().join("img").join(".blobshift-tmp-x"), b"partial").unwrap();

        let mut keys: Vec<String> = provider
            .list("img/")
            .map_ok(|info| info.key)
            .try_collect()
            .await
            .unwrap();
        keys.sort();
        assert_eq!(keys, vec!["img/1.png", "img/2.png"]);

        let all: Vec<ObjectInfo> = provider.list("").try_collect().await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all.iter().map(|o| o.size).sum::<u64>(), 6);
    }

    #[tokio::test]
    async fn list_missing_root_is_empty() {
        let temp = tempdir().unwrap();
        let provider = LocalProvider::new(temp.path().join("never-created"));
        let all: Vec<ObjectInfo> = provider.list("").try_collect().await.unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn stat_on_directory_is_not_found() {
        let temp = tempdir().unwrap();
        let provider = LocalProvider::new(temp.path());
        std::fs::create_dir(temp.path().join("dir")).unwrap();

        assert!(provider.stat("dir").await.unwrap_err().is_not_found());
        assert!(!provider.exists("dir").await.unwrap());
    }

    #[tokio::test]
    async fn test_connection_reports_missing_root() {
        let temp = tempdir().unwrap();
        let ok = LocalProvider::new(temp.path()).test_connection().await;
        assert!(ok.success);

        let missing = LocalProvider::new(temp.path().join("nope"))
            .test_connection()
            .await;
        assert!(!missing.success);
        assert!(missing.message.contains("does not exist"));
    }
}
