use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream;
use s3::Bucket;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::region::Region;
use serde_json::json;
use std::collections::VecDeque;
use tracing::debug;

use super::{ObjectStream, StorageProvider, check_key};
use crate::core::error::StorageError;
use crate::core::models::{ConnectionReport, ObjectInfo, ObjectStat, S3Config};

/// Keys requested per ListObjectsV2 page.
const LIST_PAGE_SIZE: usize = 1000;

/// Provider backed by an S3-compatible bucket.
pub struct S3Provider {
    bucket: Box<Bucket>,
    endpoint: String,
    region: String,
    path_style: bool,
}

impl S3Provider {
    /// Build a client for the bucket. No request is made until first use.
    pub fn new(config: &S3Config) -> Result<Self, StorageError> {
        let endpoint = config.endpoint_url();
        let region = Region::Custom {
            region: config.region_or_default().to_string(),
            endpoint: endpoint.clone(),
        };
        let credentials = Credentials::new(
            Some(&config.access_key),
            Some(&config.secret_key),
            None,
            None,
            None,
        )
        .map_err(|e| StorageError::Unreachable(format!("invalid credentials: {}", e)))?;

        let mut bucket = Bucket::new(&config.bucket, region, credentials)
            .map_err(|e| StorageError::Backend(format!("invalid bucket configuration: {}", e)))?;
        if config.path_style {
            bucket = bucket.with_path_style();
        }

        Ok(Self {
            bucket,
            endpoint,
            region: config.region_or_default().to_string(),
            path_style: config.path_style,
        })
    }

    fn object_key(key: &str) -> Result<&str, StorageError> {
        check_key(key)?;
        let trimmed = key.trim_start_matches('/');
        if trimmed.is_empty() {
            return Err(StorageError::invalid_key(key, "no path segments"));
        }
        Ok(trimmed)
    }
}

/// Translate an S3 client error for an operation on `key`.
fn map_s3_error(key: &str, error: S3Error) -> StorageError {
    match error {
        S3Error::HttpFailWithBody(404, _) => StorageError::NotFound(key.to_string()),
        S3Error::HttpFailWithBody(status @ (401 | 403), body) => StorageError::Unreachable(
            format!("access denied (HTTP {}): {}", status, first_line(&body)),
        ),
        S3Error::HttpFailWithBody(status, body) => {
            StorageError::Backend(format!("HTTP {}: {}", status, first_line(&body)))
        }
        other => StorageError::Unreachable(other.to_string()),
    }
}

fn first_line(body: &str) -> &str {
    body.lines().next().unwrap_or_default()
}

fn parse_listing_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn parse_header_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[async_trait]
impl StorageProvider for S3Provider {
    fn kind(&self) -> &'static str {
        "s3"
    }

    fn describe(&self) -> String {
        format!("s3://{} @ {}", self.bucket.name(), self.endpoint)
    }

    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<(), StorageError> {
        let object_key = Self::object_key(key)?;
        self.bucket
            .put_object_with_content_type(object_key, &data, content_type)
            .await
            .map_err(|e| map_s3_error(key, e))?;

        debug!(key = %key, bytes = data.len(), "Uploaded object");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        let object_key = Self::object_key(key)?;
        let response = self
            .bucket
            .get_object(object_key)
            .await
            .map_err(|e| map_s3_error(key, e))?;
        Ok(response.bytes().clone())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self.stat(key).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let object_key = Self::object_key(key)?;
        match self.bucket.delete_object(object_key).await {
            Ok(_) => Ok(()),
            Err(e) => match map_s3_error(key, e) {
                StorageError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    fn list(&self, prefix: &str) -> ObjectStream {
        let pager = Pager {
            bucket: self.bucket.clone(),
            prefix: prefix.trim_start_matches('/').to_string(),
            continuation: None,
            buffered: VecDeque::new(),
            exhausted: false,
        };

        stream::try_unfold(pager, |mut pager| async move {
            let next = pager.next_object().await?;
            Ok(next.map(|info| (info, pager)))
        })
        .boxed()
    }

    async fn stat(&self, key: &str) -> Result<ObjectStat, StorageError> {
        let object_key = Self::object_key(key)?;
        let (head, _status) = self
            .bucket
            .head_object(object_key)
            .await
            .map_err(|e| map_s3_error(key, e))?;

        Ok(ObjectStat {
            size: head.content_length.unwrap_or(0).max(0) as u64,
            last_modified: head.last_modified.as_deref().and_then(parse_header_time),
        })
    }

    async fn test_connection(&self) -> ConnectionReport {
        let details = json!({
            "endpoint": self.endpoint,
            "bucket": self.bucket.name(),
            "region": self.region,
            "path_style": self.path_style,
        });

        match self
            .bucket
            .list_page(String::new(), None, None, None, Some(1))
            .await
        {
            Ok((page, _)) => ConnectionReport::ok(
                format!("Bucket '{}' is reachable", self.bucket.name()),
                json!({
                    "endpoint": self.endpoint,
                    "bucket": self.bucket.name(),
                    "region": self.region,
                    "path_style": self.path_style,
                    "empty": page.contents.is_empty(),
                }),
            ),
            Err(e) => {
                let err = map_s3_error("", e);
                ConnectionReport::failed(format!("Bucket check failed: {}", err), details)
            }
        }
    }
}

/// Walks ListObjectsV2 pages, buffering one page at a time.
struct Pager {
    bucket: Box<Bucket>,
    prefix: String,
    continuation: Option<String>,
    buffered: VecDeque<ObjectInfo>,
    exhausted: bool,
}

impl Pager {
    async fn next_object(&mut self) -> Result<Option<ObjectInfo>, StorageError> {
        loop {
            if let Some(info) = self.buffered.pop_front() {
                return Ok(Some(info));
            }
            if self.exhausted {
                return Ok(None);
            }

            let (page, _) = self
                .bucket
                .list_page(
                    self.prefix.clone(),
                    None,
                    self.continuation.take(),
                    None,
                    Some(LIST_PAGE_SIZE),
                )
                .await
                .map_err(|e| map_s3_error(&self.prefix, e))?;

            self.continuation = page.next_continuation_token;
            self.exhausted = !page.is_truncated || self.continuation.is_none();
            self.buffered.extend(
                page.contents
                    .into_iter()
                    // Zero-byte "directory" markers are not objects
                    .filter(|o| !o.key.ends_with('/'))
                    .map(|o| ObjectInfo {
                        last_modified: parse_listing_time(&o.last_modified),
                        size: o.size,
                        key: o.key,
                    }),
            );
        }
    }
}
