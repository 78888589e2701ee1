use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;

use super::error::{MigrationError, SettingsError};

/// Region used when an S3 configuration leaves it blank.
pub const DEFAULT_REGION: &str = "us-east-1";

// Settings store keys for the active storage configuration
pub const KEY_STORAGE_TYPE: &str = "storage.type";
pub const KEY_LOCAL_ROOT: &str = "storage.local.root";
pub const KEY_S3_ENDPOINT: &str = "storage.s3.endpoint";
pub const KEY_S3_REGION: &str = "storage.s3.region";
pub const KEY_S3_BUCKET: &str = "storage.s3.bucket";
pub const KEY_S3_ACCESS_KEY: &str = "storage.s3.access_key";
pub const KEY_S3_SECRET_KEY: &str = "storage.s3.secret_key";
pub const KEY_S3_PATH_STYLE: &str = "storage.s3.path_style";
pub const KEY_S3_USE_SSL: &str = "storage.s3.use_ssl";

/// An object as seen by `list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectStat {
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Outcome of a connectivity check. Always returned, never raised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionReport {
    pub success: bool,
    pub message: String,
    pub details: Value,
}

impl ConnectionReport {
    pub fn ok(message: impl Into<String>, details: Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            details,
        }
    }

    pub fn failed(message: impl Into<String>, details: Value) -> Self {
        Self {
            success: false,
            message: message.into(),
            details,
        }
    }
}

/// Connection settings for an S3-compatible bucket.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Config {
    pub endpoint: String,
    #[serde(default = "default_region")]
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    #[serde(default)]
    pub path_style: bool,
    #[serde(default = "default_use_ssl")]
    pub use_ssl: bool,
}

fn default_region() -> String {
    DEFAULT_REGION.to_string()
}

fn default_use_ssl() -> bool {
    true
}

impl S3Config {
    /// Endpoint URL with the scheme chosen by `use_ssl`, whatever scheme the
    /// operator typed.
    pub fn endpoint_url(&self) -> String {
        let scheme = if self.use_ssl { "https" } else { "http" };
        format!("{}://{}", scheme, self.endpoint_host())
    }

    /// Endpoint without scheme or trailing slash.
    fn endpoint_host(&self) -> &str {
        self.endpoint
            .trim()
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
    }

    /// Whether both configs address the same bucket, regardless of
    /// credentials, scheme, or a blank versus explicit default region.
    pub fn same_bucket(&self, other: &S3Config) -> bool {
        self.bucket.trim() == other.bucket.trim()
            && self.region_or_default() == other.region_or_default()
            && self
                .endpoint_host()
                .eq_ignore_ascii_case(other.endpoint_host())
    }

    pub fn region_or_default(&self) -> &str {
        if self.region.trim().is_empty() {
            DEFAULT_REGION
        } else {
            self.region.trim()
        }
    }
}

impl std::fmt::Debug for S3Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Config")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("bucket", &self.bucket)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("path_style", &self.path_style)
            .field("use_ssl", &self.use_ssl)
            .finish()
    }
}

/// Which backend stores application objects, and how to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    Local { root: PathBuf },
    S3(S3Config),
}

impl StorageConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            StorageConfig::Local { .. } => "local",
            StorageConfig::S3(_) => "s3",
        }
    }

    /// Short human-readable description, safe to log.
    pub fn summary(&self) -> String {
        match self {
            StorageConfig::Local { root } => format!("local:{}", root.display()),
            StorageConfig::S3(s3) => format!("s3://{} @ {}", s3.bucket, s3.endpoint_url()),
        }
    }

    /// Names of required fields that are blank.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        match self {
            StorageConfig::Local { root } => {
                if root.as_os_str().is_empty() {
                    missing.push("root");
                }
            }
            StorageConfig::S3(s3) => {
                let required = [
                    ("endpoint", &s3.endpoint),
                    ("bucket", &s3.bucket),
                    ("access_key", &s3.access_key),
                    ("secret_key", &s3.secret_key),
                ];
                for (name, value) in required {
                    if value.trim().is_empty() {
                        missing.push(name);
                    }
                }
            }
        }
        missing
    }

    pub fn validate(&self) -> Result<(), MigrationError> {
        let missing = self.missing_fields();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(MigrationError::IncompleteConfig(format!(
                "missing {}",
                missing.join(", ")
            )))
        }
    }

    /// Copy of this config with secrets blanked, for responses and logs.
    pub fn redacted(&self) -> Self {
        match self {
            StorageConfig::Local { .. } => self.clone(),
            StorageConfig::S3(s3) => {
                let mut s3 = s3.clone();
                if !s3.secret_key.is_empty() {
                    s3.secret_key = "********".to_string();
                }
                StorageConfig::S3(s3)
            }
        }
    }

    /// Read the config from settings store values. `None` when no storage
    /// type has been persisted yet.
    pub fn from_settings(values: &HashMap<String, String>) -> Result<Option<Self>, SettingsError> {
        let get = |key: &str| values.get(key).cloned().unwrap_or_default();

        let kind = match values.get(KEY_STORAGE_TYPE) {
            Some(kind) if !kind.trim().is_empty() => kind.trim().to_lowercase(),
            _ => return Ok(None),
        };

        match kind.as_str() {
            "local" => Ok(Some(StorageConfig::Local {
                root: PathBuf::from(get(KEY_LOCAL_ROOT)),
            })),
            "s3" => Ok(Some(StorageConfig::S3(S3Config {
                endpoint: get(KEY_S3_ENDPOINT),
                region: values
                    .get(KEY_S3_REGION)
                    .filter(|r| !r.trim().is_empty())
                    .cloned()
                    .unwrap_or_else(default_region),
                bucket: get(KEY_S3_BUCKET),
                access_key: get(KEY_S3_ACCESS_KEY),
                secret_key: get(KEY_S3_SECRET_KEY),
                path_style: parse_bool(values, KEY_S3_PATH_STYLE, false)?,
                use_ssl: parse_bool(values, KEY_S3_USE_SSL, true)?,
            }))),
            _ => Err(SettingsError::InvalidValue {
                key: KEY_STORAGE_TYPE.to_string(),
                value: kind,
            }),
        }
    }

    /// Key/value pairs to persist for this config.
    pub fn to_settings(&self) -> Vec<(&'static str, String)> {
        match self {
            StorageConfig::Local { root } => vec![
                (KEY_STORAGE_TYPE, "local".to_string()),
                (KEY_LOCAL_ROOT, root.to_string_lossy().into_owned()),
            ],
            StorageConfig::S3(s3) => vec![
                (KEY_STORAGE_TYPE, "s3".to_string()),
                (KEY_S3_ENDPOINT, s3.endpoint.clone()),
                (KEY_S3_REGION, s3.region.clone()),
                (KEY_S3_BUCKET, s3.bucket.clone()),
                (KEY_S3_ACCESS_KEY, s3.access_key.clone()),
                (KEY_S3_SECRET_KEY, s3.secret_key.clone()),
                (KEY_S3_PATH_STYLE, s3.path_style.to_string()),
                (KEY_S3_USE_SSL, s3.use_ssl.to_string()),
            ],
        }
    }
}

fn parse_bool(
    values: &HashMap<String, String>,
    key: &str,
    default: bool,
) -> Result<bool, SettingsError> {
    match values.get(key).map(|v| v.trim().to_lowercase()) {
        None => Ok(default),
        Some(v) if v.is_empty() => Ok(default),
        Some(v) => match v.as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(SettingsError::InvalidValue {
                key: key.to_string(),
                value: v,
            }),
        },
    }
}
