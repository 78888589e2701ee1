//! Key/value settings store.
//!
//! The application persists its configuration as plain string pairs. Only
//! the storage keys (`storage.*`) are read by this crate.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tokio_rusqlite::Connection;

use super::error::SettingsError;
use crate::db;

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, SettingsError>;

    /// All settings whose key starts with `prefix`.
    async fn get_prefixed(&self, prefix: &str) -> Result<HashMap<String, String>, SettingsError>;

    /// Write several settings at once. Either all are stored or none.
    async fn set_many(&self, entries: Vec<(String, String)>) -> Result<(), SettingsError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), SettingsError> {
        self.set_many(vec![(key.to_string(), value.to_string())])
            .await
    }
}

/// Settings persisted in the SQLite `settings` table.
#[derive(Clone)]
pub struct SqliteSettings {
    conn: Connection,
}

impl SqliteSettings {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl SettingsStore for SqliteSettings {
    async fn get(&self, key: &str) -> Result<Option<String>, SettingsError> {
        db::settings::get(&self.conn, key.to_string()).await
    }

    async fn get_prefixed(&self, prefix: &str) -> Result<HashMap<String, String>, SettingsError> {
        db::settings::get_prefixed(&self.conn, prefix.to_string()).await
    }

    async fn set_many(&self, entries: Vec<(String, String)>) -> Result<(), SettingsError> {
        db::settings::set_many(&self.conn, entries).await
    }
}

/// Settings held in process memory.
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: RwLock<HashMap<String, String>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsStore for MemorySettings {
    async fn get(&self, key: &str) -> Result<Option<String>, SettingsError> {
        Ok(self
            .values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    async fn get_prefixed(&self, prefix: &str) -> Result<HashMap<String, String>, SettingsError> {
        Ok(self
            .values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn set_many(&self, entries: Vec<(String, String)>) -> Result<(), SettingsError> {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        values.extend(entries);
        Ok(())
    }
}
