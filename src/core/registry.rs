//! The provider that live traffic uses right now.
//!
//! The registry builds the active provider lazily from the persisted storage
//! configuration and caches it. Changing the configuration goes through
//! [`ActiveProviderRegistry::apply_config`], which persists and then
//! invalidates, so the next `get` rebuilds against the new backend.
//!
//! Callers receive an `Arc` handle. A request that obtained the old provider
//! keeps using it until it finishes; the swap only affects later `get` calls.

use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

use super::error::RegistryError;
use super::models::StorageConfig;
use super::settings::SettingsStore;
use super::storage::{ProviderFactory, StorageProvider};

/// Settings key prefix covering every storage setting.
const STORAGE_PREFIX: &str = "storage.";

/// A provider together with the config it was built from.
#[derive(Clone)]
pub struct ActiveProvider {
    pub provider: Arc<dyn StorageProvider>,
    pub config: StorageConfig,
}

struct Slot {
    /// Bumped by every invalidation
    generation: u64,
    cached: Option<ActiveProvider>,
}

pub struct ActiveProviderRegistry {
    settings: Arc<dyn SettingsStore>,
    factory: Arc<dyn ProviderFactory>,
    /// Used when no storage config has been persisted yet
    fallback: StorageConfig,
    slot: RwLock<Slot>,
}

impl ActiveProviderRegistry {
    pub fn new(
        settings: Arc<dyn SettingsStore>,
        factory: Arc<dyn ProviderFactory>,
        fallback: StorageConfig,
    ) -> Self {
        Self {
            settings,
            factory,
            fallback,
            slot: RwLock::new(Slot {
                generation: 0,
                cached: None,
            }),
        }
    }

    /// The active provider, built on first use.
    pub async fn get(&self) -> Result<Arc<dyn StorageProvider>, RegistryError> {
        Ok(self.snapshot().await?.provider)
    }

    /// The active provider and the config it was built from.
    pub async fn snapshot(&self) -> Result<ActiveProvider, RegistryError> {
        loop {
            let observed = {
                let slot = self.slot.read().unwrap_or_else(PoisonError::into_inner);
                if let Some(active) = &slot.cached {
                    return Ok(active.clone());
                }
                slot.generation
            };

            // Build outside the lock; the config read may involve I/O
            let config = self.load_config().await?;
            let provider = self.factory.build(&config)?;

            let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
            if slot.generation != observed {
                // Invalidated while building: the config we read may be stale
                debug!("Storage configuration changed during provider build, retrying");
                continue;
            }
            if let Some(active) = &slot.cached {
                // Another caller finished building first
                return Ok(active.clone());
            }

            info!(
                provider = %provider.describe(),
                generation = slot.generation,
                "Active storage provider initialized"
            );
            let active = ActiveProvider { provider, config };
            slot.cached = Some(active.clone());
            return Ok(active);
        }
    }

    /// Drop the cached provider. The next `get` rebuilds from settings.
    pub fn invalidate(&self) {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        slot.generation = slot.generation.wrapping_add(1);
        if let Some(old) = slot.cached.take() {
            info!(
                provider = %old.provider.describe(),
                generation = slot.generation,
                "Active storage provider invalidated"
            );
        }
    }

    /// Persist a new active configuration, then invalidate the cache.
    ///
    /// Returns only after both steps, so a caller that sees `Ok` is
    /// guaranteed that every later `get` observes the new backend.
    pub async fn apply_config(&self, config: &StorageConfig) -> Result<(), RegistryError> {
        let missing = config.missing_fields();
        if !missing.is_empty() {
            return Err(RegistryError::InvalidConfig(format!(
                "missing {}",
                missing.join(", ")
            )));
        }

        let entries = config
            .to_settings()
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect();
        self.settings.set_many(entries).await?;
        self.invalidate();

        info!(storage = %config.summary(), "Storage configuration updated");
        Ok(())
    }

    /// The persisted configuration, or the fallback if none is stored.
    pub async fn load_config(&self) -> Result<StorageConfig, RegistryError> {
        let values = self.settings.get_prefixed(STORAGE_PREFIX).await?;
        Ok(StorageConfig::from_settings(&values)?.unwrap_or_else(|| self.fallback.clone()))
    }

    /// Build a provider that is not cached, e.g. a migration destination.
    pub fn build_detached(
        &self,
        config: &StorageConfig,
    ) -> Result<Arc<dyn StorageProvider>, RegistryError> {
        Ok(self.factory.build(config)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::settings::MemorySettings;
    use crate::core::storage::DefaultProviderFactory;
    use tempfile::tempdir;

    fn registry(fallback: &std::path::Path) -> ActiveProviderRegistry {
        ActiveProviderRegistry::new(
            Arc::new(MemorySettings::new()),
            Arc::new(DefaultProviderFactory),
            StorageConfig::Local {
                root: fallback.to_path_buf(),
            },
        )
    }

    #[tokio::test]
    async fn uses_fallback_until_configured() {
        let temp = tempdir().unwrap();
        let registry = registry(temp.path());

        let active = registry.snapshot().await.unwrap();
        assert_eq!(
            active.config,
            StorageConfig::Local {
                root: temp.path().to_path_buf()
            }
        );
    }

    #[tokio::test]
    async fn get_caches_same_instance() {
        let temp = tempdir().unwrap();
        let registry = registry(temp.path());

        let a = registry.get().await.unwrap();
        let b = registry.get().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn apply_config_rebuilds() {
        let temp = tempdir().unwrap();
        let registry = registry(&temp.path().join("old"));
        let before = registry.get().await.unwrap();

        let new_root = temp.path().join("new");
        registry
            .apply_config(&StorageConfig::Local {
                root: new_root.clone(),
            })
            .await
            .unwrap();

        let after = registry.get().await.unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.describe(), format!("local:{}", new_root.display()));
    }

    #[tokio::test]
    async fn apply_config_rejects_incomplete() {
        let temp = tempdir().unwrap();
        let registry = registry(temp.path());

        let err = registry
            .apply_config(&StorageConfig::Local {
                root: std::path::PathBuf::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidConfig(_)));
    }
}
