use serde_json::json;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::{
    ActiveProviderRegistry, ConnectionReport, DefaultProviderFactory, MigrationJob,
    ProviderFactory, SettingsStore, StorageConfig,
};

/// Services shared by every request handler, built once at startup.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub settings: Arc<dyn SettingsStore>,
    pub registry: Arc<ActiveProviderRegistry>,
    pub migration: Arc<MigrationJob>,
    factory: Arc<dyn ProviderFactory>,
}

impl AppContext {
    pub fn new(config: AppConfig, settings: Arc<dyn SettingsStore>) -> Self {
        Self::with_factory(config, settings, Arc::new(DefaultProviderFactory))
    }

    /// Build with a custom provider factory, e.g. in-memory backends in tests.
    pub fn with_factory(
        config: AppConfig,
        settings: Arc<dyn SettingsStore>,
        factory: Arc<dyn ProviderFactory>,
    ) -> Self {
        let fallback = StorageConfig::Local {
            root: config.default_local_root.clone(),
        };
        let registry = Arc::new(ActiveProviderRegistry::new(
            settings.clone(),
            factory.clone(),
            fallback,
        ));
        let migration = Arc::new(MigrationJob::new(
            registry.clone(),
            config.migration.verify,
            config.migration.log_capacity,
        ));

        Self {
            config: Arc::new(config),
            settings,
            registry,
            migration,
            factory,
        }
    }

    /// Check `config` without touching the active provider or any run.
    pub async fn test_connection(&self, config: &StorageConfig) -> ConnectionReport {
        let missing = config.missing_fields();
        if !missing.is_empty() {
            return ConnectionReport::failed(
                format!("Incomplete configuration: missing {}", missing.join(", ")),
                json!({ "missing": missing }),
            );
        }

        match self.factory.build(config) {
            Ok(provider) => provider.test_connection().await,
            Err(e) => ConnectionReport::failed(
                format!("Could not create provider: {}", e),
                json!({ "type": config.kind() }),
            ),
        }
    }
}
