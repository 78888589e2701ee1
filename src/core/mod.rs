pub mod error;
pub mod migration;
pub mod migration_log;
pub mod models;
pub mod progress;
pub mod registry;
pub mod settings;
pub mod storage;
pub mod verifier;

pub use error::{MigrationError, RegistryError, SettingsError, StorageError};
pub use migration::{MigrationJob, StartOutcome};
pub use migration_log::{LogLevel, MigrationLog, MigrationLogEntry};
pub use models::{ConnectionReport, ObjectInfo, ObjectStat, S3Config, StorageConfig};
pub use progress::{MigrationProgress, MigrationStatus, ProgressTracker};
pub use registry::{ActiveProvider, ActiveProviderRegistry};
pub use settings::{MemorySettings, SettingsStore, SqliteSettings};
pub use storage::{
    DefaultProviderFactory, InMemoryProvider, LocalProvider, ProviderFactory, S3Provider,
    StorageProvider, create_provider,
};
pub use verifier::{VerifyMode, verify_object};
