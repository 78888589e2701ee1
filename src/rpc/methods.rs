//! Method dispatch for the daemon's RPC surface.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::time::Instant;
use tracing::{info, warn};

use crate::context::AppContext;
use crate::core::{
    MigrationError, MigrationLogEntry, MigrationProgress, MigrationStatus, StartOutcome,
    StorageConfig, VerifyMode,
};

use super::protocol::{CONFLICT, REJECTED, Request, Response, STORAGE_ERROR};

/// Progress snapshot plus the derived percentage, as sent to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressView {
    #[serde(flatten)]
    pub progress: MigrationProgress,
    pub percentage: u8,
}

/// A page of migration log entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogPage {
    pub entries: Vec<MigrationLogEntry>,
    /// Cursor to pass as `since` on the next poll
    pub last_sequence: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub version: String,
    pub uptime_secs: u64,
    pub rpc_bind: String,
    /// Active storage, or why it could not be resolved
    pub storage: String,
    pub migration: MigrationStatus,
    pub verify: VerifyMode,
}

pub struct MethodHandler {
    ctx: AppContext,
    start_time: Instant,
}

impl MethodHandler {
    pub fn new(ctx: AppContext) -> Self {
        Self {
            ctx,
            start_time: Instant::now(),
        }
    }

    pub async fn handle(&self, request: Request) -> Response {
        let id = request.id.clone().unwrap_or(Value::Null);
        let params = request.params.unwrap_or(Value::Null);

        match request.method.as_str() {
            "daemon.status" => self.daemon_status(id).await,
            "storage.config.get" => self.storage_config_get(id).await,
            "storage.config.set" => self.storage_config_set(id, params).await,
            "storage.test" => self.storage_test(id, params).await,
            "migration.start" => self.migration_start(id, params).await,
            "migration.abort" => self.migration_abort(id),
            "migration.progress" => self.migration_progress(id),
            "migration.logs" => self.migration_logs(id, params),
            _ => Response::method_not_found(id, &request.method),
        }
    }

    async fn daemon_status(&self, id: Value) -> Response {
        let storage = match self.ctx.registry.snapshot().await {
            Ok(active) => active.config.summary(),
            Err(e) => format!("unavailable ({})", e),
        };

        Response::success(
            id,
            DaemonStatus {
                version: env!("CARGO_PKG_VERSION").to_string(),
                uptime_secs: self.start_time.elapsed().as_secs(),
                rpc_bind: self.ctx.config.rpc_bind.to_string(),
                storage,
                migration: self.ctx.migration.status(),
                verify: self.ctx.migration.verify_mode(),
            },
        )
    }

    /// The persisted storage configuration with secrets masked.
    async fn storage_config_get(&self, id: Value) -> Response {
        match self.ctx.registry.load_config().await {
            Ok(config) => Response::success(id, config.redacted()),
            Err(e) => Response::error(id, STORAGE_ERROR, e.to_string()),
        }
    }

    async fn storage_config_set(&self, id: Value, params: Value) -> Response {
        let config: StorageConfig = match parse(params) {
            Ok(c) => c,
            Err(e) => return Response::invalid_params(id, e),
        };

        // Swapping the source out from under a run would copy from two places
        if self.ctx.migration.status().is_active() {
            return Response::error(
                id,
                REJECTED,
                "storage configuration cannot change while a migration is running",
            );
        }

        match self.ctx.registry.apply_config(&config).await {
            Ok(()) => {
                info!(storage = %config.summary(), "Storage configuration changed via RPC");
                Response::success(id, config.redacted())
            }
            Err(e) => Response::error(id, REJECTED, e.to_string()),
        }
    }

    /// Test the given config, or the active one when no params are sent.
    async fn storage_test(&self, id: Value, params: Value) -> Response {
        let config = if params.is_null() {
            match self.ctx.registry.load_config().await {
                Ok(c) => c,
                Err(e) => return Response::error(id, STORAGE_ERROR, e.to_string()),
            }
        } else {
            match parse::<StorageConfig>(params) {
                Ok(c) => c,
                Err(e) => return Response::invalid_params(id, e),
            }
        };

        Response::success(id, self.ctx.test_connection(&config).await)
    }

    async fn migration_start(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct Params {
            destination: StorageConfig,
        }

        let params: Params = match parse(params) {
            Ok(p) => p,
            Err(e) => return Response::invalid_params(id, e),
        };

        match self.ctx.migration.try_start(params.destination).await {
            Ok(run_id) => Response::success(id, StartOutcome::started(run_id)),
            Err(e) => {
                warn!(error = %e, "Migration start rejected");
                let code = match e {
                    MigrationError::AlreadyRunning => CONFLICT,
                    _ => REJECTED,
                };
                Response::error_with_data(id, code, e.to_string(), StartOutcome::rejected(&e))
            }
        }
    }

    fn migration_abort(&self, id: Value) -> Response {
        self.ctx.migration.abort();
        Response::success(id, self.progress_view())
    }

    fn migration_progress(&self, id: Value) -> Response {
        Response::success(id, self.progress_view())
    }

    fn migration_logs(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize, Default)]
        struct Params {
            #[serde(default)]
            since: Option<u64>,
        }

        let params: Params = if params.is_null() {
            Params::default()
        } else {
            match parse(params) {
                Ok(p) => p,
                Err(e) => return Response::invalid_params(id, e),
            }
        };

        let entries = self.ctx.migration.logs(params.since);
        let last_sequence = entries.last().map(|e| e.sequence).or(params.since);
        Response::success(
            id,
            LogPage {
                entries,
                last_sequence,
            },
        )
    }

    fn progress_view(&self) -> ProgressView {
        let progress = self.ctx.migration.progress();
        let percentage = progress.percentage();
        ProgressView {
            progress,
            percentage,
        }
    }
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T, String> {
    serde_json::from_value(params).map_err(|e| e.to_string())
}
