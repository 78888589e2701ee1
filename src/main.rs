use anyhow::{Context, Result};
use blobshift::cli::{self, ClientCommand};
use blobshift::config::AppConfig;
use blobshift::context::AppContext;
use blobshift::core::{SqliteSettings, VerifyMode};
use blobshift::db;
use blobshift::logging::{self, LogConfig};
use blobshift::rpc::RpcServer;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "blobshift")]
#[command(about = "Object storage migration daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Daemon address (defaults to rpc_bind from the configuration)
    #[arg(long, global = true)]
    rpc: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground
    Daemon(ServerArgs),
    #[command(flatten)]
    Client(ClientCommand),
}

/// Daemon flags, layered over file and environment configuration.
#[derive(Args, Serialize)]
struct ServerArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    rpc_bind: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    settings_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    default_local_root: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    log_json: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    /// Verification after each copy: none, size or checksum
    #[serde(skip)]
    #[arg(long, value_parser = parse_verify_mode)]
    verify: Option<VerifyMode>,
}

/// Overrides in the nested shape figment expects.
#[derive(Serialize)]
struct Overrides<'a> {
    #[serde(flatten)]
    server: &'a ServerArgs,
    #[serde(skip_serializing_if = "Option::is_none")]
    migration: Option<MigrationOverrides>,
}

#[derive(Serialize)]
struct MigrationOverrides {
    verify: VerifyMode,
}

fn parse_verify_mode(s: &str) -> Result<VerifyMode, String> {
    serde_json::from_value(serde_json::Value::String(s.to_lowercase()))
        .map_err(|_| format!("expected none, size or checksum, got '{}'", s))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(blobshift::config::DEFAULT_CONFIG_PATH));

    match cli.command {
        Commands::Daemon(args) => {
            let overrides = Overrides {
                server: &args,
                migration: args.verify.map(|verify| MigrationOverrides { verify }),
            };
            let config = AppConfig::load(&config_path, Some(&overrides))?;
            logging::init(LogConfig::from(&config));
            run_daemon(config).await.context("Daemon exited with an error")
        }
        Commands::Client(command) => {
            let config = AppConfig::load(&config_path, None::<&ServerArgs>)?;
            logging::init(LogConfig {
                json: false,
                verbose: config.verbose,
            });
            let addr = match cli.rpc {
                Some(addr) => addr
                    .parse()
                    .with_context(|| format!("Invalid daemon address '{}'", addr))?,
                None => config.rpc_bind,
            };
            cli::run(command, addr).await
        }
    }
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    info!(
        rpc_bind = %config.rpc_bind,
        settings = %config.settings_path.display(),
        verify = ?config.migration.verify,
        "blobshift daemon starting"
    );

    let conn = db::init(&config.settings_path)
        .await
        .context("Failed to open settings database")?;
    let settings = Arc::new(SqliteSettings::new(conn));
    let bind = config.rpc_bind;
    let ctx = AppContext::new(config, settings);

    match ctx.registry.snapshot().await {
        Ok(active) => info!(storage = %active.config.summary(), "Active storage resolved"),
        Err(e) => warn!(error = %e, "Active storage could not be resolved yet"),
    }

    let server = RpcServer::bind(ctx.clone(), bind).await?;

    tokio::select! {
        result = server.start() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            server.shutdown();
        }
    }

    if ctx.migration.status().is_active() {
        warn!("Aborting in-flight migration before exit");
        ctx.migration.abort();
        ctx.migration.join().await;
    }

    info!("blobshift daemon stopped");
    Ok(())
}
