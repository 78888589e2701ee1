//! Client subcommands that talk to a running daemon.

use anyhow::{Context, Result, bail};
use clap::{Args, Subcommand, ValueEnum};
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::core::models::DEFAULT_REGION;
use crate::core::{
    ConnectionReport, MigrationLogEntry, MigrationStatus, S3Config, StartOutcome, StorageConfig,
};
use crate::rpc::{CONFLICT, DaemonStatus, LogPage, ProgressView, RpcClient};

const FOLLOW_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Subcommand, Debug)]
pub enum ClientCommand {
    /// Show daemon, storage and migration status
    Status,
    /// Start migrating every object to a new storage backend
    Migrate(StorageArgs),
    /// Stop the running migration after its current object
    Abort,
    /// Print the migration log
    Logs {
        /// Only entries with a sequence greater than this
        #[arg(long)]
        since: Option<u64>,
        /// Keep polling until the migration finishes
        #[arg(long, short)]
        follow: bool,
    },
    /// Check that a storage backend is reachable
    TestConnection(StorageArgs),
    /// Make a storage backend the active one
    SetStorage(StorageArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageKind {
    Local,
    S3,
}

#[derive(Args, Debug, Clone)]
pub struct StorageArgs {
    #[arg(long = "type", value_enum)]
    pub kind: StorageKind,
    /// Root directory (local)
    #[arg(long)]
    pub root: Option<PathBuf>,
    /// Endpoint host, with optional port (s3)
    #[arg(long)]
    pub endpoint: Option<String>,
    #[arg(long)]
    pub region: Option<String>,
    #[arg(long)]
    pub bucket: Option<String>,
    #[arg(long)]
    pub access_key: Option<String>,
    #[arg(long)]
    pub secret_key: Option<String>,
    /// Address the bucket as a path instead of a subdomain
    #[arg(long)]
    pub path_style: bool,
    /// Use plain HTTP
    #[arg(long)]
    pub no_ssl: bool,
}

impl StorageArgs {
    /// Missing values become blanks; the daemon reports which are required.
    pub fn to_config(&self) -> StorageConfig {
        match self.kind {
            StorageKind::Local => StorageConfig::Local {
                root: self.root.clone().unwrap_or_default(),
            },
            StorageKind::S3 => StorageConfig::S3(S3Config {
                endpoint: self.endpoint.clone().unwrap_or_default(),
                region: self
                    .region
                    .clone()
                    .unwrap_or_else(|| DEFAULT_REGION.to_string()),
                bucket: self.bucket.clone().unwrap_or_default(),
                access_key: self.access_key.clone().unwrap_or_default(),
                secret_key: self.secret_key.clone().unwrap_or_default(),
                path_style: self.path_style,
                use_ssl: !self.no_ssl,
            }),
        }
    }
}

pub async fn run(command: ClientCommand, addr: SocketAddr) -> Result<()> {
    let client = RpcClient::new(addr);

    match command {
        ClientCommand::Status => status(&client).await,
        ClientCommand::Migrate(args) => migrate(&client, &args).await,
        ClientCommand::Abort => abort(&client).await,
        ClientCommand::Logs { since, follow } => logs(&client, since, follow).await,
        ClientCommand::TestConnection(args) => test_connection(&client, &args).await,
        ClientCommand::SetStorage(args) => set_storage(&client, &args).await,
    }
}

async fn status(client: &RpcClient) -> Result<()> {
    let daemon: DaemonStatus = client
        .call_no_params("daemon.status")
        .await
        .context("Failed to query daemon status")?;
    let progress: ProgressView = client.call_no_params("migration.progress").await?;

    println!("blobshift {} (up {}s)", daemon.version, daemon.uptime_secs);
    println!("  storage:   {}", daemon.storage);
    println!("  verify:    {}", format!("{:?}", daemon.verify).to_lowercase());
    print_progress(&progress);
    Ok(())
}

async fn migrate(client: &RpcClient, args: &StorageArgs) -> Result<()> {
    let params = json!({ "destination": args.to_config() });
    match client
        .call::<_, StartOutcome>("migration.start", Some(&params))
        .await
    {
        Ok(outcome) => {
            let run = outcome.run_id.map(|id| id.to_string()).unwrap_or_default();
            println!("Migration started (run {})", run);
            println!("Follow it with: blobshift logs --follow");
            Ok(())
        }
        Err(e) if e.rpc_code() == Some(CONFLICT) => {
            bail!("A migration is already running; abort it or wait for it to finish")
        }
        Err(e) => Err(e).context("Migration was not started"),
    }
}

async fn abort(client: &RpcClient) -> Result<()> {
    let progress: ProgressView = client.call_no_params("migration.abort").await?;
    match progress.progress.status {
        MigrationStatus::Aborting => println!("Abort requested; the current object will finish first"),
        status => println!("Nothing to abort (migration is {})", status),
    }
    Ok(())
}

async fn logs(client: &RpcClient, since: Option<u64>, follow: bool) -> Result<()> {
    let mut cursor = since;

    loop {
        let page: LogPage = client
            .call("migration.logs", Some(&json!({ "since": cursor })))
            .await?;
        for entry in &page.entries {
            print_entry(entry);
        }
        cursor = page.last_sequence.or(cursor);

        if !follow {
            return Ok(());
        }

        let progress: ProgressView = client.call_no_params("migration.progress").await?;
        if !progress.progress.status.is_active() && page.entries.is_empty() {
            return Ok(());
        }

        tokio::select! {
            _ = tokio::time::sleep(FOLLOW_INTERVAL) => {}
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

async fn test_connection(client: &RpcClient, args: &StorageArgs) -> Result<()> {
    let report: ConnectionReport = client
        .call("storage.test", Some(&args.to_config()))
        .await?;

    let marker = if report.success { "OK" } else { "FAILED" };
    println!("{}: {}", marker, report.message);
    if !report.details.is_null() {
        println!("{}", serde_json::to_string_pretty(&report.details)?);
    }
    if !report.success {
        bail!("Connection test failed");
    }
    Ok(())
}

async fn set_storage(client: &RpcClient, args: &StorageArgs) -> Result<()> {
    let applied: StorageConfig = client
        .call("storage.config.set", Some(&args.to_config()))
        .await
        .context("Storage configuration was not changed")?;
    println!("Active storage is now {}", applied.summary());
    Ok(())
}

fn print_progress(view: &ProgressView) {
    let p = &view.progress;
    println!("  migration: {}", p.status);
    if p.run_id.is_none() {
        return;
    }
    if let (Some(source), Some(destination)) = (&p.source, &p.destination) {
        println!("    {} -> {}", source, destination);
    }
    println!(
        "    {}% of {} objects ({} migrated, {} failed, {} bytes)",
        view.percentage, p.total_objects, p.migrated_objects, p.failed_objects, p.migrated_bytes
    );
    if !p.current_key.is_empty() {
        println!("    current: {}", p.current_key);
    }
    if let Some(error) = &p.last_error {
        println!("    last error: {}", error);
    }
}

fn print_entry(entry: &MigrationLogEntry) {
    let level = serde_json::to_value(entry.level)
        .ok()
        .and_then(|v| v.as_str().map(str::to_uppercase))
        .unwrap_or_default();
    println!(
        "{:>6} {} {:<7} {}",
        entry.sequence,
        entry.timestamp.format("%H:%M:%S"),
        level,
        entry.message
    );
}
