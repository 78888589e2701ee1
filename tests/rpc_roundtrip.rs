mod common;

use blobshift::config::AppConfig;
use blobshift::context::AppContext;
use blobshift::core::{
    InMemoryProvider, MemorySettings, MigrationStatus, StartOutcome, StorageConfig,
};
use blobshift::rpc::{CONFLICT, DaemonStatus, LogPage, ProgressView, RpcClient, RpcServer};
use common::{MemoryBackends, local, s3, seed};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

struct Daemon {
    client: RpcClient,
    server: Arc<RpcServer>,
    source: Arc<InMemoryProvider>,
    destination: Arc<InMemoryProvider>,
}

async fn spawn_daemon() -> Daemon {
    let source = Arc::new(InMemoryProvider::new("source"));
    let destination = Arc::new(InMemoryProvider::new("destination"));
    let backends = Arc::new(MemoryBackends::default());
    backends.add(local("/srv/blobs"), source.clone());
    backends.add(s3("archive"), destination.clone());

    let config = AppConfig {
        rpc_bind: "127.0.0.1:0".parse().unwrap(),
        default_local_root: "/srv/blobs".into(),
        ..Default::default()
    };
    let ctx = AppContext::with_factory(config, Arc::new(MemorySettings::new()), backends);

    let server = Arc::new(
        RpcServer::bind(ctx, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap(),
    );
    let client = RpcClient::new(server.local_addr().unwrap());
    let running = server.clone();
    tokio::spawn(async move { running.start().await });

    Daemon {
        client,
        server,
        source,
        destination,
    }
}

#[tokio::test]
async fn test_status_reports_fallback_storage() {
    let daemon = spawn_daemon().await;

    let status: DaemonStatus = daemon.client.call_no_params("daemon.status").await.unwrap();
    assert_eq!(status.storage, "local:/srv/blobs");
    assert_eq!(status.migration, MigrationStatus::Idle);

    daemon.server.shutdown();
}

#[tokio::test]
async fn test_migration_over_rpc() {
    let daemon = spawn_daemon().await;
    seed(&daemon.source, 10).await;

    let params = json!({ "destination": s3("archive") });
    let outcome: StartOutcome = daemon
        .client
        .call("migration.start", Some(&params))
        .await
        .unwrap();
    assert!(outcome.started);

    let finished = timeout(Duration::from_secs(10), async {
        loop {
            let view: ProgressView = daemon
                .client
                .call_no_params("migration.progress")
                .await
                .unwrap();
            if view.progress.status.is_terminal() {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("migration did not finish");

    assert_eq!(finished.progress.status, MigrationStatus::Completed);
    assert_eq!(finished.progress.migrated_objects, 10);
    assert_eq!(finished.percentage, 100);
    assert_eq!(daemon.destination.len(), 10);

    let page: LogPage = daemon
        .client
        .call("migration.logs", Some(&json!({ "since": null })))
        .await
        .unwrap();
    let last = page.last_sequence.unwrap();
    assert_eq!(page.entries.last().unwrap().sequence, last);

    let empty: LogPage = daemon
        .client
        .call("migration.logs", Some(&json!({ "since": last })))
        .await
        .unwrap();
    assert!(empty.entries.is_empty());

    daemon.server.shutdown();
}

#[tokio::test]
async fn test_second_start_is_a_conflict() {
    let daemon = spawn_daemon().await;
    seed(&daemon.source, 100).await;
    daemon.source.set_delay(Some(Duration::from_millis(5)));

    let params = json!({ "destination": s3("archive") });
    let first: StartOutcome = daemon
        .client
        .call("migration.start", Some(&params))
        .await
        .unwrap();
    assert!(first.started);

    let err = daemon
        .client
        .call::<_, StartOutcome>("migration.start", Some(&params))
        .await
        .unwrap_err();
    assert_eq!(err.rpc_code(), Some(CONFLICT));

    // Storage cannot be swapped out from under the run either
    let err = daemon
        .client
        .call::<_, StorageConfig>("storage.config.set", Some(&s3("archive")))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("migration is running"));

    let view: ProgressView = daemon.client.call_no_params("migration.abort").await.unwrap();
    assert!(matches!(
        view.progress.status,
        MigrationStatus::Aborting | MigrationStatus::Failed
    ));

    daemon.server.shutdown();
}

#[tokio::test]
async fn test_connection_check_over_rpc() {
    let daemon = spawn_daemon().await;

    let report: serde_json::Value = daemon
        .client
        .call("storage.test", Some(&s3("archive")))
        .await
        .unwrap();
    assert_eq!(report["success"], true);

    daemon.destination.set_unreachable(true);
    let report: serde_json::Value = daemon
        .client
        .call("storage.test", Some(&s3("archive")))
        .await
        .unwrap();
    assert_eq!(report["success"], false);

    daemon.server.shutdown();
}
