#![allow(dead_code)]

use blobshift::core::{
    ActiveProviderRegistry, InMemoryProvider, MemorySettings, MigrationJob, MigrationProgress,
    ProviderFactory, S3Config, StorageConfig, StorageError, StorageProvider, VerifyMode,
};
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Hands out pre-built in-memory providers by config.
#[derive(Default)]
pub struct MemoryBackends {
    backends: Mutex<Vec<(StorageConfig, Arc<InMemoryProvider>)>>,
    pub builds: AtomicUsize,
}

impl MemoryBackends {
    pub fn add(&self, config: StorageConfig, provider: Arc<InMemoryProvider>) {
        self.backends.lock().unwrap().push((config, provider));
    }
}

impl ProviderFactory for MemoryBackends {
    fn build(&self, config: &StorageConfig) -> Result<Arc<dyn StorageProvider>, StorageError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        self.backends
            .lock()
            .unwrap()
            .iter()
            .find(|(c, _)| c == config)
            .map(|(_, p)| p.clone() as Arc<dyn StorageProvider>)
            .ok_or_else(|| StorageError::Unreachable(format!("no backend for {}", config.summary())))
    }
}

pub fn local(root: &str) -> StorageConfig {
    StorageConfig::Local {
        root: PathBuf::from(root),
    }
}

pub fn s3(bucket: &str) -> StorageConfig {
    StorageConfig::S3(S3Config {
        endpoint: "minio.internal:9000".into(),
        region: "eu-west-1".into(),
        bucket: bucket.into(),
        access_key: "AKIAEXAMPLE".into(),
        secret_key: "secret".into(),
        path_style: true,
        use_ssl: false,
    })
}

/// Source at `local("/srv/blobs")`, destination at `s3("archive")`.
pub struct Fixture {
    pub source: Arc<InMemoryProvider>,
    pub destination: Arc<InMemoryProvider>,
    pub backends: Arc<MemoryBackends>,
    pub registry: Arc<ActiveProviderRegistry>,
    pub job: MigrationJob,
}

impl Fixture {
    pub fn new(verify: VerifyMode) -> Self {
        let source = Arc::new(InMemoryProvider::new("source"));
        let destination = Arc::new(InMemoryProvider::new("destination"));
        let backends = Arc::new(MemoryBackends::default());
        backends.add(local("/srv/blobs"), source.clone());
        backends.add(s3("archive"), destination.clone());

        let registry = Arc::new(ActiveProviderRegistry::new(
            Arc::new(MemorySettings::new()),
            backends.clone(),
            local("/srv/blobs"),
        ));
        let job = MigrationJob::new(registry.clone(), verify, 1000);

        Self {
            source,
            destination,
            backends,
            registry,
            job,
        }
    }
}

pub async fn seed(provider: &InMemoryProvider, count: usize) -> Vec<String> {
    let mut keys = Vec::new();
    for i in 0..count {
        let key = format!("obj/{:03}", i);
        provider
            .put(&key, Bytes::from(format!("payload number {}", i)), "text/plain")
            .await
            .unwrap();
        keys.push(key);
    }
    keys
}

/// Poll progress until `done` holds, panicking after a generous deadline.
pub async fn wait_for(job: &MigrationJob, done: impl Fn(&MigrationProgress) -> bool) -> MigrationProgress {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let progress = job.progress();
        if done(&progress) {
            return progress;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting, last progress: {:?}",
            progress
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
