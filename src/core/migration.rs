//! The migration job: one full copy pass from the active provider to a new
//! destination, running in the background.
//!
//! At most one run is in flight per [`MigrationJob`]. The job owns the
//! progress state and the run log; callers poll both while the copy loop
//! works through the source listing object by object.

use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use super::error::{MigrationError, StorageError};
use super::migration_log::{MigrationLog, MigrationLogEntry};
use super::models::StorageConfig;
use super::progress::{MigrationProgress, MigrationStatus, ProgressTracker};
use super::registry::ActiveProviderRegistry;
use super::storage::{StorageProvider, guess_content_type};
use super::verifier::{ObjectDigest, VerifyError, VerifyMode, verify_object};
use crate::logging::LogThrottle;

/// Minimum gap between per-object debug progress lines
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(2);

/// Result of a start request, shaped for callers that only poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartOutcome {
    pub started: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
}

impl StartOutcome {
    pub fn started(run_id: Uuid) -> Self {
        Self {
            started: true,
            error: None,
            run_id: Some(run_id),
        }
    }

    pub fn rejected(err: &MigrationError) -> Self {
        Self {
            started: false,
            error: Some(err.to_string()),
            run_id: None,
        }
    }
}

pub struct MigrationJob {
    registry: Arc<ActiveProviderRegistry>,
    verify: VerifyMode,
    tracker: ProgressTracker,
    log: Arc<MigrationLog>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MigrationJob {
    pub fn new(registry: Arc<ActiveProviderRegistry>, verify: VerifyMode, log_capacity: usize) -> Self {
        Self {
            registry,
            verify,
            tracker: ProgressTracker::new(),
            log: Arc::new(MigrationLog::new(log_capacity)),
            task: Mutex::new(None),
        }
    }

    pub fn verify_mode(&self) -> VerifyMode {
        self.verify
    }

    /// Start a run towards `destination`, reporting rejection in the outcome.
    pub async fn start(&self, destination: StorageConfig) -> StartOutcome {
        match self.try_start(destination).await {
            Ok(run_id) => StartOutcome::started(run_id),
            Err(e) => {
                warn!(error = %e, "Migration start rejected");
                StartOutcome::rejected(&e)
            }
        }
    }

    /// Start a run towards `destination` and return its id.
    ///
    /// Returns as soon as the copy loop is spawned. A rejected start leaves
    /// the state of any running job untouched.
    pub async fn try_start(&self, destination: StorageConfig) -> Result<Uuid, MigrationError> {
        destination.validate()?;

        // Cheap early exit; `ProgressTracker::begin` re-checks atomically
        if self.tracker.status().is_active() {
            return Err(MigrationError::AlreadyRunning);
        }

        let source = self
            .registry
            .snapshot()
            .await
            .map_err(|e| MigrationError::SourceUnreachable(e.to_string()))?;
        if same_location(&source.config, &destination).await {
            return Err(MigrationError::DestinationIsSource);
        }

        let target = self
            .registry
            .build_detached(&destination)
            .map_err(|e| MigrationError::DestinationUnreachable(e.to_string()))?;

        let run_id = Uuid::now_v7();
        let cancel = CancellationToken::new();
        let message = format!(
            "Migration started: {} -> {}",
            source.provider.describe(),
            target.describe()
        );
        let detail = json!({
            "run_id": run_id,
            "source": source.config.redacted(),
            "destination": destination.redacted(),
            "verify": self.verify,
        });

        // The log is reset before the run is visible, so an abort can never
        // land between the two and lose its entry.
        self.tracker.begin_with(
            MigrationProgress::begin(run_id, source.provider.describe(), destination.summary()),
            cancel.clone(),
            || {
                self.log.clear();
                self.log.info(message, Some(detail));
            },
        )?;

        let run = CopyRun {
            run_id,
            source: source.provider,
            destination: target,
            verify: self.verify,
            tracker: self.tracker.clone(),
            log: self.log.clone(),
            cancel,
        };

        let handle = tokio::spawn(supervise(run));
        let previous = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        // The previous run is terminal, so its task has finished or is about to
        drop(previous);

        Ok(run_id)
    }

    /// Ask the running job to stop after the object it is copying.
    pub fn abort(&self) {
        // Logged under the tracker lock, before the token fires, so it always
        // precedes the run summary
        let requested = self.tracker.request_abort_with(|| {
            self.log
                .warning("Abort requested, stopping after the current object", None);
        });
        if !requested {
            debug!("Abort requested with no running migration");
        }
    }

    pub fn progress(&self) -> MigrationProgress {
        self.tracker.snapshot()
    }

    pub fn status(&self) -> MigrationStatus {
        self.tracker.status()
    }

    /// Log entries newer than `since`, oldest first.
    pub fn logs(&self, since: Option<u64>) -> Vec<MigrationLogEntry> {
        self.log.entries_since(since)
    }

    /// Wait for the current run's task to finish, if there is one.
    pub async fn join(&self) {
        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Migration supervisor task failed");
            }
        }
    }
}

/// Runs the copy loop and turns a panic into a failed run.
async fn supervise(run: CopyRun) {
    let tracker = run.tracker.clone();
    let log = run.log.clone();
    let span = info_span!("migration", run_id = %run.run_id);

    if let Err(e) = tokio::spawn(run.execute().instrument(span)).await {
        let message = format!("migration task terminated unexpectedly: {}", e);
        log.error(message.clone(), None);
        tracker.update(|p| {
            p.status = MigrationStatus::Failed;
            p.last_error = Some(message);
            p.finished_at = Some(Utc::now());
            p.current_key.clear();
        });
    }
}

#[derive(Debug, Error)]
enum ObjectCopyError {
    #[error("read from source failed: {0}")]
    Read(#[source] StorageError),

    #[error("write to destination failed: {0}")]
    Write(#[source] StorageError),

    #[error(transparent)]
    Verify(#[from] VerifyError),
}

/// Everything one run needs, moved into its task.
struct CopyRun {
    run_id: Uuid,
    source: Arc<dyn StorageProvider>,
    destination: Arc<dyn StorageProvider>,
    verify: VerifyMode,
    tracker: ProgressTracker,
    log: Arc<MigrationLog>,
    cancel: CancellationToken,
}

impl CopyRun {
    async fn execute(self) {
        let started = Instant::now();
        let outcome = self.copy_all().await;
        self.finish(outcome, started.elapsed());
    }

    async fn copy_all(&self) -> Result<(), MigrationError> {
        // A missing local root lists as empty, so check it before trusting the listing
        let report = self.source.test_connection().await;
        if !report.success {
            return Err(MigrationError::SourceUnreachable(report.message));
        }

        let report = self.destination.test_connection().await;
        if !report.success {
            return Err(MigrationError::DestinationUnreachable(report.message));
        }

        let throttle = LogThrottle::new(PROGRESS_LOG_INTERVAL);
        let mut objects = self.source.list("");
        let mut listed_any = false;

        loop {
            if self.cancel.is_cancelled() {
                return Err(MigrationError::Aborted);
            }

            let object = match objects.next().await {
                None => break,
                Some(Ok(object)) => object,
                Some(Err(e)) if !listed_any => {
                    return Err(MigrationError::SourceUnreachable(e.to_string()));
                }
                Some(Err(e)) => return Err(MigrationError::Enumeration(e.to_string())),
            };
            listed_any = true;

            self.tracker.update(|p| {
                p.total_objects += 1;
                p.total_bytes += object.size;
                p.current_key = object.key.clone();
            });

            match self.copy_object(&object.key).await {
                Ok(bytes) => self.tracker.update(|p| {
                    p.migrated_objects += 1;
                    p.migrated_bytes += bytes;
                }),
                Err(e) => self.record_failure(&object.key, &e),
            }

            if throttle.should_log() {
                let p = self.tracker.snapshot();
                debug!(
                    processed = p.processed_objects(),
                    discovered = p.total_objects,
                    migrated_bytes = p.migrated_bytes,
                    key = %object.key,
                    "Migration progress"
                );
            }
        }

        Ok(())
    }

    /// Copy one object and verify it. Returns the bytes written.
    async fn copy_object(&self, key: &str) -> Result<u64, ObjectCopyError> {
        let data: Bytes = self.source.get(key).await.map_err(ObjectCopyError::Read)?;
        let digest = ObjectDigest::compute(&data, self.verify).await;

        self.destination
            .put(key, data, guess_content_type(key))
            .await
            .map_err(ObjectCopyError::Write)?;
        verify_object(self.destination.as_ref(), key, &digest, self.verify).await?;

        Ok(digest.size)
    }

    fn record_failure(&self, key: &str, cause: &ObjectCopyError) {
        let err = MigrationError::PerObjectCopy {
            key: key.to_string(),
            cause: cause.to_string(),
        };
        let message = err.to_string();
        self.tracker.update(|p| {
            p.failed_objects += 1;
            p.last_error = Some(message.clone());
        });
        self.log.error(
            message,
            Some(json!({
                "run_id": self.run_id,
                "key": key,
                "cause": cause.to_string(),
            })),
        );
    }

    fn finish(&self, outcome: Result<(), MigrationError>, elapsed: Duration) {
        // Outcome, summary entry and terminal status are settled under one
        // tracker lock: an abort either lands before all three or is a no-op.
        let (migrated, failed, aborted) = self.tracker.update(|p| {
            let outcome = match outcome {
                Ok(()) if p.status == MigrationStatus::Aborting || self.cancel.is_cancelled() => {
                    Err(MigrationError::Aborted)
                }
                other => other,
            };
            let aborted = matches!(outcome, Err(MigrationError::Aborted));
            self.append_summary(p, &outcome, elapsed);

            p.finished_at = Some(Utc::now());
            p.current_key.clear();
            match outcome {
                Ok(()) => p.status = MigrationStatus::Completed,
                Err(e) => {
                    p.status = MigrationStatus::Failed;
                    p.last_error = Some(e.to_string());
                }
            }
            (p.migrated_objects, p.failed_objects, aborted)
        });

        info!(
            migrated,
            failed,
            aborted,
            elapsed_ms = elapsed.as_millis() as u64,
            "Migration run finished"
        );
    }

    fn append_summary(
        &self,
        p: &MigrationProgress,
        outcome: &Result<(), MigrationError>,
        elapsed: Duration,
    ) {
        let seconds = elapsed.as_secs_f64();
        let bytes_per_sec = if seconds > 0.0 {
            (p.migrated_bytes as f64 / seconds) as u64
        } else {
            p.migrated_bytes
        };
        let detail = json!({
            "run_id": self.run_id,
            "total_objects": p.total_objects,
            "migrated_objects": p.migrated_objects,
            "failed_objects": p.failed_objects,
            "total_bytes": p.total_bytes,
            "migrated_bytes": p.migrated_bytes,
            "duration_ms": elapsed.as_millis() as u64,
            "bytes_per_sec": bytes_per_sec,
            "aborted": matches!(outcome, Err(MigrationError::Aborted)),
        });

        match outcome {
            Ok(()) if p.failed_objects == 0 => {
                self.log.info(
                    format!(
                        "Migration completed: {} of {} objects copied",
                        p.migrated_objects, p.total_objects
                    ),
                    Some(detail),
                );
            }
            Ok(()) => {
                self.log.warning(
                    format!(
                        "Migration completed with {} failed objects: {} of {} copied",
                        p.failed_objects, p.migrated_objects, p.total_objects
                    ),
                    Some(detail),
                );
            }
            Err(MigrationError::Aborted) => {
                self.log.warning(
                    format!(
                        "Migration aborted after {} of {} objects",
                        p.processed_objects(),
                        p.total_objects
                    ),
                    Some(detail),
                );
            }
            Err(e) => {
                self.log
                    .error(format!("Migration failed: {}", e), Some(detail));
            }
        }
    }
}

/// True when a copy between the two locations would read back its own
/// writes: the same bucket, or local roots where one contains the other.
pub async fn same_location(a: &StorageConfig, b: &StorageConfig) -> bool {
    match (a, b) {
        (StorageConfig::Local { root: a }, StorageConfig::Local { root: b }) => {
            let a = normalized_root(a).await;
            let b = normalized_root(b).await;
            a.starts_with(&b) || b.starts_with(&a)
        }
        (StorageConfig::S3(a), StorageConfig::S3(b)) => a.same_bucket(b),
        _ => false,
    }
}

/// Canonical form of `root`. The deepest existing ancestor is resolved
/// through symlinks; the components below it are kept as written.
async fn normalized_root(root: &Path) -> PathBuf {
    let lexical = lexically_normalized(root);
    let mut existing = lexical.as_path();
    let mut below = Vec::new();

    loop {
        if let Ok(canonical) = tokio::fs::canonicalize(existing).await {
            return below
                .iter()
                .rev()
                .fold(canonical, |path: PathBuf, part| path.join(part));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                below.push(name.to_os_string());
                existing = parent;
            }
            _ => return lexical,
        }
    }
}

fn lexically_normalized(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}
