//! In-memory progress state for the migration job.
//!
//! Progress is updated by the copy loop after every object and read by any
//! number of pollers. It is NOT persisted; a restart starts from `Idle`.
//! No lock here is ever held across an `.await`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::error::MigrationError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStatus {
    #[default]
    Idle,
    Running,
    Aborting,
    Completed,
    Failed,
}

impl MigrationStatus {
    /// A run is in flight and a new one may not start.
    pub fn is_active(self) -> bool {
        matches!(self, MigrationStatus::Running | MigrationStatus::Aborting)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MigrationStatus::Completed | MigrationStatus::Failed)
    }
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MigrationStatus::Idle => "idle",
            MigrationStatus::Running => "running",
            MigrationStatus::Aborting => "aborting",
            MigrationStatus::Completed => "completed",
            MigrationStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Point-in-time copy of the migration state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationProgress {
    pub run_id: Option<Uuid>,
    pub status: MigrationStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Objects discovered so far. Final once the run is terminal.
    pub total_objects: u64,
    pub migrated_objects: u64,
    pub failed_objects: u64,
    pub total_bytes: u64,
    pub migrated_bytes: u64,
    pub current_key: String,
    pub last_error: Option<String>,
    pub source: Option<String>,
    pub destination: Option<String>,
}

impl MigrationProgress {
    /// Fresh `Running` state for a new run.
    pub fn begin(run_id: Uuid, source: String, destination: String) -> Self {
        Self {
            run_id: Some(run_id),
            status: MigrationStatus::Running,
            started_at: Some(Utc::now()),
            source: Some(source),
            destination: Some(destination),
            ..Default::default()
        }
    }

    pub fn processed_objects(&self) -> u64 {
        self.migrated_objects + self.failed_objects
    }

    /// Share of discovered objects already processed.
    pub fn percentage(&self) -> u8 {
        if self.total_objects == 0 {
            return if self.status.is_terminal() { 100 } else { 0 };
        }
        ((self.processed_objects() as f64 / self.total_objects as f64) * 100.0).min(100.0) as u8
    }
}

struct TrackedRun {
    progress: MigrationProgress,
    cancel: CancellationToken,
}

/// Thread-safe holder for the current run's progress and cancellation token.
#[derive(Clone)]
pub struct ProgressTracker {
    inner: Arc<RwLock<TrackedRun>>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(TrackedRun {
                progress: MigrationProgress::default(),
                cancel: CancellationToken::new(),
            })),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, TrackedRun> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, TrackedRun> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> MigrationProgress {
        self.read().progress.clone()
    }

    pub fn status(&self) -> MigrationStatus {
        self.read().progress.status
    }

    /// Apply a mutation to the progress state.
    pub fn update<R>(&self, f: impl FnOnce(&mut MigrationProgress) -> R) -> R {
        f(&mut self.write().progress)
    }

    /// Install a new run if none is active. The status check and the reset
    /// happen under one lock, so two concurrent starts cannot both succeed.
    pub fn begin(
        &self,
        progress: MigrationProgress,
        cancel: CancellationToken,
    ) -> Result<(), MigrationError> {
        self.begin_with(progress, cancel, || {})
    }

    /// Like [`ProgressTracker::begin`], running `on_begin` under the lock
    /// before the new run becomes visible to readers.
    pub fn begin_with(
        &self,
        progress: MigrationProgress,
        cancel: CancellationToken,
        on_begin: impl FnOnce(),
    ) -> Result<(), MigrationError> {
        let mut run = self.write();
        if run.progress.status.is_active() {
            return Err(MigrationError::AlreadyRunning);
        }
        on_begin();
        run.progress = progress;
        run.cancel = cancel;
        Ok(())
    }

    /// Move a running job to `Aborting` and fire its cancellation token.
    /// Returns false when there was nothing to abort.
    pub fn request_abort(&self) -> bool {
        self.request_abort_with(|| {})
    }

    /// Like [`ProgressTracker::request_abort`], running `on_abort` under the
    /// lock only when a running job is actually moved to `Aborting`.
    pub fn request_abort_with(&self, on_abort: impl FnOnce()) -> bool {
        let mut run = self.write();
        if run.progress.status != MigrationStatus::Running {
            return false;
        }
        run.progress.status = MigrationStatus::Aborting;
        on_abort();
        run.cancel.cancel();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running() -> MigrationProgress {
        MigrationProgress::begin(Uuid::now_v7(), "local:/a".into(), "s3://b".into())
    }

    #[test]
    fn begin_rejects_while_active() {
        let tracker = ProgressTracker::new();
        tracker.begin(running(), CancellationToken::new()).unwrap();

        let err = tracker.begin(running(), CancellationToken::new()).unwrap_err();
        assert!(matches!(err, MigrationError::AlreadyRunning));

        tracker.request_abort();
        assert_eq!(tracker.status(), MigrationStatus::Aborting);
        assert!(tracker.begin(running(), CancellationToken::new()).is_err());
    }

    #[test]
    fn begin_allowed_after_terminal() {
        let tracker = ProgressTracker::new();
        tracker.begin(running(), CancellationToken::new()).unwrap();
        tracker.update(|p| {
            p.total_objects = 4;
            p.migrated_objects = 4;
            p.status = MigrationStatus::Completed;
        });

        tracker.begin(running(), CancellationToken::new()).unwrap();
        let fresh = tracker.snapshot();
        assert_eq!(fresh.status, MigrationStatus::Running);
        assert_eq!(fresh.total_objects, 0);
        assert_eq!(fresh.migrated_objects, 0);
    }

    #[test]
    fn abort_cancels_token_once() {
        let tracker = ProgressTracker::new();
        assert!(!tracker.request_abort());

        let token = CancellationToken::new();
        tracker.begin(running(), token.clone()).unwrap();
        assert!(tracker.request_abort());
        assert!(token.is_cancelled());
        assert!(!tracker.request_abort());
    }

    #[test]
    fn hooks_run_only_on_transition() {
        let tracker = ProgressTracker::new();
        let mut aborted = false;
        assert!(!tracker.request_abort_with(|| aborted = true));
        assert!(!aborted);

        let mut began = 0;
        tracker
            .begin_with(running(), CancellationToken::new(), || began += 1)
            .unwrap();
        assert!(
            tracker
                .begin_with(running(), CancellationToken::new(), || began += 1)
                .is_err()
        );
        assert_eq!(began, 1);

        assert!(tracker.request_abort_with(|| aborted = true));
        assert!(aborted);
    }

    #[test]
    fn percentage_tracks_processed() {
        let mut p = running();
        assert_eq!(p.percentage(), 0);
        p.total_objects = 4;
        p.migrated_objects = 2;
        p.failed_objects = 1;
        assert_eq!(p.percentage(), 75);
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&MigrationStatus::Aborting).unwrap();
        assert_eq!(json, "\"aborting\"");
    }
}
