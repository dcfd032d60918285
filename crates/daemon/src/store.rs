//! Durable job store: one JSON record per job in the job state directory.
//!
//! Every operation runs under an advisory lock on `<dir>/.lock`, so the daemon
//! and short-lived CLI processes sharing the directory see each other's writes.
//! Records are persisted with write-temp, fsync, rename. A failed write latches
//! the store into a halted state and claiming stops.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use fs2::FileExt;
use log::{debug, error, info, warn};
use tokio::sync::{watch, Notify};

use crate::backup;
use crate::error::{ConflictError, StoreError};
use crate::job::{Job, JobKind, JobStatus, StageFlags};

/// Terminal outcome reported by the executor through [`JobStore::finish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed,
}

impl Outcome {
    fn status(self) -> JobStatus {
        match self {
            Outcome::Completed => JobStatus::Completed,
            Outcome::Failed => JobStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job is now cancelled.
    Cancelled,
    /// The job is running; the executor will stop at the next stage boundary.
    Requested,
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued: Vec<String>,
    pub failed: Vec<String>,
    pub cancelled: Vec<String>,
}

impl RecoveryReport {
    pub fn total(&self) -> usize {
        self.requeued.len() + self.failed.len() + self.cancelled.len()
    }
}

const LOCK_FILE: &str = ".lock";

/// Exclusive hold on the store directory, released on drop.
struct StoreLock {
    file: fs::File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

pub struct JobStore {
    dir: PathBuf,
    wakeup: Notify,
    halted: AtomicBool,
}

impl JobStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StoreError::Durability {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            wakeup: Notify::new(),
            halted: AtomicBool::new(false),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Block until no other thread or process holds the store.
    ///
    /// Each call opens its own handle, so threads of one process exclude each
    /// other the same way separate processes do.
    fn guard(&self) -> Result<StoreLock, StoreError> {
        let path = self.dir.join(LOCK_FILE);
        let file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .and_then(|file| FileExt::lock_exclusive(&file).map(|()| file))
            .map_err(|source| StoreError::Lock { path, source })?;
        Ok(StoreLock { file })
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn read_record(&self, path: &Path) -> Result<Job, StoreError> {
        let content = fs::read_to_string(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                let id = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                StoreError::NotFound(id)
            } else {
                StoreError::Read {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        serde_json::from_str(&content).map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }

    fn load(&self, id: &str) -> Result<Job, StoreError> {
        self.read_record(&self.record_path(id))
    }

    /// All readable records. Corrupt records are logged and skipped.
    fn load_all(&self) -> Result<Vec<Job>, StoreError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| StoreError::Read {
            path: self.dir.clone(),
            source,
        })?;

        let mut jobs = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            match self.read_record(&path) {
                Ok(job) => jobs.push(job),
                // Purged by another process since the directory was listed.
                Err(StoreError::NotFound(_)) => {}
                Err(e) => warn!("Skipping unreadable job record: {}", e),
            }
        }
        Ok(jobs)
    }

    fn write_record(&self, job: &Job) -> Result<(), StoreError> {
        let path = self.record_path(&job.id);
        let tmp = self.dir.join(format!("{}.json.tmp", job.id));

        let result = (|| -> std::io::Result<()> {
            let data = serde_json::to_vec_pretty(job)?;
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&data)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)?;
            Ok(())
        })();

        result.map_err(|source| {
            self.halted.store(true, Ordering::SeqCst);
            error!(
                "Job {}: failed to persist state to {}: {}. Halting job claims.",
                job.id,
                path.display(),
                source
            );
            StoreError::Durability { path, source }
        })
    }

    /// Create a pending job for `file_path`.
    pub fn create(&self, file_path: &Path, job_kind: JobKind) -> Result<Job, StoreError> {
        self.insert(Job::new(file_path, job_kind))
    }

    /// Persist a freshly built pending job, enforcing one active job per path.
    pub fn insert(&self, mut job: Job) -> Result<Job, StoreError> {
        let guard = self.guard()?;

        if let Some(active) = self
            .load_all()?
            .into_iter()
            .find(|j| j.is_active() && j.file_path == job.file_path)
        {
            return Err(ConflictError::ActiveJob {
                path: active.file_path,
                job_id: active.id,
                status: active.status,
            }
            .into());
        }

        job.status = JobStatus::Pending;
        job.started_at = None;
        job.completed_at = None;
        self.write_record(&job)?;
        info!("Job {}: queued {} ({})", job.id, job.file_path.display(), job.job_kind);
        drop(guard);

        self.wakeup.notify_one();
        Ok(job)
    }

    /// Atomically move the best pending job to running.
    ///
    /// Higher priority first, then older creation time.
    pub fn claim_next(&self) -> Result<Option<Job>, StoreError> {
        if self.is_halted() {
            return Err(StoreError::Halted);
        }
        let _guard = self.guard()?;

        let next = self
            .load_all()?
            .into_iter()
            .filter(|j| j.status == JobStatus::Pending)
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.cmp(&b.id))
            });

        let Some(mut job) = next else {
            return Ok(None);
        };
        transition(&job, JobStatus::Running, "claim")?;

        let now = Utc::now();
        job.status = JobStatus::Running;
        job.started_at = Some(now);
        job.updated_at = now;
        self.write_record(&job)?;
        debug!("Job {}: claimed", job.id);
        Ok(Some(job))
    }

    /// Suspend until a job can be claimed or shutdown is signalled.
    ///
    /// Woken by local enqueues; `poll` bounds the wait so records written by
    /// other processes sharing the directory are noticed too.
    pub async fn claim_next_wait(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        poll: Duration,
    ) -> Result<Option<Job>, StoreError> {
        loop {
            if *shutdown.borrow() {
                return Ok(None);
            }
            let notified = self.wakeup.notified();
            if let Some(job) = self.claim_next()? {
                return Ok(Some(job));
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(poll) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Checkpoint progress and raise stage flags. Only while running.
    ///
    /// Progress is clamped to [0, 1] and never decreases.
    pub fn update_progress(
        &self,
        id: &str,
        progress: f64,
        delta: StageFlags,
    ) -> Result<Job, StoreError> {
        let _guard = self.guard()?;
        let mut job = self.load(id)?;
        require_running(&job, "update progress")?;

        let progress = if progress.is_finite() { progress.clamp(0.0, 1.0) } else { 0.0 };
        job.progress = job.progress.max(progress);
        job.stage_flags.merge(delta);
        job.updated_at = Utc::now();
        self.write_record(&job)?;
        Ok(job)
    }

    /// Append a per-stage outcome note. Only while running.
    pub fn annotate(&self, id: &str, note: impl Into<String>) -> Result<Job, StoreError> {
        let _guard = self.guard()?;
        let mut job = self.load(id)?;
        require_running(&job, "annotate")?;
        job.result.push(note.into());
        job.updated_at = Utc::now();
        self.write_record(&job)?;
        Ok(job)
    }

    /// Clear stage flags after the file was rolled back to its pre-job state.
    pub fn clear_stage_flags(&self, id: &str) -> Result<Job, StoreError> {
        let _guard = self.guard()?;
        let mut job = self.load(id)?;
        require_running(&job, "clear stage flags")?;
        job.stage_flags = StageFlags::default();
        job.updated_at = Utc::now();
        self.write_record(&job)?;
        Ok(job)
    }

    /// Running to completed or failed. Repeating the same outcome is a no-op.
    pub fn finish(
        &self,
        id: &str,
        outcome: Outcome,
        error: Option<String>,
    ) -> Result<Job, StoreError> {
        let _guard = self.guard()?;
        let mut job = self.load(id)?;
        let target = outcome.status();

        if job.status == target {
            return Ok(job);
        }
        transition(&job, target, "finish")?;

        let now = Utc::now();
        job.status = target;
        job.cancel_requested = false;
        job.completed_at = Some(now);
        job.updated_at = now;
        match outcome {
            Outcome::Completed => {
                job.progress = 1.0;
                job.error = None;
            }
            Outcome::Failed => {
                let message = error
                    .filter(|m| !m.trim().is_empty())
                    .unwrap_or_else(|| "job failed without a message".to_string());
                job.error = Some(message);
            }
        }
        self.write_record(&job)?;
        Ok(job)
    }

    /// Cancel a job: immediately when pending, cooperatively when running.
    pub fn cancel(&self, id: &str) -> Result<CancelOutcome, StoreError> {
        let _guard = self.guard()?;
        let mut job = self.load(id)?;
        if job.status == JobStatus::Cancelled {
            return Ok(CancelOutcome::Cancelled);
        }
        transition(&job, JobStatus::Cancelled, "cancel")?;
        let now = Utc::now();

        match job.status {
            JobStatus::Pending => {
                job.status = JobStatus::Cancelled;
                job.completed_at = Some(now);
                job.updated_at = now;
                self.write_record(&job)?;
                info!("Job {}: cancelled before start", id);
                Ok(CancelOutcome::Cancelled)
            }
            _ => {
                if !job.cancel_requested {
                    job.cancel_requested = true;
                    job.updated_at = now;
                    self.write_record(&job)?;
                    info!("Job {}: cancellation requested", id);
                }
                Ok(CancelOutcome::Requested)
            }
        }
    }

    pub fn is_cancel_requested(&self, id: &str) -> Result<bool, StoreError> {
        let _guard = self.guard()?;
        Ok(self.load(id)?.cancel_requested)
    }

    /// The executor stopped a running job after a cancellation request.
    pub fn acknowledge_cancel(&self, id: &str) -> Result<Job, StoreError> {
        let _guard = self.guard()?;
        let mut job = self.load(id)?;
        if job.status == JobStatus::Cancelled {
            return Ok(job);
        }
        require_running(&job, "acknowledge cancellation")?;
        if !job.cancel_requested {
            return Err(ConflictError::IllegalTransition {
                id: id.to_string(),
                status: job.status,
                action: "acknowledge an unrequested cancellation",
            }
            .into());
        }

        let now = Utc::now();
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(now);
        job.updated_at = now;
        self.write_record(&job)?;
        info!("Job {}: cancelled", id);
        Ok(job)
    }

    pub fn get(&self, id: &str) -> Result<Job, StoreError> {
        let _guard = self.guard()?;
        self.load(id)
    }

    /// Newest first.
    pub fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let _guard = self.guard()?;
        let mut jobs: Vec<Job> = self
            .load_all()?
            .into_iter()
            .filter(|j| filter.status.map_or(true, |s| j.status == s))
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    pub fn stats(&self) -> Result<BTreeMap<JobStatus, usize>, StoreError> {
        let _guard = self.guard()?;
        let mut counts: BTreeMap<JobStatus, usize> =
            JobStatus::ALL.into_iter().map(|s| (s, 0)).collect();
        for job in self.load_all()? {
            *counts.entry(job.status).or_default() += 1;
        }
        Ok(counts)
    }

    /// Remove a terminal record.
    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        let _guard = self.guard()?;
        let job = self.load(id)?;
        if job.is_active() {
            return Err(ConflictError::IllegalTransition {
                id: id.to_string(),
                status: job.status,
                action: "delete",
            }
            .into());
        }
        let path = self.record_path(id);
        fs::remove_file(&path).map_err(|source| StoreError::Durability { path, source })
    }

    /// Delete terminal records whose `completed_at` is older than `horizon`.
    pub fn purge_expired(&self, horizon: chrono::Duration) -> Result<usize, StoreError> {
        let _guard = self.guard()?;
        let cutoff = Utc::now() - horizon;
        let mut purged = 0;
        for job in self.load_all()? {
            let expired = job.status.is_terminal()
                && job.completed_at.unwrap_or(job.updated_at) < cutoff;
            if !expired {
                continue;
            }
            let path = self.record_path(&job.id);
            match fs::remove_file(&path) {
                Ok(()) => purged += 1,
                Err(e) => warn!("Job {}: failed to purge record: {}", job.id, e),
            }
        }
        if purged > 0 {
            info!("Purged {} expired job records", purged);
        }
        Ok(purged)
    }

    /// Repair jobs left running by an unclean shutdown.
    ///
    /// The file is first restored from the job's backup if one exists. An intact
    /// file sends the job back to pending; a missing or empty file fails it. A
    /// job whose cancellation was requested becomes cancelled.
    pub fn recover_on_startup(&self) -> Result<RecoveryReport, StoreError> {
        let guard = self.guard()?;
        let mut report = RecoveryReport::default();

        for mut job in self.load_all()? {
            if job.status != JobStatus::Running {
                continue;
            }

            let restored = match backup::restore_if_present(&job.file_path, &job.id) {
                Ok(restored) => restored,
                Err(e) => {
                    warn!("Job {}: failed to restore backup: {}", job.id, e);
                    false
                }
            };
            if restored {
                info!("Job {}: restored {} from backup", job.id, job.file_path.display());
            }

            let now = Utc::now();
            job.updated_at = now;
            job.stage_flags = StageFlags::default();

            if job.cancel_requested {
                job.status = JobStatus::Cancelled;
                job.completed_at = Some(now);
                self.write_record(&job)?;
                info!("Job {}: cancellation completed during recovery", job.id);
                report.cancelled.push(job.id);
                continue;
            }

            let intact = fs::metadata(&job.file_path)
                .map(|m| m.is_file() && m.len() > 0)
                .unwrap_or(false);

            if intact {
                job.status = JobStatus::Pending;
                job.progress = 0.0;
                job.started_at = None;
                job.result.clear();
                self.write_record(&job)?;
                info!("Job {}: requeued after unclean shutdown", job.id);
                report.requeued.push(job.id);
            } else {
                job.status = JobStatus::Failed;
                job.completed_at = Some(now);
                job.error = Some(format!(
                    "file missing or corrupted after unclean shutdown: {}",
                    job.file_path.display()
                ));
                self.write_record(&job)?;
                warn!("Job {}: file missing after unclean shutdown", job.id);
                report.failed.push(job.id);
            }
        }

        drop(guard);
        if !report.requeued.is_empty() {
            self.wakeup.notify_one();
        }
        Ok(report)
    }
}

fn illegal(job: &Job, action: &'static str) -> StoreError {
    ConflictError::IllegalTransition {
        id: job.id.clone(),
        status: job.status,
        action,
    }
    .into()
}

/// Status changes go through the lifecycle table on [`JobStatus`].
fn transition(job: &Job, next: JobStatus, action: &'static str) -> Result<(), StoreError> {
    if job.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(illegal(job, action))
    }
}

/// In-place updates that are not status changes, allowed only while running.
fn require_running(job: &Job, action: &'static str) -> Result<(), StoreError> {
    if job.status == JobStatus::Running {
        Ok(())
    } else {
        Err(illegal(job, action))
    }
}
