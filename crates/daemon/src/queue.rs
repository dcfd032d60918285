use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};

use crate::config::RemuxConfig;
use crate::error::{ConflictError, QueueError, StoreError};
use crate::job::{Job, JobKind, JobSource, JobStatus};
use crate::manager::{ExternalId, MediaManager};
use crate::store::{CancelOutcome, JobFilter, JobStore};

#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    Queued(Job),
    /// The file already has a pending or running job.
    AlreadyInProgress { job_id: String, status: JobStatus },
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> &str {
        match self {
            EnqueueOutcome::Queued(job) => &job.id,
            EnqueueOutcome::AlreadyInProgress { job_id, .. } => job_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchResult {
    Queued { job_id: String, path: PathBuf },
    AlreadyInProgress { job_id: String, path: PathBuf },
    LookupFailed(String),
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchItem {
    pub id: ExternalId,
    pub result: BatchResult,
}

/// Entry point for external callers: the CLI, webhooks, batch requests.
pub struct QueueManager {
    store: Arc<JobStore>,
    manager: Arc<dyn MediaManager>,
    config: Arc<RemuxConfig>,
}

impl QueueManager {
    pub fn new(
        store: Arc<JobStore>,
        manager: Arc<dyn MediaManager>,
        config: Arc<RemuxConfig>,
    ) -> Self {
        Self {
            store,
            manager,
            config,
        }
    }

    /// Queue a file by the path the caller knows it by.
    pub fn enqueue(&self, path: &str, kind: JobKind) -> Result<EnqueueOutcome, QueueError> {
        self.enqueue_with(path, kind, JobSource::Api, 0)
    }

    pub fn enqueue_with(
        &self,
        path: &str,
        kind: JobKind,
        source: JobSource,
        priority: i32,
    ) -> Result<EnqueueOutcome, QueueError> {
        let host_path = self.config.translate_path(path);
        self.submit(&host_path, kind, source, priority)
    }

    /// Queue a path that is already a host path.
    fn submit(
        &self,
        path: &Path,
        kind: JobKind,
        source: JobSource,
        priority: i32,
    ) -> Result<EnqueueOutcome, QueueError> {
        if !path.is_file() {
            return Err(QueueError::FileNotFound(path.to_path_buf()));
        }

        let job = Job::new(path, kind)
            .with_source(source)
            .with_priority(priority);
        match self.store.insert(job) {
            Ok(job) => Ok(EnqueueOutcome::Queued(job)),
            Err(StoreError::Conflict(ConflictError::ActiveJob { job_id, status, .. })) => {
                info!(
                    "{} already has active job {} ({})",
                    path.display(),
                    job_id,
                    status
                );
                Ok(EnqueueOutcome::AlreadyInProgress { job_id, status })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve manager identifiers to files and queue each one.
    ///
    /// Every identifier gets its own result; one failure never aborts the rest.
    /// A store durability failure is the exception and ends the batch.
    pub async fn enqueue_batch(
        &self,
        ids: &[ExternalId],
        kind: JobKind,
    ) -> Result<Vec<BatchItem>, QueueError> {
        let mut items = Vec::with_capacity(ids.len());

        for id in ids {
            let result = match self.manager.lookup_metadata(id).await {
                Err(e) => {
                    warn!("Batch: lookup for {} failed: {}", id, e);
                    BatchResult::LookupFailed(e.to_string())
                }
                Ok(meta) => match self.submit(&meta.path, kind, JobSource::Batch, 0) {
                    Ok(EnqueueOutcome::Queued(job)) => BatchResult::Queued {
                        job_id: job.id,
                        path: meta.path,
                    },
                    Ok(EnqueueOutcome::AlreadyInProgress { job_id, .. }) => {
                        BatchResult::AlreadyInProgress {
                            job_id,
                            path: meta.path,
                        }
                    }
                    Err(QueueError::Store(e)) if e.is_fatal() => return Err(e.into()),
                    Err(e) => {
                        warn!("Batch: {} rejected: {}", id, e);
                        BatchResult::Rejected(e.to_string())
                    }
                },
            };
            items.push(BatchItem { id: *id, result });
        }

        let queued = items
            .iter()
            .filter(|i| matches!(i.result, BatchResult::Queued { .. }))
            .count();
        info!("Batch: {} of {} item(s) queued", queued, items.len());
        Ok(items)
    }

    pub fn status(&self, job_id: &str) -> Result<Job, QueueError> {
        Ok(self.store.get(job_id)?)
    }

    pub fn cancel(&self, job_id: &str) -> Result<CancelOutcome, QueueError> {
        Ok(self.store.cancel(job_id)?)
    }

    pub fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, QueueError> {
        Ok(self.store.list(filter)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathMapping;
    use crate::error::LookupError;
    use crate::executor::testing::FakeManager;
    use crate::manager::{ManagerMetadata, MediaType, NullManager};
    use std::fs;
    use tempfile::TempDir;

    fn meta(path: &Path) -> ManagerMetadata {
        ManagerMetadata {
            media_type: MediaType::Series,
            title: "Show".to_string(),
            path: path.to_path_buf(),
            genres: Vec::new(),
            original_language: None,
            content_type: None,
        }
    }

    fn setup(manager: Arc<dyn MediaManager>, config: RemuxConfig) -> (TempDir, Arc<JobStore>, QueueManager) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(JobStore::open(dir.path().join("jobs")).unwrap());
        let queue = QueueManager::new(store.clone(), manager, Arc::new(config));
        (dir, store, queue)
    }

    #[test]
    fn test_duplicate_enqueue_reports_in_progress() {
        let (dir, store, queue) = setup(Arc::new(NullManager), RemuxConfig::default_config());
        let file = dir.path().join("a.mkv");
        fs::write(&file, b"x").unwrap();
        let path = file.to_str().unwrap();

        let first = queue.enqueue(path, JobKind::Full).unwrap();
        let EnqueueOutcome::Queued(job) = &first else {
            panic!("expected a new job");
        };
        let second = queue.enqueue(path, JobKind::Audio).unwrap();
        assert_eq!(
            second,
            EnqueueOutcome::AlreadyInProgress {
                job_id: job.id.clone(),
                status: JobStatus::Pending
            }
        );
        assert_eq!(store.list(&JobFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_enqueue_missing_file_rejected() {
        let (dir, _store, queue) = setup(Arc::new(NullManager), RemuxConfig::default_config());
        let missing = dir.path().join("missing.mkv");
        let err = queue
            .enqueue(missing.to_str().unwrap(), JobKind::Full)
            .unwrap_err();
        assert!(matches!(err, QueueError::FileNotFound(p) if p == missing));
    }

    #[test]
    fn test_enqueue_translates_container_paths() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("media/tv")).unwrap();
        let file = dir.path().join("media/tv/e1.mkv");
        fs::write(&file, b"x").unwrap();

        let mut config = RemuxConfig::default_config();
        config.path_mappings = vec![PathMapping {
            container: "/tv".to_string(),
            host: dir.path().join("media/tv").to_string_lossy().into_owned(),
        }];
        let store = Arc::new(JobStore::open(dir.path().join("jobs")).unwrap());
        let queue = QueueManager::new(store, Arc::new(NullManager), Arc::new(config));

        let outcome = queue
            .enqueue_with("/tv/e1.mkv", JobKind::Cleanup, JobSource::Webhook, 5)
            .unwrap();
        let EnqueueOutcome::Queued(job) = outcome else {
            panic!("expected a new job");
        };
        assert_eq!(job.file_path, file);
        assert_eq!(job.source, JobSource::Webhook);
        assert_eq!(job.priority, 5);
    }

    #[tokio::test]
    async fn test_batch_partial_failure_does_not_abort() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("e1.mkv");
        fs::write(&file, b"x").unwrap();
        let manager = FakeManager::default()
            .with(ExternalId::EpisodeFile(1), meta(&file))
            .with(ExternalId::EpisodeFile(3), meta(&dir.path().join("gone.mkv")));
        let (_d, store, queue) = setup(Arc::new(manager), RemuxConfig::default_config());

        let ids = [
            ExternalId::EpisodeFile(1),
            ExternalId::EpisodeFile(2),
            ExternalId::EpisodeFile(3),
            ExternalId::EpisodeFile(1),
        ];
        let items = queue.enqueue_batch(&ids, JobKind::Full).await.unwrap();
        assert_eq!(items.len(), 4);

        let BatchResult::Queued { job_id, path } = &items[0].result else {
            panic!("expected first id to be queued: {:?}", items[0]);
        };
        assert_eq!(path, &file);
        assert_eq!(store.get(job_id).unwrap().source, JobSource::Batch);

        assert!(matches!(items[1].result, BatchResult::LookupFailed(_)));
        assert!(matches!(items[2].result, BatchResult::Rejected(_)));
        assert!(matches!(
            &items[3].result,
            BatchResult::AlreadyInProgress { job_id: dup, .. } if dup == job_id
        ));
        assert_eq!(store.list(&JobFilter::default()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_batch_without_manager_reports_lookup_failures() {
        let (_dir, _store, queue) = setup(Arc::new(NullManager), RemuxConfig::default_config());
        let items = queue
            .enqueue_batch(&[ExternalId::Movie(7)], JobKind::Full)
            .await
            .unwrap();
        assert_eq!(items[0].id, ExternalId::Movie(7));
        assert_eq!(
            items[0].result,
            BatchResult::LookupFailed(LookupError::NotConfigured("media manager").to_string())
        );
    }

    #[test]
    fn test_cancel_pending_through_queue() {
        let (dir, _store, queue) = setup(Arc::new(NullManager), RemuxConfig::default_config());
        let file = dir.path().join("a.mkv");
        fs::write(&file, b"x").unwrap();
        let outcome = queue.enqueue(file.to_str().unwrap(), JobKind::Full).unwrap();

        assert_eq!(queue.cancel(outcome.job_id()).unwrap(), CancelOutcome::Cancelled);
        let job = queue.status(outcome.job_id()).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.started_at.is_none());
        assert!(matches!(
            queue.status("nope"),
            Err(QueueError::Store(StoreError::NotFound(_)))
        ));
    }
}
