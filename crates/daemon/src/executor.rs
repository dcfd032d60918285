//! Runs one claimed job: classify, plan, then the audio/video/cleanup stages
//! against the transcoder, with backup and rollback around every mutation.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use humansize::{format_size, DECIMAL};
use log::{debug, error, info, warn};

use crate::backup::{BackupGuard, StagedOutput};
use crate::classifier::{classify, ContentProfile, Evidence};
use crate::config::RemuxConfig;
use crate::error::{PipelineError, ProbeError, StoreError, ToolError};
use crate::ffprobe::{MediaInfo, MediaProber};
use crate::job::{Job, StageFlags};
use crate::manager::MediaManager;
use crate::policy::{self, StagePlan};
use crate::sidecar;
use crate::store::{JobStore, Outcome};
use crate::transcode::{TranscodeRequest, Transcoder};

/// How a pipeline run ended. Store failures are reported separately.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(StageFlags),
    Failed(String),
    Cancelled,
}

pub struct Pipeline {
    store: Arc<JobStore>,
    prober: Arc<dyn MediaProber>,
    transcoder: Arc<dyn Transcoder>,
    manager: Arc<dyn MediaManager>,
    config: Arc<RemuxConfig>,
}

impl Pipeline {
    pub fn new(
        store: Arc<JobStore>,
        prober: Arc<dyn MediaProber>,
        transcoder: Arc<dyn Transcoder>,
        manager: Arc<dyn MediaManager>,
        config: Arc<RemuxConfig>,
    ) -> Self {
        Self {
            store,
            prober,
            transcoder,
            manager,
            config,
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn config(&self) -> &RemuxConfig {
        &self.config
    }

    /// Execute a job the caller has already claimed.
    ///
    /// Every path through here leaves the job terminal. An `Err` means the
    /// store could not record that; the file has been restored by then.
    pub async fn execute(&self, job: &Job) -> Result<JobOutcome, StoreError> {
        info!(
            "Job {}: processing {} ({})",
            job.id,
            job.file_path.display(),
            job.job_kind
        );

        let profile = match self.profile(&job.file_path).await {
            Ok(profile) => profile,
            Err(e) => return self.fail(job, None, e.into()),
        };

        let plan = match policy::plan(&profile, job.job_kind, &self.config) {
            Ok(plan) => plan,
            Err(e) => return self.fail(job, None, e.into()),
        };

        if plan.is_empty() {
            info!("Job {}: nothing to do", job.id);
            self.store.annotate(&job.id, "no conversion needed")?;
            self.store.finish(&job.id, Outcome::Completed, None)?;
            return Ok(JobOutcome::Completed(StageFlags::default()));
        }

        info!(
            "Job {}: planned stages {:?} (anime={}, language={})",
            job.id,
            plan.stage_kinds(),
            profile.is_anime,
            profile.original_language
        );

        let total = plan.len();
        let mut current = profile;
        let mut backup: Option<BackupGuard> = None;
        let mut flags = StageFlags::default();

        for (i, planned) in plan.stages().iter().enumerate() {
            let stage = planned.stage();
            let progress = (i + 1) as f64 / total as f64;

            if self.store.is_cancel_requested(&job.id)? {
                info!("Job {}: cancellation observed before {} stage", job.id, stage);
                return self.cancelled(job, backup);
            }

            // Stream indices move once the file has been rewritten.
            let stage_plan = if flags.any() {
                match self.prober.probe(&job.file_path).await {
                    Ok(info) => current.info = info,
                    Err(e) => return self.fail(job, backup, e.into()),
                }
                match policy::plan_stage(stage, &current, &self.config) {
                    Ok(Some(replanned)) => replanned,
                    Ok(None) => {
                        debug!("Job {}: {} stage no longer needed", job.id, stage);
                        self.store.annotate(&job.id, format!("{}: skipped", stage))?;
                        self.store
                            .update_progress(&job.id, progress, StageFlags::default())?;
                        continue;
                    }
                    Err(e) => return self.fail(job, backup, e.into()),
                }
            } else {
                planned.clone()
            };

            if backup.is_none() {
                match BackupGuard::acquire(&job.file_path, &job.id) {
                    Ok(guard) => backup = Some(guard),
                    Err(source) => {
                        let err = PipelineError::Backup {
                            path: job.file_path.clone(),
                            source,
                        };
                        return self.fail(job, None, err);
                    }
                }
            }

            info!("Job {}: {}", job.id, stage_plan.describe());
            let size = match self.run_stage(job, &stage_plan, &current.info).await {
                Ok(size) => size,
                Err(e) => return self.fail(job, backup, e.into()),
            };
            info!(
                "Job {}: {} stage done ({})",
                job.id,
                stage,
                format_size(size, DECIMAL)
            );

            let delta = StageFlags::for_stage(stage);
            flags.merge(delta);
            self.store.update_progress(&job.id, progress, delta)?;
            self.store
                .annotate(&job.id, stage_plan.describe())?;
        }

        if let Some(guard) = backup {
            if let Err(e) = guard.discard() {
                warn!("Job {}: failed to remove backup: {}", job.id, e);
            }
        }
        self.store.finish(&job.id, Outcome::Completed, None)?;
        info!("✅ Job {}: completed", job.id);

        if flags.any() {
            self.notify_rename(job);
        }
        Ok(JobOutcome::Completed(flags))
    }

    /// Probe the file and classify it against sidecar and manager metadata.
    async fn profile(&self, path: &Path) -> Result<ContentProfile, ProbeError> {
        let info = self.prober.probe(path).await?;
        let cfg = &self.config.classifier;

        let nfo = if cfg.use_sidecar {
            sidecar::read_sidecar(path)
        } else {
            None
        };

        let managed = if cfg.use_manager_lookup && self.manager.is_configured() {
            match self.manager.lookup_by_path(path).await {
                Ok(found) => found,
                Err(e) => {
                    warn!("Manager lookup failed for {}: {}", path.display(), e);
                    None
                }
            }
        } else {
            None
        };

        let evidence = Evidence {
            path,
            sidecar: nfo.as_ref(),
            manager: managed.as_ref(),
        };
        Ok(ContentProfile::new(info, classify(&evidence, cfg)))
    }

    /// Run one stage through a temp output and commit it over the file.
    /// Transient tool failures are retried with exponential backoff.
    async fn run_stage(
        &self,
        job: &Job,
        stage: &StagePlan,
        info: &MediaInfo,
    ) -> Result<u64, ToolError> {
        let retries = self.config.processing.tool_retries;
        let mut attempt: u32 = 0;

        loop {
            let staged = StagedOutput::new(&job.file_path, &job.id)
                .map_err(|e| ToolError::io("failed to prepare temp output", e))?;
            let request = TranscodeRequest {
                job_id: &job.id,
                input: &job.file_path,
                output: staged.temp_path(),
                stage,
                info,
            };

            let result = match self.transcoder.transcode(&request).await {
                Ok(()) => staged.commit(),
                Err(e) => Err(e),
            };

            match result {
                Ok(size) => return Ok(size),
                Err(e) if e.is_transient() && attempt < retries => {
                    let delay = backoff(self.config.processing.retry_backoff_secs, attempt);
                    attempt += 1;
                    warn!(
                        "Job {}: {} stage attempt {} failed ({}), retrying in {}s",
                        job.id,
                        stage.stage(),
                        attempt,
                        e,
                        delay.as_secs()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn fail(
        &self,
        job: &Job,
        backup: Option<BackupGuard>,
        err: PipelineError,
    ) -> Result<JobOutcome, StoreError> {
        let mut message = err.to_string();
        match err {
            PipelineError::Policy(_) => error!("❌ Job {}: internal policy error: {}", job.id, message),
            _ => error!("❌ Job {}: {}", job.id, message),
        }

        if let Some(guard) = backup {
            match guard.rollback() {
                Ok(kept) => info!("Job {}: backup kept at {}", job.id, kept.display()),
                Err(e) => {
                    error!("Job {}: rollback failed: {}", job.id, e);
                    message = format!("{}; rollback failed: {}", message, e);
                }
            }
            self.store.clear_stage_flags(&job.id)?;
        }

        self.store
            .finish(&job.id, Outcome::Failed, Some(message.clone()))?;
        Ok(JobOutcome::Failed(message))
    }

    fn cancelled(
        &self,
        job: &Job,
        backup: Option<BackupGuard>,
    ) -> Result<JobOutcome, StoreError> {
        if let Some(guard) = backup {
            match guard.rollback() {
                Ok(kept) => {
                    if let Err(e) = fs::remove_file(&kept) {
                        warn!("Job {}: failed to remove backup {}: {}", job.id, kept.display(), e);
                    }
                }
                Err(e) => error!("Job {}: rollback after cancellation failed: {}", job.id, e),
            }
            self.store.clear_stage_flags(&job.id)?;
        }
        self.store.acknowledge_cancel(&job.id)?;
        Ok(JobOutcome::Cancelled)
    }

    /// Runs in the background so the worker is free for the next claim.
    /// The result is only logged and never changes the job's status.
    fn notify_rename(&self, job: &Job) {
        if !self.manager.is_configured() {
            return;
        }
        let manager = Arc::clone(&self.manager);
        let job_id = job.id.clone();
        let path = job.file_path.clone();
        tokio::spawn(async move {
            match manager.trigger_rename(&path).await {
                Ok(()) => debug!("Job {}: rename triggered", job_id),
                Err(e) => warn!("Job {}: rename trigger failed: {}", job_id, e),
            }
        });
    }
}

fn backoff(base_secs: u64, attempt: u32) -> Duration {
    Duration::from_secs(base_secs.saturating_mul(1u64 << attempt.min(6)))
}

/// In-memory collaborators for pipeline, pool and queue tests.
#[cfg(test)]
pub(crate) mod testing {
    use std::collections::{HashMap, VecDeque};
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::error::{LookupError, ProbeError, ToolError};
    use crate::ffprobe::{AudioStream, MediaInfo, MediaProber, SubtitleStream, VideoStream};
    use crate::job::Stage;
    use crate::manager::{ExternalId, ManagerMetadata, MediaManager};
    use crate::transcode::{TranscodeRequest, Transcoder};

    pub fn video(codec: &str, bit_depth: u8) -> VideoStream {
        VideoStream {
            index: 0,
            codec: codec.to_string(),
            bit_depth,
            profile: None,
            pix_fmt: None,
            width: Some(1920),
            height: Some(1080),
            attached_pic: false,
        }
    }

    pub fn audio(index: u32, codec: &str, channels: u32, lang: &str) -> AudioStream {
        AudioStream {
            index,
            codec: codec.to_string(),
            profile: None,
            channels,
            language: Some(lang.to_string()),
            title: None,
            bitrate_bps: Some(1_509_000),
            default: index == 1,
            forced: false,
            commentary: false,
            audio_description: false,
        }
    }

    pub fn subtitle(index: u32, lang: &str) -> SubtitleStream {
        SubtitleStream {
            index,
            codec: "subrip".to_string(),
            language: Some(lang.to_string()),
            title: None,
            forced: false,
            sdh: false,
            commentary: false,
        }
    }

    /// English 8-bit h264 with AAC audio: nothing to convert.
    pub fn clean_info() -> MediaInfo {
        MediaInfo {
            video: vec![video("h264", 8)],
            audio: vec![audio(1, "aac", 2, "eng")],
            subtitles: vec![subtitle(2, "eng")],
            ..MediaInfo::default()
        }
    }

    /// Needs the audio stage (DTS 5.1).
    pub fn dts_info() -> MediaInfo {
        MediaInfo {
            audio: vec![audio(1, "dts", 6, "eng")],
            ..clean_info()
        }
    }

    /// Needs the audio and video stages.
    pub fn dts_10bit_info() -> MediaInfo {
        MediaInfo {
            video: vec![video("h264", 10)],
            ..dts_info()
        }
    }

    /// Replays probe results in order, repeating the last one.
    pub struct FakeProber {
        results: Mutex<VecDeque<Result<MediaInfo, String>>>,
        pub calls: AtomicU32,
    }

    impl FakeProber {
        pub fn new(info: MediaInfo) -> Self {
            Self::sequence(vec![Ok(info)])
        }

        pub fn failing(message: &str) -> Self {
            Self::sequence(vec![Err(message.to_string())])
        }

        pub fn sequence(results: Vec<Result<MediaInfo, String>>) -> Self {
            Self {
                results: Mutex::new(results.into()),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl MediaProber for FakeProber {
        async fn probe(&self, path: &Path) -> Result<MediaInfo, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut results = self.results.lock().unwrap();
            let next = if results.len() > 1 {
                results.pop_front().unwrap()
            } else {
                results.front().cloned().unwrap()
            };
            match next {
                Ok(mut info) => {
                    info.path = path.to_path_buf();
                    Ok(info)
                }
                Err(stderr) => Err(ProbeError::Failed {
                    path: path.to_path_buf(),
                    exit_code: 1,
                    stderr,
                }),
            }
        }
    }

    type Hook = Box<dyn Fn(&TranscodeRequest<'_>) + Send + Sync>;

    /// Writes `<input bytes><stage name>` to the output, or fails on request.
    #[derive(Default)]
    pub struct FakeTranscoder {
        pub fail_stage: Option<Stage>,
        pub transient_failures: AtomicU32,
        pub calls: Mutex<Vec<Stage>>,
        pub on_call: Option<Hook>,
    }

    impl FakeTranscoder {
        pub fn failing_at(stage: Stage) -> Self {
            Self {
                fail_stage: Some(stage),
                ..Self::default()
            }
        }

        pub fn stages(&self) -> Vec<Stage> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transcoder for FakeTranscoder {
        async fn transcode(&self, request: &TranscodeRequest<'_>) -> Result<(), ToolError> {
            let stage = request.stage.stage();
            self.calls.lock().unwrap().push(stage);
            if let Some(hook) = &self.on_call {
                hook(request);
            }
            if self.fail_stage == Some(stage) {
                // Leave a partial file behind like a crashed encoder would.
                std::fs::write(request.output, b"partial").unwrap();
                return Err(ToolError::Failed {
                    exit_code: 1,
                    stderr: "No space left on device".to_string(),
                });
            }
            if self
                .transient_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ToolError::Timeout { secs: 1 });
            }
            let mut data = std::fs::read(request.input).unwrap();
            data.extend_from_slice(stage.as_str().as_bytes());
            std::fs::write(request.output, data).unwrap();
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct FakeManager {
        pub metadata: HashMap<ExternalId, ManagerMetadata>,
        pub fail_rename: bool,
        /// Time a rename spends waiting on the manager after being recorded.
        pub rename_delay: Duration,
        pub renames: Mutex<Vec<PathBuf>>,
    }

    impl FakeManager {
        pub fn with(mut self, id: ExternalId, meta: ManagerMetadata) -> Self {
            self.metadata.insert(id, meta);
            self
        }

        pub fn renamed(&self) -> Vec<PathBuf> {
            self.renames.lock().unwrap().clone()
        }

        /// Renames run in the background; wait until `count` were requested.
        pub async fn wait_for_renames(&self, count: usize) -> Vec<PathBuf> {
            for _ in 0..250 {
                let renamed = self.renamed();
                if renamed.len() >= count {
                    return renamed;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            panic!("expected {} rename(s), saw {:?}", count, self.renamed());
        }
    }

    #[async_trait]
    impl MediaManager for FakeManager {
        fn is_configured(&self) -> bool {
            true
        }

        async fn lookup_metadata(&self, id: &ExternalId) -> Result<ManagerMetadata, LookupError> {
            self.metadata
                .get(id)
                .cloned()
                .ok_or_else(|| LookupError::NotFound(id.to_string()))
        }

        async fn lookup_by_path(
            &self,
            path: &Path,
        ) -> Result<Option<ManagerMetadata>, LookupError> {
            Ok(self.metadata.values().find(|m| m.path == path).cloned())
        }

        async fn trigger_rename(&self, path: &Path) -> Result<(), LookupError> {
            self.renames.lock().unwrap().push(path.to_path_buf());
            if !self.rename_delay.is_zero() {
                tokio::time::sleep(self.rename_delay).await;
            }
            if self.fail_rename {
                return Err(LookupError::NotFound(path.display().to_string()));
            }
            Ok(())
        }
    }
}
