use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Persisted status vocabulary. The serialized names are part of the on-disk
/// format and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Pending or running: the job holds the path lock.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// Legal edges of the lifecycle state machine.
    ///
    /// Crash recovery (running back to pending) is not a caller transition and is
    /// handled inside the store.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown job status: {s}"))
    }
}

/// The three pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Audio,
    Video,
    Cleanup,
}

impl Stage {
    pub const ORDER: [Stage; 3] = [Stage::Audio, Stage::Video, Stage::Cleanup];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Audio => "audio",
            Stage::Video => "video",
            Stage::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested scope of a job. `Full` lets the policy decide all three stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Audio,
    Video,
    Cleanup,
    #[default]
    Full,
}

impl JobKind {
    pub fn includes(self, stage: Stage) -> bool {
        match self {
            JobKind::Full => true,
            JobKind::Audio => stage == Stage::Audio,
            JobKind::Video => stage == Stage::Video,
            JobKind::Cleanup => stage == Stage::Cleanup,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Audio => "audio",
            JobKind::Video => "video",
            JobKind::Cleanup => "cleanup",
            JobKind::Full => "full",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "audio" => Ok(JobKind::Audio),
            "video" => Ok(JobKind::Video),
            "cleanup" => Ok(JobKind::Cleanup),
            "full" => Ok(JobKind::Full),
            other => Err(format!("unknown job kind: {other}")),
        }
    }
}

/// Which stages actually mutated the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StageFlags {
    pub video_converted: bool,
    pub audio_converted: bool,
    pub streams_cleaned: bool,
}

impl StageFlags {
    pub fn for_stage(stage: Stage) -> Self {
        let mut flags = StageFlags::default();
        match stage {
            Stage::Audio => flags.audio_converted = true,
            Stage::Video => flags.video_converted = true,
            Stage::Cleanup => flags.streams_cleaned = true,
        }
        flags
    }

    /// Flags are only ever raised by a delta, never lowered.
    pub fn merge(&mut self, delta: StageFlags) {
        self.video_converted |= delta.video_converted;
        self.audio_converted |= delta.audio_converted;
        self.streams_cleaned |= delta.streams_cleaned;
    }

    pub fn any(&self) -> bool {
        self.video_converted || self.audio_converted || self.streams_cleaned
    }

    pub fn is_set(&self, stage: Stage) -> bool {
        match stage {
            Stage::Audio => self.audio_converted,
            Stage::Video => self.video_converted,
            Stage::Cleanup => self.streams_cleaned,
        }
    }
}

/// Where a job came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobSource {
    #[default]
    Api,
    Batch,
    Webhook,
    Scan,
}

impl fmt::Display for JobSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobSource::Api => "api",
            JobSource::Batch => "batch",
            JobSource::Webhook => "webhook",
            JobSource::Scan => "scan",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub file_path: PathBuf,
    pub job_kind: JobKind,
    pub status: JobStatus,
    pub progress: f64,
    pub error: Option<String>,
    #[serde(default)]
    pub stage_flags: StageFlags,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub source: JobSource,
    #[serde(default)]
    pub cancel_requested: bool,
    /// Per-stage outcome notes, e.g. `audio: 1 stream dts -> ac3 640k`.
    #[serde(default)]
    pub result: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(file_path: impl Into<PathBuf>, job_kind: JobKind) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().simple().to_string(),
            file_path: file_path.into(),
            job_kind,
            status: JobStatus::Pending,
            progress: 0.0,
            error: None,
            stage_flags: StageFlags::default(),
            priority: 0,
            source: JobSource::Api,
            cancel_requested: false,
            result: Vec::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_source(mut self, source: JobSource) -> Self {
        self.source = source;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn file_name(&self) -> String {
        self.file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.file_path.display().to_string())
    }
}
