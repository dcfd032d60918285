use std::path::PathBuf;

use thiserror::Error;

use crate::job::JobStatus;

/// The external analysis tool could not describe a file.
///
/// Never retried by the adapter; the pipeline fails the job immediately.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("file does not exist: {0}")]
    Missing(PathBuf),

    #[error("failed to execute ffprobe for {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ffprobe failed (exit code {exit_code}) for {path}: {stderr}")]
    Failed {
        path: PathBuf,
        exit_code: i32,
        stderr: String,
    },

    #[error("ffprobe timed out after {secs}s for {path}")]
    Timeout { path: PathBuf, secs: u64 },

    #[error("malformed ffprobe output for {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Internal invariant violation while turning a profile into a plan.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("audio stream {index} ({codec}) reports {channels} channels")]
    InvalidAudioStream {
        index: u32,
        codec: String,
        channels: u32,
    },

    #[error("bitrate cap for {codec} is zero")]
    ZeroBitrateCap { codec: String },
}

/// Failure of the external transcoder or of committing its output.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to spawn {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("ffmpeg exited with code {exit_code}: {stderr}")]
    Failed { exit_code: i32, stderr: String },

    #[error("ffmpeg timed out after {secs}s and was killed")]
    Timeout { secs: u64 },

    #[error("transcoded output does not exist: {0}")]
    MissingOutput(PathBuf),

    #[error("transcoded output is empty: {0}")]
    EmptyOutput(PathBuf),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl ToolError {
    /// Whether another attempt with the same parameters may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ToolError::Timeout { .. } => true,
            ToolError::Spawn { source, .. } => source.kind() != std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ToolError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Duplicate active job or illegal state transition. Rejected at the API
/// boundary; never turns into a job failure.
#[derive(Debug, Error)]
pub enum ConflictError {
    #[error("job {job_id} is already {status} for {}", path.display())]
    ActiveJob {
        path: PathBuf,
        job_id: String,
        status: JobStatus,
    },

    #[error("job {id}: cannot {action} while {status}")]
    IllegalTransition {
        id: String,
        status: JobStatus,
        action: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error("failed to read job state at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to lock job store at {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to persist job state at {path}: {source}")]
    Durability {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt job record {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("job store halted after a durability failure; claiming is disabled")]
    Halted,
}

impl StoreError {
    /// Failed writes stop all claiming. Reads and lock waits are local to one
    /// call and may be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Durability { .. } | StoreError::Halted)
    }
}

/// An external identifier could not be resolved by the media manager.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} has no file on disk")]
    NoFile(String),

    #[error("{context}: {source}")]
    Request {
        context: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Everything that can end a pipeline run early.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error("policy invariant violated: {0}")]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("backup failed for {path}: {source}")]
    Backup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_tool_errors() {
        assert!(ToolError::Timeout { secs: 10 }.is_transient());
        assert!(ToolError::Spawn {
            tool: "ffmpeg".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Interrupted, "interrupted"),
        }
        .is_transient());
        assert!(!ToolError::Spawn {
            tool: "ffmpeg".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        }
        .is_transient());
        assert!(!ToolError::Failed {
            exit_code: 1,
            stderr: "No space left on device".to_string(),
        }
        .is_transient());
    }

    #[test]
    fn test_fatal_store_errors() {
        assert!(StoreError::Halted.is_fatal());
        assert!(!StoreError::NotFound("abc".to_string()).is_fatal());
        assert!(!StoreError::Read {
            path: PathBuf::from("/jobs/abc.json"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        }
        .is_fatal());
    }
}
