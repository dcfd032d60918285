pub mod backup;
pub mod classifier;
pub mod config;
pub mod error;
pub mod executor;
pub mod ffprobe;
pub mod job;
pub mod language;
pub mod manager;
pub mod policy;
pub mod pool;
pub mod queue;
pub mod scan;
pub mod sidecar;
pub mod store;
pub mod transcode;

pub use config::RemuxConfig;
pub use error::{ConflictError, LookupError, QueueError, StoreError, ToolError};
pub use executor::{JobOutcome, Pipeline};
pub use ffprobe::{FfprobeCli, MediaInfo, MediaProber};
pub use job::{Job, JobKind, JobSource, JobStatus, Stage, StageFlags};
pub use manager::{ExternalId, MediaManager};
pub use pool::WorkerPool;
pub use queue::{BatchItem, BatchResult, EnqueueOutcome, QueueManager};
pub use store::{JobFilter, JobStore};
pub use transcode::{FfmpegTranscoder, Transcoder};
