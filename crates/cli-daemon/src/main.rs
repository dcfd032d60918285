use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use humansize::{format_size, DECIMAL};
use log::{error, info, warn};
use remux_daemon::{
    backup, manager,
    queue::{BatchResult, EnqueueOutcome},
    scan::{self, ScanResult},
    store::{CancelOutcome, JobFilter},
    ExternalId, FfmpegTranscoder, FfprobeCli, Job, JobKind, JobSource, JobStatus, JobStore,
    Pipeline, QueueManager, RemuxConfig, WorkerPool,
};

/// Media library normalisation daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Recover interrupted jobs and run the worker pool until interrupted
    Run {
        /// Override the configured number of workers
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Queue one file
    Enqueue {
        path: String,
        #[arg(short, long, default_value = "full")]
        kind: JobKind,
        #[arg(short, long, default_value_t = 0)]
        priority: i32,
    },
    /// Queue files by media-manager id (movie:<id>, episodefile:<id>)
    Batch {
        #[arg(required = true)]
        ids: Vec<ExternalId>,
        #[arg(short, long, default_value = "full")]
        kind: JobKind,
    },
    /// Walk the library roots and queue every media file found
    Scan {
        #[arg(short, long, default_value = "full")]
        kind: JobKind,
        /// List candidates without queuing them
        #[arg(long)]
        dry_run: bool,
    },
    /// Show one job
    Status {
        job_id: String,
        #[arg(long)]
        json: bool,
    },
    /// List jobs, newest first
    List {
        #[arg(short, long)]
        status: Option<JobStatus>,
        #[arg(short, long)]
        limit: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Cancel a pending or running job
    Cancel { job_id: String },
    /// Delete finished job records older than the retention horizon
    Purge {
        /// Override the configured retention in days
        #[arg(long)]
        days: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Use RUST_LOG when set, otherwise info (debug with --verbose)
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let cfg = RemuxConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    let cfg = Arc::new(cfg);

    let store = Arc::new(
        JobStore::open(&cfg.processing.job_state_dir).with_context(|| {
            format!(
                "Failed to open job state directory: {}",
                cfg.processing.job_state_dir.display()
            )
        })?,
    );

    match args.command {
        Command::Run { workers } => run(cfg, store, workers).await,
        Command::Enqueue {
            path,
            kind,
            priority,
        } => {
            let queue = queue_manager(&cfg, store)?;
            match queue.enqueue_with(&path, kind, JobSource::Api, priority)? {
                EnqueueOutcome::Queued(job) => println!("queued {} {}", job.id, job.file_path.display()),
                EnqueueOutcome::AlreadyInProgress { job_id, status } => {
                    println!("already in progress: {} ({})", job_id, status)
                }
            }
            Ok(())
        }
        Command::Batch { ids, kind } => {
            let queue = queue_manager(&cfg, store)?;
            let items = queue.enqueue_batch(&ids, kind).await?;
            for item in &items {
                match &item.result {
                    BatchResult::Queued { job_id, path } => {
                        println!("{}\tqueued {} {}", item.id, job_id, path.display())
                    }
                    BatchResult::AlreadyInProgress { job_id, path } => {
                        println!("{}\tin progress {} {}", item.id, job_id, path.display())
                    }
                    BatchResult::LookupFailed(reason) => println!("{}\tlookup failed: {}", item.id, reason),
                    BatchResult::Rejected(reason) => println!("{}\trejected: {}", item.id, reason),
                }
            }
            Ok(())
        }
        Command::Scan { kind, dry_run } => scan_and_enqueue(&cfg, store, kind, dry_run).await,
        Command::Status { job_id, json } => {
            let job = store.get(&job_id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&job)?);
            } else {
                print_job_details(&job);
            }
            Ok(())
        }
        Command::List {
            status,
            limit,
            json,
        } => {
            let jobs = store.list(&JobFilter { status, limit })?;
            if json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
                return Ok(());
            }
            for job in &jobs {
                println!(
                    "{}  {:<9}  {:<7}  {:>3.0}%  {}",
                    job.id,
                    job.status,
                    job.job_kind,
                    job.progress * 100.0,
                    job.file_path.display()
                );
            }
            let stats = store.stats()?;
            let summary: Vec<String> = stats.iter().map(|(s, n)| format!("{} {}", n, s)).collect();
            println!("{}", summary.join(", "));
            Ok(())
        }
        Command::Cancel { job_id } => {
            match store.cancel(&job_id)? {
                CancelOutcome::Cancelled => println!("cancelled {}", job_id),
                CancelOutcome::Requested => {
                    println!("cancellation requested for {}; it stops at the next stage", job_id)
                }
            }
            Ok(())
        }
        Command::Purge { days } => {
            let days = days.unwrap_or(cfg.processing.retention_days);
            let removed = store.purge_expired(chrono::Duration::days(i64::from(days)))?;
            println!("purged {} job record(s) older than {} day(s)", removed, days);
            Ok(())
        }
    }
}

fn queue_manager(cfg: &Arc<RemuxConfig>, store: Arc<JobStore>) -> Result<QueueManager> {
    let media_manager = manager::from_config(cfg).context("Failed to set up media manager client")?;
    Ok(QueueManager::new(store, media_manager, cfg.clone()))
}

async fn run(cfg: Arc<RemuxConfig>, store: Arc<JobStore>, workers: Option<usize>) -> Result<()> {
    let workers = workers.unwrap_or(cfg.processing.workers);

    info!("Remux daemon starting");
    info!("  Library roots: {:?}", cfg.library_roots);
    info!("  Job state dir: {}", cfg.processing.job_state_dir.display());
    info!("  Workers: {}", workers);
    info!("  Anime only: {}", cfg.content_filter.anime_only);
    info!("  Video encoder: {:?}", cfg.video.encoder);

    for root in &cfg.library_roots {
        if !root.exists() {
            warn!("Library root does not exist: {}", root.display());
        }
    }

    // Recovery on startup: interrupted jobs first, then orphaned temp files
    let report = store
        .recover_on_startup()
        .context("Failed to recover interrupted jobs")?;
    let cleaned = backup::sweep_orphans(&cfg.library_roots);
    if report.total() > 0 || cleaned > 0 {
        info!(
            "✅ Startup recovery complete: {} requeued, {} failed, {} cancelled, {} temp file(s) cleaned",
            report.requeued.len(),
            report.failed.len(),
            report.cancelled.len(),
            cleaned
        );
    } else {
        info!("✅ Startup recovery complete: no interrupted jobs or orphaned files found");
    }

    let pipeline = Arc::new(Pipeline::new(
        store,
        Arc::new(FfprobeCli::new(
            &cfg.processing.ffprobe_bin,
            cfg.processing.probe_timeout_secs,
        )),
        Arc::new(FfmpegTranscoder::new(
            &cfg.processing.ffmpeg_bin,
            cfg.processing.job_timeout_secs,
        )),
        manager::from_config(&cfg).context("Failed to set up media manager client")?,
        cfg.clone(),
    ));

    let pool = WorkerPool::start(
        pipeline,
        workers,
        Duration::from_secs(cfg.processing.poll_interval_secs.max(1)),
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested, waiting for running jobs to reach a stage boundary");
    pool.shutdown();

    if let Err(e) = pool.wait().await {
        error!("Worker pool stopped on a store failure: {}", e);
        bail!("job store failure: {}", e);
    }
    info!("Remux daemon stopped");
    Ok(())
}

async fn scan_and_enqueue(
    cfg: &Arc<RemuxConfig>,
    store: Arc<JobStore>,
    kind: JobKind,
    dry_run: bool,
) -> Result<()> {
    if cfg.library_roots.is_empty() {
        bail!("no library_roots configured");
    }
    let results = scan::scan_library(
        &cfg.library_roots,
        Duration::from_secs(cfg.processing.scan_settle_secs),
    )
    .await
    .context("Failed to scan library")?;

    let queue = queue_manager(cfg, store)?;
    let (mut queued, mut active, mut skipped) = (0, 0, 0);

    for result in results {
        match result {
            ScanResult::Candidate(path, size) => {
                if dry_run {
                    println!("{}  {}", format_size(size, DECIMAL), path.display());
                    continue;
                }
                match queue.enqueue_with(&path.to_string_lossy(), kind, JobSource::Scan, 0) {
                    Ok(EnqueueOutcome::Queued(job)) => {
                        info!("Created job {} for: {} ({})", job.id, path.display(), format_size(size, DECIMAL));
                        queued += 1;
                    }
                    Ok(EnqueueOutcome::AlreadyInProgress { .. }) => active += 1,
                    Err(e) => warn!("Could not queue {}: {}", path.display(), e),
                }
            }
            ScanResult::Skipped(path, reason) => {
                skipped += 1;
                info!("Skipped {}: {}", path.display(), reason);
            }
        }
    }

    println!(
        "scan: {} queued, {} already in progress, {} skipped",
        queued, active, skipped
    );
    Ok(())
}

fn print_job_details(job: &Job) {
    println!("Job:       {}", job.id);
    println!("File:      {}", job.file_path.display());
    if let Some(size) = file_size(&job.file_path) {
        println!("Size:      {}", format_size(size, DECIMAL));
    }
    println!("Kind:      {}", job.job_kind);
    println!("Status:    {}", job.status);
    println!("Progress:  {:.0}%", job.progress * 100.0);
    println!("Source:    {} (priority {})", job.source, job.priority);
    println!(
        "Stages:    audio={} video={} cleanup={}",
        job.stage_flags.audio_converted, job.stage_flags.video_converted, job.stage_flags.streams_cleaned
    );
    if job.cancel_requested {
        println!("Cancel:    requested");
    }
    println!("Created:   {} ({} ago)", job.created_at, format_duration(Utc::now() - job.created_at));
    if let Some(started) = job.started_at {
        println!("Started:   {}", started);
    }
    if let Some(completed) = job.completed_at {
        println!("Finished:  {}", completed);
        if let Some(started) = job.started_at {
            println!("Took:      {}", format_duration(completed - started));
        }
    }
    for note in &job.result {
        println!("Result:    {}", note);
    }
    if let Some(error) = &job.error {
        println!("Error:     {}", error);
    }
}

fn file_size(path: &Path) -> Option<u64> {
    std::fs::metadata(path).ok().map(|m| m.len())
}

fn format_duration(d: chrono::Duration) -> String {
    let secs = d.num_seconds().max(0);
    if secs >= 3600 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}
