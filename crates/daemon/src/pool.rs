use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::error::StoreError;
use crate::executor::{JobOutcome, Pipeline};

/// Fixed set of workers, each looping claim, execute.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<Result<(), StoreError>>,
}

impl WorkerPool {
    pub fn start(pipeline: Arc<Pipeline>, workers: usize, poll: Duration) -> Self {
        let workers = workers.max(1);
        let (shutdown, _) = watch::channel(false);
        let mut tasks = JoinSet::new();

        info!("Starting worker pool with {} worker(s)", workers);
        for worker in 0..workers {
            let pipeline = pipeline.clone();
            let rx = shutdown.subscribe();
            tasks.spawn(run_worker(worker, pipeline, rx, poll));
        }

        Self { shutdown, tasks }
    }

    /// Ask workers to stop after their current job.
    pub fn shutdown(&self) {
        // Err only when every worker is gone already.
        let _ = self.shutdown.send(true);
    }

    /// Wait for every worker to exit. The first store failure is returned.
    pub async fn wait(mut self) -> Result<(), StoreError> {
        let mut first_error = None;
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    // One worker hit a fatal store error; the others stop too.
                    let _ = self.shutdown.send(true);
                    first_error.get_or_insert(e);
                }
                Err(e) => error!("Worker task panicked: {}", e),
            }
        }
        info!("Worker pool stopped");
        first_error.map_or(Ok(()), Err)
    }
}

async fn run_worker(
    worker: usize,
    pipeline: Arc<Pipeline>,
    mut shutdown: watch::Receiver<bool>,
    poll: Duration,
) -> Result<(), StoreError> {
    debug!("Worker {} started", worker);
    let store = pipeline.store().clone();

    loop {
        let job = match store.claim_next_wait(&mut shutdown, poll).await {
            Ok(Some(job)) => job,
            Ok(None) => break,
            Err(e) if e.is_fatal() => {
                error!("Worker {}: job store halted: {}", worker, e);
                return Err(e);
            }
            Err(e) => {
                warn!("Worker {}: claim failed: {}", worker, e);
                tokio::time::sleep(poll).await;
                continue;
            }
        };

        debug!("Worker {} claimed job {}", worker, job.id);
        match pipeline.execute(&job).await {
            Ok(JobOutcome::Completed(_)) | Ok(JobOutcome::Cancelled) => {}
            Ok(JobOutcome::Failed(reason)) => debug!("Worker {}: job {} failed: {}", worker, job.id, reason),
            Err(e) if e.is_fatal() => {
                error!("Worker {}: cannot record job {}: {}", worker, job.id, e);
                return Err(e);
            }
            Err(e) => error!("Worker {}: job {} left inconsistent: {}", worker, job.id, e),
        }
    }

    debug!("Worker {} shutting down", worker);
    Ok(())
}
