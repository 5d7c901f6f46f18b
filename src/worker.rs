//! Queue consumer running the ingestion pipeline.
//!
//! `concurrency` loops share one queue. Each loop claims a job, runs the
//! [`Ingestor`] while renewing the job's lease every `heartbeat`, and acks or
//! fails it. When nothing is claimable a loop also returns expired leases to
//! the queue, which is how jobs held by a dead worker get picked up again.
//! Queue errors are logged and retried after `poll_interval`; they never
//! stop a loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::app::AppContext;
use crate::config::Config;
use crate::ingest::{IngestError, IngestOutcome, Ingestor};
use crate::queue::{FailOutcome, JobQueue, QueuedJob};

const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub concurrency: usize,
    pub poll_interval: Duration,
    /// How often a running job's lease is renewed. Keep it well under the
    /// queue's lease.
    pub heartbeat: Duration,
    /// Exit once no job is queued or running instead of polling forever.
    pub drain: bool,
}

/// Totals across all loops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl WorkerStats {
    fn merge(&mut self, other: WorkerStats) {
        self.completed += other.completed;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// `docrag worker [--drain]`
pub async fn run_worker_command(config: &Config, drain: bool) -> Result<()> {
    let ctx = AppContext::open(config).await?;
    let queue: Arc<dyn JobQueue> = Arc::new(ctx.queue());
    let options = ctx.worker_options(drain);

    println!(
        "worker started (queue: {}, concurrency: {}, provider: {})",
        config.queue.name,
        options.concurrency,
        ctx.llm.name()
    );
    let stats = run_worker(queue, ctx.ingestor()?, options).await?;

    println!("worker stopped");
    println!("  completed: {}", stats.completed);
    println!("  skipped: {}", stats.skipped);
    println!("  failed: {}", stats.failed);
    Ok(())
}

/// Run the worker until drained or interrupted with Ctrl-C.
pub async fn run_worker(
    queue: Arc<dyn JobQueue>,
    ingestor: Ingestor,
    options: WorkerOptions,
) -> Result<WorkerStats> {
    if let Err(e) = queue.recover_expired().await {
        warn!(error = %e, "could not recover expired jobs at startup");
    }

    let mut handles = Vec::with_capacity(options.concurrency);
    for slot in 0..options.concurrency.max(1) {
        let queue = queue.clone();
        let ingestor = ingestor.clone();
        let options = options.clone();
        handles.push(tokio::spawn(async move {
            worker_loop(slot, queue, ingestor, options).await
        }));
    }

    let mut stats = WorkerStats::default();
    tokio::select! {
        joined = futures_util::future::join_all(handles) => {
            for result in joined {
                stats.merge(result?);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, stopping worker");
        }
    }

    Ok(stats)
}

async fn worker_loop(
    slot: usize,
    queue: Arc<dyn JobQueue>,
    ingestor: Ingestor,
    options: WorkerOptions,
) -> WorkerStats {
    let mut stats = WorkerStats::default();

    loop {
        let claimed = match queue.claim().await {
            Ok(Some(claimed)) => claimed,
            Ok(None) => {
                if idle(slot, queue.as_ref(), &options).await {
                    return stats;
                }
                continue;
            }
            Err(e) => {
                warn!(slot, error = %e, "claim failed");
                tokio::time::sleep(options.poll_interval).await;
                continue;
            }
        };

        let doc_id = claimed.job.document_id.clone();
        info!(slot, job_id = claimed.id, document_id = %doc_id, attempt = claimed.attempt, "job claimed");

        let result =
            process_with_heartbeat(slot, queue.as_ref(), &ingestor, &claimed, options.heartbeat)
                .await;
        match result {
            Ok(IngestOutcome::Completed { chunks, .. }) => {
                if let Err(e) = queue.complete(&claimed).await {
                    error!(slot, document_id = %doc_id, error = %e, "could not acknowledge job");
                }
                info!(slot, document_id = %doc_id, chunks, "job completed");
                stats.completed += 1;
            }
            Ok(IngestOutcome::Skipped { status }) => {
                if let Err(e) = queue.complete(&claimed).await {
                    error!(slot, document_id = %doc_id, error = %e, "could not acknowledge job");
                }
                info!(slot, document_id = %doc_id, %status, "job acknowledged without work");
                stats.skipped += 1;
            }
            Err(e) => {
                stats.failed += 1;
                match queue.fail(&claimed, &e.to_string()).await {
                    Ok(FailOutcome::Retrying { delay }) => {
                        warn!(slot, document_id = %doc_id, ?delay, error = %e, "job failed, will retry");
                    }
                    Ok(FailOutcome::Dead) => {
                        error!(slot, document_id = %doc_id, error = %e, "job failed permanently");
                    }
                    Err(qe) => {
                        error!(slot, document_id = %doc_id, error = %e, queue_error = %qe, "could not record job failure");
                    }
                }
            }
        }
    }
}

/// Nothing was claimable. Reclaim expired leases, then either report the
/// loop done (drain mode, queue empty) or wait out `poll_interval`.
async fn idle(slot: usize, queue: &dyn JobQueue, options: &WorkerOptions) -> bool {
    match queue.recover_expired().await {
        Ok(0) => {}
        Ok(_) => return false,
        Err(e) => warn!(slot, error = %e, "could not recover expired jobs"),
    }

    if options.drain {
        match queue.outstanding().await {
            Ok(0) => return true,
            Ok(_) => {}
            Err(e) => warn!(slot, error = %e, "could not count outstanding jobs"),
        }
    }

    tokio::time::sleep(options.poll_interval).await;
    false
}

/// Run the ingestor for `claimed`, renewing its lease until it finishes.
async fn process_with_heartbeat(
    slot: usize,
    queue: &dyn JobQueue,
    ingestor: &Ingestor,
    claimed: &QueuedJob,
    heartbeat: Duration,
) -> Result<IngestOutcome, IngestError> {
    let work = ingestor.process_attempt(&claimed.job, claimed.attempt, claimed.max_attempts);
    tokio::pin!(work);

    let mut ticker = tokio::time::interval(heartbeat.max(MIN_HEARTBEAT));
    ticker.tick().await;

    loop {
        tokio::select! {
            result = &mut work => return result,
            _ = ticker.tick() => match queue.extend_lease(claimed).await {
                Ok(true) => {}
                Ok(false) => warn!(slot, job_id = claimed.id, "lease lost, job was reclaimed by another worker"),
                Err(e) => warn!(slot, job_id = claimed.id, error = %e, "lease renewal failed"),
            },
        }
    }
}
