//! Retry scheduler: finds due jobs, claims them and runs their attempts.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use courier_core::{Clock, JobId};

use crate::error::DispatchError;

use super::executor::{AttemptExecutor, AttemptReport};
use super::store::{JobStore, JobStoreError};
use super::types::DispatchJob;

/// What happened to one due job in a pass.
#[derive(Debug)]
pub enum ProcessOutcome {
    Attempted(AttemptReport),
    /// Another worker claimed the job first, or it was changed before the claim.
    ClaimLost,
    /// No attempt could be made, or the result could not be stored.
    Errored(DispatchError),
}

#[derive(Debug)]
pub struct ProcessedJob {
    pub job_id: JobId,
    pub outcome: ProcessOutcome,
}

#[derive(Clone)]
pub struct RetryScheduler {
    store: Arc<dyn JobStore>,
    executor: Arc<AttemptExecutor>,
    clock: Arc<dyn Clock>,
    claim_lease: Duration,
    concurrency: usize,
}

impl RetryScheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        executor: Arc<AttemptExecutor>,
        clock: Arc<dyn Clock>,
        claim_lease: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            executor,
            clock,
            claim_lease,
            concurrency: concurrency.max(1),
        }
    }

    /// Attempt up to `limit` due jobs, at most `concurrency` at a time.
    ///
    /// Per-job problems are reported in the returned list; only a failure to
    /// read the due set fails the pass.
    pub async fn process_due(&self, limit: usize) -> Result<Vec<ProcessedJob>, DispatchError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let due = self.store.due(self.clock.now(), limit).await?;
        if due.is_empty() {
            return Ok(Vec::new());
        }
        debug!(due = due.len(), "processing due dispatch jobs");

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        for job in due {
            let permits = permits.clone();
            let scheduler = self.clone();
            tasks.spawn(async move {
                // Claim only once a slot is free so the lease is not spent waiting.
                let _permit = permits.acquire_owned().await;
                scheduler.claim_and_execute(job).await
            });
        }

        let mut processed = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(job) => processed.push(job),
                Err(e) => error!(error = %e, "dispatch attempt task failed"),
            }
        }
        Ok(processed)
    }

    /// Claim `job` at the version it was read with and attempt it.
    pub async fn claim_and_execute(&self, job: DispatchJob) -> ProcessedJob {
        let job_id = job.id;
        let outcome = match self.claim(&job).await {
            Ok(Some(claimed)) => match self.executor.execute(claimed).await {
                Ok(report) => ProcessOutcome::Attempted(report),
                Err(e) => ProcessOutcome::Errored(e),
            },
            Ok(None) => ProcessOutcome::ClaimLost,
            Err(e) => ProcessOutcome::Errored(e),
        };
        ProcessedJob { job_id, outcome }
    }

    async fn claim(&self, job: &DispatchJob) -> Result<Option<DispatchJob>, DispatchError> {
        let mut claimed = job.clone();
        if claimed.claim(self.clock.now(), self.claim_lease).is_err() {
            debug!(job_id = %job.id, status = %job.status, "job no longer claimable");
            return Ok(None);
        }
        match self.store.compare_and_swap(&claimed, job.version).await {
            Ok(stored) => Ok(Some(stored)),
            Err(JobStoreError::Conflict { .. }) => {
                debug!(job_id = %job.id, "claim lost to another worker");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Run `process_due` every `interval` until the handle is shut down.
    pub fn spawn(self, interval: Duration, batch: usize) -> SchedulerHandle {
        let (shutdown, mut stop) = watch::channel(false);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval_ms = interval.as_millis() as u64, batch, "dispatch scheduler started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.process_due(batch).await {
                            warn!(error = %e, "scheduler pass failed");
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("dispatch scheduler stopped");
        });
        SchedulerHandle { shutdown, join }
    }
}

impl std::fmt::Debug for RetryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryScheduler")
            .field("claim_lease", &self.claim_lease)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

/// Handle to stop a spawned scheduler loop.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop after the current pass and wait for the loop to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "dispatch scheduler task failed");
        }
    }
}
