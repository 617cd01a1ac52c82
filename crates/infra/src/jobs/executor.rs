//! Attempt executor: one delivery attempt and the transition it causes.
//!
//! The executor is handed a job that has already been claimed. It picks the
//! transport for the job's target, re-checks the contract, runs the attempt
//! under a timeout and writes the outcome back with a compare-and-swap on the
//! claimed version.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use courier_core::Clock;

use crate::audit::{AuditRecord, AuditSink};
use crate::error::DispatchError;
use crate::transport::{DeliveryOutcome, FailureKind, TransportFailure, TransportRegistry};

use super::backoff::RetryPolicy;
use super::store::{JobStore, JobStoreError};
use super::types::{DispatchJob, JobStatus, TransitionError};

/// Write attempts for a delivery whose first write lost a race.
const DELIVERY_WRITE_ATTEMPTS: usize = 3;

/// Where an attempt left the job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptDisposition {
    Dispatched,
    Rescheduled,
    Failed,
    DeadLettered,
    /// Someone else changed the job while the attempt was in flight; their
    /// write stands and this attempt's failure was discarded.
    Superseded,
}

impl AttemptDisposition {
    fn of(status: JobStatus) -> Self {
        match status {
            JobStatus::Dispatched => Self::Dispatched,
            JobStatus::Failed => Self::Failed,
            JobStatus::DeadLetter => Self::DeadLettered,
            JobStatus::Pending | JobStatus::Retrying => Self::Rescheduled,
        }
    }

    fn audit_action(&self) -> &'static str {
        match self {
            Self::Dispatched => "dispatch.attempt.delivered",
            Self::Rescheduled => "dispatch.attempt.retry_scheduled",
            Self::Failed => "dispatch.attempt.failed",
            Self::DeadLettered => "dispatch.attempt.dead_lettered",
            Self::Superseded => "dispatch.attempt.superseded",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttemptReport {
    /// The job as stored after the attempt.
    pub job: DispatchJob,
    pub disposition: AttemptDisposition,
    pub failure: Option<TransportFailure>,
}

pub struct AttemptExecutor {
    store: Arc<dyn JobStore>,
    transports: TransportRegistry,
    policy: RetryPolicy,
    attempt_timeout: Duration,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
}

impl AttemptExecutor {
    pub fn new(
        store: Arc<dyn JobStore>,
        transports: TransportRegistry,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            store,
            transports,
            policy: RetryPolicy::default(),
            attempt_timeout: Duration::from_secs(15),
            clock,
            audit,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Make one delivery attempt without writing anything.
    ///
    /// Transport failures come back as `Ok(DeliveryOutcome::Failed)`. `Err` means
    /// no attempt was possible at all (no transport for the route).
    pub async fn attempt(&self, job: &DispatchJob) -> Result<DeliveryOutcome, DispatchError> {
        let transport = self.transports.resolve(job.target, job.vendor)?;

        let report = courier_contract::validate(job.target, job.vendor, job.payload().value());
        if !report.ok {
            return Ok(DeliveryOutcome::failed(
                FailureKind::Contract,
                format!("payload no longer satisfies its contract: {}", report.summary()),
            ));
        }

        match tokio::time::timeout(self.attempt_timeout, transport.deliver(job)).await {
            Ok(outcome) => Ok(outcome),
            Err(_) => Ok(DeliveryOutcome::Failed(TransportFailure::timeout(format!(
                "no response within {}ms",
                self.attempt_timeout.as_millis()
            )))),
        }
    }

    /// Attempt a claimed job and persist the outcome.
    #[instrument(
        skip(self, claimed),
        fields(job_id = %claimed.id, target = %claimed.target, attempt = claimed.attempt_count + 1)
    )]
    pub async fn execute(&self, claimed: DispatchJob) -> Result<AttemptReport, DispatchError> {
        let started_at = self.clock.now();
        let outcome = match self.attempt(&claimed).await {
            Ok(outcome) => outcome,
            Err(fault) => {
                self.record_fault(&claimed, &fault).await;
                return Err(fault);
            }
        };
        let finished_at = self.clock.now();

        let mut next = claimed.clone();
        let disposition = self
            .apply(&mut next, &outcome, started_at, finished_at)
            .map_err(|e| DispatchError::transition(claimed.id, e))?;

        match self.store.compare_and_swap(&next, claimed.version).await {
            Ok(stored) => Ok(self.finish(&claimed, stored, disposition, &outcome).await),
            Err(JobStoreError::Conflict { .. }) => {
                self.resolve_conflict(&claimed, outcome, started_at, finished_at).await
            }
            Err(source) => match outcome {
                DeliveryOutcome::Delivered { external_message_id } => {
                    error!(%external_message_id, error = %source, "delivered but proof of delivery not stored");
                    Err(DispatchError::DeliveryNotRecorded {
                        job_id: claimed.id,
                        external_message_id,
                        source,
                    })
                }
                DeliveryOutcome::Failed(_) => Err(source.into()),
            },
        }
    }

    fn apply(
        &self,
        job: &mut DispatchJob,
        outcome: &DeliveryOutcome,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Result<AttemptDisposition, TransitionError> {
        match outcome {
            DeliveryOutcome::Delivered { external_message_id } => {
                job.record_delivered(external_message_id.clone(), started_at, finished_at)?;
            }
            DeliveryOutcome::Failed(failure) if failure.is_retryable() => {
                let retry_at = self.policy.next_attempt_at(
                    finished_at,
                    job.attempt_count + 1,
                    &mut rand::thread_rng(),
                );
                job.record_retryable_failure(failure.to_string(), started_at, finished_at, retry_at)?;
            }
            DeliveryOutcome::Failed(failure) => {
                job.record_permanent_failure(failure.to_string(), started_at, finished_at)?;
            }
        }
        Ok(AttemptDisposition::of(job.status))
    }

    /// The first write lost a race. A delivery still has to be recorded; a
    /// failure yields to whatever was written in the meantime.
    async fn resolve_conflict(
        &self,
        claimed: &DispatchJob,
        outcome: DeliveryOutcome,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Result<AttemptReport, DispatchError> {
        let external_message_id = match &outcome {
            DeliveryOutcome::Delivered { external_message_id } => external_message_id,
            DeliveryOutcome::Failed(_) => {
                let current = self
                    .store
                    .get(claimed.id)
                    .await?
                    .ok_or(DispatchError::NotFound(claimed.id))?;
                warn!(status = %current.status, "job changed during attempt; discarding failed attempt");
                return Ok(self
                    .finish(claimed, current, AttemptDisposition::Superseded, &outcome)
                    .await);
            }
        };

        let mut last_error = None;
        for _ in 0..DELIVERY_WRITE_ATTEMPTS {
            let current = self
                .store
                .get(claimed.id)
                .await?
                .ok_or(DispatchError::NotFound(claimed.id))?;
            if current.status == JobStatus::Dispatched {
                return Ok(self
                    .finish(claimed, current, AttemptDisposition::Superseded, &outcome)
                    .await);
            }

            let mut next = current.clone();
            if let Err(e) = next.record_delivered(external_message_id.clone(), started_at, finished_at) {
                error!(
                    %external_message_id,
                    status = %current.status,
                    "delivered but job was moved to a terminal state during the attempt"
                );
                self.audit.record(
                    AuditRecord::new("dispatch.attempt.delivery_unrecorded", None, Some(claimed), &current, finished_at)
                        .with_reason(format!("delivered as {external_message_id}: {e}")),
                );
                return Err(DispatchError::transition(claimed.id, e));
            }
            match self.store.compare_and_swap(&next, current.version).await {
                Ok(stored) => {
                    return Ok(self
                        .finish(claimed, stored, AttemptDisposition::Dispatched, &outcome)
                        .await);
                }
                Err(JobStoreError::Conflict { .. }) => continue,
                Err(e) => {
                    last_error = Some(e);
                    break;
                }
            }
        }

        let source = last_error.unwrap_or(JobStoreError::Conflict {
            job_id: claimed.id,
            expected: claimed.version,
            actual: claimed.version,
        });
        error!(%external_message_id, error = %source, "delivered but proof of delivery not stored");
        Err(DispatchError::DeliveryNotRecorded {
            job_id: claimed.id,
            external_message_id: external_message_id.clone(),
            source,
        })
    }

    async fn finish(
        &self,
        claimed: &DispatchJob,
        stored: DispatchJob,
        disposition: AttemptDisposition,
        outcome: &DeliveryOutcome,
    ) -> AttemptReport {
        let failure = match outcome {
            DeliveryOutcome::Failed(failure) => Some(failure.clone()),
            DeliveryOutcome::Delivered { .. } => None,
        };

        match disposition {
            AttemptDisposition::Dispatched => {
                info!(
                    external_message_id = stored.external_message_id.as_deref().unwrap_or_default(),
                    attempts = stored.attempt_count,
                    "job dispatched"
                );
                self.warn_on_duplicate_proof(&stored).await;
            }
            AttemptDisposition::Rescheduled => warn!(
                next_retry_at = ?stored.next_retry_at,
                error = stored.last_error.as_deref().unwrap_or_default(),
                "attempt failed; retry scheduled"
            ),
            AttemptDisposition::Failed => warn!(
                error = stored.last_error.as_deref().unwrap_or_default(),
                "attempt failed permanently"
            ),
            AttemptDisposition::DeadLettered => error!(
                attempts = stored.attempt_count,
                error = stored.last_error.as_deref().unwrap_or_default(),
                "retries exhausted; job dead-lettered"
            ),
            AttemptDisposition::Superseded => {}
        }

        let mut record = AuditRecord::new(
            disposition.audit_action(),
            None,
            Some(claimed),
            &stored,
            stored.updated_at,
        );
        if let Some(failure) = &failure {
            record = record.with_reason(failure.to_string());
        }
        self.audit.record(record);

        AttemptReport {
            job: stored,
            disposition,
            failure,
        }
    }

    async fn warn_on_duplicate_proof(&self, job: &DispatchJob) {
        let Some(external_message_id) = job.external_message_id.as_deref() else {
            return;
        };
        match self
            .store
            .find_by_external_message_id(job.target, external_message_id)
            .await
        {
            Ok(ids) => {
                let others: Vec<_> = ids.into_iter().filter(|id| *id != job.id).collect();
                if !others.is_empty() {
                    warn!(
                        external_message_id,
                        other_jobs = ?others,
                        "counterparty returned a message id already recorded on another job"
                    );
                }
            }
            Err(e) => warn!(error = %e, "duplicate proof-of-delivery check failed"),
        }
    }

    /// No attempt was possible. The job is halted as FAILED with the fault as
    /// its error; no attempt is consumed and an operator replay re-arms it.
    async fn record_fault(&self, claimed: &DispatchJob, fault: &DispatchError) {
        error!(error = %fault, "cannot attempt delivery; halting job");
        let now = self.clock.now();
        let mut halted = claimed.clone();
        if halted.record_configuration_fault(fault.to_string(), now).is_err() {
            return;
        }
        match self.store.compare_and_swap(&halted, claimed.version).await {
            Ok(stored) => self.audit.record(
                AuditRecord::new("dispatch.attempt.halted", None, Some(claimed), &stored, now)
                    .with_reason(fault.to_string()),
            ),
            Err(e) => warn!(error = %e, "could not record fault on job"),
        }
    }
}

impl std::fmt::Debug for AttemptExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttemptExecutor")
            .field("transports", &self.transports)
            .field("policy", &self.policy)
            .field("attempt_timeout", &self.attempt_timeout)
            .finish()
    }
}
