//! The dispatch engine: one entry point over the store, scheduler and
//! dead-letter manager.

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use courier_contract::{SandboxReadiness, ValidationReport, sandbox_readiness};
use courier_core::{ActorId, Clock, ContractType, DispatchTarget, EncounterId, JobId, NoteId, Vendor};

use crate::audit::{AuditRecord, AuditSink};
use crate::config::{ConfigError, DispatchConfig};
use crate::error::DispatchError;
use crate::jobs::{
    AttemptExecutor, DeadLetterManager, DeadLetterSummary, DispatchJob, JobFilter, JobStore, NewJob,
    PayloadSnapshot, ProcessOutcome, ProcessedJob, RetryScheduler,
};
use crate::transport::TransportRegistry;

/// A finished document handed over for delivery.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub encounter_id: EncounterId,
    pub note_id: NoteId,
    pub actor_id: ActorId,
    pub target: DispatchTarget,
    pub vendor: Vendor,
    /// When given, must match the contract the route enforces.
    pub contract_type: Option<ContractType>,
    pub payload: Value,
    /// Defaults to the configured attempt budget.
    pub max_attempts: Option<u32>,
}

pub struct DispatchEngine {
    config: DispatchConfig,
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    scheduler: RetryScheduler,
    dead_letters: DeadLetterManager,
}

impl DispatchEngine {
    pub fn new(
        config: DispatchConfig,
        store: Arc<dyn JobStore>,
        transports: TransportRegistry,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let executor = AttemptExecutor::new(store.clone(), transports, clock.clone(), audit.clone())
            .with_retry_policy(config.retry.clone())
            .with_attempt_timeout(config.attempt_timeout);
        let scheduler = RetryScheduler::new(
            store.clone(),
            Arc::new(executor),
            clock.clone(),
            config.claim_lease,
            config.concurrency,
        );
        let dead_letters = DeadLetterManager::new(store.clone(), clock.clone(), audit.clone())
            .with_replay_reset_attempts(config.replay_reset_attempts);

        Self {
            config,
            store,
            clock,
            audit,
            scheduler,
            dead_letters,
        }
    }

    /// Build the engine with every transport the configuration supports.
    pub fn from_config(
        config: DispatchConfig,
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, ConfigError> {
        let transports = TransportRegistry::from_config(&config, clock.clone())?;
        Ok(Self::new(config, store, transports, clock, audit))
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &RetryScheduler {
        &self.scheduler
    }

    /// Validate and persist a new job, then try it once if the fast path is on.
    ///
    /// A rejected payload never becomes a job. A failed fast-path attempt does
    /// not fail the call; the job is returned as stored afterwards.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<DispatchJob, DispatchError> {
        let max_attempts = request.max_attempts.unwrap_or(self.config.retry.max_attempts);
        if max_attempts == 0 {
            return Err(DispatchError::InvalidRequest("maxAttempts must be at least 1".into()));
        }

        let report = self.validate(request.target, request.vendor, &request.payload);
        if !report.ok {
            warn!(
                target_system = %request.target,
                vendor = %request.vendor,
                errors = report.errors.len(),
                "payload rejected at enqueue"
            );
            return Err(DispatchError::Validation {
                target: request.target,
                vendor: request.vendor,
                report,
            });
        }
        let contract_type = report.contract_type.unwrap_or(ContractType::None);
        match request.contract_type {
            Some(requested) if requested != contract_type => {
                return Err(DispatchError::InvalidRequest(format!(
                    "contract type {requested} does not match the {contract_type} contract of {}/{}",
                    request.target, request.vendor
                )));
            }
            _ => {}
        }

        let now = self.clock.now();
        let job = DispatchJob::new(
            NewJob {
                encounter_id: request.encounter_id,
                note_id: request.note_id,
                created_by: request.actor_id,
                target: request.target,
                vendor: request.vendor,
                contract_type,
                payload: PayloadSnapshot::capture(request.payload),
                max_attempts,
            },
            now,
        );
        self.store.insert(&job).await?;

        info!(
            job_id = %job.id,
            encounter_id = %job.encounter_id,
            target_system = %job.target,
            vendor = %job.vendor,
            "dispatch job enqueued"
        );
        self.audit.record(AuditRecord::new(
            "dispatch.enqueue",
            Some(request.actor_id),
            None,
            &job,
            now,
        ));

        if !self.config.fast_path {
            return Ok(job);
        }
        let ProcessedJob { job_id, outcome } = self.scheduler.claim_and_execute(job).await;
        match outcome {
            ProcessOutcome::Attempted(report) => Ok(report.job),
            ProcessOutcome::ClaimLost => self.get(job_id).await,
            ProcessOutcome::Errored(e) => {
                warn!(job_id = %job_id, error = %e, "fast-path attempt not made");
                self.get(job_id).await
            }
        }
    }

    pub async fn process_due(&self, limit: usize) -> Result<Vec<ProcessedJob>, DispatchError> {
        self.scheduler.process_due(limit).await
    }

    /// Operator-triggered scheduler pass. Each job the pass touched gets a
    /// `dispatch.retry_due` audit record attributed to `actor_id`.
    pub async fn retry_due(&self, limit: usize, actor_id: ActorId) -> Result<Vec<ProcessedJob>, DispatchError> {
        let processed = self.scheduler.process_due(limit).await?;
        info!(actor_id = %actor_id, limit, processed = processed.len(), "retry-due pass triggered");

        let now = self.clock.now();
        for entry in &processed {
            let job = match &entry.outcome {
                ProcessOutcome::Attempted(report) => Some(report.job.clone()),
                ProcessOutcome::ClaimLost | ProcessOutcome::Errored(_) => match self.store.get(entry.job_id).await {
                    Ok(job) => job,
                    Err(e) => {
                        warn!(job_id = %entry.job_id, error = %e, "could not load job for retry-due audit");
                        None
                    }
                },
            };
            if let Some(job) = job {
                self.audit.record(
                    AuditRecord::new("dispatch.retry_due", Some(actor_id), None, &job, now)
                        .with_reason(format!("operator retry-due pass (limit {limit})")),
                );
            }
        }
        Ok(processed)
    }

    pub async fn get(&self, job_id: JobId) -> Result<DispatchJob, DispatchError> {
        self.store
            .get(job_id)
            .await?
            .ok_or(DispatchError::NotFound(job_id))
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<DispatchJob>, DispatchError> {
        self.dead_letters.list(filter).await
    }

    pub async fn mark_dead_letter(
        &self,
        job_id: JobId,
        reason: &str,
        actor_id: ActorId,
    ) -> Result<DispatchJob, DispatchError> {
        self.dead_letters.mark_dead_letter(job_id, reason, actor_id).await
    }

    pub async fn replay(&self, job_id: JobId, actor_id: ActorId) -> Result<DispatchJob, DispatchError> {
        self.dead_letters.replay(job_id, actor_id).await
    }

    pub async fn summary(&self, window_minutes: u32) -> Result<DeadLetterSummary, DispatchError> {
        self.dead_letters.summary(window_minutes).await
    }

    pub fn validate(&self, target: DispatchTarget, vendor: Vendor, payload: &Value) -> ValidationReport {
        courier_contract::validate(target, vendor, payload)
    }

    /// Readiness of every (target, vendor) route under the current configuration.
    pub fn sandbox_readiness(&self) -> Vec<SandboxReadiness> {
        DispatchTarget::ALL
            .iter()
            .flat_map(|target| {
                Vendor::ALL.iter().map(move |vendor| {
                    sandbox_readiness(*target, *vendor, &self.config.transport.presence_for(*vendor))
                })
            })
            .collect()
    }
}

impl std::fmt::Debug for DispatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchEngine")
            .field("config", &self.config)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}
