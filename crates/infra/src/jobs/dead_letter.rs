//! Dead-letter quarantine and the operator controls around it.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use courier_core::{ActorId, Clock, DispatchTarget, JobId};

use crate::audit::{AuditRecord, AuditSink};
use crate::error::DispatchError;

use super::store::{JobFilter, JobStore, JobStoreError};
use super::types::{DispatchJob, TransitionError};

/// Operator writes re-read and re-apply this many times on a version conflict.
const OPERATOR_WRITE_ATTEMPTS: usize = 3;

/// Alerting figures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterSummary {
    pub window_minutes: u32,
    pub dead_letter_recent_count: usize,
    pub dead_letter_total: usize,
    pub failed_total: usize,
    pub retrying_total: usize,
    pub pending_total: usize,
    pub oldest_dead_letter_at: Option<DateTime<Utc>>,
    pub dead_letter_by_target: BTreeMap<DispatchTarget, usize>,
}

pub struct DeadLetterManager {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    replay_reset_attempts: u32,
}

impl DeadLetterManager {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            store,
            clock,
            audit,
            replay_reset_attempts: 0,
        }
    }

    /// Attempt count a replayed job restarts from.
    pub fn with_replay_reset_attempts(mut self, attempts: u32) -> Self {
        self.replay_reset_attempts = attempts;
        self
    }

    /// Force a job that has not finished into DEAD_LETTER.
    pub async fn mark_dead_letter(
        &self,
        job_id: JobId,
        reason: &str,
        actor_id: ActorId,
    ) -> Result<DispatchJob, DispatchError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(DispatchError::InvalidRequest("a dead-letter reason is required".into()));
        }
        let now = self.clock.now();
        let (before, after) = self
            .update(job_id, |job| job.force_dead_letter(reason.to_string(), now))
            .await?;

        info!(job_id = %job_id, actor_id = %actor_id, reason, "job dead-lettered by operator");
        self.audit.record(
            AuditRecord::new("dispatch.dead_letter", Some(actor_id), Some(&before), &after, now)
                .with_reason(reason),
        );
        Ok(after)
    }

    /// Re-arm a FAILED or DEAD_LETTER job for immediate delivery.
    pub async fn replay(&self, job_id: JobId, actor_id: ActorId) -> Result<DispatchJob, DispatchError> {
        let now = self.clock.now();
        let reset = self.replay_reset_attempts;
        let (before, after) = self.update(job_id, |job| job.replay(reset, now)).await?;

        info!(
            job_id = %job_id,
            actor_id = %actor_id,
            from = %before.status,
            attempt_count = after.attempt_count,
            "job replayed"
        );
        let mut record = AuditRecord::new("dispatch.replay", Some(actor_id), Some(&before), &after, now);
        if let Some(error) = &before.last_error {
            record = record.with_reason(format!("previous error: {error}"));
        }
        self.audit.record(record);
        Ok(after)
    }

    /// Figures for the last `window_minutes`.
    pub async fn summary(&self, window_minutes: u32) -> Result<DeadLetterSummary, DispatchError> {
        let since = self.clock.now() - chrono::Duration::minutes(i64::from(window_minutes));
        let stats = self.store.stats(since).await?;
        Ok(DeadLetterSummary {
            window_minutes,
            dead_letter_recent_count: stats.dead_letter_in_window,
            dead_letter_total: stats.dead_letter,
            failed_total: stats.failed,
            retrying_total: stats.retrying,
            pending_total: stats.pending,
            oldest_dead_letter_at: stats.oldest_dead_letter_at,
            dead_letter_by_target: stats.dead_letter_by_target,
        })
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<DispatchJob>, DispatchError> {
        Ok(self.store.list(filter).await?)
    }

    /// Load, transition and write back, re-reading on version conflicts.
    async fn update<F>(&self, job_id: JobId, transition: F) -> Result<(DispatchJob, DispatchJob), DispatchError>
    where
        F: Fn(&mut DispatchJob) -> Result<(), TransitionError>,
    {
        let mut conflict = None;
        for _ in 0..OPERATOR_WRITE_ATTEMPTS {
            let before = self
                .store
                .get(job_id)
                .await?
                .ok_or(DispatchError::NotFound(job_id))?;
            let mut next = before.clone();
            transition(&mut next).map_err(|e| DispatchError::transition(job_id, e))?;

            match self.store.compare_and_swap(&next, before.version).await {
                Ok(after) => return Ok((before, after)),
                Err(e @ JobStoreError::Conflict { .. }) => conflict = Some(e),
                Err(e) => return Err(e.into()),
            }
        }
        Err(conflict.map_or(DispatchError::Conflict(job_id), DispatchError::from))
    }
}

impl std::fmt::Debug for DeadLetterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterManager")
            .field("replay_reset_attempts", &self.replay_reset_attempts)
            .finish()
    }
}
