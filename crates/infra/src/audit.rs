//! Audit trail for job state changes and operator actions.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};

use courier_core::{ActorId, JobId};

use crate::jobs::DispatchJob;

/// One audited change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub action: &'static str,
    pub job_id: JobId,
    /// `None` for changes made by the engine itself.
    pub actor_id: Option<ActorId>,
    pub before: Option<Value>,
    pub after: Value,
    pub reason: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        action: &'static str,
        actor_id: Option<ActorId>,
        before: Option<&DispatchJob>,
        after: &DispatchJob,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            action,
            job_id: after.id,
            actor_id,
            before: before.map(audit_state),
            after: audit_state(after),
            reason: None,
            recorded_at,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Job state as it appears in audit records. Never includes the payload.
pub fn audit_state(job: &DispatchJob) -> Value {
    json!({
        "status": job.status,
        "attemptCount": job.attempt_count,
        "nextRetryAt": job.next_retry_at,
        "lastError": job.last_error,
        "deadLetteredAt": job.dead_lettered_at,
        "externalMessageId": job.external_message_id,
        "version": job.version,
    })
}

pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);
}

/// Writes audit records as structured events on the `audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: AuditRecord) {
        let before = record.before.as_ref().map(Value::to_string).unwrap_or_default();
        let actor = record
            .actor_id
            .map(|a| a.to_string())
            .unwrap_or_else(|| "system".into());
        tracing::info!(
            target: "audit",
            action = record.action,
            job_id = %record.job_id,
            actor_id = %actor,
            reason = record.reason.as_deref().unwrap_or(""),
            before = %before,
            after = %record.after,
            recorded_at = %record.recorded_at,
            "dispatch job audited"
        );
    }
}

/// Keeps records in memory; used by tests and local runs.
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn actions_for(&self, job_id: JobId) -> Vec<&'static str> {
        self.records()
            .into_iter()
            .filter(|r| r.job_id == job_id)
            .map(|r| r.action)
            .collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&self, record: AuditRecord) {
        let mut records = match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        records.push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::tests::{new_job, t0};

    #[test]
    fn audit_state_omits_payload() {
        let job = new_job(3);
        let state = audit_state(&job);
        assert_eq!(state["status"], "PENDING");
        assert!(state.get("payload").is_none());
        assert!(!state.to_string().contains("Follow up"));
    }

    #[test]
    fn in_memory_sink_collects_records() {
        let sink = InMemoryAuditSink::new();
        let before = new_job(3);
        let mut after = before.clone();
        after.force_dead_letter("stop".into(), t0()).unwrap();

        sink.record(AuditRecord::new("dispatch.dead_letter", Some(ActorId::new()), Some(&before), &after, t0()).with_reason("stop"));

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].before.as_ref().unwrap()["status"], "PENDING");
        assert_eq!(records[0].after["status"], "DEAD_LETTER");
        assert_eq!(sink.actions_for(after.id), vec!["dispatch.dead_letter"]);
    }
}
