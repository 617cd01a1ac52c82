use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use courier_core::{ContractType, DispatchTarget, EncounterId, JobId, NoteId, Vendor};
use courier_infra::jobs::{AttemptDisposition, DispatchJob, JobStatus, ProcessOutcome, ProcessedJob};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueJobRequest {
    pub encounter_id: EncounterId,
    pub note_id: NoteId,
    pub target: DispatchTarget,
    #[serde(default)]
    pub vendor: Option<Vendor>,
    #[serde(default)]
    pub contract_type: Option<ContractType>,
    pub payload: Value,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RetryDueRequest {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct DeadLetterRequest {
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    pub target: DispatchTarget,
    #[serde(default)]
    pub vendor: Option<Vendor>,
    pub payload: Value,
}

/// Raw query strings; parsed in the handler so bad values get a JSON 400.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub encounter_id: Option<String>,
    pub target: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryQuery {
    pub window_minutes: Option<u32>,
}

// -------------------------
// Response DTOs
// -------------------------

/// Operational projection of a job. The payload is never exposed.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: JobId,
    pub encounter_id: EncounterId,
    pub note_id: NoteId,
    pub target: DispatchTarget,
    pub vendor: Vendor,
    pub contract_type: ContractType,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub dead_lettered_at: Option<DateTime<Utc>>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub external_message_id: Option<String>,
    pub payload_digest: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&DispatchJob> for JobView {
    fn from(job: &DispatchJob) -> Self {
        Self {
            id: job.id,
            encounter_id: job.encounter_id,
            note_id: job.note_id,
            target: job.target,
            vendor: job.vendor,
            contract_type: job.contract_type,
            status: job.status,
            attempt_count: job.attempt_count,
            max_attempts: job.max_attempts,
            next_retry_at: job.next_retry_at,
            last_error: job.last_error.clone(),
            dead_lettered_at: job.dead_lettered_at,
            dispatched_at: job.dispatched_at,
            external_message_id: job.external_message_id.clone(),
            payload_digest: job.payload().digest().to_string(),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedJobView {
    pub job_id: JobId,
    /// `claim_lost`, `error`, or the attempt disposition.
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<JobView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&ProcessedJob> for ProcessedJobView {
    fn from(processed: &ProcessedJob) -> Self {
        let (outcome, job, error) = match &processed.outcome {
            ProcessOutcome::Attempted(report) => (
                disposition_str(report.disposition),
                Some(JobView::from(&report.job)),
                report.failure.as_ref().map(ToString::to_string),
            ),
            ProcessOutcome::ClaimLost => ("claim_lost", None, None),
            ProcessOutcome::Errored(e) => ("error", None, Some(e.to_string())),
        };
        Self {
            job_id: processed.job_id,
            outcome,
            job,
            error,
        }
    }
}

fn disposition_str(disposition: AttemptDisposition) -> &'static str {
    match disposition {
        AttemptDisposition::Dispatched => "dispatched",
        AttemptDisposition::Rescheduled => "rescheduled",
        AttemptDisposition::Failed => "failed",
        AttemptDisposition::DeadLettered => "dead_lettered",
        AttemptDisposition::Superseded => "superseded",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn enqueue_request_uses_camel_case_and_optional_fields() {
        let body = json!({
            "encounterId": uuid::Uuid::now_v7(),
            "noteId": uuid::Uuid::now_v7(),
            "target": "webhook",
            "payload": {"note": "x"}
        });
        let req: EnqueueJobRequest = serde_json::from_value(body).unwrap();
        assert_eq!(req.target, DispatchTarget::Webhook);
        assert_eq!(req.vendor, None);
        assert_eq!(req.max_attempts, None);
    }
}
