//! Dispatch job model and its state machine.
//!
//! Every transition is a method on [`DispatchJob`] taking an explicit `now`, so
//! the scheduler, executor and operator actions share one set of rules and tests
//! can drive time by hand. Stores persist whatever these methods produce and
//! re-check [`DispatchJob::check_invariants`] before every write.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use courier_core::{ActorId, ContractType, DispatchTarget, EncounterId, JobId, NoteId, Vendor};

/// Lifecycle status of a dispatch job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Enqueued (or replayed), waiting for its first attempt.
    Pending,
    /// At least one retryable failure; waiting for `next_retry_at`.
    Retrying,
    /// Delivered; `external_message_id` holds the proof.
    Dispatched,
    /// Non-retryable failure.
    Failed,
    /// Retries exhausted or forced by an operator.
    DeadLetter,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        Self::Pending,
        Self::Retrying,
        Self::Dispatched,
        Self::Failed,
        Self::DeadLetter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Retrying => "RETRYING",
            Self::Dispatched => "DISPATCHED",
            Self::Failed => "FAILED",
            Self::DeadLetter => "DEAD_LETTER",
        }
    }

    /// Terminal jobs are never selected by the scheduler.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Dispatched | Self::Failed | Self::DeadLetter)
    }

    pub fn is_replayable(&self) -> bool {
        matches!(self, Self::Failed | Self::DeadLetter)
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = courier_core::DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| courier_core::DomainError::unknown("job status", s))
    }
}

/// The payload exactly as it was accepted at enqueue time.
///
/// Cloning is cheap; the canonical text and parsed value are shared.
#[derive(Debug, Clone)]
pub struct PayloadSnapshot {
    text: Arc<str>,
    value: Arc<Value>,
    digest: String,
}

impl PayloadSnapshot {
    /// Capture a payload, serializing it once into canonical JSON.
    pub fn capture(value: Value) -> Self {
        let text = value.to_string();
        let digest = sha256_hex(text.as_bytes());
        Self {
            text: Arc::from(text),
            value: Arc::new(value),
            digest,
        }
    }

    /// Rebuild a snapshot from stored text, verifying the stored digest.
    pub fn restore(text: String, digest: &str) -> Result<Self, String> {
        let actual = sha256_hex(text.as_bytes());
        if actual != digest {
            return Err(format!(
                "payload digest mismatch: stored {digest}, computed {actual}"
            ));
        }
        let value: Value =
            serde_json::from_str(&text).map_err(|e| format!("stored payload is not JSON: {e}"))?;
        Ok(Self {
            text: Arc::from(text),
            value: Arc::new(value),
            digest: actual,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.text.as_bytes()
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Hex SHA-256 of the canonical text.
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl PartialEq for PayloadSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest && self.text == other.text
    }
}

impl Eq for PayloadSnapshot {}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// How one delivery attempt ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptResult {
    Delivered,
    RetryableFailure,
    PermanentFailure,
}

/// Record of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub result: AttemptResult,
    pub error: Option<String>,
    pub external_message_id: Option<String>,
}

/// Rejected state transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("cannot {action} a job in status {from}")]
    InvalidState { from: JobStatus, action: &'static str },
    #[error("job is not due until {0}")]
    NotDue(DateTime<Utc>),
}

/// Everything needed to create a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub encounter_id: EncounterId,
    pub note_id: NoteId,
    pub created_by: ActorId,
    pub target: DispatchTarget,
    pub vendor: Vendor,
    pub contract_type: ContractType,
    pub payload: PayloadSnapshot,
    pub max_attempts: u32,
}

/// A unit of outbound delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchJob {
    pub id: JobId,
    pub encounter_id: EncounterId,
    pub note_id: NoteId,
    pub created_by: ActorId,
    pub target: DispatchTarget,
    pub vendor: Vendor,
    pub contract_type: ContractType,
    pub(crate) payload: PayloadSnapshot,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub dead_lettered_at: Option<DateTime<Utc>>,
    pub external_message_id: Option<String>,
    pub last_error: Option<String>,
    /// Bumped by the store on every successful write.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<AttemptRecord>,
}

impl DispatchJob {
    /// A new PENDING job, due immediately.
    pub fn new(draft: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            encounter_id: draft.encounter_id,
            note_id: draft.note_id,
            created_by: draft.created_by,
            target: draft.target,
            vendor: draft.vendor,
            contract_type: draft.contract_type,
            payload: draft.payload,
            status: JobStatus::Pending,
            attempt_count: 0,
            max_attempts: draft.max_attempts.max(1),
            next_retry_at: Some(now),
            dispatched_at: None,
            dead_lettered_at: None,
            external_message_id: None,
            last_error: None,
            version: 0,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        }
    }

    pub fn payload(&self) -> &PayloadSnapshot {
        &self.payload
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && self.next_retry_at.is_some_and(|at| at <= now)
    }

    /// Take the job for one attempt by pushing `next_retry_at` out by `lease`.
    ///
    /// Persisted with a version check, this is what keeps two workers off the
    /// same job. If the worker dies the lease expires and the job is due again.
    pub fn claim(&mut self, now: DateTime<Utc>, lease: Duration) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::InvalidState {
                from: self.status,
                action: "claim",
            });
        }
        if let Some(at) = self.next_retry_at.filter(|at| *at > now) {
            return Err(TransitionError::NotDue(at));
        }
        self.next_retry_at = Some(now + chrono_duration(lease));
        self.updated_at = now;
        Ok(())
    }

    /// Record a successful delivery and its proof.
    pub fn record_delivered(
        &mut self,
        external_message_id: String,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.ensure_active("record delivery for")?;
        self.attempt_count += 1;
        self.status = JobStatus::Dispatched;
        self.next_retry_at = None;
        self.dispatched_at = Some(now);
        self.external_message_id = Some(external_message_id.clone());
        self.updated_at = now;
        self.push_attempt(started_at, now, AttemptResult::Delivered, None, Some(external_message_id));
        Ok(())
    }

    /// Record a retryable failure. Reschedules at `retry_at`, or dead-letters
    /// the job when this attempt used up the budget.
    pub fn record_retryable_failure(
        &mut self,
        error: String,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
        retry_at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.ensure_active("record a failure for")?;
        self.attempt_count += 1;
        self.updated_at = now;
        self.push_attempt(started_at, now, AttemptResult::RetryableFailure, Some(error.clone()), None);

        if self.attempt_count >= self.max_attempts {
            self.status = JobStatus::DeadLetter;
            self.next_retry_at = None;
            self.dead_lettered_at = Some(now);
            self.last_error = Some(format!(
                "{error} (retries exhausted after {} attempts)",
                self.attempt_count
            ));
        } else {
            self.status = JobStatus::Retrying;
            self.next_retry_at = Some(retry_at.max(now));
            self.last_error = Some(error);
        }
        Ok(())
    }

    /// Record a non-retryable failure.
    pub fn record_permanent_failure(
        &mut self,
        error: String,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.ensure_active("record a failure for")?;
        self.attempt_count += 1;
        self.status = JobStatus::Failed;
        self.next_retry_at = None;
        self.last_error = Some(error.clone());
        self.updated_at = now;
        self.push_attempt(started_at, now, AttemptResult::PermanentFailure, Some(error), None);
        Ok(())
    }

    /// Halt a job that cannot be attempted at all (no transport for its route).
    ///
    /// The job goes to FAILED without consuming an attempt, so a replay after
    /// the route is configured still has the full budget.
    pub fn record_configuration_fault(&mut self, error: String, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_active("record a fault for")?;
        self.status = JobStatus::Failed;
        self.next_retry_at = None;
        self.last_error = Some(format!("configuration error: {error}"));
        self.updated_at = now;
        Ok(())
    }

    /// Operator action: stop retrying a job that has not finished.
    pub fn force_dead_letter(&mut self, reason: String, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_active("dead-letter")?;
        self.status = JobStatus::DeadLetter;
        self.next_retry_at = None;
        self.dead_lettered_at = Some(now);
        self.last_error = Some(reason);
        self.updated_at = now;
        Ok(())
    }

    /// Operator action: send a FAILED or DEAD_LETTER job around again.
    ///
    /// `reset_attempts_to` is clamped so at least one attempt remains.
    pub fn replay(&mut self, reset_attempts_to: u32, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if !self.status.is_replayable() {
            return Err(TransitionError::InvalidState {
                from: self.status,
                action: "replay",
            });
        }
        self.status = JobStatus::Pending;
        self.attempt_count = reset_attempts_to.min(self.max_attempts.saturating_sub(1));
        self.last_error = None;
        self.dead_lettered_at = None;
        self.external_message_id = None;
        self.next_retry_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Structural invariants every persisted job must satisfy.
    pub fn check_invariants(&self) -> Result<(), String> {
        let terminal = self.status.is_terminal();
        if terminal == self.next_retry_at.is_some() {
            return Err(format!(
                "job {} in {} must {}have next_retry_at",
                self.id,
                self.status,
                if terminal { "not " } else { "" }
            ));
        }
        let dispatched = self.status == JobStatus::Dispatched;
        if dispatched != self.external_message_id.is_some() {
            return Err(format!(
                "job {} in {} has inconsistent external_message_id",
                self.id, self.status
            ));
        }
        if dispatched != self.dispatched_at.is_some() {
            return Err(format!("job {} in {} has inconsistent dispatched_at", self.id, self.status));
        }
        if (self.status == JobStatus::DeadLetter) != self.dead_lettered_at.is_some() {
            return Err(format!(
                "job {} in {} has inconsistent dead_lettered_at",
                self.id, self.status
            ));
        }
        if self.attempt_count > self.max_attempts
            || (!terminal && self.attempt_count >= self.max_attempts)
        {
            return Err(format!(
                "job {} in {} has attempt_count {} against max_attempts {}",
                self.id, self.status, self.attempt_count, self.max_attempts
            ));
        }
        Ok(())
    }

    fn ensure_active(&self, action: &'static str) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::InvalidState {
                from: self.status,
                action,
            });
        }
        Ok(())
    }

    fn push_attempt(
        &mut self,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        result: AttemptResult,
        error: Option<String>,
        external_message_id: Option<String>,
    ) {
        self.history.push(AttemptRecord {
            attempt: self.attempt_count,
            started_at,
            finished_at,
            result,
            error,
            external_message_id,
        });
    }
}

pub(crate) fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(3650))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T09:00:00Z")
            .map(|t| t.with_timezone(&Utc))
            .unwrap()
    }

    pub(crate) fn new_job(max_attempts: u32) -> DispatchJob {
        DispatchJob::new(
            NewJob {
                encounter_id: EncounterId::new(),
                note_id: NoteId::new(),
                created_by: ActorId::new(),
                target: DispatchTarget::Webhook,
                vendor: Vendor::Generic,
                contract_type: ContractType::None,
                payload: PayloadSnapshot::capture(json!({"note": "Follow up in two weeks"})),
                max_attempts,
            },
            t0(),
        )
    }

    #[test]
    fn new_job_is_pending_and_due() {
        let job = new_job(3);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt_count, 0);
        assert!(job.is_due(t0()));
        job.check_invariants().unwrap();
    }

    #[test]
    fn claim_pushes_next_retry_out_and_blocks_second_claim() {
        let mut job = new_job(3);
        job.claim(t0(), Duration::from_secs(60)).unwrap();
        assert_eq!(job.next_retry_at, Some(t0() + chrono::Duration::seconds(60)));
        assert!(!job.is_due(t0()));
        assert!(matches!(
            job.claim(t0(), Duration::from_secs(60)),
            Err(TransitionError::NotDue(_))
        ));
        job.check_invariants().unwrap();
    }

    #[test]
    fn delivery_records_proof_and_clears_schedule() {
        let mut job = new_job(3);
        job.record_delivered("abc".into(), t0(), t0()).unwrap();
        assert_eq!(job.status, JobStatus::Dispatched);
        assert_eq!(job.external_message_id.as_deref(), Some("abc"));
        assert_eq!(job.next_retry_at, None);
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.history[0].result, AttemptResult::Delivered);
        job.check_invariants().unwrap();
    }

    #[test]
    fn dispatched_job_rejects_further_transitions() {
        let mut job = new_job(3);
        job.record_delivered("abc".into(), t0(), t0()).unwrap();
        assert!(job.claim(t0(), Duration::from_secs(1)).is_err());
        assert!(job.record_retryable_failure("x".into(), t0(), t0(), t0()).is_err());
        assert!(job.force_dead_letter("x".into(), t0()).is_err());
        assert!(job.replay(0, t0()).is_err());
    }

    #[test]
    fn exhausting_attempts_dead_letters_exactly_at_max() {
        let mut job = new_job(3);
        for n in 1..=3u32 {
            let later = t0() + chrono::Duration::minutes(n as i64);
            job.record_retryable_failure("timeout: no response".into(), t0(), t0(), later)
                .unwrap();
            if n < 3 {
                assert_eq!(job.status, JobStatus::Retrying);
                assert_eq!(job.next_retry_at, Some(later));
            }
            job.check_invariants().unwrap();
        }
        assert_eq!(job.status, JobStatus::DeadLetter);
        assert_eq!(job.attempt_count, 3);
        assert_eq!(job.next_retry_at, None);
        assert!(job.dead_lettered_at.is_some());
        assert!(job.last_error.as_deref().unwrap().contains("timeout"));
    }

    #[test]
    fn permanent_failure_short_circuits() {
        let mut job = new_job(5);
        job.record_permanent_failure("http 422: bad note".into(), t0(), t0()).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.next_retry_at, None);
        job.check_invariants().unwrap();
    }

    #[test]
    fn replay_resets_dead_letter() {
        let mut job = new_job(2);
        job.force_dead_letter("operator stop".into(), t0()).unwrap();
        let later = t0() + chrono::Duration::hours(1);
        job.replay(0, later).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt_count, 0);
        assert_eq!(job.last_error, None);
        assert_eq!(job.dead_lettered_at, None);
        assert_eq!(job.next_retry_at, Some(later));
        job.check_invariants().unwrap();
    }

    #[test]
    fn replay_reset_is_clamped_below_max_attempts() {
        let mut job = new_job(3);
        job.record_permanent_failure("rejected".into(), t0(), t0()).unwrap();
        job.replay(10, t0()).unwrap();
        assert_eq!(job.attempt_count, 2);
        job.check_invariants().unwrap();
    }

    #[test]
    fn replay_of_active_job_is_rejected() {
        let mut job = new_job(3);
        assert_eq!(
            job.replay(0, t0()),
            Err(TransitionError::InvalidState {
                from: JobStatus::Pending,
                action: "replay"
            })
        );
    }

    #[test]
    fn configuration_fault_halts_without_consuming_attempts() {
        let mut job = new_job(3);
        job.claim(t0(), Duration::from_secs(30)).unwrap();
        job.record_configuration_fault("no transport configured for mllp/generic".into(), t0())
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt_count, 0);
        assert_eq!(job.next_retry_at, None);
        assert!(job.history.is_empty());
        assert!(!job.is_due(t0() + chrono::Duration::days(1)));
        job.check_invariants().unwrap();

        job.replay(0, t0()).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt_count, 0);
    }

    #[test]
    fn snapshot_restore_verifies_digest() {
        let snap = PayloadSnapshot::capture(json!({"a": 1}));
        let restored = PayloadSnapshot::restore(snap.as_str().to_string(), snap.digest()).unwrap();
        assert_eq!(restored, snap);
        assert!(PayloadSnapshot::restore("{\"a\":2}".into(), snap.digest()).is_err());
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("dead_letter".parse::<JobStatus>().unwrap(), JobStatus::DeadLetter);
        assert_eq!(" PENDING ".parse::<JobStatus>().unwrap(), JobStatus::Pending);
        assert!("running".parse::<JobStatus>().is_err());
    }
}
