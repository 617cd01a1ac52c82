//! Job storage implementations.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use courier_core::{DispatchTarget, EncounterId, JobId};

use super::types::{DispatchJob, JobStatus};

/// Job store abstraction.
///
/// Writes are compare-and-swap on `version`: the caller loads a job, applies a
/// transition to a copy and hands it back with the version it read. The store
/// persists it with `version + 1` or reports a conflict.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a freshly created job.
    async fn insert(&self, job: &DispatchJob) -> Result<(), JobStoreError>;

    /// Get a job by ID.
    async fn get(&self, job_id: JobId) -> Result<Option<DispatchJob>, JobStoreError>;

    /// Active jobs whose `next_retry_at` has passed, earliest first.
    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DispatchJob>, JobStoreError>;

    /// Write `job` if the stored version still equals `expected_version`.
    async fn compare_and_swap(
        &self,
        job: &DispatchJob,
        expected_version: u64,
    ) -> Result<DispatchJob, JobStoreError>;

    /// Jobs matching `filter`, most recently updated first.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<DispatchJob>, JobStoreError>;

    /// Status counts plus dead-letter figures since `since`.
    async fn stats(&self, since: DateTime<Utc>) -> Result<JobStats, JobStoreError>;

    /// Other jobs on `target` already holding `external_message_id`.
    async fn find_by_external_message_id(
        &self,
        target: DispatchTarget,
        external_message_id: &str,
    ) -> Result<Vec<JobId>, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {job_id} was modified concurrently (expected version {expected}, found {actual})")]
    Conflict { job_id: JobId, expected: u64, actual: u64 },
    #[error("refusing write: {0}")]
    Invariant(String),
    #[error("storage error: {0}")]
    Storage(String),
}

pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 500;

/// Listing filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub encounter_id: Option<EncounterId>,
    pub target: Option<DispatchTarget>,
    pub limit: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            status: None,
            encounter_id: None,
            target: None,
            limit: DEFAULT_LIST_LIMIT,
        }
    }
}

impl JobFilter {
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Limit clamped to `1..=MAX_LIST_LIMIT`.
    pub fn effective_limit(&self) -> usize {
        self.limit.clamp(1, MAX_LIST_LIMIT)
    }

    pub fn matches(&self, job: &DispatchJob) -> bool {
        self.status.is_none_or(|s| job.status == s)
            && self.encounter_id.is_none_or(|e| job.encounter_id == e)
            && self.target.is_none_or(|t| job.target == t)
    }
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    pub pending: usize,
    pub retrying: usize,
    pub dispatched: usize,
    pub failed: usize,
    pub dead_letter: usize,
    /// Jobs dead-lettered at or after the window start.
    pub dead_letter_in_window: usize,
    pub oldest_dead_letter_at: Option<DateTime<Utc>>,
    pub dead_letter_by_target: BTreeMap<DispatchTarget, usize>,
}

impl JobStats {
    pub(crate) fn count(&mut self, job: &DispatchJob, since: DateTime<Utc>) {
        match job.status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Retrying => self.retrying += 1,
            JobStatus::Dispatched => self.dispatched += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::DeadLetter => {
                self.dead_letter += 1;
                *self.dead_letter_by_target.entry(job.target).or_default() += 1;
                if let Some(at) = job.dead_lettered_at {
                    if at >= since {
                        self.dead_letter_in_window += 1;
                    }
                    self.oldest_dead_letter_at = Some(self.oldest_dead_letter_at.map_or(at, |o| o.min(at)));
                }
            }
        }
    }
}

/// Checks every store applies before a compare-and-swap write.
pub(crate) fn check_update(current: &DispatchJob, next: &DispatchJob) -> Result<(), JobStoreError> {
    if current.payload() != next.payload() {
        return Err(JobStoreError::Invariant(format!("payload of job {} is immutable", current.id)));
    }
    if current.status == JobStatus::Dispatched && next.status != JobStatus::Dispatched {
        return Err(JobStoreError::Invariant(format!(
            "job {} is dispatched and cannot move to {}",
            current.id, next.status
        )));
    }
    next.check_invariants().map_err(JobStoreError::Invariant)
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, DispatchJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<JobId, DispatchJob>>, JobStoreError> {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<JobId, DispatchJob>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".into()))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &DispatchJob) -> Result<(), JobStoreError> {
        job.check_invariants().map_err(JobStoreError::Invariant)?;
        let mut jobs = self.write()?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<DispatchJob>, JobStoreError> {
        Ok(self.read()?.get(&job_id).cloned())
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DispatchJob>, JobStoreError> {
        let jobs = self.read()?;
        let mut due: Vec<_> = jobs.values().filter(|j| j.is_due(now)).cloned().collect();
        due.sort_by_key(|j| (j.next_retry_at, j.id));
        due.truncate(limit);
        Ok(due)
    }

    async fn compare_and_swap(
        &self,
        job: &DispatchJob,
        expected_version: u64,
    ) -> Result<DispatchJob, JobStoreError> {
        let mut jobs = self.write()?;
        let current = jobs.get(&job.id).ok_or(JobStoreError::NotFound(job.id))?;
        if current.version != expected_version {
            return Err(JobStoreError::Conflict {
                job_id: job.id,
                expected: expected_version,
                actual: current.version,
            });
        }
        check_update(current, job)?;

        let mut stored = job.clone();
        stored.version = expected_version + 1;
        jobs.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<DispatchJob>, JobStoreError> {
        let jobs = self.read()?;
        let mut result: Vec<_> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        result.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        result.truncate(filter.effective_limit());
        Ok(result)
    }

    async fn stats(&self, since: DateTime<Utc>) -> Result<JobStats, JobStoreError> {
        let jobs = self.read()?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.count(job, since);
        }
        Ok(stats)
    }

    async fn find_by_external_message_id(
        &self,
        target: DispatchTarget,
        external_message_id: &str,
    ) -> Result<Vec<JobId>, JobStoreError> {
        let jobs = self.read()?;
        let mut ids: Vec<_> = jobs
            .values()
            .filter(|j| j.target == target && j.external_message_id.as_deref() == Some(external_message_id))
            .map(|j| j.id)
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::tests::{new_job, t0};
    use std::time::Duration;

    #[tokio::test]
    async fn insert_and_get() {
        let store = InMemoryJobStore::new();
        let job = new_job(3);
        store.insert(&job).await.unwrap();

        assert_eq!(store.get(job.id).await.unwrap(), Some(job.clone()));
        assert_eq!(store.insert(&job).await, Err(JobStoreError::AlreadyExists(job.id)));
    }

    #[tokio::test]
    async fn compare_and_swap_bumps_version_and_detects_conflicts() {
        let store = InMemoryJobStore::new();
        let job = new_job(3);
        store.insert(&job).await.unwrap();

        let mut claimed = job.clone();
        claimed.claim(t0(), Duration::from_secs(60)).unwrap();
        let stored = store.compare_and_swap(&claimed, 0).await.unwrap();
        assert_eq!(stored.version, 1);

        // A second worker holding the stale copy loses.
        let mut rival = job.clone();
        rival.claim(t0(), Duration::from_secs(60)).unwrap();
        assert!(matches!(
            store.compare_and_swap(&rival, 0).await,
            Err(JobStoreError::Conflict { expected: 0, actual: 1, .. })
        ));
    }

    #[tokio::test]
    async fn compare_and_swap_refuses_invariant_violations() {
        let store = InMemoryJobStore::new();
        let job = new_job(3);
        store.insert(&job).await.unwrap();

        let mut broken = job.clone();
        broken.status = JobStatus::Dispatched;
        assert!(matches!(
            store.compare_and_swap(&broken, 0).await,
            Err(JobStoreError::Invariant(_))
        ));
    }

    #[tokio::test]
    async fn dispatched_job_cannot_be_rewritten() {
        let store = InMemoryJobStore::new();
        let mut job = new_job(3);
        store.insert(&job).await.unwrap();
        job.record_delivered("abc".into(), t0(), t0()).unwrap();
        let stored = store.compare_and_swap(&job, 0).await.unwrap();

        let mut rewind = stored.clone();
        rewind.status = JobStatus::Pending;
        rewind.external_message_id = None;
        rewind.dispatched_at = None;
        rewind.next_retry_at = Some(t0());
        assert!(matches!(
            store.compare_and_swap(&rewind, 1).await,
            Err(JobStoreError::Invariant(_))
        ));
    }

    #[tokio::test]
    async fn due_skips_terminal_and_future_jobs() {
        let store = InMemoryJobStore::new();
        let due = new_job(3);
        let mut later = new_job(3);
        later.next_retry_at = Some(t0() + chrono::Duration::minutes(5));
        let mut done = new_job(3);
        done.record_delivered("x".into(), t0(), t0()).unwrap();
        for job in [&due, &later, &done] {
            store.insert(job).await.unwrap();
        }

        let ids: Vec<_> = store.due(t0(), 10).await.unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![due.id]);
    }

    #[tokio::test]
    async fn list_filters_and_limits() {
        let store = InMemoryJobStore::new();
        let mut dead = new_job(3);
        dead.force_dead_letter("stop".into(), t0()).unwrap();
        store.insert(&dead).await.unwrap();
        for _ in 0..3 {
            store.insert(&new_job(3)).await.unwrap();
        }

        let dead_only = store
            .list(&JobFilter::default().with_status(JobStatus::DeadLetter))
            .await
            .unwrap();
        assert_eq!(dead_only.len(), 1);
        assert_eq!(dead_only[0].id, dead.id);

        let limited = store.list(&JobFilter::default().with_limit(2)).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn stats_count_dead_letters_in_window() {
        let store = InMemoryJobStore::new();
        let mut old = new_job(3);
        old.force_dead_letter("old".into(), t0() - chrono::Duration::hours(2)).unwrap();
        let mut recent = new_job(3);
        recent.force_dead_letter("recent".into(), t0()).unwrap();
        store.insert(&old).await.unwrap();
        store.insert(&recent).await.unwrap();
        store.insert(&new_job(3)).await.unwrap();

        let stats = store.stats(t0() - chrono::Duration::minutes(60)).await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.dead_letter, 2);
        assert_eq!(stats.dead_letter_in_window, 1);
        assert_eq!(stats.oldest_dead_letter_at, old.dead_lettered_at);
        assert_eq!(stats.dead_letter_by_target.get(&DispatchTarget::Webhook), Some(&2));
    }
}
