//! Postgres-backed job store.
//!
//! One row per job in `dispatch_jobs`. Writes are conditional on the `version`
//! column, so concurrent workers race through the database rather than through
//! process-local locks. Check constraints mirror the in-process invariants and
//! a trigger rejects any update that touches the payload columns.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` (insert) |
//! | Database (check constraint violation) | `23514` | `Invariant` |
//! | Database (other) / PoolClosed / Other | any | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::instrument;

use courier_core::{ActorId, DispatchTarget, EncounterId, JobId, NoteId};

use super::store::{JobFilter, JobStats, JobStore, JobStoreError, check_update};
use super::types::{AttemptRecord, DispatchJob, JobStatus, PayloadSnapshot};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS dispatch_jobs (
    id                  UUID PRIMARY KEY,
    encounter_id        UUID NOT NULL,
    note_id             UUID NOT NULL,
    created_by          UUID NOT NULL,
    target              TEXT NOT NULL,
    vendor              TEXT NOT NULL,
    contract_type       TEXT NOT NULL,
    payload             TEXT NOT NULL,
    payload_digest      TEXT NOT NULL,
    status              TEXT NOT NULL,
    attempt_count       INTEGER NOT NULL CHECK (attempt_count >= 0),
    max_attempts        INTEGER NOT NULL CHECK (max_attempts >= 1),
    next_retry_at       TIMESTAMPTZ,
    dispatched_at       TIMESTAMPTZ,
    dead_lettered_at    TIMESTAMPTZ,
    external_message_id TEXT,
    last_error          TEXT,
    history             JSONB NOT NULL DEFAULT '[]'::jsonb,
    version             BIGINT NOT NULL,
    created_at          TIMESTAMPTZ NOT NULL,
    updated_at          TIMESTAMPTZ NOT NULL,
    CONSTRAINT dispatch_jobs_schedule_ck
        CHECK ((next_retry_at IS NULL) = (status IN ('DISPATCHED', 'FAILED', 'DEAD_LETTER'))),
    CONSTRAINT dispatch_jobs_proof_ck
        CHECK ((external_message_id IS NOT NULL) = (status = 'DISPATCHED')),
    CONSTRAINT dispatch_jobs_attempts_ck
        CHECK (attempt_count <= max_attempts)
);

CREATE INDEX IF NOT EXISTS dispatch_jobs_due_idx
    ON dispatch_jobs (next_retry_at) WHERE next_retry_at IS NOT NULL;
CREATE INDEX IF NOT EXISTS dispatch_jobs_encounter_idx
    ON dispatch_jobs (encounter_id, updated_at DESC);
CREATE INDEX IF NOT EXISTS dispatch_jobs_status_idx
    ON dispatch_jobs (status, updated_at DESC);
CREATE INDEX IF NOT EXISTS dispatch_jobs_external_id_idx
    ON dispatch_jobs (target, external_message_id) WHERE external_message_id IS NOT NULL;

CREATE OR REPLACE FUNCTION dispatch_jobs_payload_immutable() RETURNS trigger AS $$
BEGIN
    IF NEW.payload IS DISTINCT FROM OLD.payload
       OR NEW.payload_digest IS DISTINCT FROM OLD.payload_digest THEN
        RAISE EXCEPTION 'dispatch job payload is immutable' USING ERRCODE = 'check_violation';
    END IF;
    RETURN NEW;
END
$$ LANGUAGE plpgsql;

DROP TRIGGER IF EXISTS dispatch_jobs_payload_immutable ON dispatch_jobs;
CREATE TRIGGER dispatch_jobs_payload_immutable
    BEFORE UPDATE ON dispatch_jobs
    FOR EACH ROW EXECUTE FUNCTION dispatch_jobs_payload_immutable();
"#;

const COLUMNS: &str = "id, encounter_id, note_id, created_by, target, vendor, contract_type, \
    payload, payload_digest, status, attempt_count, max_attempts, next_retry_at, dispatched_at, \
    dead_lettered_at, external_message_id, last_error, history, version, created_at, updated_at";

/// Postgres-backed job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    /// Create the table, indexes and payload trigger if they are missing.
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn current_version(&self, job_id: JobId) -> Result<Option<u64>, JobStoreError> {
        let row = sqlx::query("SELECT version FROM dispatch_jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("current_version", e))?;
        row.map(|r| r.try_get::<i64, _>("version").map(|v| v as u64))
            .transpose()
            .map_err(|e| map_sqlx_error("current_version", e))
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn insert(&self, job: &DispatchJob) -> Result<(), JobStoreError> {
        job.check_invariants().map_err(JobStoreError::Invariant)?;
        let query = format!(
            "INSERT INTO dispatch_jobs ({COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)"
        );
        let result = sqlx::query(&query)
            .bind(job.id.as_uuid())
            .bind(job.encounter_id.as_uuid())
            .bind(job.note_id.as_uuid())
            .bind(job.created_by.as_uuid())
            .bind(job.target.as_str())
            .bind(job.vendor.as_str())
            .bind(job.contract_type.as_str())
            .bind(job.payload().as_str())
            .bind(job.payload().digest())
            .bind(job.status.as_str())
            .bind(job.attempt_count as i32)
            .bind(job.max_attempts as i32)
            .bind(job.next_retry_at)
            .bind(job.dispatched_at)
            .bind(job.dead_lettered_at)
            .bind(job.external_message_id.as_deref())
            .bind(job.last_error.as_deref())
            .bind(Json(&job.history))
            .bind(job.version as i64)
            .bind(job.created_at)
            .bind(job.updated_at)
            .execute(&*self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(JobStoreError::AlreadyExists(job.id)),
            Err(e) => Err(map_sqlx_error("insert", e)),
        }
    }

    async fn get(&self, job_id: JobId) -> Result<Option<DispatchJob>, JobStoreError> {
        let query = format!("SELECT {COLUMNS} FROM dispatch_jobs WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DispatchJob>, JobStoreError> {
        let query = format!(
            "SELECT {COLUMNS} FROM dispatch_jobs \
             WHERE status IN ('PENDING', 'RETRYING') AND next_retry_at <= $1 \
             ORDER BY next_retry_at ASC, id ASC LIMIT $2"
        );
        let rows = sqlx::query(&query)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("due", e))?;
        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, status = %job.status), err)]
    async fn compare_and_swap(
        &self,
        job: &DispatchJob,
        expected_version: u64,
    ) -> Result<DispatchJob, JobStoreError> {
        let current = self.get(job.id).await?.ok_or(JobStoreError::NotFound(job.id))?;
        if current.version != expected_version {
            return Err(JobStoreError::Conflict {
                job_id: job.id,
                expected: expected_version,
                actual: current.version,
            });
        }
        check_update(&current, job)?;

        let next_version = expected_version + 1;
        let result = sqlx::query(
            r#"
            UPDATE dispatch_jobs SET
                status = $3,
                attempt_count = $4,
                next_retry_at = $5,
                dispatched_at = $6,
                dead_lettered_at = $7,
                external_message_id = $8,
                last_error = $9,
                history = $10,
                version = $11,
                updated_at = $12
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(expected_version as i64)
        .bind(job.status.as_str())
        .bind(job.attempt_count as i32)
        .bind(job.next_retry_at)
        .bind(job.dispatched_at)
        .bind(job.dead_lettered_at)
        .bind(job.external_message_id.as_deref())
        .bind(job.last_error.as_deref())
        .bind(Json(&job.history))
        .bind(next_version as i64)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("compare_and_swap", e))?;

        if result.rows_affected() == 0 {
            // Lost the race between the read above and the conditional update.
            let actual = self
                .current_version(job.id)
                .await?
                .ok_or(JobStoreError::NotFound(job.id))?;
            return Err(JobStoreError::Conflict {
                job_id: job.id,
                expected: expected_version,
                actual,
            });
        }

        let mut stored = job.clone();
        stored.version = next_version;
        Ok(stored)
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<DispatchJob>, JobStoreError> {
        let query = format!(
            "SELECT {COLUMNS} FROM dispatch_jobs \
             WHERE ($1::TEXT IS NULL OR status = $1) \
               AND ($2::UUID IS NULL OR encounter_id = $2) \
               AND ($3::TEXT IS NULL OR target = $3) \
             ORDER BY updated_at DESC, id DESC LIMIT $4"
        );
        let rows = sqlx::query(&query)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.encounter_id.map(|e| *e.as_uuid()))
            .bind(filter.target.map(|t| t.as_str()))
            .bind(filter.effective_limit() as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list", e))?;
        rows.iter().map(job_from_row).collect()
    }

    async fn stats(&self, since: DateTime<Utc>) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, target,
                   COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE dead_lettered_at >= $1) AS in_window,
                   MIN(dead_lettered_at) AS oldest_dead_letter_at
            FROM dispatch_jobs
            GROUP BY status, target
            "#,
        )
        .bind(since)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let target: String = row.try_get("target").map_err(|e| map_sqlx_error("stats", e))?;
            let total: i64 = row.try_get("total").map_err(|e| map_sqlx_error("stats", e))?;
            let in_window: i64 = row.try_get("in_window").map_err(|e| map_sqlx_error("stats", e))?;
            let oldest: Option<DateTime<Utc>> = row
                .try_get("oldest_dead_letter_at")
                .map_err(|e| map_sqlx_error("stats", e))?;
            let total = total as usize;

            match parse_column::<JobStatus>("status", &status)? {
                JobStatus::Pending => stats.pending += total,
                JobStatus::Retrying => stats.retrying += total,
                JobStatus::Dispatched => stats.dispatched += total,
                JobStatus::Failed => stats.failed += total,
                JobStatus::DeadLetter => {
                    stats.dead_letter += total;
                    stats.dead_letter_in_window += in_window as usize;
                    let target = parse_column::<DispatchTarget>("target", &target)?;
                    *stats.dead_letter_by_target.entry(target).or_default() += total;
                    if let Some(at) = oldest {
                        stats.oldest_dead_letter_at =
                            Some(stats.oldest_dead_letter_at.map_or(at, |o| o.min(at)));
                    }
                }
            }
        }
        Ok(stats)
    }

    async fn find_by_external_message_id(
        &self,
        target: DispatchTarget,
        external_message_id: &str,
    ) -> Result<Vec<JobId>, JobStoreError> {
        let rows = sqlx::query(
            "SELECT id FROM dispatch_jobs WHERE target = $1 AND external_message_id = $2 ORDER BY id",
        )
        .bind(target.as_str())
        .bind(external_message_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_external_message_id", e))?;

        rows.iter()
            .map(|r| {
                r.try_get::<uuid::Uuid, _>("id")
                    .map(JobId::from_uuid)
                    .map_err(|e| map_sqlx_error("find_by_external_message_id", e))
            })
            .collect()
    }
}

fn parse_column<T: core::str::FromStr>(column: &str, value: &str) -> Result<T, JobStoreError>
where
    T::Err: core::fmt::Display,
{
    value
        .parse()
        .map_err(|e| JobStoreError::Storage(format!("bad {column} column '{value}': {e}")))
}

fn job_from_row(row: &PgRow) -> Result<DispatchJob, JobStoreError> {
    let get_err = |e: sqlx::Error| map_sqlx_error("decode_job", e);

    let payload_text: String = row.try_get("payload").map_err(get_err)?;
    let digest: String = row.try_get("payload_digest").map_err(get_err)?;
    let payload = PayloadSnapshot::restore(payload_text, &digest).map_err(JobStoreError::Storage)?;
    let history: Json<Vec<AttemptRecord>> = row.try_get("history").map_err(get_err)?;
    let target: String = row.try_get("target").map_err(get_err)?;
    let vendor: String = row.try_get("vendor").map_err(get_err)?;
    let contract_type: String = row.try_get("contract_type").map_err(get_err)?;
    let status: String = row.try_get("status").map_err(get_err)?;

    Ok(DispatchJob {
        id: JobId::from_uuid(row.try_get("id").map_err(get_err)?),
        encounter_id: EncounterId::from_uuid(row.try_get("encounter_id").map_err(get_err)?),
        note_id: NoteId::from_uuid(row.try_get("note_id").map_err(get_err)?),
        created_by: ActorId::from_uuid(row.try_get("created_by").map_err(get_err)?),
        target: parse_column("target", &target)?,
        vendor: parse_column("vendor", &vendor)?,
        contract_type: parse_column("contract_type", &contract_type)?,
        payload,
        status: parse_column("status", &status)?,
        attempt_count: row.try_get::<i32, _>("attempt_count").map_err(get_err)?.max(0) as u32,
        max_attempts: row.try_get::<i32, _>("max_attempts").map_err(get_err)?.max(1) as u32,
        next_retry_at: row.try_get("next_retry_at").map_err(get_err)?,
        dispatched_at: row.try_get("dispatched_at").map_err(get_err)?,
        dead_lettered_at: row.try_get("dead_lettered_at").map_err(get_err)?,
        external_message_id: row.try_get("external_message_id").map_err(get_err)?,
        last_error: row.try_get("last_error").map_err(get_err)?,
        version: row.try_get::<i64, _>("version").map_err(get_err)?.max(0) as u64,
        created_at: row.try_get("created_at").map_err(get_err)?,
        updated_at: row.try_get("updated_at").map_err(get_err)?,
        history: history.0,
    })
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23514") => JobStoreError::Invariant(msg),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
