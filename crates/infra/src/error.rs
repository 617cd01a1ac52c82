//! Errors surfaced by the dispatch engine to its callers.
//!
//! Transport failures are not errors here: they become job state transitions.
//! What remains is rejected input, missing jobs, lost races, misconfiguration
//! and storage trouble.

use courier_contract::ValidationReport;
use courier_core::{DispatchTarget, JobId, Vendor};

use crate::jobs::{JobStatus, JobStoreError, TransitionError};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error("payload rejected by the {target}/{vendor} contract: {}", .report.summary())]
    Validation {
        target: DispatchTarget,
        vendor: Vendor,
        report: ValidationReport,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("dispatch job not found: {0}")]
    NotFound(JobId),
    #[error("job {job_id} is {status}; cannot {action}")]
    InvalidState {
        job_id: JobId,
        status: JobStatus,
        action: &'static str,
    },
    #[error("job {0} was modified concurrently; retry the request")]
    Conflict(JobId),
    #[error("no transport configured for {target}/{vendor}")]
    TransportNotConfigured { target: DispatchTarget, vendor: Vendor },
    #[error("job {job_id} was delivered as {external_message_id} but the proof could not be stored: {source}")]
    DeliveryNotRecorded {
        job_id: JobId,
        external_message_id: String,
        #[source]
        source: JobStoreError,
    },
    #[error(transparent)]
    Store(JobStoreError),
}

impl DispatchError {
    pub(crate) fn transition(job_id: JobId, err: TransitionError) -> Self {
        match err {
            TransitionError::InvalidState { from, action } => Self::InvalidState {
                job_id,
                status: from,
                action,
            },
            TransitionError::NotDue(_) => Self::Conflict(job_id),
        }
    }
}

impl From<JobStoreError> for DispatchError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(id) => Self::NotFound(id),
            JobStoreError::Conflict { job_id, .. } => Self::Conflict(job_id),
            other => Self::Store(other),
        }
    }
}
