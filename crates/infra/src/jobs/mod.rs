//! Dispatch jobs: model, retry policy, storage and the workers that move them.
//!
//! ## Components
//!
//! - `DispatchJob`: one outbound delivery and its state machine
//! - `JobStore`: persistence with compare-and-swap writes (in-memory or Postgres)
//! - `AttemptExecutor`: one delivery attempt and the transition it causes
//! - `RetryScheduler`: claims due jobs and runs them with bounded concurrency
//! - `DeadLetterManager`: operator visibility, forced dead-letter and replay

pub mod backoff;
pub mod dead_letter;
pub mod executor;
pub mod postgres;
pub mod scheduler;
pub mod store;
pub mod types;

pub use backoff::RetryPolicy;
pub use dead_letter::{DeadLetterManager, DeadLetterSummary};
pub use executor::{AttemptDisposition, AttemptExecutor, AttemptReport};
pub use postgres::PostgresJobStore;
pub use scheduler::{ProcessOutcome, ProcessedJob, RetryScheduler, SchedulerHandle};
pub use store::{InMemoryJobStore, JobFilter, JobStats, JobStore, JobStoreError};
pub use types::{
    AttemptRecord, AttemptResult, DispatchJob, JobStatus, NewJob, PayloadSnapshot, TransitionError,
};
