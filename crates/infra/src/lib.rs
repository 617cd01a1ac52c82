//! Infrastructure layer: job storage, transports, retry scheduling and the
//! dispatch engine that ties them together.

pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod transport;


pub use audit::{AuditRecord, AuditSink, InMemoryAuditSink, TracingAuditSink};
pub use config::{ConfigError, DispatchConfig, TransportConfig, WebhookAuthMode};
pub use engine::{DispatchEngine, EnqueueRequest};
pub use error::DispatchError;
