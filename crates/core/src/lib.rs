//! `courier-core`: shared building blocks for the dispatch engine.
//!
//! This crate contains **pure** primitives (no infrastructure concerns):
//! identifiers, routing enums, the clock abstraction and the domain error.

pub mod clock;
pub mod error;
pub mod id;
pub mod routing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{ActorId, EncounterId, JobId, NoteId};
pub use routing::{ContractType, DispatchTarget, Vendor};
