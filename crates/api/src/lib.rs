//! HTTP API: operator and workflow surface of the dispatch engine.

pub mod app;
pub mod authz;
pub mod context;
pub mod middleware;
