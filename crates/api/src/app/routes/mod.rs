use axum::{routing::get, Router};

pub mod dispatch;
pub mod system;

/// Router for all authenticated endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .nest("/dispatch", dispatch::router())
}
