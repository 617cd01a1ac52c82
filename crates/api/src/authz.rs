//! API-side authorization guard.
//!
//! Checked in each handler before the engine is called, keeping the engine
//! itself auth-agnostic.

use axum::http::StatusCode;
use axum::response::Response;

use courier_auth::{Permission, Principal, authorize};

use crate::app::errors;
use crate::context::PrincipalContext;

/// Check that the request principal holds `required`.
pub fn require(principal: &PrincipalContext, required: &Permission) -> Result<(), Response> {
    let principal = Principal::from_roles(principal.actor_id(), principal.roles().to_vec());
    authorize(&principal, required)
        .map_err(|e| errors::json_error(StatusCode::FORBIDDEN, "forbidden", e.to_string()))
}
