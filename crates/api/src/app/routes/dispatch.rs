use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use courier_auth::Permission;
use courier_core::{DispatchTarget, EncounterId, JobId, Vendor};
use courier_infra::EnqueueRequest;
use courier_infra::jobs::{JobFilter, JobStatus, store::DEFAULT_LIST_LIMIT};

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::authz::require;
use crate::context::PrincipalContext;

/// Jobs per `retry-due` call when the body names no limit.
const DEFAULT_RETRY_BATCH: usize = 25;
const MAX_RETRY_BATCH: usize = 500;
const DEFAULT_SUMMARY_WINDOW_MINUTES: u32 = 60;

pub fn router() -> Router {
    Router::new()
        .route("/jobs", post(enqueue_job).get(list_jobs))
        .route("/jobs/:job_id", get(get_job))
        .route("/retry-due", post(retry_due))
        .route("/summary", get(summary))
        .route("/contract/validate", post(validate_contract))
        .route("/sandbox-readiness", get(sandbox_readiness))
        .route("/:job_id/replay", post(replay))
        .route("/:job_id/dead-letter", post(dead_letter))
}

pub async fn enqueue_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Json(body): Json<dto::EnqueueJobRequest>,
) -> axum::response::Response {
    if let Err(denied) = require(&principal, &Permission::DISPATCH_ENQUEUE) {
        return denied;
    }

    let request = EnqueueRequest {
        encounter_id: body.encounter_id,
        note_id: body.note_id,
        actor_id: principal.actor_id(),
        target: body.target,
        vendor: body.vendor.unwrap_or_default(),
        contract_type: body.contract_type,
        payload: body.payload,
        max_attempts: body.max_attempts,
    };

    match services.engine.enqueue(request).await {
        Ok(job) => (StatusCode::CREATED, Json(dto::JobView::from(&job))).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Query(query): Query<dto::ListJobsQuery>,
) -> axum::response::Response {
    if let Err(denied) = require(&principal, &Permission::DISPATCH_READ) {
        return denied;
    }

    let filter = match list_filter(&query) {
        Ok(filter) => filter,
        Err(response) => return response,
    };

    match services.engine.list(&filter).await {
        Ok(jobs) => {
            let jobs: Vec<dto::JobView> = jobs.iter().map(dto::JobView::from).collect();
            Json(json!({ "jobs": jobs, "count": jobs.len() })).into_response()
        }
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

fn list_filter(query: &dto::ListJobsQuery) -> Result<JobFilter, axum::response::Response> {
    let status = query
        .status
        .as_deref()
        .map(|s| errors::parse_param::<JobStatus>(s, "invalid_status", "status"))
        .transpose()?;
    let encounter_id = query
        .encounter_id
        .as_deref()
        .map(|s| errors::parse_param::<EncounterId>(s, "invalid_id", "encounter id"))
        .transpose()?;
    let target = query
        .target
        .as_deref()
        .map(|s| errors::parse_param::<DispatchTarget>(s, "invalid_target", "target"))
        .transpose()?;

    Ok(JobFilter {
        status,
        encounter_id,
        target,
        limit: query.limit.unwrap_or(DEFAULT_LIST_LIMIT),
    })
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    if let Err(denied) = require(&principal, &Permission::DISPATCH_READ) {
        return denied;
    }
    let job_id: JobId = match errors::parse_param(&job_id, "invalid_id", "job id") {
        Ok(id) => id,
        Err(response) => return response,
    };

    match services.engine.get(job_id).await {
        Ok(job) => Json(dto::JobView::from(&job)).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn retry_due(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    body: Bytes,
) -> axum::response::Response {
    if let Err(denied) = require(&principal, &Permission::DISPATCH_OPERATE) {
        return denied;
    }
    let limit = match retry_limit(&body) {
        Ok(limit) => limit,
        Err(response) => return response,
    };

    match services.engine.retry_due(limit, principal.actor_id()).await {
        Ok(processed) => {
            let processed: Vec<dto::ProcessedJobView> = processed.iter().map(dto::ProcessedJobView::from).collect();
            Json(json!({ "processed": processed, "count": processed.len() })).into_response()
        }
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

/// The body is optional; when present it must be a valid `RetryDueRequest`.
fn retry_limit(body: &[u8]) -> Result<usize, axum::response::Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(DEFAULT_RETRY_BATCH);
    }
    let request: dto::RetryDueRequest = serde_json::from_slice(body).map_err(|e| {
        errors::json_error(StatusCode::BAD_REQUEST, "invalid_body", format!("invalid retry-due body: {e}"))
    })?;
    Ok(request.limit.unwrap_or(DEFAULT_RETRY_BATCH).min(MAX_RETRY_BATCH))
}

pub async fn replay(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    if let Err(denied) = require(&principal, &Permission::DISPATCH_OPERATE) {
        return denied;
    }
    let job_id: JobId = match errors::parse_param(&job_id, "invalid_id", "job id") {
        Ok(id) => id,
        Err(response) => return response,
    };

    match services.engine.replay(job_id, principal.actor_id()).await {
        Ok(job) => Json(dto::JobView::from(&job)).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn dead_letter(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(job_id): Path<String>,
    Json(body): Json<dto::DeadLetterRequest>,
) -> axum::response::Response {
    if let Err(denied) = require(&principal, &Permission::DISPATCH_OPERATE) {
        return denied;
    }
    let job_id: JobId = match errors::parse_param(&job_id, "invalid_id", "job id") {
        Ok(id) => id,
        Err(response) => return response,
    };

    match services
        .engine
        .mark_dead_letter(job_id, &body.reason, principal.actor_id())
        .await
    {
        Ok(job) => Json(dto::JobView::from(&job)).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn summary(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Query(query): Query<dto::SummaryQuery>,
) -> axum::response::Response {
    if let Err(denied) = require(&principal, &Permission::DISPATCH_READ) {
        return denied;
    }
    let window = query.window_minutes.unwrap_or(DEFAULT_SUMMARY_WINDOW_MINUTES);

    match services.engine.summary(window).await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn validate_contract(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Json(body): Json<dto::ValidateRequest>,
) -> axum::response::Response {
    if let Err(denied) = require(&principal, &Permission::DISPATCH_READ) {
        return denied;
    }
    let vendor: Vendor = body.vendor.unwrap_or_default();
    let report = services.engine.validate(body.target, vendor, &body.payload);
    Json(report).into_response()
}

pub async fn sandbox_readiness(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
) -> axum::response::Response {
    if let Err(denied) = require(&principal, &Permission::DISPATCH_READ) {
        return denied;
    }
    let routes = services.engine.sandbox_readiness();
    let ready = routes.iter().filter(|r| r.ready).count();
    Json(json!({ "routes": routes, "readyCount": ready })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_limit_defaults_only_for_an_absent_body() {
        assert_eq!(retry_limit(b"").unwrap(), DEFAULT_RETRY_BATCH);
        assert_eq!(retry_limit(b"  \n").unwrap(), DEFAULT_RETRY_BATCH);
        assert_eq!(retry_limit(b"{}").unwrap(), DEFAULT_RETRY_BATCH);
        assert_eq!(retry_limit(br#"{"limit": 7}"#).unwrap(), 7);
        assert_eq!(retry_limit(br#"{"limit": 100000}"#).unwrap(), MAX_RETRY_BATCH);
    }

    #[test]
    fn malformed_retry_body_is_a_bad_request() {
        for body in [&b"{not json"[..], br#"{"limit": "ten"}"#, br#"{"limit": -1}"#] {
            let response = retry_limit(body).unwrap_err();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
    }
}
