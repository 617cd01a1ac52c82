use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use courier_infra::DispatchError;

pub fn dispatch_error_to_response(err: DispatchError) -> axum::response::Response {
    let message = err.to_string();
    match err {
        DispatchError::Validation { report, .. } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            axum::Json(json!({
                "error": "validation_error",
                "message": message,
                "violations": report.errors,
            })),
        )
            .into_response(),
        DispatchError::InvalidRequest(_) => json_error(StatusCode::BAD_REQUEST, "invalid_request", message),
        DispatchError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", message),
        DispatchError::InvalidState { .. } => json_error(StatusCode::CONFLICT, "invalid_state", message),
        DispatchError::Conflict(_) => json_error(StatusCode::CONFLICT, "conflict", message),
        DispatchError::TransportNotConfigured { .. } => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "transport_not_configured", message)
        }
        DispatchError::DeliveryNotRecorded { .. } => {
            tracing::error!(error = %message, "delivery proof lost");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "delivery_not_recorded", message)
        }
        DispatchError::Store(e) => {
            tracing::error!(error = %e, "job store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", "job store unavailable")
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

/// Parse a path or query value, answering 400 with `code` when it does not parse.
pub fn parse_param<T: std::str::FromStr>(
    raw: &str,
    code: &'static str,
    what: &str,
) -> Result<T, axum::response::Response>
where
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e| json_error(StatusCode::BAD_REQUEST, code, format!("invalid {what}: {e}")))
}
