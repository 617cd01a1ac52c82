//! Shared HTTP plumbing for the webhook and vendor API transports.

use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Client, Identity, RequestBuilder, redirect};
use serde_json::Value;

use crate::config::ConfigError;
use crate::jobs::DispatchJob;

use super::{DeliveryOutcome, FailureKind, TransportFailure};

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";
pub const JOB_ID_HEADER: &str = "X-Courier-Job-Id";
pub const MESSAGE_ID_HEADER: &str = "X-Message-Id";

/// Response keys checked for a message id when the route has no specific ones.
pub const GENERIC_ID_KEYS: &[&str] = &["externalMessageId", "messageId", "message_id", "id"];

const ERROR_BODY_SNIPPET: usize = 200;

/// Stable per (job, payload) so a counterparty can drop retried duplicates.
pub fn idempotency_key(job: &DispatchJob) -> String {
    let digest = job.payload().digest();
    format!("{}-{}", job.id, digest.get(..16).unwrap_or(digest))
}

pub fn build_client(
    connect_timeout: Duration,
    request_timeout: Duration,
    identity: Option<Identity>,
) -> Result<Client, ConfigError> {
    let mut builder = Client::builder()
        .connect_timeout(connect_timeout)
        .timeout(request_timeout)
        .redirect(redirect::Policy::none());
    if let Some(identity) = identity {
        builder = builder.identity(identity);
    }
    builder
        .build()
        .map_err(|e| ConfigError::HttpClient(e.to_string()))
}

/// `None` means delivered.
pub fn classify_status(status: u16) -> Option<FailureKind> {
    match status {
        200..=299 => None,
        408 | 425 | 429 => Some(FailureKind::Throttled),
        500..=599 => Some(FailureKind::ServerError),
        300..=399 => Some(FailureKind::Redirect),
        _ => Some(FailureKind::ClientError),
    }
}

pub fn classify_error(err: &reqwest::Error) -> TransportFailure {
    if err.is_timeout() {
        TransportFailure::timeout(format!("request timed out: {err}"))
    } else if err.is_connect() {
        TransportFailure::new(FailureKind::Connection, format!("connection failed: {err}"))
    } else if err.is_builder() {
        TransportFailure::new(FailureKind::InvalidRequest, err.to_string())
    } else {
        TransportFailure::new(FailureKind::Connection, format!("request failed: {err}"))
    }
}

/// Send `request` and turn the response into an outcome.
///
/// The proof of delivery is the first id found in the body under `id_keys`,
/// then the `X-Message-Id` header, then `fallback_id`.
pub async fn send(request: RequestBuilder, id_keys: &[&str], fallback_id: &str) -> DeliveryOutcome {
    let response = match request.send().await {
        Ok(response) => response,
        Err(err) => return DeliveryOutcome::Failed(classify_error(&err)),
    };

    let status = response.status().as_u16();
    let header_id = message_id_header(response.headers());
    let body = response.bytes().await.unwrap_or_default();

    match classify_status(status) {
        None => {
            let id = external_id_from_body(&body, id_keys)
                .or(header_id)
                .unwrap_or_else(|| fallback_id.to_string());
            DeliveryOutcome::delivered(id)
        }
        Some(kind) => DeliveryOutcome::failed(kind, format!("http {status}: {}", snippet(&body))),
    }
}

fn message_id_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(MESSAGE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

pub fn external_id_from_body(body: &[u8], keys: &[&str]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let scopes = [Some(&value), value.get("data")];
    scopes
        .into_iter()
        .flatten()
        .find_map(|scope| keys.iter().find_map(|key| id_value(scope.get(*key)?)))
}

fn id_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_owned()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn snippet(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        return "<empty body>".to_owned();
    }
    text.chars().take(ERROR_BODY_SNIPPET).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(200), None);
        assert_eq!(classify_status(204), None);
        assert_eq!(classify_status(429), Some(FailureKind::Throttled));
        assert_eq!(classify_status(503), Some(FailureKind::ServerError));
        assert_eq!(classify_status(422), Some(FailureKind::ClientError));
        assert_eq!(classify_status(302), Some(FailureKind::Redirect));
        assert!(classify_status(502).unwrap().is_retryable());
        assert!(!classify_status(400).unwrap().is_retryable());
    }

    #[test]
    fn external_id_prefers_listed_keys_in_order() {
        let body = br#"{"id": "row-7", "externalMessageId": "abc"}"#;
        assert_eq!(external_id_from_body(body, GENERIC_ID_KEYS).as_deref(), Some("abc"));
    }

    #[test]
    fn external_id_looks_inside_data_and_accepts_numbers() {
        let body = br#"{"data": {"documentid": 991}}"#;
        assert_eq!(external_id_from_body(body, &["documentid"]).as_deref(), Some("991"));
    }

    #[test]
    fn external_id_ignores_blank_and_non_json() {
        assert_eq!(external_id_from_body(br#"{"id": "  "}"#, GENERIC_ID_KEYS), None);
        assert_eq!(external_id_from_body(b"accepted", GENERIC_ID_KEYS), None);
    }

    #[test]
    fn snippet_truncates() {
        let long = "x".repeat(500);
        assert_eq!(snippet(long.as_bytes()).len(), ERROR_BODY_SNIPPET);
        assert_eq!(snippet(b"  "), "<empty body>");
    }
}
