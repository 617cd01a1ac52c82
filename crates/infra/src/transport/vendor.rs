//! Vendor HTTP APIs (Epic, Cerner, Athena).
//!
//! The request body comes from the contract crate's vendor mapping; this
//! transport only adds the base URL, the bearer token and the idempotency headers.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use courier_contract::map_vendor_request;
use courier_core::{DispatchTarget, Vendor};

use crate::config::{ConfigError, TransportConfig};
use crate::jobs::DispatchJob;

use super::http::{self, IDEMPOTENCY_KEY_HEADER, JOB_ID_HEADER};
use super::{DeliveryOutcome, FailureKind, Transport};

#[derive(Clone)]
pub struct VendorEndpoint {
    pub base_url: String,
    pub token: String,
}

impl std::fmt::Debug for VendorEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VendorEndpoint")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct VendorApiTransport {
    client: Client,
    endpoints: BTreeMap<Vendor, VendorEndpoint>,
}

impl VendorApiTransport {
    pub fn new(client: Client, endpoints: BTreeMap<Vendor, VendorEndpoint>) -> Self {
        Self { client, endpoints }
    }

    /// Vendors with both a base URL and a token; `None` when there are none.
    pub fn from_config(
        config: &TransportConfig,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Option<Self>, ConfigError> {
        let endpoints: BTreeMap<_, _> = config
            .vendors
            .iter()
            .filter_map(|(vendor, settings)| match (&settings.base_url, &settings.token) {
                (Some(base_url), Some(token)) => Some((
                    *vendor,
                    VendorEndpoint {
                        base_url: base_url.clone(),
                        token: token.clone(),
                    },
                )),
                (Some(_), None) => {
                    tracing::warn!(vendor = %vendor, "vendor base URL set without a token");
                    None
                }
                _ => None,
            })
            .collect();

        if endpoints.is_empty() {
            return Ok(None);
        }
        let client = http::build_client(connect_timeout, request_timeout, None)?;
        Ok(Some(Self::new(client, endpoints)))
    }

    fn url(base_url: &str, path: &str) -> String {
        format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }
}

#[async_trait]
impl Transport for VendorApiTransport {
    fn target(&self) -> DispatchTarget {
        DispatchTarget::VendorApi
    }

    fn supports(&self, vendor: Vendor) -> bool {
        self.endpoints.contains_key(&vendor)
    }

    async fn deliver(&self, job: &DispatchJob) -> DeliveryOutcome {
        let Some(endpoint) = self.endpoints.get(&job.vendor) else {
            return DeliveryOutcome::failed(
                FailureKind::InvalidRequest,
                format!("no endpoint for vendor {}", job.vendor),
            );
        };
        let request = match map_vendor_request(job.vendor, job.payload().value()) {
            Ok(request) => request,
            Err(e) => {
                return DeliveryOutcome::failed(FailureKind::Contract, e.to_string());
            }
        };

        let idempotency_key = http::idempotency_key(job);
        let builder = self
            .client
            .post(Self::url(&endpoint.base_url, &request.path))
            .bearer_auth(&endpoint.token)
            .header(IDEMPOTENCY_KEY_HEADER, &idempotency_key)
            .header(JOB_ID_HEADER, job.id.to_string())
            .json(&request.body);

        // Vendor-specific keys first, then the generic ones.
        let mut keys: Vec<&str> = request.external_id_keys.to_vec();
        keys.extend_from_slice(http::GENERIC_ID_KEYS);
        http::send(builder, &keys, &idempotency_key).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::Router;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use serde_json::{Value, json};
    use tokio::net::TcpListener;

    use courier_core::{ActorId, ContractType, EncounterId, NoteId};

    use super::*;
    use crate::config::VendorSettings;
    use crate::jobs::types::tests::t0;
    use crate::jobs::{NewJob, PayloadSnapshot};

    /// Fake vendor sandbox answering every note with a fixed status and body.
    struct Sandbox {
        status: StatusCode,
        reply: Value,
        seen: Mutex<Vec<(HeaderMap, Value)>>,
    }

    async fn accept_note(
        State(sandbox): State<Arc<Sandbox>>,
        headers: HeaderMap,
        axum::Json(body): axum::Json<Value>,
    ) -> (StatusCode, axum::Json<Value>) {
        sandbox.seen.lock().unwrap().push((headers, body));
        (sandbox.status, axum::Json(sandbox.reply.clone()))
    }

    async fn sandbox(status: StatusCode, reply: Value) -> (Arc<Sandbox>, VendorApiTransport) {
        let sandbox = Arc::new(Sandbox {
            status,
            reply,
            seen: Mutex::new(Vec::new()),
        });
        let app = Router::new()
            .route("/api/clinical-notes", post(accept_note))
            .with_state(sandbox.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = http::build_client(Duration::from_secs(1), Duration::from_secs(2), None).unwrap();
        let endpoints = BTreeMap::from([(
            Vendor::Epic,
            VendorEndpoint {
                base_url: format!("http://{addr}/api/"),
                token: "epic-token".into(),
            },
        )]);
        (sandbox, VendorApiTransport::new(client, endpoints))
    }

    fn epic_job() -> DispatchJob {
        DispatchJob::new(
            NewJob {
                encounter_id: EncounterId::new(),
                note_id: NoteId::new(),
                created_by: ActorId::new(),
                target: DispatchTarget::VendorApi,
                vendor: Vendor::Epic,
                contract_type: ContractType::VendorNote,
                payload: PayloadSnapshot::capture(json!({
                    "patient": {"id": "P-100"},
                    "encounter": {"id": "E-200"},
                    "note": {"type": "Progress Note", "content": "Follow up in two weeks"},
                })),
                max_attempts: 3,
            },
            t0(),
        )
    }

    fn failure_kind(outcome: DeliveryOutcome) -> FailureKind {
        match outcome {
            DeliveryOutcome::Failed(failure) => failure.kind,
            DeliveryOutcome::Delivered { external_message_id } => {
                panic!("expected a failure, delivered as {external_message_id}")
            }
        }
    }

    #[tokio::test]
    async fn sends_the_mapped_note_and_records_the_vendor_id() {
        let (sandbox, transport) = sandbox(StatusCode::CREATED, json!({"NoteID": "EPIC-77"})).await;
        let job = epic_job();

        assert_eq!(transport.deliver(&job).await, DeliveryOutcome::delivered("EPIC-77"));

        let seen = sandbox.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (headers, body) = &seen[0];
        assert_eq!(
            body,
            &map_vendor_request(Vendor::Epic, job.payload().value()).unwrap().body
        );
        assert_eq!(body["PatientID"], "P-100");
        assert_eq!(body["NoteText"], "Follow up in two weeks");
        assert_eq!(headers["authorization"], "Bearer epic-token");
        assert_eq!(
            headers[IDEMPOTENCY_KEY_HEADER].to_str().unwrap(),
            http::idempotency_key(&job)
        );
        assert_eq!(headers[JOB_ID_HEADER].to_str().unwrap(), job.id.to_string());
    }

    #[tokio::test]
    async fn client_errors_are_permanent_and_server_errors_retryable() {
        let (_, rejecting) = sandbox(StatusCode::UNPROCESSABLE_ENTITY, json!({"error": "unknown patient"})).await;
        let kind = failure_kind(rejecting.deliver(&epic_job()).await);
        assert_eq!(kind, FailureKind::ClientError);
        assert!(!kind.is_retryable());

        let (_, unavailable) = sandbox(StatusCode::SERVICE_UNAVAILABLE, json!({"error": "maintenance"})).await;
        let kind = failure_kind(unavailable.deliver(&epic_job()).await);
        assert_eq!(kind, FailureKind::ServerError);
        assert!(kind.is_retryable());

        let (_, throttling) = sandbox(StatusCode::TOO_MANY_REQUESTS, json!({})).await;
        assert_eq!(failure_kind(throttling.deliver(&epic_job()).await), FailureKind::Throttled);
    }

    #[tokio::test]
    async fn vendor_without_endpoint_is_rejected_without_a_request() {
        let (sandbox, transport) = sandbox(StatusCode::OK, json!({"NoteID": "x"})).await;
        let mut job = epic_job();
        job.vendor = Vendor::Generic;

        assert_eq!(failure_kind(transport.deliver(&job).await), FailureKind::InvalidRequest);
        assert!(sandbox.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn url_joins_without_double_slashes() {
        assert_eq!(
            VendorApiTransport::url("https://sandbox.example/api/", "/clinical-notes"),
            "https://sandbox.example/api/clinical-notes"
        );
    }

    #[test]
    fn only_fully_configured_vendors_are_supported() {
        let mut config = TransportConfig::default();
        config.vendors.insert(
            Vendor::Epic,
            VendorSettings {
                base_url: Some("https://epic.example".into()),
                token: Some("t".into()),
            },
        );
        config.vendors.insert(
            Vendor::Cerner,
            VendorSettings {
                base_url: Some("https://cerner.example".into()),
                token: None,
            },
        );

        let transport = VendorApiTransport::from_config(&config, Duration::from_secs(1), Duration::from_secs(1))
            .unwrap()
            .unwrap();
        assert!(transport.supports(Vendor::Epic));
        assert!(!transport.supports(Vendor::Cerner));
        assert!(!transport.supports(Vendor::Generic));
    }
}
