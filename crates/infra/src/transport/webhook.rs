//! Generic webhook transport: POST the payload snapshot as JSON.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{CONTENT_TYPE, HeaderName};
use reqwest::{Client, Identity};
use sha2::Sha256;

use courier_core::{Clock, DispatchTarget};

use crate::config::{ConfigError, TransportConfig, WebhookAuthMode};
use crate::jobs::DispatchJob;

use super::http::{self, GENERIC_ID_KEYS, IDEMPOTENCY_KEY_HEADER, JOB_ID_HEADER};
use super::{DeliveryOutcome, FailureKind, Transport};

pub const SIGNATURE_HEADER: &str = "X-Courier-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Courier-Timestamp";

/// How requests authenticate to the webhook receiver.
#[derive(Clone)]
pub enum WebhookAuth {
    None,
    ApiKey { header: HeaderName, key: String },
    Bearer(String),
    /// Sign `"{timestamp}.{body}"` with HMAC-SHA256.
    Hmac(Vec<u8>),
}

impl fmt::Debug for WebhookAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::ApiKey { header, .. } => write!(f, "ApiKey({header}: <redacted>)"),
            Self::Bearer(_) => f.write_str("Bearer(<redacted>)"),
            Self::Hmac(_) => f.write_str("Hmac(<redacted>)"),
        }
    }
}

/// `sha256=<hex>` signature over `"{timestamp}.{body}"`.
pub fn sign(secret: &[u8], timestamp: i64, body: &[u8]) -> Result<String, String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(|e| e.to_string())?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Receiver-side check of a signature produced by [`sign`].
pub fn verify_signature(secret: &[u8], timestamp: &str, body: &[u8], signature: &str) -> bool {
    let Ok(timestamp) = timestamp.parse::<i64>() else {
        return false;
    };
    let Some(hex_sig) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret) else {
        return false;
    };
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[derive(Clone)]
pub struct WebhookTransport {
    client: Client,
    url: String,
    auth: WebhookAuth,
    /// Source of the signing timestamp.
    clock: Arc<dyn Clock>,
}

impl WebhookTransport {
    pub fn new(client: Client, url: impl Into<String>, auth: WebhookAuth, clock: Arc<dyn Clock>) -> Self {
        Self {
            client,
            url: url.into(),
            auth,
            clock,
        }
    }

    /// `Ok(None)` when settings are missing; errors only for settings that are
    /// present but unusable.
    pub fn from_config(
        config: &TransportConfig,
        connect_timeout: Duration,
        request_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Option<Self>, ConfigError> {
        let Some(url) = config.webhook_url.clone() else {
            return Ok(None);
        };

        let auth = match (config.webhook_auth_mode, config.webhook_secret.clone()) {
            (WebhookAuthMode::None, _) => WebhookAuth::None,
            (_, None) => {
                tracing::warn!(
                    auth_mode = %config.webhook_auth_mode,
                    "webhook auth mode needs DISPATCH_WEBHOOK_SECRET"
                );
                return Ok(None);
            }
            (WebhookAuthMode::ApiKey, Some(key)) => WebhookAuth::ApiKey {
                header: HeaderName::from_str(&config.webhook_api_key_header).map_err(|e| {
                    ConfigError::invalid("DISPATCH_WEBHOOK_API_KEY_HEADER", &config.webhook_api_key_header, e)
                })?,
                key,
            },
            (WebhookAuthMode::Bearer, Some(token)) => WebhookAuth::Bearer(token),
            (WebhookAuthMode::Hmac, Some(secret)) => WebhookAuth::Hmac(secret.into_bytes()),
        };

        let identity = match (&config.client_cert_path, &config.client_key_path) {
            (None, None) => None,
            (Some(cert), Some(key)) => {
                let mut pem = std::fs::read(cert)
                    .map_err(|e| ConfigError::Tls(format!("reading {}: {e}", cert.display())))?;
                pem.push(b'\n');
                pem.extend(
                    std::fs::read(key)
                        .map_err(|e| ConfigError::Tls(format!("reading {}: {e}", key.display())))?,
                );
                Some(Identity::from_pem(&pem).map_err(|e| ConfigError::Tls(e.to_string()))?)
            }
            _ => {
                tracing::warn!("webhook mTLS needs both a client certificate and a client key");
                return Ok(None);
            }
        };

        let client = http::build_client(connect_timeout, request_timeout, identity)?;
        Ok(Some(Self::new(client, url, auth, clock)))
    }
}

impl fmt::Debug for WebhookTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookTransport")
            .field("url", &self.url)
            .field("auth", &self.auth)
            .finish()
    }
}

#[async_trait]
impl Transport for WebhookTransport {
    fn target(&self) -> DispatchTarget {
        DispatchTarget::Webhook
    }

    async fn deliver(&self, job: &DispatchJob) -> DeliveryOutcome {
        let idempotency_key = http::idempotency_key(job);
        let body = job.payload().as_bytes().to_vec();

        let mut request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(IDEMPOTENCY_KEY_HEADER, &idempotency_key)
            .header(JOB_ID_HEADER, job.id.to_string());

        request = match &self.auth {
            WebhookAuth::None => request,
            WebhookAuth::ApiKey { header, key } => request.header(header.clone(), key),
            WebhookAuth::Bearer(token) => request.bearer_auth(token),
            WebhookAuth::Hmac(secret) => {
                let timestamp = self.clock.now().timestamp();
                match sign(secret, timestamp, &body) {
                    Ok(signature) => request
                        .header(TIMESTAMP_HEADER, timestamp.to_string())
                        .header(SIGNATURE_HEADER, signature),
                    Err(e) => return DeliveryOutcome::failed(FailureKind::InvalidRequest, e),
                }
            }
        };

        http::send(request.body(body), GENERIC_ID_KEYS, &idempotency_key).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use axum::Router;
    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use serde_json::json;
    use tokio::net::TcpListener;

    use courier_core::ManualClock;

    use super::*;
    use crate::jobs::types::tests::{new_job, t0};

    fn clock() -> Arc<dyn Clock> {
        Arc::new(ManualClock::new(t0()))
    }

    #[derive(Default)]
    struct Seen {
        requests: Mutex<Vec<(HeaderMap, Bytes)>>,
    }

    async fn record(State(seen): State<Arc<Seen>>, headers: HeaderMap, body: Bytes) -> axum::Json<serde_json::Value> {
        seen.requests.lock().unwrap().push((headers, body));
        axum::Json(json!({"messageId": "wh-1"}))
    }

    async fn spawn_receiver() -> (Arc<Seen>, String) {
        let seen = Arc::new(Seen::default());
        let app = Router::new().route("/hook", post(record)).with_state(seen.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (seen, format!("http://{addr}/hook"))
    }

    #[tokio::test]
    async fn hmac_signature_uses_the_injected_clock() {
        let (seen, url) = spawn_receiver().await;
        let client = http::build_client(Duration::from_secs(1), Duration::from_secs(2), None).unwrap();
        let transport = WebhookTransport::new(client, url, WebhookAuth::Hmac(b"s3cret".to_vec()), clock());
        let job = new_job(3);

        assert_eq!(transport.deliver(&job).await, DeliveryOutcome::delivered("wh-1"));

        let requests = seen.requests.lock().unwrap();
        let (headers, body) = &requests[0];
        let header = |name: &str| headers.get(name).unwrap().to_str().unwrap().to_string();
        let expected_ts = t0().timestamp();
        assert_eq!(header(TIMESTAMP_HEADER), expected_ts.to_string());
        assert_eq!(header(SIGNATURE_HEADER), sign(b"s3cret", expected_ts, job.payload().as_bytes()).unwrap());
        assert_eq!(&body[..], job.payload().as_bytes());
    }

    #[test]
    fn signature_round_trips_and_binds_timestamp() {
        let sig = sign(b"shared-secret", 1_767_268_800, b"{\"a\":1}").unwrap();
        assert!(sig.starts_with("sha256="));
        assert_eq!(sig.len(), "sha256=".len() + 64);
        assert!(verify_signature(b"shared-secret", "1767268800", b"{\"a\":1}", &sig));
        assert!(!verify_signature(b"shared-secret", "1767268801", b"{\"a\":1}", &sig));
        assert!(!verify_signature(b"other", "1767268800", b"{\"a\":1}", &sig));
    }

    #[test]
    fn auth_debug_redacts_secrets() {
        let auth = WebhookAuth::Bearer("very-secret".into());
        assert!(!format!("{auth:?}").contains("very-secret"));
    }

    #[test]
    fn missing_url_means_not_configured() {
        let config = TransportConfig::default();
        let built = WebhookTransport::from_config(&config, Duration::from_secs(1), Duration::from_secs(1), clock()).unwrap();
        assert!(built.is_none());
    }

    #[test]
    fn auth_mode_without_secret_means_not_configured() {
        let config = TransportConfig {
            webhook_url: Some("http://127.0.0.1:9/hook".into()),
            webhook_auth_mode: WebhookAuthMode::Hmac,
            ..TransportConfig::default()
        };
        let built = WebhookTransport::from_config(&config, Duration::from_secs(1), Duration::from_secs(1), clock()).unwrap();
        assert!(built.is_none());
    }
}
